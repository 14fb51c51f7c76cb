//! Collecting required variables before failing.

use gearshed_common::{Error, Result};

use crate::env::EnvSource;

/// Reads required variables and remembers every missing one, so a single
/// error can name them all.
pub(crate) struct Required<'a> {
    scope: &'static str,
    env: &'a dyn EnvSource,
    missing: Vec<&'static str>,
}

impl<'a> Required<'a> {
    pub(crate) fn new(scope: &'static str, env: &'a dyn EnvSource) -> Self {
        Self {
            scope,
            env,
            missing: Vec::new(),
        }
    }

    /// The value of `key`, or an empty string recorded as missing.
    pub(crate) fn get(&mut self, key: &'static str) -> String {
        match self.env.non_empty(key) {
            Some(value) => value,
            None => {
                self.missing.push(key);
                String::new()
            }
        }
    }

    pub(crate) fn finish(self) -> Result<()> {
        if self.missing.is_empty() {
            return Ok(());
        }
        Err(Error::Configuration(format!(
            "missing {} configuration: {}",
            self.scope,
            self.missing.join(", ")
        )))
    }
}
