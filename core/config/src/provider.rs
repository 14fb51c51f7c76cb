//! Backend provider names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use gearshed_common::{Error, Result};

use crate::env::EnvSource;

/// Variable naming the active provider, readable by client code.
pub const PUBLIC_PROVIDER_VAR: &str = "PUBLIC_BACKEND_PROVIDER";

/// Server-side fallback variable naming the active provider.
pub const PROVIDER_VAR: &str = "BACKEND_PROVIDER";

/// The backends this build knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Document store with auth and object storage.
    #[default]
    Docstore,
    /// Relational store with auth and object storage.
    Relational,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [Self::Docstore, Self::Relational];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docstore => "docstore",
            Self::Relational => "relational",
        }
    }

    /// Comma separated list of every valid name.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(ProviderKind::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    /// Parse a provider name, failing closed on unknown names.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown backend provider '{}'; valid options: {}",
                    s,
                    Self::valid_names()
                ))
            })
    }
}

/// Resolve the active provider from the environment.
///
/// Reads the public variable first, then the server one. A missing name
/// selects the default provider; an unknown name is logged and also falls
/// back to the default.
pub fn resolve_provider_kind(env: &dyn EnvSource) -> ProviderKind {
    let configured = env
        .non_empty(PUBLIC_PROVIDER_VAR)
        .or_else(|| env.non_empty(PROVIDER_VAR));

    match configured {
        None => {
            debug!(provider = %ProviderKind::default(), "No backend provider configured, using default");
            ProviderKind::default()
        }
        Some(name) => match name.parse() {
            Ok(kind) => kind,
            Err(_) => {
                warn!(
                    provider = %name,
                    fallback = %ProviderKind::default(),
                    valid = %ProviderKind::valid_names(),
                    "Unknown backend provider, falling back to default"
                );
                ProviderKind::default()
            }
        },
    }
}
