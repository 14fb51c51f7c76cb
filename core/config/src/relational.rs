//! Relational store configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use gearshed_common::{Error, Result, SecretString};

use crate::env::EnvSource;
use crate::require::Required;

pub const URL_VAR: &str = "PUBLIC_RELATIONAL_URL";
pub const ANON_KEY_VAR: &str = "PUBLIC_RELATIONAL_ANON_KEY";
pub const STORAGE_BUCKET_VAR: &str = "PUBLIC_RELATIONAL_STORAGE_BUCKET";
pub const FOREIGN_KEYS_VAR: &str = "PUBLIC_RELATIONAL_FOREIGN_KEYS";
pub const SERVICE_ROLE_KEY_VAR: &str = "RELATIONAL_SERVICE_ROLE_KEY";
pub const DATABASE_URL_VAR: &str = "RELATIONAL_DATABASE_URL";
pub const STORAGE_ROOT_VAR: &str = "RELATIONAL_STORAGE_ROOT";

/// Bucket used when none is configured.
pub const DEFAULT_STORAGE_BUCKET: &str = "uploads";

/// Client-safe relational store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationalClientConfig {
    pub url: String,
    pub anon_key: String,
    pub storage_bucket: String,
    /// Foreign key column per `parent/child` collection pair.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub foreign_keys: BTreeMap<String, String>,
}

impl RelationalClientConfig {
    /// # Errors
    /// - `Configuration` naming every missing required variable
    /// - `Configuration` for a malformed foreign key mapping
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let mut required = Required::new("relational client", env);
        let url = required.get(URL_VAR);
        let anon_key = required.get(ANON_KEY_VAR);
        required.finish()?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            anon_key,
            storage_bucket: storage_bucket(env),
            foreign_keys: foreign_keys(env)?,
        })
    }
}

/// Privileged relational store settings.
#[derive(Debug, Clone)]
pub struct RelationalServerConfig {
    pub url: String,
    pub service_role_key: SecretString,
    /// SQLite location; in-memory when unset.
    pub database_url: Option<String>,
    /// Directory holding stored objects; a per-project directory under the
    /// system temp directory when unset.
    pub storage_root: Option<PathBuf>,
    pub storage_bucket: String,
    pub foreign_keys: BTreeMap<String, String>,
}

impl RelationalServerConfig {
    /// # Errors
    /// - `Configuration` naming every missing required variable
    /// - `Configuration` for a malformed foreign key mapping
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let mut required = Required::new("relational server", env);
        let url = required.get(URL_VAR);
        let service_role_key = required.get(SERVICE_ROLE_KEY_VAR);
        required.finish()?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            service_role_key: SecretString::new(service_role_key),
            database_url: env.non_empty(DATABASE_URL_VAR),
            storage_root: env.non_empty(STORAGE_ROOT_VAR).map(PathBuf::from),
            storage_bucket: storage_bucket(env),
            foreign_keys: foreign_keys(env)?,
        })
    }
}

fn storage_bucket(env: &dyn EnvSource) -> String {
    env.non_empty(STORAGE_BUCKET_VAR)
        .unwrap_or_else(|| DEFAULT_STORAGE_BUCKET.to_string())
}

fn foreign_keys(env: &dyn EnvSource) -> Result<BTreeMap<String, String>> {
    match env.non_empty(FOREIGN_KEYS_VAR) {
        Some(raw) => parse_foreign_keys(&raw),
        None => Ok(BTreeMap::new()),
    }
}

/// Columns every relational table already has.
pub const RESERVED_COLUMNS: [&str; 5] = ["id", "parent", "data", "revision", "updated_at"];

/// Parse `parent/child=column;...` into a map keyed by `parent/child`.
///
/// # Errors
/// - An entry without `=`, without a `parent/child` pair, or with an empty column
/// - A column named like one of [`RESERVED_COLUMNS`]
pub fn parse_foreign_keys(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let malformed = || {
            Error::Configuration(format!(
                "malformed foreign key mapping '{}' in {}; expected parent/child=column",
                entry, FOREIGN_KEYS_VAR
            ))
        };

        let (relation, column) = entry.split_once('=').ok_or_else(malformed)?;
        let (parent, child) = relation.trim().split_once('/').ok_or_else(malformed)?;
        let column = column.trim();
        let valid_ident = |s: &str| {
            !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if !valid_ident(parent.trim()) || !valid_ident(child.trim()) || !valid_ident(column) {
            return Err(malformed());
        }
        if RESERVED_COLUMNS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(column))
        {
            return Err(Error::Configuration(format!(
                "foreign key column '{}' in {} is reserved; choose a name other than {}",
                column,
                FOREIGN_KEYS_VAR,
                RESERVED_COLUMNS.join(", ")
            )));
        }

        map.insert(
            format!("{}/{}", parent.trim(), child.trim()),
            column.to_string(),
        );
    }
    Ok(map)
}
