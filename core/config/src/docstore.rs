//! Document store configuration.

use serde::{Deserialize, Serialize};

use gearshed_common::{Result, SecretString};

use crate::env::EnvSource;
use crate::require::Required;

pub const API_KEY_VAR: &str = "PUBLIC_DOCSTORE_API_KEY";
pub const PROJECT_ID_VAR: &str = "PUBLIC_DOCSTORE_PROJECT_ID";
pub const AUTH_DOMAIN_VAR: &str = "PUBLIC_DOCSTORE_AUTH_DOMAIN";
pub const STORAGE_BUCKET_VAR: &str = "PUBLIC_DOCSTORE_STORAGE_BUCKET";
pub const SERVICE_ACCOUNT_KEY_VAR: &str = "DOCSTORE_SERVICE_ACCOUNT_KEY";
pub const CLIENT_EMAIL_VAR: &str = "DOCSTORE_CLIENT_EMAIL";

/// Client-safe document store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocstoreClientConfig {
    pub api_key: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_domain: Option<String>,
    pub storage_bucket: String,
}

impl DocstoreClientConfig {
    /// # Errors
    /// - `Configuration` naming every missing required variable
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let mut required = Required::new("docstore client", env);
        let api_key = required.get(API_KEY_VAR);
        let project_id = required.get(PROJECT_ID_VAR);
        let storage_bucket = required.get(STORAGE_BUCKET_VAR);
        required.finish()?;

        Ok(Self {
            api_key,
            project_id,
            auth_domain: env.non_empty(AUTH_DOMAIN_VAR),
            storage_bucket,
        })
    }
}

/// Privileged document store settings.
#[derive(Debug, Clone)]
pub struct DocstoreServerConfig {
    pub project_id: String,
    pub service_account_key: SecretString,
    pub client_email: Option<String>,
}

impl DocstoreServerConfig {
    /// # Errors
    /// - `Configuration` naming every missing required variable
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let mut required = Required::new("docstore server", env);
        let project_id = required.get(PROJECT_ID_VAR);
        let service_account_key = required.get(SERVICE_ACCOUNT_KEY_VAR);
        required.finish()?;

        Ok(Self {
            project_id,
            service_account_key: SecretString::new(service_account_key),
            client_email: env.non_empty(CLIENT_EMAIL_VAR),
        })
    }
}
