//! Per-provider configuration, split into client-safe and server parts.

use serde::{Deserialize, Serialize};
use tracing::debug;

use gearshed_common::Result;

use crate::docstore::{DocstoreClientConfig, DocstoreServerConfig};
use crate::env::EnvSource;
use crate::provider::{resolve_provider_kind, ProviderKind};
use crate::relational::{RelationalClientConfig, RelationalServerConfig};

/// Settings safe to ship to end-user code.
///
/// Serializes as `{"provider": "<name>", ...camelCase fields}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ClientConfig {
    Docstore(DocstoreClientConfig),
    Relational(RelationalClientConfig),
}

impl ClientConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Docstore(_) => ProviderKind::Docstore,
            Self::Relational(_) => ProviderKind::Relational,
        }
    }

    /// Load the client settings of `kind`.
    pub fn from_env(kind: ProviderKind, env: &dyn EnvSource) -> Result<Self> {
        debug!(provider = %kind, "Loading client configuration");
        Ok(match kind {
            ProviderKind::Docstore => Self::Docstore(DocstoreClientConfig::from_env(env)?),
            ProviderKind::Relational => Self::Relational(RelationalClientConfig::from_env(env)?),
        })
    }
}

/// Settings holding privileged credentials. Never serialized; debug output
/// redacts secrets.
#[derive(Debug, Clone)]
pub enum ServerConfig {
    Docstore(DocstoreServerConfig),
    Relational(RelationalServerConfig),
}

impl ServerConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Docstore(_) => ProviderKind::Docstore,
            Self::Relational(_) => ProviderKind::Relational,
        }
    }

    /// Load the server settings of `kind`.
    pub fn from_env(kind: ProviderKind, env: &dyn EnvSource) -> Result<Self> {
        debug!(provider = %kind, "Loading server configuration");
        Ok(match kind {
            ProviderKind::Docstore => Self::Docstore(DocstoreServerConfig::from_env(env)?),
            ProviderKind::Relational => Self::Relational(RelationalServerConfig::from_env(env)?),
        })
    }
}

/// Client settings of the provider selected by the environment.
pub fn load_client_config(env: &dyn EnvSource) -> Result<ClientConfig> {
    ClientConfig::from_env(resolve_provider_kind(env), env)
}

/// Server settings of the provider selected by the environment.
pub fn load_server_config(env: &dyn EnvSource) -> Result<ServerConfig> {
    ServerConfig::from_env(resolve_provider_kind(env), env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use crate::{docstore, relational};

    fn relational_env() -> MapEnv {
        MapEnv::new()
            .with(crate::provider::PUBLIC_PROVIDER_VAR, "relational")
            .with(relational::URL_VAR, "https://garage.relational.local")
            .with(relational::ANON_KEY_VAR, "anon-key")
            .with(relational::SERVICE_ROLE_KEY_VAR, "service-secret")
    }

    #[test]
    fn test_client_config_json_shape() {
        let config = load_client_config(&relational_env()).unwrap();
        assert_eq!(config.kind(), ProviderKind::Relational);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["provider"], "relational");
        assert_eq!(json["url"], "https://garage.relational.local");
        assert_eq!(json["anonKey"], "anon-key");
        assert_eq!(json["storageBucket"], "uploads");
        assert!(!json.to_string().contains("service-secret"));

        let back: ClientConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_server_config_follows_provider() {
        let config = load_server_config(&relational_env()).unwrap();
        assert_eq!(config.kind(), ProviderKind::Relational);
        assert!(!format!("{:?}", config).contains("service-secret"));
    }

    #[test]
    fn test_docstore_is_default() {
        let env = MapEnv::new()
            .with(docstore::API_KEY_VAR, "k")
            .with(docstore::PROJECT_ID_VAR, "garage")
            .with(docstore::STORAGE_BUCKET_VAR, "garage-bucket");
        let config = load_client_config(&env).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["provider"], "docstore");
        assert_eq!(json["projectId"], "garage");
    }
}
