//! Where a client-context provider gets its configuration.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use gearshed_common::{Error, Result};

use crate::endpoint::CONFIG_ROUTE;
use crate::env::EnvSource;
use crate::loader::{ClientConfig, ServerConfig};
use crate::provider::ProviderKind;

/// Source of provider configuration.
#[derive(Clone)]
pub enum ConfigSource {
    /// Read variables directly; used in a server runtime.
    Environment(Arc<dyn EnvSource>),
    /// Fetch `GET {origin}/api/config` once and cache the answer; used in a
    /// browser runtime, which cannot read server variables.
    Endpoint {
        origin: Url,
        http: reqwest::Client,
        cache: Arc<OnceCell<ClientConfig>>,
    },
    /// Settings given up front.
    Fixed {
        client: ClientConfig,
        server: Option<ServerConfig>,
    },
}

impl ConfigSource {
    pub fn environment(env: Arc<dyn EnvSource>) -> Self {
        Self::Environment(env)
    }

    pub fn fixed(client: ClientConfig, server: Option<ServerConfig>) -> Self {
        Self::Fixed { client, server }
    }

    /// # Errors
    /// - `Configuration` if `origin` is not an absolute URL
    pub fn endpoint(origin: &str) -> Result<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| Error::Configuration(format!("invalid origin '{}': {}", origin, e)))?;
        Ok(Self::Endpoint {
            origin,
            http: reqwest::Client::new(),
            cache: Arc::new(OnceCell::new()),
        })
    }

    /// Client settings for `kind`.
    ///
    /// # Errors
    /// - `Configuration` if settings are missing, or the endpoint serves
    ///   another provider's settings
    /// - `Backend` if the endpoint cannot be reached
    pub async fn client_config(&self, kind: ProviderKind) -> Result<ClientConfig> {
        let config = match self {
            Self::Environment(env) => ClientConfig::from_env(kind, env.as_ref())?,
            Self::Endpoint {
                origin,
                http,
                cache,
            } => cache
                .get_or_try_init(|| fetch_client_config(http, origin))
                .await?
                .clone(),
            Self::Fixed { client, .. } => client.clone(),
        };

        if config.kind() != kind {
            return Err(Error::Configuration(format!(
                "expected {} configuration, got {}",
                kind,
                config.kind()
            )));
        }
        Ok(config)
    }

    /// Server settings for `kind`; an endpoint source never has them.
    ///
    /// # Errors
    /// - `Configuration` for an endpoint source, missing settings, or
    ///   settings of another provider
    pub fn server_config(&self, kind: ProviderKind) -> Result<ServerConfig> {
        let config = match self {
            Self::Environment(env) => ServerConfig::from_env(kind, env.as_ref())?,
            Self::Fixed {
                server: Some(server),
                ..
            } => server.clone(),
            Self::Fixed { server: None, .. } => {
                return Err(Error::Configuration(
                    "no server configuration was provided".to_string(),
                ))
            }
            Self::Endpoint { .. } => {
                return Err(Error::Configuration(
                    "server configuration is not available from the config endpoint"
                        .to_string(),
                ))
            }
        };

        if config.kind() != kind {
            return Err(Error::Configuration(format!(
                "expected {} server configuration, got {}",
                kind,
                config.kind()
            )));
        }
        Ok(config)
    }
}

async fn fetch_client_config(http: &reqwest::Client, origin: &Url) -> Result<ClientConfig> {
    let url = origin
        .join(CONFIG_ROUTE)
        .map_err(|e| Error::Configuration(format!("invalid config endpoint URL: {}", e)))?;
    debug!(url = %url, "Fetching client configuration");

    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::Backend(format!("Failed to fetch {}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("no error message");
        return Err(Error::Configuration(format!(
            "config endpoint answered {}: {}",
            status, message
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::Configuration(format!("config endpoint sent invalid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tests::{docstore_env, spawn};
    use crate::env::MapEnv;

    #[tokio::test]
    async fn test_endpoint_source_fetches_once() {
        let addr = spawn(docstore_env()).await;
        let source = ConfigSource::endpoint(&format!("http://{}", addr)).unwrap();

        let config = source.client_config(ProviderKind::Docstore).await.unwrap();
        assert_eq!(config.kind(), ProviderKind::Docstore);

        if let ConfigSource::Endpoint { cache, .. } = &source {
            assert!(cache.get().is_some());
        }

        let err = source
            .client_config(ProviderKind::Relational)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(source.server_config(ProviderKind::Docstore).is_err());
    }

    #[tokio::test]
    async fn test_endpoint_error_is_configuration() {
        let addr = spawn(MapEnv::new()).await;
        let source = ConfigSource::endpoint(&format!("http://{}", addr)).unwrap();
        let err = source.client_config(ProviderKind::Docstore).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_fixed_source_checks_kind() {
        let env = docstore_env();
        let client = ClientConfig::from_env(ProviderKind::Docstore, &env).unwrap();
        let source = ConfigSource::fixed(client, None);
        assert!(source.client_config(ProviderKind::Docstore).await.is_ok());
        assert!(matches!(
            source.client_config(ProviderKind::Relational).await,
            Err(Error::Configuration(_))
        ));
        assert!(source.server_config(ProviderKind::Docstore).is_err());
    }

    #[tokio::test]
    async fn test_environment_source() {
        let source = ConfigSource::environment(Arc::new(docstore_env()));
        assert!(source.client_config(ProviderKind::Docstore).await.is_ok());
        assert!(source.server_config(ProviderKind::Docstore).is_ok());
        assert!(source.client_config(ProviderKind::Relational).await.is_err());
    }
}
