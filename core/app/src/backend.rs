//! The application's handle on the active backend.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use gearshed_backend::{AuthProvider, Capabilities, Database, Provider, Storage};
use gearshed_common::{Error, ExecutionContext, Result};
use gearshed_config::{resolve_provider_kind, ConfigSource, EnvSource, ProviderKind, ServerConfig};

use crate::registry::{self, ProviderConstructor};

/// Where the application runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// Browser code. Configuration comes from `{origin}/api/config` and only
    /// client capabilities are available.
    Browser { origin: String },
    /// Server code. Configuration comes from the environment and both client
    /// and server capabilities are available.
    Server,
}

impl Runtime {
    fn context(&self) -> ExecutionContext {
        match self {
            Self::Browser { .. } => ExecutionContext::Client,
            Self::Server => ExecutionContext::Server,
        }
    }
}

/// Lazily initialized providers of one runtime.
///
/// Each getter constructs and initializes its provider on first use; later
/// calls share it. Concurrent first calls run a single initialization.
pub struct Backend {
    runtime: Runtime,
    env: Arc<dyn EnvSource>,
    kind: ProviderKind,
    constructor: ProviderConstructor,
    client: OnceCell<Arc<dyn Provider>>,
    server: OnceCell<Arc<dyn Provider>>,
}

impl Backend {
    /// Use the provider named by the environment.
    pub fn new(runtime: Runtime, env: Arc<dyn EnvSource>) -> Self {
        let kind = resolve_provider_kind(env.as_ref());
        Self::with_kind(runtime, env, kind)
    }

    /// Use the provider called `name`, whatever the environment says.
    ///
    /// # Errors
    /// - `Configuration` when `name` is not a registered provider
    pub fn with_provider(runtime: Runtime, env: Arc<dyn EnvSource>, name: &str) -> Result<Self> {
        let (kind, _) = registry::provider_constructor(name)?;
        Ok(Self::with_kind(runtime, env, kind))
    }

    pub fn with_kind(runtime: Runtime, env: Arc<dyn EnvSource>, kind: ProviderKind) -> Self {
        info!(provider = %kind, context = %runtime.context(), "Selected backend provider");
        Self {
            runtime,
            env,
            kind,
            constructor: registry::constructor(kind),
            client: OnceCell::new(),
            server: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn capabilities(&self) -> Capabilities {
        registry::capabilities(self.kind)
    }

    fn client_source(&self) -> Result<ConfigSource> {
        match &self.runtime {
            Runtime::Browser { origin } => ConfigSource::endpoint(origin),
            Runtime::Server => Ok(ConfigSource::environment(Arc::clone(&self.env))),
        }
    }

    /// The client-context provider, initialized.
    ///
    /// In a server runtime with server settings present, the server provider
    /// is initialized first so that a backend shared by both opens with the
    /// server's storage settings.
    async fn client_provider(&self) -> Result<&Arc<dyn Provider>> {
        if let Some(provider) = self.client.get() {
            return Ok(provider);
        }
        if self.runtime == Runtime::Server
            && ServerConfig::from_env(self.kind, self.env.as_ref()).is_ok()
        {
            self.server_provider("get_auth").await?;
        }
        self.client
            .get_or_try_init(|| async {
                let provider = (self.constructor)(ExecutionContext::Client, self.client_source()?);
                provider.initialize().await?;
                debug!(provider = %self.kind, "Client provider ready");
                Ok(provider)
            })
            .await
    }

    async fn server_provider(&self, operation: &'static str) -> Result<&Arc<dyn Provider>> {
        if let Runtime::Browser { .. } = self.runtime {
            return Err(Error::context_violation(operation, ExecutionContext::Client));
        }
        self.server
            .get_or_try_init(|| async {
                let provider = (self.constructor)(
                    ExecutionContext::Server,
                    ConfigSource::environment(Arc::clone(&self.env)),
                );
                provider.initialize().await?;
                debug!(provider = %self.kind, "Server provider ready");
                Ok(provider)
            })
            .await
    }

    /// # Errors
    /// - `Configuration` for missing or invalid settings
    /// - Any error raised while the provider initializes
    pub async fn get_auth(&self) -> Result<Arc<dyn AuthProvider>> {
        self.client_provider().await?.auth()
    }

    /// # Errors
    /// - `Configuration` for missing or invalid settings
    /// - Any error raised while the provider initializes
    pub async fn get_db(&self) -> Result<Arc<dyn Database>> {
        self.client_provider().await?.db()
    }

    /// # Errors
    /// - `Configuration` for missing or invalid settings
    /// - Any error raised while the provider initializes
    pub async fn get_storage(&self) -> Result<Arc<dyn Storage>> {
        self.client_provider().await?.storage()
    }

    /// # Errors
    /// - `ContextViolation` in a browser runtime
    /// - `Configuration` for missing or invalid server settings
    pub async fn get_server_auth(&self) -> Result<Arc<dyn AuthProvider>> {
        self.server_provider("get_server_auth").await?.server_auth()
    }

    /// # Errors
    /// - `ContextViolation` in a browser runtime
    /// - `Configuration` for missing or invalid server settings
    pub async fn get_server_db(&self) -> Result<Arc<dyn Database>> {
        self.server_provider("get_server_db").await?.server_db()
    }

    /// Drop the client provider; the next getter builds a new one.
    pub fn reset(&mut self) {
        self.client = OnceCell::new();
    }

    /// Drop the server provider; the next getter builds a new one.
    pub fn reset_server(&mut self) {
        self.server = OnceCell::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_config::MapEnv;
    use gearshed_docstore::BACKEND_NAME as DOCSTORE;

    fn browser() -> Runtime {
        Runtime::Browser {
            origin: "http://localhost:5173".to_string(),
        }
    }

    #[tokio::test]
    async fn test_server_getters_refuse_browser_runtime() {
        let backend = Backend::new(browser(), Arc::new(MapEnv::new()));
        assert!(backend.get_server_auth().await.err().expect("expected error").is_context_violation());
        assert!(backend.get_server_db().await.err().expect("expected error").is_context_violation());
    }

    #[tokio::test]
    async fn test_missing_settings_fail_loudly() {
        let backend = Backend::new(Runtime::Server, Arc::new(MapEnv::new()));
        let err = backend.get_db().await.err().expect("expected error");
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("PUBLIC_DOCSTORE_PROJECT_ID"));
    }

    #[test]
    fn test_override_fails_closed() {
        let env: Arc<dyn EnvSource> = Arc::new(MapEnv::new());
        assert!(matches!(
            Backend::with_provider(Runtime::Server, Arc::clone(&env), "mongo"),
            Err(Error::Configuration(_))
        ));
        let backend = Backend::with_provider(Runtime::Server, env, "relational").unwrap();
        assert_eq!(backend.kind(), ProviderKind::Relational);
        assert!(!backend.capabilities().vector_search);
    }

    #[test]
    fn test_environment_selects_provider() {
        let backend = Backend::new(Runtime::Server, Arc::new(MapEnv::new()));
        assert_eq!(backend.kind().as_str(), DOCSTORE);

        let env = MapEnv::new().with("PUBLIC_BACKEND_PROVIDER", "relational");
        let backend = Backend::new(Runtime::Server, Arc::new(env));
        assert_eq!(backend.kind(), ProviderKind::Relational);
    }
}
