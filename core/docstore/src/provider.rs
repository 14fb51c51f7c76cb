//! Document store provider.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::info;

use gearshed_backend::{
    ensure_context, AuthProvider, Capabilities, CheckedDatabase, Database, Lifecycle, Provider,
    ProviderState, Storage,
};
use gearshed_common::{Error, ExecutionContext, Result};
use gearshed_config::{ClientConfig, ConfigSource, ProviderKind, ServerConfig};

use crate::auth::DocstoreAuth;
use crate::database::{self, DocstoreDatabase};
use crate::engine::identity::AdminSession;
use crate::engine::{self, DocstoreService};
use crate::storage::DocstoreStorage;
use crate::BACKEND_NAME;

/// Open sessions of an initialized provider.
struct Sessions {
    service: Arc<DocstoreService>,
    storage_bucket: String,
    /// Present in the server context only.
    admin: Option<Arc<AdminSession>>,
}

/// The document store backend.
///
/// A client-context provider opens a client session only. A server-context
/// provider also opens an admin session with the service account key.
pub struct DocstoreProvider {
    context: ExecutionContext,
    source: ConfigSource,
    lifecycle: Lifecycle<Sessions>,
    auth: OnceCell<Arc<dyn AuthProvider>>,
    db: OnceCell<Arc<dyn Database>>,
    storage: OnceCell<Arc<dyn Storage>>,
    server_auth: OnceCell<Arc<dyn AuthProvider>>,
    server_db: OnceCell<Arc<dyn Database>>,
}

impl DocstoreProvider {
    pub fn new(context: ExecutionContext, source: ConfigSource) -> Self {
        Self {
            context,
            source,
            lifecycle: Lifecycle::new(),
            auth: OnceCell::new(),
            db: OnceCell::new(),
            storage: OnceCell::new(),
            server_auth: OnceCell::new(),
            server_db: OnceCell::new(),
        }
    }

    async fn open(&self) -> Result<Sessions> {
        let client = match self.source.client_config(ProviderKind::Docstore).await? {
            ClientConfig::Docstore(client) => client,
            other => return Err(wrong_backend(other.kind())),
        };
        let service = engine::connect(&client.project_id);

        let admin = match self.context {
            ExecutionContext::Client => None,
            ExecutionContext::Server => {
                let server = match self.source.server_config(ProviderKind::Docstore)? {
                    ServerConfig::Docstore(server) => server,
                    other => return Err(wrong_backend(other.kind())),
                };
                if server.project_id != client.project_id {
                    return Err(Error::Configuration(format!(
                        "server project '{}' does not match client project '{}'",
                        server.project_id, client.project_id
                    )));
                }
                let admin = service.admin(&server.service_account_key, server.client_email)?;
                Some(Arc::new(admin))
            }
        };

        info!(
            project_id = %client.project_id,
            context = %self.context,
            "Initialized docstore provider"
        );
        Ok(Sessions {
            service,
            storage_bucket: client.storage_bucket,
            admin,
        })
    }

    fn sessions(&self) -> Result<&Sessions> {
        self.lifecycle
            .get()
            .ok_or_else(|| Error::NotInitialized(format!("{} provider", BACKEND_NAME)))
    }

    fn admin(&self, operation: &'static str) -> Result<(&Sessions, Arc<AdminSession>)> {
        ensure_context(operation, self.context, ExecutionContext::Server)?;
        let sessions = self.sessions()?;
        let admin = sessions
            .admin
            .clone()
            .ok_or_else(|| Error::NotInitialized("docstore admin session".to_string()))?;
        Ok((sessions, admin))
    }
}

fn wrong_backend(kind: ProviderKind) -> Error {
    Error::Configuration(format!(
        "{} provider was given {} configuration",
        BACKEND_NAME, kind
    ))
}

#[async_trait]
impl Provider for DocstoreProvider {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn context(&self) -> ExecutionContext {
        self.context
    }

    fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    async fn initialize(&self) -> Result<()> {
        self.lifecycle.initialize(|| self.open()).await?;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        database::capabilities()
    }

    fn auth(&self) -> Result<Arc<dyn AuthProvider>> {
        let sessions = self.sessions()?;
        let auth = self.auth.get_or_init(|| {
            Arc::new(DocstoreAuth::client(sessions.service.identity())) as Arc<dyn AuthProvider>
        });
        Ok(Arc::clone(auth))
    }

    fn db(&self) -> Result<Arc<dyn Database>> {
        let sessions = self.sessions()?;
        let db = self.db.get_or_init(|| {
            CheckedDatabase::wrap(Arc::new(DocstoreDatabase::new(
                sessions.service.store(),
                ExecutionContext::Client,
            )))
        });
        Ok(Arc::clone(db))
    }

    fn storage(&self) -> Result<Arc<dyn Storage>> {
        let sessions = self.sessions()?;
        let storage = self.storage.get_or_init(|| {
            Arc::new(DocstoreStorage::new(
                sessions.service.bucket(&sessions.storage_bucket),
            )) as Arc<dyn Storage>
        });
        Ok(Arc::clone(storage))
    }

    fn server_auth(&self) -> Result<Arc<dyn AuthProvider>> {
        let (sessions, admin) = self.admin("server_auth")?;
        let auth = self.server_auth.get_or_init(|| {
            Arc::new(DocstoreAuth::server(admin, sessions.service.identity()))
                as Arc<dyn AuthProvider>
        });
        Ok(Arc::clone(auth))
    }

    fn server_db(&self) -> Result<Arc<dyn Database>> {
        let (sessions, _) = self.admin("server_db")?;
        let db = self.server_db.get_or_init(|| {
            CheckedDatabase::wrap(Arc::new(DocstoreDatabase::new(
                sessions.service.store(),
                ExecutionContext::Server,
            )))
        });
        Ok(Arc::clone(db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_backend::{document, DocumentPath, SetOptions, Value};
    use gearshed_config::{DocstoreClientConfig, DocstoreServerConfig, RelationalClientConfig};
    use gearshed_common::SecretString;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn client_config(project_id: &str) -> ClientConfig {
        ClientConfig::Docstore(DocstoreClientConfig {
            api_key: "api-key".to_string(),
            project_id: project_id.to_string(),
            auth_domain: None,
            storage_bucket: "garage.appspot.com".to_string(),
        })
    }

    fn server_source(project_id: &str, key: &str) -> ConfigSource {
        ConfigSource::fixed(
            client_config(project_id),
            Some(ServerConfig::Docstore(DocstoreServerConfig {
                project_id: project_id.to_string(),
                service_account_key: SecretString::new(key),
                client_email: None,
            })),
        )
    }

    #[tokio::test]
    async fn test_accessors_before_initialize() {
        let provider = DocstoreProvider::new(
            ExecutionContext::Client,
            ConfigSource::fixed(client_config("p"), None),
        );
        assert_eq!(provider.state(), ProviderState::Uninitialized);
        assert!(matches!(provider.db(), Err(Error::NotInitialized(_))));
        assert!(provider.server_db().err().expect("expected error").is_context_violation());
    }

    #[tokio::test]
    async fn test_server_provider_shares_data_with_client() {
        let project = format!("garage-{}", Uuid::new_v4());
        let server = DocstoreProvider::new(ExecutionContext::Server, server_source(&project, "key"));
        let client = DocstoreProvider::new(
            ExecutionContext::Client,
            ConfigSource::fixed(client_config(&project), None),
        );
        server.initialize().await.unwrap();
        client.initialize().await.unwrap();
        assert!(server.is_initialized());

        let path = DocumentPath::new("bikes", "b1").unwrap();
        server
            .server_db()
            .unwrap()
            .set_doc(&path, document([("name", "trail")]), SetOptions::default())
            .await
            .unwrap();
        let snap = client.db().unwrap().get_doc(&path).await.unwrap();
        assert_eq!(snap.get("name"), Some(&Value::from("trail")));

        assert!(Arc::ptr_eq(&client.db().unwrap(), &client.db().unwrap()));
        assert!(server.auth().is_ok());
        assert!(server.storage().is_ok());
        assert!(server.server_auth().is_ok());
    }

    #[tokio::test]
    async fn test_wrong_backend_config() {
        let provider = DocstoreProvider::new(
            ExecutionContext::Client,
            ConfigSource::fixed(
                ClientConfig::Relational(RelationalClientConfig {
                    url: "http://localhost:54321".to_string(),
                    anon_key: "anon".to_string(),
                    storage_bucket: "uploads".to_string(),
                    foreign_keys: BTreeMap::new(),
                }),
                None,
            ),
        );
        let err = provider.initialize().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(provider.state(), ProviderState::Uninitialized);
    }

    #[tokio::test]
    async fn test_server_requires_matching_key() {
        let project = format!("garage-{}", Uuid::new_v4());
        let first = DocstoreProvider::new(ExecutionContext::Server, server_source(&project, "key-1"));
        first.initialize().await.unwrap();

        let second = DocstoreProvider::new(ExecutionContext::Server, server_source(&project, "key-2"));
        let err = second.initialize().await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }
}
