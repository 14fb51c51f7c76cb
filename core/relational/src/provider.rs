//! Relational store provider.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{info, warn};

use gearshed_backend::{
    ensure_context, AuthProvider, Capabilities, CheckedDatabase, Database, Lifecycle, Provider,
    ProviderState, Storage,
};
use gearshed_common::{Error, ExecutionContext, Result};
use gearshed_config::{ClientConfig, ConfigSource, ProviderKind, ServerConfig};

use crate::auth::RelationalAuth;
use crate::database::{self, RelationalDatabase};
use crate::engine::identity::AdminSession;
use crate::engine::{self, RelationalService, Settings};
use crate::storage::RelationalStorage;
use crate::BACKEND_NAME;

struct Sessions {
    service: Arc<RelationalService>,
    storage_bucket: String,
    /// Present in the server context only.
    admin: Option<Arc<AdminSession>>,
}

/// The relational backend.
///
/// A client-context provider uses the public URL and anon key only. A
/// server-context provider also opens a service role session, and its
/// database and storage settings take effect when it is the first to
/// connect to the project.
pub struct RelationalProvider {
    context: ExecutionContext,
    source: ConfigSource,
    lifecycle: Lifecycle<Sessions>,
    auth: OnceCell<Arc<dyn AuthProvider>>,
    db: OnceCell<Arc<dyn Database>>,
    storage: OnceCell<Arc<dyn Storage>>,
    server_auth: OnceCell<Arc<dyn AuthProvider>>,
    server_db: OnceCell<Arc<dyn Database>>,
}

impl RelationalProvider {
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
        let client = match self.source.client_config(ProviderKind::Relational).await? {
            ClientConfig::Relational(client) => client,
            other => return Err(wrong_backend(other.kind())),
        };
        if client.anon_key.is_empty() {
            return Err(Error::Configuration(
                "relational anon key cannot be empty".to_string(),
            ));
        }

        let mut settings = Settings::new(client.url.clone());
        settings.foreign_keys = client.foreign_keys.clone();
        let server = match self.context {
            ExecutionContext::Client => None,
            ExecutionContext::Server => {
                let server = match self.source.server_config(ProviderKind::Relational)? {
                    ServerConfig::Relational(server) => server,
                    other => return Err(wrong_backend(other.kind())),
                };
                if server.url != client.url {
                    return Err(Error::Configuration(format!(
                        "server url '{}' does not match client url '{}'",
                        server.url, client.url
                    )));
                }
                settings.database_url = server.database_url.clone();
                settings.storage_root = server.storage_root.clone();
                settings.foreign_keys.extend(server.foreign_keys.clone());
                Some(server)
            }
        };

        let service = engine::connect(&settings)?;
        let admin = match server {
            None => None,
            Some(server) => {
                if server.storage_bucket != client.storage_bucket {
                    warn!(
                        server_bucket = %server.storage_bucket,
                        client_bucket = %client.storage_bucket,
                        "Server and client storage buckets differ; using the client bucket"
                    );
                }
                Some(Arc::new(service.admin(&server.service_role_key)?))
            }
        };

        info!(url = %client.url, context = %self.context, "Initialized relational provider");
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
            .ok_or_else(|| Error::NotInitialized("relational service role session".to_string()))?;
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
impl Provider for RelationalProvider {
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
            Arc::new(RelationalAuth::client(sessions.service.identity())) as Arc<dyn AuthProvider>
        });
        Ok(Arc::clone(auth))
    }

    fn db(&self) -> Result<Arc<dyn Database>> {
        let sessions = self.sessions()?;
        let db = self.db.get_or_init(|| {
            CheckedDatabase::wrap(Arc::new(RelationalDatabase::new(
                Arc::clone(&sessions.service),
                ExecutionContext::Client,
            )))
        });
        Ok(Arc::clone(db))
    }

    fn storage(&self) -> Result<Arc<dyn Storage>> {
        let sessions = self.sessions()?;
        let storage = self.storage.get_or_init(|| {
            Arc::new(RelationalStorage::new(
                sessions.service.objects(),
                sessions.storage_bucket.clone(),
                sessions.service.url(),
            )) as Arc<dyn Storage>
        });
        Ok(Arc::clone(storage))
    }

    fn server_auth(&self) -> Result<Arc<dyn AuthProvider>> {
        let (sessions, admin) = self.admin("server_auth")?;
        let auth = self.server_auth.get_or_init(|| {
            Arc::new(RelationalAuth::server(admin, sessions.service.identity()))
                as Arc<dyn AuthProvider>
        });
        Ok(Arc::clone(auth))
    }

    fn server_db(&self) -> Result<Arc<dyn Database>> {
        let (sessions, _) = self.admin("server_db")?;
        let db = self.server_db.get_or_init(|| {
            CheckedDatabase::wrap(Arc::new(RelationalDatabase::new(
                Arc::clone(&sessions.service),
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
    use gearshed_common::SecretString;
    use gearshed_config::{DocstoreClientConfig, RelationalClientConfig, RelationalServerConfig};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn client_config(url: &str) -> ClientConfig {
        ClientConfig::Relational(RelationalClientConfig {
            url: url.to_string(),
            anon_key: "anon".to_string(),
            storage_bucket: "uploads".to_string(),
            foreign_keys: BTreeMap::new(),
        })
    }

    fn server_source(url: &str, key: &str, root: &TempDir) -> ConfigSource {
        ConfigSource::fixed(
            client_config(url),
            Some(ServerConfig::Relational(RelationalServerConfig {
                url: url.to_string(),
                service_role_key: SecretString::new(key),
                database_url: None,
                storage_root: Some(root.path().to_path_buf()),
                storage_bucket: "uploads".to_string(),
                foreign_keys: BTreeMap::new(),
            })),
        )
    }

    fn project_url() -> String {
        format!("http://{}.relational.local", Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_accessors_before_initialize() {
        let provider = RelationalProvider::new(
            ExecutionContext::Client,
            ConfigSource::fixed(client_config("http://localhost:54321"), None),
        );
        assert_eq!(provider.state(), ProviderState::Uninitialized);
        assert!(matches!(provider.auth(), Err(Error::NotInitialized(_))));
        assert!(provider.server_auth().err().expect("expected error").is_context_violation());
    }

    #[tokio::test]
    async fn test_server_provider_shares_data_with_client() {
        let url = project_url();
        let root = TempDir::new().unwrap();
        let server =
            RelationalProvider::new(ExecutionContext::Server, server_source(&url, "role", &root));
        let client = RelationalProvider::new(
            ExecutionContext::Client,
            ConfigSource::fixed(client_config(&url), None),
        );
        server.initialize().await.unwrap();
        client.initialize().await.unwrap();

        let path = DocumentPath::new("bikes", "b1").unwrap();
        server
            .server_db()
            .unwrap()
            .set_doc(&path, document([("name", "trail")]), SetOptions::default())
            .await
            .unwrap();
        let snap = client.db().unwrap().get_doc(&path).await.unwrap();
        assert_eq!(snap.get("name"), Some(&Value::from("trail")));

        let uploaded = client
            .storage()
            .unwrap()
            .upload_data_url(
                &gearshed_common::ObjectPath::parse("bikes/b1/a.txt").unwrap(),
                "data:text/plain,hi",
            )
            .await
            .unwrap();
        assert!(uploaded.download_url.starts_with(&url));
        assert!(root.path().join("uploads/bikes/b1/a.txt").exists());

        assert!(Arc::ptr_eq(&server.server_db().unwrap(), &server.server_db().unwrap()));
        assert!(client.server_db().err().expect("expected error").is_context_violation());
    }

    #[tokio::test]
    async fn test_wrong_backend_config() {
        let provider = RelationalProvider::new(
            ExecutionContext::Client,
            ConfigSource::fixed(
                ClientConfig::Docstore(DocstoreClientConfig {
                    api_key: "api-key".to_string(),
                    project_id: "garage".to_string(),
                    auth_domain: None,
                    storage_bucket: "garage.appspot.com".to_string(),
                }),
                None,
            ),
        );
        assert!(matches!(
            provider.initialize().await,
            Err(Error::Configuration(_))
        ));
        assert_eq!(provider.state(), ProviderState::Uninitialized);
    }

    #[tokio::test]
    async fn test_server_requires_matching_key() {
        let url = project_url();
        let root = TempDir::new().unwrap();
        let first =
            RelationalProvider::new(ExecutionContext::Server, server_source(&url, "role-1", &root));
        first.initialize().await.unwrap();

        let second =
            RelationalProvider::new(ExecutionContext::Server, server_source(&url, "role-2", &root));
        assert!(matches!(
            second.initialize().await,
            Err(Error::PermissionDenied(_))
        ));
    }
}
