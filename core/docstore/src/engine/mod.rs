//! Embedded document engine standing in for the hosted service.
//!
//! One [`DocstoreService`] exists per project id and process. Every provider
//! configured for the same project reaches the same documents, accounts and
//! buckets, the way separate SDK instances reach one hosted project.

pub mod bucket;
pub mod identity;
pub mod query;
pub mod store;
pub mod value;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use gearshed_common::{Error, Result, SecretString};
use gearshed_crypto::SigningKey;

use bucket::ObjectBucket;
use identity::{AdminSession, IdentityService};
use store::DocumentStore;

static SERVICES: Lazy<Mutex<HashMap<String, Arc<DocstoreService>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const FINGERPRINT_PURPOSE: &[u8] = b"gearshed-docstore-service-account";

/// The hosted project: documents, identities and object buckets.
pub struct DocstoreService {
    project_id: String,
    store: Arc<DocumentStore>,
    identity: Arc<IdentityService>,
    buckets: Mutex<HashMap<String, Arc<ObjectBucket>>>,
    /// Fingerprint of the service account key the project accepts.
    admin_fingerprint: Mutex<Option<[u8; 32]>>,
}

impl DocstoreService {
    fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            store: Arc::new(DocumentStore::new()),
            identity: Arc::new(IdentityService::new(project_id)),
            buckets: Mutex::new(HashMap::new()),
            admin_fingerprint: Mutex::new(None),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn store(&self) -> Arc<DocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn identity(&self) -> Arc<IdentityService> {
        Arc::clone(&self.identity)
    }

    /// The bucket named `name`, created on first use.
    pub fn bucket(&self, name: &str) -> Arc<ObjectBucket> {
        let mut buckets = self.buckets.lock();
        Arc::clone(
            buckets
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ObjectBucket::new(name))),
        )
    }

    /// Open a privileged session with a service account key.
    ///
    /// The first key presented to a project becomes its service account key.
    ///
    /// # Errors
    /// - `PermissionDenied` when the key differs from the project's key
    /// - `Crypto` for an empty key
    pub fn admin(
        &self,
        service_account_key: &SecretString,
        client_email: Option<String>,
    ) -> Result<AdminSession> {
        let fingerprint = SigningKey::from_secret(service_account_key.expose(), FINGERPRINT_PURPOSE)?
            .tag(self.project_id.as_bytes());

        {
            let mut accepted = self.admin_fingerprint.lock();
            match *accepted {
                Some(existing) if existing != fingerprint => {
                    return Err(Error::PermissionDenied(format!(
                        "Service account key is not valid for project '{}'",
                        self.project_id
                    )));
                }
                Some(_) => {}
                None => *accepted = Some(fingerprint),
            }
        }

        debug!(project_id = %self.project_id, "Opened admin session");
        AdminSession::new(self.identity(), service_account_key, client_email)
    }
}

/// The service for `project_id`, created on first use.
pub fn connect(project_id: &str) -> Arc<DocstoreService> {
    let mut services = SERVICES.lock();
    Arc::clone(services.entry(project_id.to_string()).or_insert_with(|| {
        info!(project_id = %project_id, "Starting document service");
        Arc::new(DocstoreService::new(project_id))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn project() -> String {
        format!("project-{}", Uuid::new_v4())
    }

    #[test]
    fn test_connect_shares_service() {
        let id = project();
        let a = connect(&id);
        let b = connect(&id);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &connect(&project())));
        assert!(Arc::ptr_eq(&a.bucket("photos"), &b.bucket("photos")));
    }

    #[test]
    fn test_admin_key_is_pinned() {
        let service = connect(&project());
        assert!(service.admin(&SecretString::new("key-1"), None).is_ok());
        assert!(service.admin(&SecretString::new("key-1"), None).is_ok());
        assert!(matches!(
            service.admin(&SecretString::new("key-2"), None),
            Err(Error::PermissionDenied(_))
        ));
    }
}
