//! SQLite engine standing in for the hosted relational service.
//!
//! One [`RelationalService`] exists per project URL and process. The first
//! connection to a URL decides where its database and object files live;
//! later connections share them, the way clients of one hosted project do.

pub mod identity;
pub mod objects;
pub mod schema;
pub mod sql;

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use gearshed_backend::subscription::register;
use gearshed_backend::{
    Document, ListenerRegistration, ListenerSet, Precondition, QuerySpec, WriteOperation,
};
use gearshed_common::{CollectionPath, DocumentPath, Error, Result, SecretString};
use gearshed_crypto::SigningKey;

use crate::codec::{decode_document, encode_document, format_date};
use crate::writes::apply_write;

use identity::{AdminSession, IdentityService};
use objects::ObjectIndex;
use schema::{quote, Catalog, ForeignKeys, Location};

static SERVICES: Lazy<Mutex<HashMap<String, Arc<RelationalService>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const FINGERPRINT_PURPOSE: &[u8] = b"gearshed-relational-service-role";

/// Wrap a SQLite failure with what was being done.
pub(crate) fn sqlite_error(action: &str, err: rusqlite::Error) -> Error {
    Error::Backend(format!("SQLite error ({}): {}", action, err))
}

/// Receives the paths changed by each commit.
pub type ChangeListener = dyn Fn(&[DocumentPath]) + Send + Sync;

/// Where a project keeps its data.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub url: String,
    /// SQLite file; in-memory when `None`.
    pub database_url: Option<String>,
    /// Directory for object files; under the system temp dir when `None`.
    pub storage_root: Option<PathBuf>,
    pub foreign_keys: BTreeMap<String, String>,
}

impl Settings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A stored document body and its revision.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub data: Document,
    pub revision: u64,
}

/// The hosted project: tables, accounts and object files.
pub struct RelationalService {
    url: String,
    conn: Arc<Mutex<Connection>>,
    catalog: Mutex<Catalog>,
    foreign_keys: ForeignKeys,
    identity: Arc<IdentityService>,
    objects: Arc<ObjectIndex>,
    listeners: Arc<ListenerSet<ChangeListener>>,
    /// Fingerprint of the service role key the project accepts.
    admin_fingerprint: Mutex<Option<[u8; 32]>>,
}

impl RelationalService {
    fn open(settings: &Settings) -> Result<Self> {
        let conn = match settings.database_url.as_deref() {
            None | Some(":memory:") => Connection::open_in_memory(),
            Some(url) => Connection::open(url.strip_prefix("sqlite://").unwrap_or(url)),
        }
        .map_err(|e| sqlite_error("open database", e))?;
        schema::init(&conn)?;

        let conn = Arc::new(Mutex::new(conn));
        let storage_root = settings
            .storage_root
            .clone()
            .unwrap_or_else(|| default_storage_root(&settings.url));

        Ok(Self {
            url: settings.url.clone(),
            identity: Arc::new(IdentityService::new(Arc::clone(&conn), &settings.url)?),
            objects: Arc::new(ObjectIndex::new(Arc::clone(&conn), storage_root)?),
            conn,
            catalog: Mutex::new(Catalog::default()),
            foreign_keys: ForeignKeys::new(settings.foreign_keys.clone()),
            listeners: Arc::new(ListenerSet::new()),
            admin_fingerprint: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn identity(&self) -> Arc<IdentityService> {
        Arc::clone(&self.identity)
    }

    pub fn objects(&self) -> Arc<ObjectIndex> {
        Arc::clone(&self.objects)
    }

    pub fn foreign_keys(&self) -> &ForeignKeys {
        &self.foreign_keys
    }

    /// Where the documents of `collection` live.
    pub fn location(&self, collection: &CollectionPath) -> Result<Location> {
        Location::of(collection, &self.foreign_keys)
    }

    /// Read one document.
    pub fn get(&self, path: &DocumentPath) -> Result<Option<StoredRow>> {
        let location = self.location(&path.parent())?;
        let conn = self.conn.lock();
        if !self.catalog.lock().exists(&conn, &location)? {
            return Ok(None);
        }
        read_row(&conn, &location, path.id())
    }

    /// Run a query against one collection.
    pub fn query(
        &self,
        collection: &CollectionPath,
        spec: &QuerySpec,
    ) -> Result<Vec<(DocumentPath, StoredRow)>> {
        let location = self.location(collection)?;
        let statement = sql::select(&location, spec)?;

        let conn = self.conn.lock();
        if !self.catalog.lock().exists(&conn, &location)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(&statement.sql)
            .map_err(|e| sqlite_error("prepare query", e))?;
        let rows = stmt
            .query_map(params_from_iter(statement.params.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| sqlite_error("run query", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| sqlite_error("read query rows", e))?;

        rows.into_iter()
            .map(|(id, data, revision)| {
                Ok((
                    collection.doc(id)?,
                    StoredRow {
                        data: decode_document(&data)?,
                        revision: to_revision(revision)?,
                    },
                ))
            })
            .collect()
    }

    /// Apply writes in one immediate transaction if every precondition
    /// holds. Returns the revision the written documents now carry.
    ///
    /// # Errors
    /// - `Conflict` when a precondition fails
    /// - `NotFound` when an update targets a missing document
    pub fn commit(&self, writes: &[WriteOperation], preconditions: &[Precondition]) -> Result<u64> {
        let now = Utc::now();
        let updated_at = format_date(now);

        let revision = {
            let mut conn = self.conn.lock();
            let mut catalog = self.catalog.lock();

            let mut targets = Vec::with_capacity(writes.len());
            for write in writes {
                let location = self.location(&write.path().parent())?;
                // DDL runs outside the transaction so a rollback cannot
                // leave the catalog ahead of the schema.
                catalog.ensure(&conn, &location)?;
                targets.push(location);
            }
            let mut checked = Vec::with_capacity(preconditions.len());
            for precondition in preconditions {
                let location = self.location(&precondition.path.parent())?;
                let exists = catalog.exists(&conn, &location)?;
                checked.push((location, exists));
            }

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| sqlite_error("begin transaction", e))?;

            for (precondition, (location, exists)) in preconditions.iter().zip(&checked) {
                let current = if *exists {
                    read_row(&tx, location, precondition.path.id())?.map(|row| row.revision)
                } else {
                    None
                };
                if current != precondition.revision {
                    return Err(Error::Conflict(format!(
                        "{} changed since it was read",
                        precondition.path
                    )));
                }
            }

            let revision = schema::next_revision(&tx)?;
            for (write, location) in writes.iter().zip(&targets) {
                let id = write.path().id();
                let current = read_row(&tx, location, id)?.map(|row| row.data);
                match apply_write(current, write, now)? {
                    Some(doc) => upsert(&tx, location, id, &doc, revision, &updated_at)?,
                    None => {
                        tx.execute(
                            &format!(
                                "DELETE FROM {} WHERE parent = ?1 AND id = ?2",
                                quote(&location.table)
                            ),
                            params![location.parent, id],
                        )
                        .map_err(|e| sqlite_error("delete document", e))?;
                    }
                }
            }
            tx.commit().map_err(|e| sqlite_error("commit", e))?;
            revision
        };

        let changed: Vec<DocumentPath> = writes.iter().map(|w| w.path().clone()).collect();
        debug!(url = %self.url, writes = writes.len(), revision, "Committed");
        for (_, listener) in self.listeners.snapshot() {
            listener(&changed);
        }
        Ok(revision)
    }

    /// Receive the paths of every later commit.
    pub fn subscribe(&self, listener: Arc<ChangeListener>) -> ListenerRegistration {
        register(&self.listeners, listener).1
    }

    /// Open a privileged session with the service role key.
    ///
    /// The first key presented to a project becomes its key.
    ///
    /// # Errors
    /// - `PermissionDenied` when the key differs from the project's key
    /// - `Crypto` for an empty key
    pub fn admin(&self, service_role_key: &SecretString) -> Result<AdminSession> {
        let fingerprint = SigningKey::from_secret(service_role_key.expose(), FINGERPRINT_PURPOSE)?
            .tag(self.url.as_bytes());

        {
            let mut accepted = self.admin_fingerprint.lock();
            match *accepted {
                Some(existing) if existing != fingerprint => {
                    return Err(Error::PermissionDenied(format!(
                        "Invalid service role key for '{}'",
                        self.url
                    )));
                }
                Some(_) => {}
                None => *accepted = Some(fingerprint),
            }
        }

        debug!(url = %self.url, "Opened admin session");
        AdminSession::new(self.identity(), service_role_key)
    }
}

fn to_revision(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Backend(format!("Negative revision {}", value)))
}

fn read_row(conn: &Connection, location: &Location, id: &str) -> Result<Option<StoredRow>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            &format!(
                "SELECT data, revision FROM {} WHERE parent = ?1 AND id = ?2",
                quote(&location.table)
            ),
            params![location.parent, id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| sqlite_error("read document", e))?;

    row.map(|(data, revision)| {
        Ok(StoredRow {
            data: decode_document(&data)?,
            revision: to_revision(revision)?,
        })
    })
    .transpose()
}

fn upsert(
    conn: &Connection,
    location: &Location,
    id: &str,
    doc: &Document,
    revision: u64,
    updated_at: &str,
) -> Result<()> {
    let mut columns = vec!["id", "parent", "data", "revision", "updated_at"]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
    let mut values = vec![
        SqlValue::Text(id.to_string()),
        SqlValue::Text(location.parent.clone()),
        SqlValue::Text(encode_document(doc)?),
        SqlValue::Integer(i64::try_from(revision).unwrap_or(i64::MAX)),
        SqlValue::Text(updated_at.to_string()),
    ];
    if let Some((column, parent_id)) = &location.foreign_key {
        columns.push(quote(column));
        values.push(SqlValue::Text(parent_id.clone()));
    }

    let placeholders = (1..=values.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})
         ON CONFLICT(parent, id) DO UPDATE SET
             data = excluded.data,
             revision = excluded.revision,
             updated_at = excluded.updated_at",
        quote(&location.table),
        columns.join(", "),
        placeholders
    );
    conn.execute(&sql, params_from_iter(values.iter()))
        .map_err(|e| sqlite_error("write document", e))?;
    Ok(())
}

/// Per-project directory under the system temp dir.
fn default_storage_root(url: &str) -> PathBuf {
    let name: String = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    std::env::temp_dir().join("gearshed-relational").join(name)
}

/// The service for `settings.url`, opened on first use.
///
/// # Errors
/// - `Backend` when the database cannot be opened
pub fn connect(settings: &Settings) -> Result<Arc<RelationalService>> {
    let mut services = SERVICES.lock();
    if let Some(service) = services.get(&settings.url) {
        return Ok(Arc::clone(service));
    }
    let service = Arc::new(RelationalService::open(settings)?);
    info!(
        url = %settings.url,
        database = settings.database_url.as_deref().unwrap_or(":memory:"),
        "Started relational service"
    );
    services.insert(settings.url.clone(), Arc::clone(&service));
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_backend::{document, Value};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn settings() -> Settings {
        Settings::new(format!("http://{}.relational.local", Uuid::new_v4()))
    }

    fn set(path: &DocumentPath, data: Document) -> WriteOperation {
        WriteOperation::Set {
            path: path.clone(),
            data,
            merge: false,
        }
    }

    #[test]
    fn test_connect_shares_service() {
        let settings = settings();
        let a = connect(&settings).unwrap();
        let b = connect(&settings).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &connect(&self::settings()).unwrap()));
    }

    #[test]
    fn test_commit_and_read_back() {
        let service = connect(&settings()).unwrap();
        let path = DocumentPath::new("bikes", "b1").unwrap();
        assert_eq!(service.get(&path).unwrap(), None);

        let revision = service
            .commit(&[set(&path, document([("name", "trail")]))], &[])
            .unwrap();
        let row = service.get(&path).unwrap().unwrap();
        assert_eq!(row.revision, revision);
        assert_eq!(row.data.get("name"), Some(&Value::from("trail")));
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let service = connect(&settings()).unwrap();
        let written = DocumentPath::new("bikes", "b1").unwrap();
        let missing = DocumentPath::new("bikes", "nope").unwrap();

        let err = service
            .commit(
                &[
                    set(&written, document([("km", 1)])),
                    WriteOperation::Update {
                        path: missing,
                        fields: document([("km", 2)]),
                    },
                ],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(service.get(&written).unwrap(), None);
    }

    #[test]
    fn test_precondition_conflict() {
        let service = connect(&settings()).unwrap();
        let path = DocumentPath::new("bikes", "b1").unwrap();
        let first = service
            .commit(&[set(&path, document([("km", 1)]))], &[])
            .unwrap();
        service
            .commit(&[set(&path, document([("km", 2)]))], &[])
            .unwrap();

        let err = service
            .commit(
                &[set(&path, document([("km", 3)]))],
                &[Precondition {
                    path: path.clone(),
                    revision: Some(first),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_nested_rows_carry_foreign_key() {
        let service = connect(&settings()).unwrap();
        let child = DocumentPath::parse("bikes/b1/components/c1").unwrap();
        service
            .commit(&[set(&child, document([("kind", "chain")]))], &[])
            .unwrap();

        let bike_id: String = service
            .conn
            .lock()
            .query_row("SELECT bike_id FROM components WHERE id = 'c1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(bike_id, "b1");

        let other_parent = CollectionPath::parse("bikes/b2/components").unwrap();
        assert!(service.query(&other_parent, &QuerySpec::default()).unwrap().is_empty());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings();
        settings.database_url = Some(dir.path().join("garage.db").display().to_string());
        let service = connect(&settings).unwrap();
        service
            .commit(
                &[set(&DocumentPath::new("bikes", "b1").unwrap(), document([("km", 1)]))],
                &[],
            )
            .unwrap();
        assert!(dir.path().join("garage.db").exists());
    }
}
