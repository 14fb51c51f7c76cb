//! Object metadata index.
//!
//! Object bytes live in files under the storage root; their size and
//! content type are indexed here so existence checks and URLs do not touch
//! the filesystem.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use gearshed_common::{ObjectPath, Result};

use super::sqlite_error;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS _storage_objects (
        bucket TEXT NOT NULL,
        name TEXT NOT NULL,
        size INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (bucket, name)
    );
";

/// An indexed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub size: u64,
    pub content_type: String,
}

/// Objects of every bucket of one project.
pub struct ObjectIndex {
    conn: Arc<Mutex<Connection>>,
    root: PathBuf,
}

impl ObjectIndex {
    /// # Errors
    /// - `Backend` when the index table cannot be created
    pub fn new(conn: Arc<Mutex<Connection>>, root: PathBuf) -> Result<Self> {
        conn.lock()
            .execute_batch(SCHEMA)
            .map_err(|e| sqlite_error("create object index", e))?;
        Ok(Self { conn, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the bytes of `path` in `bucket`.
    pub fn file_path(&self, bucket: &str, path: &ObjectPath) -> PathBuf {
        path.components()
            .iter()
            .fold(self.root.join(bucket), |dir, component| dir.join(component))
    }

    pub fn put(&self, bucket: &str, path: &ObjectPath, entry: &ObjectEntry) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO _storage_objects (bucket, name, size, content_type, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    bucket,
                    path.as_key(),
                    i64::try_from(entry.size).unwrap_or(i64::MAX),
                    entry.content_type,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| sqlite_error("index object", e))?;
        debug!(bucket = %bucket, path = %path, size = entry.size, "Indexed object");
        Ok(())
    }

    pub fn get(&self, bucket: &str, path: &ObjectPath) -> Result<Option<ObjectEntry>> {
        self.conn
            .lock()
            .query_row(
                "SELECT size, content_type FROM _storage_objects WHERE bucket = ?1 AND name = ?2",
                params![bucket, path.as_key()],
                |row| {
                    Ok(ObjectEntry {
                        size: u64::try_from(row.get::<_, i64>(0)?).unwrap_or_default(),
                        content_type: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| sqlite_error("look up object", e))
    }

    /// Remove an entry; whether it existed.
    pub fn remove(&self, bucket: &str, path: &ObjectPath) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM _storage_objects WHERE bucket = ?1 AND name = ?2",
                params![bucket, path.as_key()],
            )
            .map_err(|e| sqlite_error("remove object", e))?;
        Ok(removed > 0)
    }
}
