//! Table layout of the relational engine.
//!
//! Every collection id maps to one table. Documents of nested collections
//! share the table of their collection id and are told apart by the
//! `parent` column, which holds the full path of the owning document. A
//! child table also carries a foreign key column with the parent
//! document's id, so the rows read naturally from plain SQL.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use gearshed_common::{CollectionPath, Error, Result};

use super::sqlite_error;

/// Prefix reserved for engine tables.
pub const RESERVED_PREFIX: char = '_';

const META_TABLE: &str = "_gearshed_meta";
const REVISION_KEY: &str = "revision";

/// Engine tables. Collection tables are created on first use.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS _gearshed_meta (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
";

/// Create the engine tables.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| sqlite_error("create engine tables", e))?;
    debug!(table = META_TABLE, "Engine schema ready");
    Ok(())
}

/// The table name for a collection id.
///
/// # Errors
/// - `InvalidInput` for characters outside `[A-Za-z0-9_-]` or a reserved name
pub fn table_name(collection_id: &str) -> Result<String> {
    let valid = !collection_id.is_empty()
        && collection_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(Error::InvalidInput(format!(
            "Collection id '{}' is not a valid table name",
            collection_id
        )));
    }
    if collection_id.starts_with(RESERVED_PREFIX) {
        return Err(Error::InvalidInput(format!(
            "Collection ids starting with '{}' are reserved: {}",
            RESERVED_PREFIX, collection_id
        )));
    }
    Ok(collection_id.to_string())
}

/// `"name"`, for names already checked by [`table_name`].
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Singular form of a plural collection id.
pub fn singular(name: &str) -> String {
    if let Some(stem) = name.strip_suffix("ies") {
        format!("{}y", stem)
    } else if let Some(stem) = name.strip_suffix("sses") {
        format!("{}ss", stem)
    } else if let Some(stem) = name.strip_suffix("xes") {
        format!("{}x", stem)
    } else if let Some(stem) = name.strip_suffix('s') {
        stem.to_string()
    } else {
        name.to_string()
    }
}

/// Foreign key column names of nested collections.
#[derive(Debug, Clone, Default)]
pub struct ForeignKeys {
    /// Column per `parent/child` collection id pair.
    explicit: BTreeMap<String, String>,
}

impl ForeignKeys {
    pub fn new(explicit: BTreeMap<String, String>) -> Self {
        Self { explicit }
    }

    /// The column linking `child` rows to documents of `parent`.
    pub fn column(&self, parent: &str, child: &str) -> String {
        if let Some(column) = self.explicit.get(&format!("{}/{}", parent, child)) {
            return column.clone();
        }
        let column = format!("{}_id", singular(parent));
        debug!(
            parent = %parent,
            child = %child,
            column = %column,
            "No foreign key mapping, using naming convention"
        );
        column
    }
}

/// Where the rows of a collection live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub table: String,
    /// Full path of the owning document; empty for top-level collections.
    pub parent: String,
    /// Foreign key column and the owning document's id, for nested collections.
    pub foreign_key: Option<(String, String)>,
}

impl Location {
    /// # Errors
    /// - `InvalidInput` when a collection id is not a valid table name
    pub fn of(collection: &CollectionPath, keys: &ForeignKeys) -> Result<Self> {
        let table = table_name(collection.id())?;
        let Some(parent) = collection.parent() else {
            return Ok(Self {
                table,
                parent: String::new(),
                foreign_key: None,
            });
        };
        let parent_collection = parent.parent();
        table_name(parent_collection.id())?;
        let column = keys.column(parent_collection.id(), collection.id());
        Ok(Self {
            table,
            foreign_key: Some((column, parent.id().to_string())),
            parent: parent.to_string(),
        })
    }
}

/// Tables and columns known to exist, so DDL runs once per connection.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashSet<String>,
    columns: HashSet<(String, String)>,
}

impl Catalog {
    /// Create the table and foreign key column of `location` if missing.
    pub fn ensure(&mut self, conn: &Connection, location: &Location) -> Result<()> {
        if !self.tables.contains(&location.table) {
            let table = quote(&location.table);
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT NOT NULL,
                    parent TEXT NOT NULL DEFAULT '',
                    data TEXT NOT NULL,
                    revision INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (parent, id)
                );",
                table = table
            ))
            .map_err(|e| sqlite_error("create collection table", e))?;
            debug!(table = %location.table, "Collection table ready");
            self.tables.insert(location.table.clone());
        }

        if let Some((column, _)) = &location.foreign_key {
            let key = (location.table.clone(), column.clone());
            if !self.columns.contains(&key) {
                if !has_column(conn, &location.table, column)? {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {table} ADD COLUMN {column} TEXT;
                         CREATE INDEX IF NOT EXISTS {index} ON {table} ({column});",
                        table = quote(&location.table),
                        column = quote(column),
                        index = quote(&format!("{}_{}_idx", location.table, column)),
                    ))
                    .map_err(|e| sqlite_error("add foreign key column", e))?;
                    debug!(table = %location.table, column = %column, "Added foreign key column");
                }
                self.columns.insert(key);
            }
        }
        Ok(())
    }

    /// Whether the table of `location` exists, without creating it.
    pub fn exists(&self, conn: &Connection, location: &Location) -> Result<bool> {
        if self.tables.contains(&location.table) {
            return Ok(true);
        }
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![location.table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sqlite_error("look up table", e))?;
        Ok(found.is_some())
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote(table)))
        .map_err(|e| sqlite_error("read table info", e))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| sqlite_error("read table info", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| sqlite_error("read table info", e))?;
    Ok(names.iter().any(|name| name == column))
}

/// Advance the global revision counter and return the new value.
pub fn next_revision(conn: &Connection) -> Result<u64> {
    conn.execute(
        "INSERT INTO _gearshed_meta (key, value) VALUES (?1, 1)
         ON CONFLICT(key) DO UPDATE SET value = value + 1",
        params![REVISION_KEY],
    )
    .map_err(|e| sqlite_error("advance revision", e))?;
    let value: i64 = conn
        .query_row(
            "SELECT value FROM _gearshed_meta WHERE key = ?1",
            params![REVISION_KEY],
            |row| row.get(0),
        )
        .map_err(|e| sqlite_error("read revision", e))?;
    u64::try_from(value).map_err(|_| Error::Backend(format!("Negative revision {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singular() {
        assert_eq!(singular("bikes"), "bike");
        assert_eq!(singular("categories"), "category");
        assert_eq!(singular("addresses"), "address");
        assert_eq!(singular("boxes"), "box");
        assert_eq!(singular("gear"), "gear");
    }

    #[test]
    fn test_table_names() {
        assert_eq!(table_name("service-logs").unwrap(), "service-logs");
        assert!(table_name("_gearshed_meta").is_err());
        assert!(table_name("bikes; DROP TABLE x").is_err());
        assert!(table_name("bïkes").is_err());
    }

    #[test]
    fn test_foreign_key_mapping_first() {
        let mut explicit = BTreeMap::new();
        explicit.insert("bikes/components".to_string(), "frame_ref".to_string());
        let keys = ForeignKeys::new(explicit);
        assert_eq!(keys.column("bikes", "components"), "frame_ref");
        assert_eq!(keys.column("bikes", "rides"), "bike_id");
        assert_eq!(keys.column("categories", "parts"), "category_id");
    }

    #[test]
    fn test_nested_location() {
        let path = CollectionPath::parse("bikes/b1/components").unwrap();
        let location = Location::of(&path, &ForeignKeys::default()).unwrap();
        assert_eq!(location.table, "components");
        assert_eq!(location.parent, "bikes/b1");
        assert_eq!(
            location.foreign_key,
            Some(("bike_id".to_string(), "b1".to_string()))
        );

        let top = Location::of(&CollectionPath::new("bikes").unwrap(), &ForeignKeys::default())
            .unwrap();
        assert_eq!(top.parent, "");
        assert_eq!(top.foreign_key, None);
    }

    #[test]
    fn test_catalog_adds_columns_once() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        let mut catalog = Catalog::default();
        let location = Location::of(
            &CollectionPath::parse("bikes/b1/components").unwrap(),
            &ForeignKeys::default(),
        )
        .unwrap();

        assert!(!catalog.exists(&conn, &location).unwrap());
        catalog.ensure(&conn, &location).unwrap();
        catalog.ensure(&conn, &location).unwrap();
        assert!(catalog.exists(&conn, &location).unwrap());
        assert!(has_column(&conn, "components", "bike_id").unwrap());

        // A fresh catalog sees the column already present.
        Catalog::default().ensure(&conn, &location).unwrap();
    }

    #[test]
    fn test_revisions_increase() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        assert_eq!(next_revision(&conn).unwrap(), 1);
        assert_eq!(next_revision(&conn).unwrap(), 2);
    }
}
