//! Relational store backend.
//!
//! Collections map onto SQLite tables, one per collection name. Documents
//! are stored as JSON with tagged dates and bytes, queries are compiled to
//! SQL over the JSON columns, and nested collections become child tables
//! keyed by a foreign key column on the parent. Accounts, sessions and
//! object metadata live in reserved tables of the same database.

pub mod auth;
pub mod codec;
pub mod database;
pub mod engine;
pub mod provider;
pub mod storage;
pub mod writes;

pub use auth::RelationalAuth;
pub use database::{capabilities, RelationalDatabase};
pub use engine::Settings;
pub use provider::RelationalProvider;
pub use storage::RelationalStorage;

/// Registry name of this backend.
pub const BACKEND_NAME: &str = "relational";
