//! Document store backend.
//!
//! Adapters translate the neutral capability interfaces onto the document
//! engine in [`engine`]: native timestamps, native query evaluation, field
//! transforms applied at commit time and nested collections under documents.

pub mod auth;
pub mod codec;
pub mod database;
pub mod engine;
pub mod provider;
pub mod storage;

pub use auth::DocstoreAuth;
pub use database::{capabilities, DocstoreDatabase, MAX_IN_VALUES};
pub use provider::DocstoreProvider;
pub use storage::DocstoreStorage;

/// Registry name of this backend.
pub const BACKEND_NAME: &str = "docstore";
