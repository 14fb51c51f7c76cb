//! Common utilities and types shared across the gearshed backend layer.
//!
//! This crate provides the error taxonomy, the execution context marker and
//! the path types that every other crate speaks, so that no backend-specific
//! type leaks across crate boundaries.

pub mod error;
pub mod types;

pub use error::{AuthErrorCode, Error, Result};
pub use types::{CollectionPath, DocumentPath, ExecutionContext, ObjectPath, SecretString};
