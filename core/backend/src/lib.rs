//! Capability interfaces of the gearshed backend layer.
//!
//! Application code talks to a backend only through the [`AuthProvider`],
//! [`Database`] and [`Storage`] traits and the neutral value model defined
//! here. Each backend crate implements the traits with its own adapters and
//! bundles them in a [`Provider`].

pub mod auth;
pub mod batch;
pub mod capabilities;
pub mod database;
pub mod guard;
pub mod ids;
pub mod provider;
pub mod query;
pub mod snapshot;
pub mod storage;
pub mod subscription;
pub mod value;

pub use auth::{
    AuthProvider, AuthSession, AuthStateCallback, AuthUser, DecodedIdToken, ProfileUpdate,
    UserRecord,
};
pub use batch::{
    Precondition, SetOptions, Transaction, WriteBatch, WriteOperation, MAX_TRANSACTION_ATTEMPTS,
    MAX_WRITES_PER_COMMIT,
};
pub use capabilities::{Capabilities, NestingModel};
pub use database::{
    Database, DistanceMeasure, DocumentCallback, QueryCallback, VectorSearchOptions,
};
pub use guard::{ensure_context, CheckedDatabase};
pub use ids::auto_id;
pub use provider::{Lifecycle, Provider, ProviderState};
pub use query::{Bound, Cursor, Direction, Filter, FilterOp, Order, QueryConstraint, QuerySpec};
pub use snapshot::{DocumentSnapshot, QuerySnapshot};
pub use storage::{DataUrl, Storage, UploadResult, DEFAULT_CONTENT_TYPE};
pub use subscription::{Emitter, ListenerRegistration, ListenerSet};
pub use value::{
    document, Document, FieldValue, FieldValueKind, NativeTimestamp, Numeric, Value,
};

pub use gearshed_common::{
    AuthErrorCode, CollectionPath, DocumentPath, Error, ExecutionContext, ObjectPath, Result,
};
