//! Backend configuration.
//!
//! Resolves which backend provider is active and loads its settings as a
//! client-safe part and a privileged server part. The client part is also
//! served over HTTP for runtimes that cannot read server variables.

pub mod docstore;
pub mod endpoint;
pub mod env;
pub mod loader;
pub mod provider;
pub mod relational;
mod require;
pub mod source;

pub use docstore::{DocstoreClientConfig, DocstoreServerConfig};
pub use env::{EnvSource, MapEnv, ProcessEnv};
pub use loader::{load_client_config, load_server_config, ClientConfig, ServerConfig};
pub use provider::{resolve_provider_kind, ProviderKind};
pub use relational::{RelationalClientConfig, RelationalServerConfig};
pub use source::ConfigSource;
