//! Backend selection for the application.
//!
//! [`registry`] maps provider names to constructors; [`Backend`] owns the
//! client and server providers of one runtime and hands out their
//! capability interfaces.

pub mod backend;
pub mod registry;

pub use backend::{Backend, Runtime};
pub use registry::{capabilities, constructor, create_provider, provider_constructor, ProviderConstructor};

pub use gearshed_backend::{AuthProvider, Database, Provider, Storage};
pub use gearshed_config::ProviderKind;
