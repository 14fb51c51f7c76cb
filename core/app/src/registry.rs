//! Provider registry.

use std::sync::Arc;
use tracing::debug;

use gearshed_backend::{Capabilities, Provider};
use gearshed_common::{ExecutionContext, Result};
use gearshed_config::{ConfigSource, ProviderKind};
use gearshed_docstore::DocstoreProvider;
use gearshed_relational::RelationalProvider;

/// Builds an uninitialized provider.
pub type ProviderConstructor = fn(ExecutionContext, ConfigSource) -> Arc<dyn Provider>;

fn docstore(context: ExecutionContext, source: ConfigSource) -> Arc<dyn Provider> {
    Arc::new(DocstoreProvider::new(context, source))
}

fn relational(context: ExecutionContext, source: ConfigSource) -> Arc<dyn Provider> {
    Arc::new(RelationalProvider::new(context, source))
}

/// The constructor registered for `kind`.
pub fn constructor(kind: ProviderKind) -> ProviderConstructor {
    match kind {
        ProviderKind::Docstore => docstore,
        ProviderKind::Relational => relational,
    }
}

/// What the provider registered for `kind` supports.
pub fn capabilities(kind: ProviderKind) -> Capabilities {
    match kind {
        ProviderKind::Docstore => gearshed_docstore::capabilities(),
        ProviderKind::Relational => gearshed_relational::capabilities(),
    }
}

/// The constructor registered under `name`.
///
/// # Errors
/// - `Configuration` listing the valid names when `name` is unknown
pub fn provider_constructor(name: &str) -> Result<(ProviderKind, ProviderConstructor)> {
    let kind: ProviderKind = name.parse()?;
    Ok((kind, constructor(kind)))
}

pub fn create_provider(
    kind: ProviderKind,
    context: ExecutionContext,
    source: ConfigSource,
) -> Arc<dyn Provider> {
    debug!(provider = %kind, context = %context, "Creating provider");
    constructor(kind)(context, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_backend::ProviderState;
    use gearshed_common::Error;
    use gearshed_config::MapEnv;

    #[test]
    fn test_every_kind_is_registered() {
        for kind in ProviderKind::ALL {
            let provider = create_provider(
                kind,
                ExecutionContext::Client,
                ConfigSource::environment(Arc::new(MapEnv::new())),
            );
            assert_eq!(provider.name(), kind.as_str());
            assert_eq!(provider.state(), ProviderState::Uninitialized);
            assert_eq!(provider.capabilities(), capabilities(kind));
            assert_eq!(capabilities(kind).backend, kind.as_str());
        }
    }

    #[test]
    fn test_unknown_name_fails_closed() {
        let err = provider_constructor("mongo").map(|(kind, _)| kind).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: unknown backend provider 'mongo'; valid options: docstore, relational"
        );

        let (kind, _) = provider_constructor("relational").unwrap();
        assert_eq!(kind, ProviderKind::Relational);
    }
}
