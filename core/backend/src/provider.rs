//! Provider: one backend's capability objects and their lifecycle.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use gearshed_common::{ExecutionContext, Result};

use crate::auth::AuthProvider;
use crate::capabilities::Capabilities;
use crate::database::Database;
use crate::storage::Storage;

/// Lifecycle state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Uninitialized,
    Initializing,
    Initialized,
}

/// One backend: its capability objects and their one-time setup.
///
/// Accessors fail with `NotInitialized` before [`Provider::initialize`]
/// completes. The server accessors fail with `ContextViolation` on a
/// client-context provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name, e.g. `docstore`.
    fn name(&self) -> &'static str;

    fn context(&self) -> ExecutionContext;

    fn state(&self) -> ProviderState;

    fn is_initialized(&self) -> bool {
        self.state() == ProviderState::Initialized
    }

    /// Load configuration and open the backend session(s).
    ///
    /// Idempotent; concurrent callers share one initialization.
    async fn initialize(&self) -> Result<()>;

    fn capabilities(&self) -> Capabilities;

    fn auth(&self) -> Result<Arc<dyn AuthProvider>>;

    fn db(&self) -> Result<Arc<dyn Database>>;

    fn storage(&self) -> Result<Arc<dyn Storage>>;

    fn server_auth(&self) -> Result<Arc<dyn AuthProvider>>;

    fn server_db(&self) -> Result<Arc<dyn Database>>;
}

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// One-time initialization cell with an observable [`ProviderState`].
///
/// A failed initialization returns the cell to `Uninitialized` so a later
/// call can try again.
pub struct Lifecycle<S> {
    state: AtomicU8,
    cell: OnceCell<S>,
}

impl<S> Lifecycle<S> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            cell: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ProviderState {
        match self.state.load(Ordering::Acquire) {
            INITIALIZED => ProviderState::Initialized,
            INITIALIZING => ProviderState::Initializing,
            _ => ProviderState::Uninitialized,
        }
    }

    /// The initialized value, if any.
    pub fn get(&self) -> Option<&S> {
        self.cell.get()
    }

    /// Run `init` unless a value is already present.
    pub async fn initialize<F, Fut>(&self, init: F) -> Result<&S>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }

        self.state.store(INITIALIZING, Ordering::Release);
        match self.cell.get_or_try_init(init).await {
            Ok(value) => {
                self.state.store(INITIALIZED, Ordering::Release);
                Ok(value)
            }
            Err(e) => {
                if self.cell.get().is_none() {
                    self.state.store(UNINITIALIZED, Ordering::Release);
                }
                Err(e)
            }
        }
    }
}

impl<S> Default for Lifecycle<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_common::Error;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new();
        let runs = AtomicUsize::new(0);
        assert_eq!(lifecycle.state(), ProviderState::Uninitialized);

        for _ in 0..3 {
            let value = lifecycle
                .initialize(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(*value, 7);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), ProviderState::Initialized);
    }

    #[tokio::test]
    async fn test_failed_initialize_can_retry() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new();
        let err = lifecycle
            .initialize(|| async { Err(Error::Configuration("missing".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(lifecycle.state(), ProviderState::Uninitialized);

        lifecycle.initialize(|| async { Ok(1) }).await.unwrap();
        assert_eq!(lifecycle.state(), ProviderState::Initialized);
    }
}
