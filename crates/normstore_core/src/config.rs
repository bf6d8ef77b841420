//! Store configuration.

use crate::entity::UidGen;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;

/// Configuration for constructing a [`Store`](crate::Store).
///
/// Carries the initial snapshot, the uid generator the snapshot was built
/// with, and optionally the transport capability. Construction is explicit:
/// no ambient injection, everything the store needs arrives here.
///
/// ```rust,ignore
/// let uids = UidGen::new();
/// let initial = AppState {
///     pokemon: EntityCollection::with_indices(&uids, seed, &["type"]),
/// };
/// let store = Store::new(
///     StoreConfig::new(initial, uids).with_transport(Arc::new(client)),
/// );
/// ```
#[derive(Clone)]
pub struct StoreConfig<S> {
    /// The initial snapshot; `reset()` restores exactly this value.
    pub initial: S,
    /// Uid generator shared with initial-state construction.
    pub uids: UidGen,
    /// Transport capability; absent means load/write operations fail with a
    /// configuration error.
    pub transport: Option<Arc<dyn Transport>>,
}

impl<S> StoreConfig<S> {
    /// Creates a configuration from an initial snapshot and its uid source.
    pub fn new(initial: S, uids: UidGen) -> Self {
        Self {
            initial,
            uids,
            transport: None,
        }
    }

    /// Sets the transport capability.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl<S: fmt::Debug> fmt::Debug for StoreConfig<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("initial", &self.initial)
            .field("has_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn defaults_to_no_transport() {
        let config = StoreConfig::new(0u32, UidGen::new());
        assert!(config.transport.is_none());
    }

    #[test]
    fn builder_attaches_transport() {
        let config =
            StoreConfig::new(0u32, UidGen::new()).with_transport(Arc::new(MockTransport::new()));
        assert!(config.transport.is_some());
    }
}
