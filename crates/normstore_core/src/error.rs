//! Error types for the store core.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure of the transport capability.
///
/// The store never interprets transport failures; it wraps whatever the
/// capability reports and propagates it to the caller. The type is `Clone`
/// because a settled failure may be delivered to every caller sharing a
/// deduplicated in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport call failed: {message}")]
pub struct TransportError {
    /// Description of the failure as reported by the transport.
    pub message: String,
    /// Protocol status code, when the transport has one.
    pub status: Option<u16>,
}

impl TransportError {
    /// Creates a transport error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// Creates a transport error carrying a protocol status code.
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

/// Errors that can occur in store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A load or write operation was attempted without a transport capability.
    #[error("no transport capability configured for this store")]
    Configuration,

    /// The operation targets a key absent from the collection.
    #[error("entity not found in collection: {key}")]
    NotFound {
        /// Debug rendering of the missing key.
        key: String,
    },

    /// A delete was requested on an entity already being deleted.
    #[error("entity is already being deleted: {key}")]
    Conflict {
        /// Debug rendering of the contested key.
        key: String,
    },

    /// The underlying transport call failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A payload could not be decoded into the entity type (or a request
    /// body could not be encoded).
    #[error("payload decode failed: {message}")]
    Decode {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a not-found error from any debuggable key.
    pub fn not_found(key: impl std::fmt::Debug) -> Self {
        Self::NotFound {
            key: format!("{key:?}"),
        }
    }

    /// Creates a conflict error from any debuggable key.
    pub fn conflict(key: impl std::fmt::Debug) -> Self {
        Self::Conflict {
            key: format!("{key:?}"),
        }
    }

    /// Creates a decode error.
    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        let err = TransportError::with_status("503 from upstream", 503);
        assert_eq!(err.status, Some(503));
        assert!(err.to_string().contains("503 from upstream"));
    }

    #[test]
    fn store_error_from_transport() {
        let err: StoreError = TransportError::new("boom").into();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[test]
    fn not_found_renders_key() {
        let err = StoreError::not_found(42);
        assert_eq!(err.to_string(), "entity not found in collection: 42");
    }
}
