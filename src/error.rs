//! Error taxonomy for permission resolution and caching.

use thiserror::Error;

/// Errors surfaced by the caches, the resolver and the stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthzError {
    /// The authority store call failed or timed out.
    #[error("authority store unavailable during {operation}: {reason}")]
    StoreUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// A key component was malformed (e.g. a negative id).
    #[error("invalid {kind} id: {id}")]
    InvalidKey { kind: &'static str, id: i64 },

    /// A bounded backend is full and cannot evict.
    #[error("cache '{cache}' is exhausted")]
    CacheExhausted { cache: String },

    /// The shared cache backend failed (transport or payload encoding).
    #[error("cache backend '{cache}' failed: {reason}")]
    CacheBackend { cache: String, reason: String },

    /// Configuration could not be loaded or was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AuthzError {
    pub(crate) fn store(operation: &'static str, reason: impl ToString) -> Self {
        Self::StoreUnavailable {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Whether the error came from the authority store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = AuthzError> = std::result::Result<T, E>;
