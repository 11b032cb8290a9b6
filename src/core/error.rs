// ============================================================================
// spark-query - Error Types
// ============================================================================

use thiserror::Error;

/// Result alias for operations that can fail with a [`QueryError`].
pub type QueryResult<T> = std::result::Result<T, QueryError>;

/// Why a cancellation scope was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The owning controller was destroyed explicitly.
    Destroyed,
    /// A linked parent signal aborted.
    Parent,
    /// The in-flight fetch itself was cancelled by the engine.
    Fetch,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destroyed => write!(f, "controller destroyed"),
            Self::Parent => write!(f, "parent signal aborted"),
            Self::Fetch => write!(f, "fetch cancelled"),
        }
    }
}

/// Error produced by a query or mutation function.
///
/// Recorded into the result snapshot unconditionally; surfaced to a caller
/// only under throw policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors surfaced from awaited controller operations
/// (`refetch`, `start`, `mutate`, page fetches).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The fetch settled with an error and throw policy applied.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The operation's governing signal aborted before it settled.
    /// Distinct from a fetch error; never retried, never swallowed.
    #[error("operation cancelled: {0}")]
    Cancelled(AbortReason),
}

impl QueryError {
    /// The underlying fetch error, if this is one.
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) => Some(e),
            Self::Cancelled(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_display() {
        let e = FetchError::new("BAD");
        assert_eq!(e.to_string(), "BAD");
        assert_eq!(QueryError::from(e).to_string(), "fetch failed: BAD");
    }

    #[test]
    fn cancelled_display_carries_reason() {
        let e = QueryError::Cancelled(AbortReason::Destroyed);
        assert_eq!(e.to_string(), "operation cancelled: controller destroyed");
        assert!(e.as_fetch().is_none());
    }
}
