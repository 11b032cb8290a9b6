// ============================================================================
// spark-query - Entity Lifecycle Controllers
// Query, InfiniteQuery, and Mutation: one engine observer each, wrapped in a
// cancellation scope, a result slot, and an options reconciler
// ============================================================================

pub(crate) mod listeners;

pub mod infinite;
pub mod mutation;
pub mod query;

/// When fetching may begin: immediately on construction, or deferred until
/// the first tracked read of the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Eager,
    OnDemand,
}

/// When the controller holds a live engine subscription: always, or only
/// while the result slot has reactive observers (with a debounce window
/// before detaching).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Eager,
    Lazy { unobserve_delay_ms: u64 },
}

impl Default for Subscription {
    fn default() -> Self {
        Self::Eager
    }
}

/// Cache eviction policy run when the controller is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoveOnDestroy {
    /// Leave entries in the cache.
    #[default]
    No,
    /// Evict even if other observers are still attached.
    Always,
    /// Evict only entries with no remaining observers.
    Safe,
}

pub use infinite::{InfiniteQuery, InfiniteQueryConfig};
pub use mutation::{InvalidateAfter, Mutation, MutationConfig};
pub use query::{Query, QueryConfig};
