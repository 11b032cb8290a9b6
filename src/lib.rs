// ============================================================================
// spark-query - Reactive Query Bindings for Rust
// ============================================================================
//
// A pull-based query/mutation cache with a fine-grained reactive front end.
// The `engine` layer owns cache entries, fetch dispatch, and observers; the
// `binding` layer adapts their push callbacks into observable cells; the
// `controllers` layer composes both into Query / InfiniteQuery / Mutation
// handles with scoped cancellation and lazy subscription.
// ============================================================================

#[macro_use]
mod macros;

pub mod binding;
pub mod controllers;
pub mod core;
pub mod engine;
pub mod reactive;

// Re-export core items at crate root for ergonomic access
pub use core::error::{AbortReason, FetchError, QueryError, QueryResult};
pub use core::key::{hash_key, KeyHashFn, QueryFilter, QueryHash, QueryKey};
pub use core::options::{
    DefaultOptions, Enabled, MergedOptions, NotifyScope, OptionsPatch, QueryOptions,
    ResolvedOptions, RetryPolicy, ThrowOnError,
};
pub use core::snapshot::{
    FetchStatus, InfiniteData, MutationSnapshot, MutationStatus, QuerySnapshot, QueryStatus,
};

// Engine: cache, client, observers
pub use engine::{
    ClientConfig, FetchFn, FetchHandle, FetchMode, FetchOutcome, InfiniteQueryObserver,
    MutationFn, MutationObserver, PageFetchFn, PageParamFn, QueryClient, QueryObserver,
    Unsubscribe,
};

// Binding layer: cancellation, lazy observation, result slots, reconciliation
pub use binding::{
    AbortSignal, CancellationScope, DynamicKeyFn, DynamicOptionsFn, EnabledGate,
    LazyObservationBridge, Rearm, Reconciler, ReconcilerConfig, ResultSlot,
};

// Controllers: the user-facing lifecycle handles
pub use controllers::{
    Activation, InfiniteQuery, InfiniteQueryConfig, InvalidateAfter, Mutation, MutationConfig,
    Query, QueryConfig, RemoveOnDestroy, Subscription,
};

// Reactive substrate
pub use reactive::{
    advance_clock, batch, default_equals, never_equals, now_ms, untrack, watch_memo, EqualsFn,
    ObservableCell, ObservedHooks, TimerId, Watcher,
};

#[doc(hidden)]
pub use serde_json::json as __json;

// =============================================================================
// TESTS
// =============================================================================
