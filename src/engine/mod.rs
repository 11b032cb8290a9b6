// ============================================================================
// spark-query - Query Engine
// The cache engine collaborator: client, cache, observers, fetch dispatch
// ============================================================================

pub mod cache;
pub mod client;
pub mod fetch;
pub mod infinite;
pub mod mutation;
pub mod observer;

pub use client::{ClientConfig, QueryClient};
pub use fetch::{FetchHandle, FetchMode, FetchOutcome};
pub use infinite::{InfiniteQueryObserver, PageFetchFn, PageParamFn};
pub use mutation::{MutationFn, MutationObserver};
pub use observer::{FetchFn, QueryObserver, Unsubscribe};
