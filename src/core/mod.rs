// ============================================================================
// spark-query - Core Types
// ============================================================================

pub mod error;
pub mod key;
pub mod options;
pub mod snapshot;

pub use error::{AbortReason, FetchError, QueryError, QueryResult};
pub use key::{hash_key, KeyHashFn, QueryFilter, QueryHash, QueryKey};
pub use options::{
    DefaultOptions, Enabled, MergedOptions, NotifyScope, OptionsPatch, QueryOptions,
    ResolvedOptions, RetryPolicy, ThrowOnError,
};
pub use snapshot::{
    FetchStatus, InfiniteData, MutationSnapshot, MutationStatus, QuerySnapshot, QueryStatus,
};
