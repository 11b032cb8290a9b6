// ============================================================================
// spark-query - Result Snapshots
// Immutable views of query and mutation state pushed into the reactive layer
// ============================================================================

use crate::core::error::FetchError;

// =============================================================================
// STATUS ENUMS
// =============================================================================

/// Data availability of a query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data has ever been produced.
    Pending,
    /// The last settle was an error and no newer data exists.
    Error,
    /// Data is available.
    Success,
}

/// Activity of a query entry, orthogonal to [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// A fetch is currently running.
    Fetching,
    /// A fetch wants to run but is held back (offline / gated).
    Paused,
    /// Nothing in flight.
    Idle,
}

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Error,
    Success,
}

// =============================================================================
// QUERY SNAPSHOT
// =============================================================================

/// One immutable observation of a query entry's state.
///
/// Snapshots are value objects: each push into the result slot replaces the
/// previous one wholesale, so consumers never see partial updates.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<T>,
    pub error: Option<FetchError>,
    /// Virtual-clock timestamp of the last successful settle, if any.
    pub data_updated_at: Option<u64>,
    /// Virtual-clock timestamp of the last error settle, if any.
    pub error_updated_at: Option<u64>,
    /// Total settles (success or error) recorded on the entry.
    pub fetch_count: u64,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Monotonic identity of the last success settle (0 = never). The clock
    /// is virtual and may not move between fetches, so timestamps alone
    /// cannot distinguish consecutive settles.
    pub data_stamp: u64,
    /// Monotonic identity of the last error settle (0 = never).
    pub error_stamp: u64,
}

impl<T> QuerySnapshot<T> {
    /// A fresh snapshot for an entry that has never fetched.
    pub fn pending() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            fetch_count: 0,
            failure_count: 0,
            data_stamp: 0,
            error_stamp: 0,
        }
    }

    /// Whether a fetch has ever settled on this entry.
    pub fn is_fetched(&self) -> bool {
        self.fetch_count > 0
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// Initial load: pending with a fetch in flight.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Whether the data is older than `stale_time_ms` at virtual time `now`.
    /// Entries without data are always stale.
    pub fn is_stale(&self, stale_time_ms: u64, now: u64) -> bool {
        match self.data_updated_at {
            Some(at) => now.saturating_sub(at) >= stale_time_ms,
            None => true,
        }
    }
}

// =============================================================================
// INFINITE DATA
// =============================================================================

/// Accumulated pages of an infinite query, with the parameter that produced
/// each page kept in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteData<T, P> {
    pub pages: Vec<T>,
    pub page_params: Vec<P>,
}

impl<T, P> InfiniteData<T, P> {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn last_page(&self) -> Option<(&T, &P)> {
        self.pages.last().zip(self.page_params.last())
    }

    pub fn first_page(&self) -> Option<(&T, &P)> {
        self.pages.first().zip(self.page_params.first())
    }
}

impl<T, P> Default for InfiniteData<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// MUTATION SNAPSHOT
// =============================================================================

/// One immutable observation of a mutation's state. `V` is the variables
/// type passed to `mutate`.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationSnapshot<T, V> {
    pub status: MutationStatus,
    pub data: Option<T>,
    pub error: Option<FetchError>,
    /// Variables of the most recent `mutate` call.
    pub variables: Option<V>,
    /// Virtual-clock timestamp of the last settle, if any.
    pub submitted_at: Option<u64>,
    /// Monotonic identity of the last settle (0 = never settled).
    pub settle_stamp: u64,
}

impl<T, V> MutationSnapshot<T, V> {
    pub fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            submitted_at: None,
            settle_stamp: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_snapshot_shape() {
        let snap: QuerySnapshot<i32> = QuerySnapshot::pending();
        assert!(snap.is_pending());
        assert!(!snap.is_fetched());
        assert!(!snap.is_fetching());
        assert!(snap.data.is_none());
    }

    #[test]
    fn staleness_without_data_is_always_stale() {
        let snap: QuerySnapshot<i32> = QuerySnapshot::pending();
        assert!(snap.is_stale(1_000_000, 0));
    }

    #[test]
    fn staleness_respects_stale_time() {
        let mut snap: QuerySnapshot<i32> = QuerySnapshot::pending();
        snap.data = Some(1);
        snap.status = QueryStatus::Success;
        snap.data_updated_at = Some(100);

        assert!(!snap.is_stale(50, 120));
        assert!(snap.is_stale(50, 150));
        // Zero stale time means data is immediately stale.
        assert!(snap.is_stale(0, 100));
    }

    #[test]
    fn infinite_data_page_access() {
        let mut data = InfiniteData::new();
        data.pages.push(vec![1, 2]);
        data.page_params.push(0);
        data.pages.push(vec![3]);
        data.page_params.push(1);

        assert_eq!(data.first_page(), Some((&vec![1, 2], &0)));
        assert_eq!(data.last_page(), Some((&vec![3], &1)));
    }

    #[test]
    fn mutation_snapshot_starts_idle() {
        let snap: MutationSnapshot<i32, String> = MutationSnapshot::idle();
        assert!(snap.is_idle());
        assert!(snap.variables.is_none());
    }
}
