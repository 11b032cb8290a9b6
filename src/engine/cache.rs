// ============================================================================
// spark-query - Query Cache
// Hash-addressed entries with type-erased data and listener counting
// ============================================================================
//
// Entries are shared: multiple observers on the same hash hold the same
// `Rc<QueryEntry>` and coordinate only through its listener list. Data is
// stored type-erased (`Rc<dyn Any>`); observers downcast on read. An entry's
// state is replaced field-wise under a single RefCell so listeners always
// see a consistent snapshot.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::core::error::FetchError;
use crate::core::key::{QueryFilter, QueryHash, QueryKey};
use crate::core::snapshot::{FetchStatus, QuerySnapshot, QueryStatus};
use crate::engine::fetch::{FetchHandle, FetchOutcome};

// =============================================================================
// ENTRY STATE
// =============================================================================

pub(crate) struct EntryState {
    pub data: Option<Rc<dyn Any>>,
    pub error: Option<FetchError>,
    pub data_updated_at: Option<u64>,
    pub error_updated_at: Option<u64>,
    pub fetch_count: u64,
    pub failure_count: u32,
    pub fetch_status: FetchStatus,
    pub data_stamp: u64,
    pub error_stamp: u64,
    /// Set by invalidation; an invalidated entry refetches on next mount
    /// even though it still has data. Cleared by the next success.
    pub invalidated: bool,
}

impl EntryState {
    fn fresh() -> Self {
        Self {
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            fetch_count: 0,
            failure_count: 0,
            fetch_status: FetchStatus::Idle,
            data_stamp: 0,
            error_stamp: 0,
            invalidated: false,
        }
    }

    fn status(&self) -> QueryStatus {
        if self.data.is_some() {
            QueryStatus::Success
        } else if self.error.is_some() {
            QueryStatus::Error
        } else {
            QueryStatus::Pending
        }
    }
}

/// The fetch currently owned by an entry. The cancelled flag is checked by
/// the job before recording anything; a cancelled job leaves the entry
/// untouched.
pub(crate) struct InFlight {
    pub handle: FetchHandle,
    pub cancelled: Rc<Cell<bool>>,
}

// =============================================================================
// QUERY ENTRY
// =============================================================================

struct EntryListener {
    id: u64,
    on_change: Rc<dyn Fn()>,
    on_invalidate: Rc<dyn Fn()>,
}

pub(crate) struct QueryEntry {
    pub key: QueryKey,
    pub hash: QueryHash,
    pub state: RefCell<EntryState>,
    listeners: RefCell<Vec<EntryListener>>,
    next_listener_id: Cell<u64>,
    pub in_flight: RefCell<Option<InFlight>>,
}

impl QueryEntry {
    pub(crate) fn new(key: QueryKey, hash: QueryHash) -> Self {
        Self {
            key,
            hash,
            state: RefCell::new(EntryState::fresh()),
            listeners: RefCell::new(Vec::new()),
            next_listener_id: Cell::new(1),
            in_flight: RefCell::new(None),
        }
    }

    // -- listeners ------------------------------------------------------------

    pub(crate) fn add_listener(&self, on_change: Rc<dyn Fn()>, on_invalidate: Rc<dyn Fn()>) -> u64 {
        let id = self.next_listener_id.get();
        self.next_listener_id.set(id + 1);
        self.listeners.borrow_mut().push(EntryListener {
            id,
            on_change,
            on_invalidate,
        });
        id
    }

    pub(crate) fn remove_listener(&self, id: u64) {
        self.listeners.borrow_mut().retain(|l| l.id != id);
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Notify every listener of a state change. Collect-then-run: a callback
    /// may add or remove listeners on this entry.
    pub(crate) fn notify(&self) {
        let callbacks: Vec<Rc<dyn Fn()>> = self
            .listeners
            .borrow()
            .iter()
            .map(|l| l.on_change.clone())
            .collect();
        for cb in callbacks {
            cb();
        }
    }

    pub(crate) fn notify_invalidate(&self) {
        let callbacks: Vec<Rc<dyn Fn()>> = self
            .listeners
            .borrow()
            .iter()
            .map(|l| l.on_invalidate.clone())
            .collect();
        for cb in callbacks {
            cb();
        }
    }

    // -- state ----------------------------------------------------------------

    /// Project the entry state into a typed snapshot. Data of a foreign type
    /// reads as absent, which cannot happen while one controller owns the
    /// entry's fetch functions.
    pub(crate) fn snapshot<T: Clone + 'static>(&self) -> QuerySnapshot<T> {
        let state = self.state.borrow();
        QuerySnapshot {
            status: state.status(),
            fetch_status: state.fetch_status,
            data: state
                .data
                .as_ref()
                .and_then(|d| d.downcast_ref::<T>())
                .cloned(),
            error: state.error.clone(),
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            fetch_count: state.fetch_count,
            failure_count: state.failure_count,
            data_stamp: state.data_stamp,
            error_stamp: state.error_stamp,
        }
    }

    pub(crate) fn has_data(&self) -> bool {
        self.state.borrow().data.is_some()
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.state.borrow().invalidated
    }

    /// Mark stale and tell listening observers to refetch.
    pub(crate) fn invalidate(&self) {
        self.state.borrow_mut().invalidated = true;
        self.notify_invalidate();
    }

    /// Direct cache write, bypassing fetch. Counts as a success settle for
    /// listener purposes but not as a fetch.
    pub(crate) fn write_data(&self, data: Rc<dyn Any>, stamp: u64, now: u64) {
        {
            let mut state = self.state.borrow_mut();
            state.data = Some(data);
            state.error = None;
            state.data_updated_at = Some(now);
            state.failure_count = 0;
            state.data_stamp = stamp;
            state.invalidated = false;
        }
        self.notify();
    }

    pub(crate) fn record_success(&self, data: Rc<dyn Any>, stamp: u64, now: u64) {
        let mut state = self.state.borrow_mut();
        state.data = Some(data);
        state.error = None;
        state.data_updated_at = Some(now);
        state.fetch_count += 1;
        state.failure_count = 0;
        state.fetch_status = FetchStatus::Idle;
        state.data_stamp = stamp;
        state.invalidated = false;
    }

    pub(crate) fn record_error(&self, error: FetchError, stamp: u64, now: u64) {
        let mut state = self.state.borrow_mut();
        state.error = Some(error);
        state.error_updated_at = Some(now);
        state.fetch_count += 1;
        state.failure_count += 1;
        state.fetch_status = FetchStatus::Idle;
        state.error_stamp = stamp;
    }

    // -- in-flight ------------------------------------------------------------

    pub(crate) fn is_fetching(&self) -> bool {
        self.in_flight.borrow().is_some()
    }

    pub(crate) fn in_flight_handle(&self) -> Option<FetchHandle> {
        self.in_flight.borrow().as_ref().map(|f| f.handle.clone())
    }

    /// Claim the in-flight slot and flip to Fetching. Returns the cancel
    /// token for the job. Caller must have checked no fetch is in flight.
    pub(crate) fn begin_fetch(&self, handle: FetchHandle) -> Rc<Cell<bool>> {
        let cancelled = Rc::new(Cell::new(false));
        *self.in_flight.borrow_mut() = Some(InFlight {
            handle,
            cancelled: cancelled.clone(),
        });
        self.state.borrow_mut().fetch_status = FetchStatus::Fetching;
        cancelled
    }

    pub(crate) fn finish_fetch(&self) {
        *self.in_flight.borrow_mut() = None;
    }

    /// Cancel the in-flight fetch, if any: the token stops the job from
    /// recording anything, the handle settles Cancelled, and the entry goes
    /// back to Idle. No-op when nothing is in flight.
    pub(crate) fn cancel_in_flight(&self) {
        let Some(in_flight) = self.in_flight.borrow_mut().take() else {
            return;
        };
        in_flight.cancelled.set(true);
        in_flight.handle.settle(FetchOutcome::Cancelled);
        self.state.borrow_mut().fetch_status = FetchStatus::Idle;
        self.notify();
    }

    /// Reset to the never-fetched state, cancelling anything in flight.
    pub(crate) fn reset(&self) {
        self.cancel_in_flight();
        *self.state.borrow_mut() = EntryState::fresh();
        self.notify();
    }
}

// =============================================================================
// QUERY CACHE
// =============================================================================

pub(crate) struct QueryCache {
    entries: RefCell<HashMap<String, Rc<QueryEntry>>>,
}

impl QueryCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, hash: &QueryHash) -> Option<Rc<QueryEntry>> {
        self.entries.borrow().get(hash.as_str()).cloned()
    }

    pub(crate) fn get_or_create(&self, key: &QueryKey, hash: &QueryHash) -> Rc<QueryEntry> {
        if let Some(entry) = self.get(hash) {
            return entry;
        }
        let entry = Rc::new(QueryEntry::new(key.clone(), hash.clone()));
        self.entries
            .borrow_mut()
            .insert(hash.as_str().to_owned(), entry.clone());
        tracing::trace!(hash = %hash, "cache entry created");
        entry
    }

    /// Drop an entry from the map, cancelling its in-flight fetch. Observers
    /// still holding the Rc keep their last snapshot; the next reconfigure
    /// recreates the entry fresh.
    pub(crate) fn remove(&self, hash: &QueryHash) -> Option<Rc<QueryEntry>> {
        let entry = self.entries.borrow_mut().remove(hash.as_str());
        if let Some(entry) = &entry {
            entry.cancel_in_flight();
            tracing::trace!(hash = %hash, "cache entry removed");
        }
        entry
    }

    /// Entries matching a filter, optionally restricted to those with at
    /// most `max_listeners` listeners ("safe" bulk operations).
    pub(crate) fn find(
        &self,
        filter: &QueryFilter,
        max_listeners: Option<usize>,
    ) -> Vec<Rc<QueryEntry>> {
        self.entries
            .borrow()
            .values()
            .filter(|e| filter.matches(&e.key, &e.hash))
            .filter(|e| max_listeners.is_none_or(|max| e.listener_count() <= max))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::hash_key;
    use serde_json::json;

    fn entry() -> QueryEntry {
        let key = QueryKey::from_values(vec![json!("e")]);
        let hash = hash_key(&key);
        QueryEntry::new(key, hash)
    }

    #[test]
    fn fresh_entry_is_pending_idle() {
        let e = entry();
        let snap: QuerySnapshot<i32> = e.snapshot();
        assert_eq!(snap.status, QueryStatus::Pending);
        assert_eq!(snap.fetch_status, FetchStatus::Idle);
        assert!(!e.is_fetching());
    }

    #[test]
    fn success_then_error_keeps_data() {
        let e = entry();
        e.record_success(Rc::new(7i32), 1, 10);
        e.record_error(FetchError::new("boom"), 2, 20);

        let snap: QuerySnapshot<i32> = e.snapshot();
        // Data survives a later error; status reflects data presence.
        assert_eq!(snap.status, QueryStatus::Success);
        assert_eq!(snap.data, Some(7));
        assert_eq!(snap.error, Some(FetchError::new("boom")));
        assert_eq!(snap.fetch_count, 2);
        assert_eq!(snap.failure_count, 1);
    }

    #[test]
    fn cancel_in_flight_settles_handle_and_idles() {
        let e = entry();
        let handle = FetchHandle::pending();
        let token = e.begin_fetch(handle.clone());
        assert!(e.is_fetching());

        e.cancel_in_flight();
        assert!(token.get());
        assert_eq!(handle.outcome(), Some(FetchOutcome::Cancelled));
        assert!(!e.is_fetching());
        assert_eq!(e.state.borrow().fetch_status, FetchStatus::Idle);
    }

    #[test]
    fn listeners_notify_and_detach() {
        let e = Rc::new(entry());
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let id = e.add_listener(Rc::new(move || h.set(h.get() + 1)), Rc::new(|| {}));
        assert_eq!(e.listener_count(), 1);

        e.notify();
        assert_eq!(hits.get(), 1);

        e.remove_listener(id);
        e.notify();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn cache_addresses_by_hash() {
        let cache = QueryCache::new();
        let key = QueryKey::from_values(vec![json!("k")]);
        let hash = hash_key(&key);

        let a = cache.get_or_create(&key, &hash);
        let b = cache.get_or_create(&key, &hash);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.remove(&hash);
        assert!(cache.get(&hash).is_none());
    }

    #[test]
    fn find_respects_listener_cap() {
        let cache = QueryCache::new();
        let key = QueryKey::from_values(vec![json!("k")]);
        let hash = hash_key(&key);
        let entry = cache.get_or_create(&key, &hash);
        entry.add_listener(Rc::new(|| {}), Rc::new(|| {}));
        entry.add_listener(Rc::new(|| {}), Rc::new(|| {}));

        let filter = QueryFilter::all();
        assert_eq!(cache.find(&filter, None).len(), 1);
        assert_eq!(cache.find(&filter, Some(1)).len(), 0);
        assert_eq!(cache.find(&filter, Some(2)).len(), 1);
    }

    #[test]
    fn reset_returns_entry_to_fresh() {
        let e = entry();
        e.record_success(Rc::new(1i32), 1, 5);
        e.reset();

        let snap: QuerySnapshot<i32> = e.snapshot();
        assert_eq!(snap.status, QueryStatus::Pending);
        assert!(snap.data.is_none());
        assert_eq!(snap.fetch_count, 0);
    }
}
