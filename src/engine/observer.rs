// ============================================================================
// spark-query - Query Observer
// Live binding between one cache entry and one consumer
// ============================================================================
//
// An observer owns the typed view of a cache entry: it projects entry state
// into QuerySnapshot<T>, pushes snapshots to subscribers, issues fetches
// through the client's dispatcher, and swaps entries when its options
// resolve to a different hash. Observers on the same hash share the entry
// but never reference each other; cancelling one never disturbs another.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::error::FetchError;
use crate::core::key::QueryKey;
use crate::core::options::{NotifyScope, ResolvedOptions};
use crate::core::snapshot::{QuerySnapshot, QueryStatus};
use crate::engine::cache::QueryEntry;
use crate::engine::client::QueryClient;
use crate::engine::fetch::{FetchHandle, FetchOutcome};
use crate::reactive::runtime::now_ms;

/// Fetch function: receives the key and the previously cached value (page
/// accumulation and refetch-all both need it).
pub type FetchFn<T> = Rc<dyn Fn(&QueryKey, Option<&T>) -> Result<T, FetchError>>;

/// One-shot detach returned by [`QueryObserver::subscribe`].
pub type Unsubscribe = Box<dyn FnOnce()>;

// =============================================================================
// OBSERVER INNER
// =============================================================================

struct ObserverInner<T: Clone + 'static> {
    client: QueryClient,
    fetch_fn: FetchFn<T>,
    options: RefCell<ResolvedOptions>,
    entry: RefCell<Rc<QueryEntry>>,
    entry_listener: Cell<Option<u64>>,
    subscribers: RefCell<Vec<(u64, Rc<dyn Fn(QuerySnapshot<T>)>)>>,
    next_sub_id: Cell<u64>,
    /// Signature of the last pushed snapshot, for Data-scope suppression.
    last_pushed: RefCell<Option<(QueryStatus, u64, u64)>>,
    destroyed: Cell<bool>,
    self_weak: RefCell<Weak<ObserverInner<T>>>,
}

impl<T: Clone + 'static> ObserverInner<T> {
    fn snapshot(&self) -> QuerySnapshot<T> {
        self.entry.borrow().snapshot()
    }

    fn attach_entry_listener(self: &Rc<Self>) {
        if self.entry_listener.get().is_some() {
            return;
        }
        let weak_change = self.self_weak.borrow().clone();
        let weak_invalidate = weak_change.clone();
        let id = self.entry.borrow().add_listener(
            Rc::new(move || {
                if let Some(inner) = weak_change.upgrade() {
                    inner.handle_change();
                }
            }),
            Rc::new(move || {
                if let Some(inner) = weak_invalidate.upgrade() {
                    inner.handle_invalidate();
                }
            }),
        );
        self.entry_listener.set(Some(id));
    }

    fn detach_entry_listener(&self) {
        if let Some(id) = self.entry_listener.take() {
            self.entry.borrow().remove_listener(id);
        }
    }

    fn handle_change(self: &Rc<Self>) {
        if self.destroyed.get() {
            return;
        }
        let snap = self.snapshot();
        let sig = (snap.status, snap.data_stamp, snap.error_stamp);
        let scope = self.options.borrow().notify;

        if scope == NotifyScope::Data && *self.last_pushed.borrow() == Some(sig) {
            return;
        }
        *self.last_pushed.borrow_mut() = Some(sig);

        let subs: Vec<Rc<dyn Fn(QuerySnapshot<T>)>> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in subs {
            cb(snap.clone());
        }
    }

    fn handle_invalidate(self: &Rc<Self>) {
        if self.destroyed.get() || !self.options.borrow().enabled {
            return;
        }
        self.fetch(self.fetch_fn.clone());
    }

    /// Issue a fetch unless one is already in flight (join it instead).
    fn fetch(self: &Rc<Self>, transform: FetchFn<T>) -> FetchHandle {
        if self.destroyed.get() {
            return FetchHandle::settled(FetchOutcome::Cancelled);
        }
        let entry = self.entry.borrow().clone();
        if let Some(handle) = entry.in_flight_handle() {
            return handle;
        }

        let handle = FetchHandle::pending();
        let cancelled = entry.begin_fetch(handle.clone());
        entry.notify();

        let client = self.client.clone();
        let job_entry = entry.clone();
        let job_handle = handle.clone();
        tracing::trace!(hash = %entry.hash, "fetch dispatched");

        self.client.dispatch(Box::new(move || {
            if cancelled.get() {
                return;
            }
            let prev = job_entry.state.borrow().data.clone();
            let prev_ref = prev.as_ref().and_then(|d| d.downcast_ref::<T>());
            let result = transform(&job_entry.key, prev_ref);
            if cancelled.get() {
                // Aborted while the job ran; the cancel path already settled
                // the handle and reset the entry.
                return;
            }
            let stamp = client.next_stamp();
            let outcome = match result {
                Ok(data) => {
                    job_entry.record_success(Rc::new(data), stamp, now_ms());
                    FetchOutcome::Success
                }
                Err(error) => {
                    job_entry.record_error(error.clone(), stamp, now_ms());
                    FetchOutcome::Failure(error)
                }
            };
            job_entry.finish_fetch();
            job_handle.settle(outcome);
            job_entry.notify();
        }));

        handle
    }

    /// Fetch on mount when the entry is enabled and has nothing usable:
    /// never fetched, or marked invalidated. Fresh data is left alone.
    fn mount_fetch_if_needed(self: &Rc<Self>) {
        let entry = self.entry.borrow().clone();
        if !self.options.borrow().enabled || entry.is_fetching() {
            return;
        }
        if entry.has_data() && !entry.is_invalidated() {
            return;
        }
        self.fetch(self.fetch_fn.clone());
    }

    fn has_subscribers(&self) -> bool {
        !self.subscribers.borrow().is_empty()
    }
}

// =============================================================================
// QUERY OBSERVER (public handle)
// =============================================================================

/// Typed observer over one cache entry. Cheap to clone; clones share state.
pub struct QueryObserver<T: Clone + 'static> {
    inner: Rc<ObserverInner<T>>,
}

impl<T: Clone + 'static> Clone for QueryObserver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> QueryObserver<T> {
    pub fn new(client: QueryClient, options: ResolvedOptions, fetch_fn: FetchFn<T>) -> Self {
        let entry = client.cache().get_or_create(&options.key, &options.hash);
        let inner = Rc::new(ObserverInner {
            client,
            fetch_fn,
            options: RefCell::new(options),
            entry: RefCell::new(entry),
            entry_listener: Cell::new(None),
            subscribers: RefCell::new(Vec::new()),
            next_sub_id: Cell::new(1),
            last_pushed: RefCell::new(None),
            destroyed: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *inner.self_weak.borrow_mut() = Rc::downgrade(&inner);
        Self { inner }
    }

    /// Snapshot of the entry as it stands, without subscribing.
    pub fn optimistic_result(&self) -> QuerySnapshot<T> {
        self.inner.snapshot()
    }

    pub fn current_result(&self) -> QuerySnapshot<T> {
        self.inner.snapshot()
    }

    /// Register a push callback. The first subscriber attaches the observer
    /// to its entry and may trigger a mount fetch. Returns a one-shot detach.
    pub fn subscribe(&self, push: impl Fn(QuerySnapshot<T>) + 'static) -> Unsubscribe {
        if self.inner.destroyed.get() {
            return Box::new(|| {});
        }

        let id = self.inner.next_sub_id.get();
        self.inner.next_sub_id.set(id + 1);
        let first = !self.inner.has_subscribers();
        self.inner.subscribers.borrow_mut().push((id, Rc::new(push)));

        if first {
            // Seed the suppression signature so the subscriber is not
            // replayed the state it can already read synchronously.
            let snap = self.inner.snapshot();
            *self.inner.last_pushed.borrow_mut() =
                Some((snap.status, snap.data_stamp, snap.error_stamp));
            self.inner.attach_entry_listener();
            self.inner.mount_fetch_if_needed();
        }

        let weak = self.inner.self_weak.borrow().clone();
        Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.subscribers.borrow_mut().retain(|(sid, _)| *sid != id);
            if !inner.has_subscribers() {
                inner.detach_entry_listener();
            }
        })
    }

    /// Reconfigure in place. Idempotent: applying an unchanged option set
    /// does nothing. A hash change swaps the cache entry; an enable flip or
    /// entry swap may trigger a fetch when subscribed.
    pub fn set_options(&self, next: ResolvedOptions) {
        if self.inner.destroyed.get() {
            return;
        }
        let prev = self.inner.options.replace(next.clone());
        if prev == next {
            return;
        }

        if prev.hash != next.hash {
            let was_attached = self.inner.entry_listener.get().is_some();
            self.inner.detach_entry_listener();
            {
                let old = self.inner.entry.borrow();
                if old.listener_count() == 0 {
                    old.cancel_in_flight();
                }
            }

            let entry = self
                .inner
                .client
                .cache()
                .get_or_create(&next.key, &next.hash);
            tracing::debug!(from = %prev.hash, to = %next.hash, "observer entry swap");
            *self.inner.entry.borrow_mut() = entry;
            *self.inner.last_pushed.borrow_mut() = None;

            if was_attached {
                self.inner.attach_entry_listener();
                // Consumers see the new entry's state immediately.
                self.inner.handle_change();
            }
        }

        if self.inner.has_subscribers() {
            self.inner.mount_fetch_if_needed();
        }
    }

    /// Imperative fetch, regardless of data freshness. Joins an in-flight
    /// fetch rather than duplicating it.
    pub fn refetch(&self) -> FetchHandle {
        self.inner.fetch(self.inner.fetch_fn.clone())
    }

    /// Fetch with a one-off transform in place of the observer's fetch
    /// function (page accumulation). Same dedup and cancellation rules.
    pub(crate) fn fetch_with(&self, transform: FetchFn<T>) -> FetchHandle {
        self.inner.fetch(transform)
    }

    pub fn in_flight_handle(&self) -> Option<FetchHandle> {
        self.inner.entry.borrow().in_flight_handle()
    }

    pub(crate) fn client(&self) -> &QueryClient {
        &self.inner.client
    }

    pub(crate) fn options(&self) -> ResolvedOptions {
        self.inner.options.borrow().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Sever the subscription and, when no other observer listens to the
    /// entry, cancel its in-flight fetch. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.inner.detach_entry_listener();
        self.inner.subscribers.borrow_mut().clear();

        let entry = self.inner.entry.borrow().clone();
        if entry.listener_count() == 0 {
            entry.cancel_in_flight();
        }
        tracing::trace!(hash = %entry.hash, "observer destroyed");
    }
}

impl<T: Clone + 'static> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.destroy();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
