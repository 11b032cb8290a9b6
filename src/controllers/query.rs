// ============================================================================
// spark-query - Query Controller
// Lifecycle: constructing -> active -> destroyed, composed from the binding
// layer around one engine observer
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;

use crate::binding::lazy::LazyObservationBridge;
use crate::binding::reconcile::{
    DynamicKeyFn, DynamicOptionsFn, Reconciler, ReconcilerConfig,
};
use crate::binding::result_slot::ResultSlot;
use crate::binding::scope::{AbortSignal, CancellationScope};
use crate::controllers::listeners::DoneErrorListeners;
use crate::controllers::{Activation, RemoveOnDestroy, Subscription};
use crate::core::error::{AbortReason, FetchError, QueryError, QueryResult};
use crate::core::key::{QueryFilter, QueryHash, QueryKey};
use crate::core::options::{OptionsPatch, QueryOptions, ThrowOnError};
use crate::core::snapshot::{QuerySnapshot, QueryStatus};
use crate::engine::client::QueryClient;
use crate::engine::fetch::{FetchHandle, FetchOutcome};
use crate::engine::observer::{FetchFn, QueryObserver, Unsubscribe};

// =============================================================================
// CONFIG
// =============================================================================

/// Construction parameters for [`Query`]. Built with `new` plus chained
/// setters; everything beyond client, key and query function is optional.
pub struct QueryConfig<T: Clone + 'static> {
    client: QueryClient,
    key: QueryKey,
    query_fn: Rc<dyn Fn(&QueryKey) -> Result<T, FetchError>>,
    options: QueryOptions,
    dynamic_options: Option<DynamicOptionsFn>,
    dynamic_key: Option<DynamicKeyFn>,
    activation: Activation,
    subscription: Subscription,
    parent_signal: Option<AbortSignal>,
    reset_on_destroy: bool,
    remove_on_destroy: RemoveOnDestroy,
    cumulative_hashes: bool,
    auto_remove_previous: bool,
    on_init: Option<Rc<dyn Fn()>>,
    on_destroy: Option<Rc<dyn Fn()>>,
}

impl<T: Clone + 'static> QueryConfig<T> {
    pub fn new(
        client: QueryClient,
        key: QueryKey,
        query_fn: impl Fn(&QueryKey) -> Result<T, FetchError> + 'static,
    ) -> Self {
        Self {
            client,
            key,
            query_fn: Rc::new(query_fn),
            options: QueryOptions::default(),
            dynamic_options: None,
            dynamic_key: None,
            activation: Activation::Eager,
            subscription: Subscription::Eager,
            parent_signal: None,
            reset_on_destroy: false,
            remove_on_destroy: RemoveOnDestroy::No,
            cumulative_hashes: false,
            auto_remove_previous: false,
            on_init: None,
            on_destroy: None,
        }
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Recomputed on every reactive pass while the merge watcher is alive.
    pub fn dynamic_options(mut self, f: impl Fn() -> QueryOptions + 'static) -> Self {
        self.dynamic_options = Some(Rc::new(f));
        self
    }

    pub fn dynamic_key(mut self, f: impl Fn() -> QueryKey + 'static) -> Self {
        self.dynamic_key = Some(Rc::new(f));
        self
    }

    /// Suppress fetching until the result is first read.
    pub fn on_demand(mut self) -> Self {
        self.activation = Activation::OnDemand;
        self
    }

    /// Subscribe only while the result is reactively observed; detach after
    /// `unobserve_delay_ms` of zero observers.
    pub fn lazy(mut self, unobserve_delay_ms: u64) -> Self {
        self.subscription = Subscription::Lazy { unobserve_delay_ms };
        self
    }

    /// Abort this controller when the given signal aborts.
    pub fn parent_signal(mut self, signal: AbortSignal) -> Self {
        self.parent_signal = Some(signal);
        self
    }

    pub fn reset_on_destroy(mut self) -> Self {
        self.reset_on_destroy = true;
        self
    }

    pub fn remove_on_destroy(mut self, policy: RemoveOnDestroy) -> Self {
        self.remove_on_destroy = policy;
        self
    }

    /// Track every hash this controller ever resolves to; bulk operations
    /// then cover the whole history instead of just the current key.
    pub fn cumulative_hashes(mut self) -> Self {
        self.cumulative_hashes = true;
        self
    }

    /// On a key change, evict the previous entry (when no one else holds it)
    /// before the new hash is applied.
    pub fn auto_remove_previous(mut self) -> Self {
        self.auto_remove_previous = true;
        self
    }

    pub fn on_init(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_init = Some(Rc::new(hook));
        self
    }

    pub fn on_destroy(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_destroy = Some(Rc::new(hook));
        self
    }
}

// =============================================================================
// QUERY
// =============================================================================

struct QueryInner<T: Clone + 'static> {
    client: QueryClient,
    scope: CancellationScope,
    observer: QueryObserver<T>,
    slot: Rc<ResultSlot<QuerySnapshot<T>>>,
    reconciler: Reconciler,
    bridge: Option<LazyObservationBridge<Unsubscribe>>,
    unsubscribe: RefCell<Option<Unsubscribe>>,
    listeners: Rc<DoneErrorListeners<T>>,
    seen_hashes: Rc<RefCell<Vec<QueryHash>>>,
    cumulative: bool,
}

impl<T: Clone + 'static> QueryInner<T> {
    /// Hashes a bulk operation from this controller covers.
    fn op_filter(&self) -> QueryFilter {
        if self.cumulative {
            QueryFilter::hashes(self.seen_hashes.borrow().clone())
        } else {
            QueryFilter::hashes(vec![self.observer.options().hash])
        }
    }

    /// Bulk operations in cumulative mode must not disturb entries other
    /// observers still need: this controller is at most the one listener.
    fn op_listener_cap(&self) -> Option<usize> {
        if self.cumulative { Some(1) } else { None }
    }
}

/// A live query binding. Cheap to clone; clones share the controller.
pub struct Query<T: Clone + 'static> {
    inner: Rc<QueryInner<T>>,
}

impl<T: Clone + 'static> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Query<T> {
    pub fn new(config: QueryConfig<T>) -> Self {
        let QueryConfig {
            client,
            key,
            query_fn,
            options,
            dynamic_options,
            dynamic_key,
            activation,
            subscription,
            parent_signal,
            reset_on_destroy,
            remove_on_destroy,
            cumulative_hashes,
            auto_remove_previous,
            on_init,
            on_destroy,
        } = config;

        let scope = match &parent_signal {
            Some(signal) => CancellationScope::linked(signal),
            None => CancellationScope::new(),
        };
        let slot = Rc::new(ResultSlot::new(QuerySnapshot::pending()));
        let seen_hashes: Rc<RefCell<Vec<QueryHash>>> = Rc::new(RefCell::new(Vec::new()));
        let listeners: Rc<DoneErrorListeners<T>> = Rc::new(DoneErrorListeners::new(0, 0));

        // The observer is created from the first reconciliation pass, so the
        // apply callback reaches it through a shared slot filled in below.
        let observer_cell: Rc<RefCell<Option<QueryObserver<T>>>> = Rc::new(RefCell::new(None));

        let apply = Rc::new(cloned!(client, observer_cell, seen_hashes, listeners =>
            move |resolved: crate::core::options::ResolvedOptions| {
                let Some(observer) = observer_cell.borrow().clone() else {
                    return;
                };
                let prev_hash = observer.options().hash;
                if prev_hash != resolved.hash {
                    if auto_remove_previous {
                        // Old entry gone before the new hash lands; only
                        // when this observer is its lone listener.
                        client.remove_where(&QueryFilter::hashes(vec![prev_hash]), Some(1));
                    }
                    let mut seen = seen_hashes.borrow_mut();
                    if !seen.contains(&resolved.hash) {
                        seen.push(resolved.hash.clone());
                    }
                    // Settles already sitting on the target entry predate
                    // this controller's attachment to it.
                    let stamp = client.current_stamp();
                    listeners.reseed(stamp, stamp);
                }
                observer.set_options(resolved);
            }
        ));

        let hash_fn = Rc::new(cloned!(client => move |key: &QueryKey| client.hash(key)));
        let reconciler = Reconciler::new(ReconcilerConfig {
            defaults: client.default_options(),
            base_key: key,
            base_options: options,
            dynamic_options,
            dynamic_key,
            hash_fn,
            on_demand: matches!(activation, Activation::OnDemand),
            requested: slot.requested_cell().clone(),
            signal: scope.signal(),
            apply,
        });

        let initial = reconciler.reconcile_once();
        seen_hashes.borrow_mut().push(initial.hash.clone());

        let fetch_fn: FetchFn<T> = Rc::new(move |key, _prev| query_fn(key));
        let observer = QueryObserver::new(client.clone(), initial, fetch_fn);
        *observer_cell.borrow_mut() = Some(observer.clone());

        let optimistic = observer.optimistic_result();
        listeners.reseed(optimistic.data_stamp, optimistic.error_stamp);
        slot.write(optimistic);

        let push = cloned!(slot, listeners => move |snap: QuerySnapshot<T>| {
            slot.write(snap.clone());
            listeners.notify(
                snap.data_stamp,
                snap.error_stamp,
                snap.data.as_ref(),
                snap.error.as_ref(),
            );
        });

        let mut unsubscribe = None;
        let bridge = match subscription {
            Subscription::Eager => {
                unsubscribe =
                    Some(observer.subscribe(cloned!(push => move |snap| push(snap))));
                reconciler.install();
                None
            }
            Subscription::Lazy { unobserve_delay_ms } => {
                let bridge = LazyObservationBridge::new(
                    cloned!(reconciler, observer => move || {
                        // Reconcile before subscribing: options changed
                        // while dormant must land before any mount fetch.
                        reconciler.install();
                        observer.subscribe(cloned!(push => move |snap| push(snap)))
                    }),
                    cloned!(reconciler => move |unsub: Unsubscribe, _rearm| {
                        // Reaction down first, so no merge pass runs against
                        // a severed subscription.
                        reconciler.uninstall();
                        unsub();
                    }),
                    unobserve_delay_ms,
                );
                slot.set_observed_hooks(bridge.hooks());
                Some(bridge)
            }
        };

        let inner = Rc::new(QueryInner {
            client,
            scope,
            observer,
            slot,
            reconciler,
            bridge,
            unsubscribe: RefCell::new(unsubscribe),
            listeners,
            seen_hashes,
            cumulative: cumulative_hashes,
        });

        let weak = Rc::downgrade(&inner);
        inner.scope.on_abort(move |reason| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tracing::debug!(%reason, "query teardown");
            inner.reconciler.uninstall();
            if let Some(bridge) = &inner.bridge {
                if let Some(unsub) = bridge.dispose() {
                    unsub();
                }
            }
            if let Some(unsub) = inner.unsubscribe.borrow_mut().take() {
                unsub();
            }
            inner.observer.destroy();

            let filter = inner.op_filter();
            if reset_on_destroy {
                inner.client.reset_where(&filter, Some(0));
            }
            match remove_on_destroy {
                RemoveOnDestroy::No => {}
                RemoveOnDestroy::Always => inner.client.remove_where(&filter, None),
                RemoveOnDestroy::Safe => inner.client.remove_where(&filter, Some(0)),
            }

            inner.listeners.clear();
            if let Some(hook) = &on_destroy {
                hook();
            }
        });

        if let Some(hook) = &on_init {
            hook();
        }
        Self { inner }
    }

    // -- live projection --------------------------------------------------------

    /// Latest snapshot, tracked. The first read marks observation requested
    /// (on-demand activation) and, under lazy subscription, tracked reads
    /// keep the subscription alive.
    pub fn result(&self) -> QuerySnapshot<T> {
        self.inner.slot.read()
    }

    /// Untracked snapshot, with no first-read side effect.
    pub fn peek(&self) -> QuerySnapshot<T> {
        self.inner.slot.peek()
    }

    pub fn data(&self) -> Option<T> {
        self.result().data
    }

    pub fn status(&self) -> QueryStatus {
        self.result().status
    }

    pub fn error(&self) -> Option<FetchError> {
        self.result().error
    }

    // -- reconfiguration ---------------------------------------------------------

    /// Apply an options patch on top of every other layer. Silent no-op
    /// once destroyed.
    pub fn update(&self, patch: OptionsPatch) {
        self.inner.reconciler.update(patch);
    }

    // -- fetching ----------------------------------------------------------------

    /// Fetch regardless of freshness and wait for the settle. Errors are
    /// surfaced only under the effective throw policy — overridable per
    /// call — while cancellation always surfaces.
    pub fn refetch(&self, throw: Option<ThrowOnError>) -> QueryResult<QuerySnapshot<T>> {
        if self.inner.scope.is_aborted() {
            return Err(self.cancelled_error());
        }
        let handle = self.inner.observer.refetch();
        self.await_handle(handle, throw)
    }

    /// Apply a patch, then join the in-flight fetch if one exists, otherwise
    /// refetch. Returns the settled snapshot.
    pub fn start(&self, patch: Option<OptionsPatch>) -> QueryResult<QuerySnapshot<T>> {
        if let Some(patch) = patch {
            self.update(patch);
        }
        if self.inner.scope.is_aborted() {
            return Err(self.cancelled_error());
        }
        let handle = match self.inner.observer.in_flight_handle() {
            Some(handle) => handle,
            None => self.inner.observer.refetch(),
        };
        self.await_handle(handle, None)
    }

    /// Drive the dispatcher until the handle settles or the scope aborts.
    fn await_handle(
        &self,
        handle: FetchHandle,
        throw: Option<ThrowOnError>,
    ) -> QueryResult<QuerySnapshot<T>> {
        loop {
            if let Some(outcome) = handle.outcome() {
                return match outcome {
                    FetchOutcome::Success => Ok(self.peek()),
                    FetchOutcome::Failure(error) => {
                        let throw = throw
                            .unwrap_or_else(|| self.inner.observer.options().throw_on_error);
                        if throw.should_throw(&error) {
                            Err(QueryError::Fetch(error))
                        } else {
                            Ok(self.peek())
                        }
                    }
                    FetchOutcome::Cancelled => Err(self.cancelled_error()),
                };
            }
            if self.inner.scope.is_aborted() {
                return Err(self.cancelled_error());
            }
            if !self.inner.client.flush_one() {
                // Nothing queued can ever settle this handle.
                handle.settle(FetchOutcome::Cancelled);
                return Err(QueryError::Cancelled(AbortReason::Fetch));
            }
        }
    }

    fn cancelled_error(&self) -> QueryError {
        QueryError::Cancelled(
            self.inner
                .scope
                .signal()
                .reason()
                .unwrap_or(AbortReason::Fetch),
        )
    }

    // -- cache operations ---------------------------------------------------------

    /// Write into the cache directly, bypassing fetch.
    pub fn set_data(&self, updater: impl FnOnce(Option<T>) -> T) {
        let key = self.inner.observer.options().key;
        self.inner.client.set_query_data(&key, updater);
    }

    /// Mark this controller's entries stale; subscribed observers refetch.
    pub fn invalidate(&self) {
        self.inner
            .client
            .invalidate_where(&self.inner.op_filter(), self.inner.op_listener_cap());
    }

    pub fn reset(&self) {
        self.inner
            .client
            .reset_where(&self.inner.op_filter(), self.inner.op_listener_cap());
    }

    pub fn remove(&self) {
        self.inner
            .client
            .remove_where(&self.inner.op_filter(), self.inner.op_listener_cap());
    }

    // -- listeners / lifecycle ------------------------------------------------------

    /// Fires once per distinct success settle, never at registration.
    pub fn on_done(&self, cb: impl Fn(&T) + 'static) {
        self.inner.listeners.on_done(cb);
    }

    /// Fires once per distinct error settle, never at registration.
    pub fn on_error(&self, cb: impl Fn(&FetchError) + 'static) {
        self.inner.listeners.on_error(cb);
    }

    /// Signal for deriving linked child scopes.
    pub fn signal(&self) -> AbortSignal {
        self.inner.scope.signal()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.scope.is_aborted()
    }

    /// Tear down: sever the subscription, destroy the engine observer, run
    /// the configured reset/remove side effects. Idempotent, and shares the
    /// exactly-once path with parent-signal aborts.
    pub fn destroy(&self) {
        self.inner.scope.abort(AbortReason::Destroyed);
    }
}

impl<T: Clone + 'static> Drop for Query<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.destroy();
        }
    }
}
