// ============================================================================
// spark-query - Infinite Query Controller
// Query lifecycle plus directional page fetching
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
use crate::core::snapshot::{InfiniteData, QuerySnapshot, QueryStatus};
use crate::engine::client::QueryClient;
use crate::engine::fetch::{FetchHandle, FetchOutcome};
use crate::engine::infinite::{InfiniteQueryObserver, PageFetchFn, PageParamFn};
use crate::engine::observer::Unsubscribe;

// =============================================================================
// CONFIG
// =============================================================================

/// Construction parameters for [`InfiniteQuery`]. `T` is one page, `P` the
/// page param.
pub struct InfiniteQueryConfig<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    client: QueryClient,
    key: QueryKey,
    page_fn: PageFetchFn<T, P>,
    initial_param: P,
    next_param: Option<PageParamFn<T, P>>,
    previous_param: Option<PageParamFn<T, P>>,
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

impl<T, P> InfiniteQueryConfig<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    pub fn new(
        client: QueryClient,
        key: QueryKey,
        initial_param: P,
        page_fn: impl Fn(&QueryKey, &P) -> Result<T, FetchError> + 'static,
    ) -> Self {
        Self {
            client,
            key,
            page_fn: Rc::new(page_fn),
            initial_param,
            next_param: None,
            previous_param: None,
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

    pub fn next_param(mut self, f: impl Fn(&InfiniteData<T, P>) -> Option<P> + 'static) -> Self {
        self.next_param = Some(Rc::new(f));
        self
    }

    pub fn previous_param(
        mut self,
        f: impl Fn(&InfiniteData<T, P>) -> Option<P> + 'static,
    ) -> Self {
        self.previous_param = Some(Rc::new(f));
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dynamic_options(mut self, f: impl Fn() -> QueryOptions + 'static) -> Self {
        self.dynamic_options = Some(Rc::new(f));
        self
    }

    pub fn dynamic_key(mut self, f: impl Fn() -> QueryKey + 'static) -> Self {
        self.dynamic_key = Some(Rc::new(f));
        self
    }

    pub fn on_demand(mut self) -> Self {
        self.activation = Activation::OnDemand;
        self
    }

    pub fn lazy(mut self, unobserve_delay_ms: u64) -> Self {
        self.subscription = Subscription::Lazy { unobserve_delay_ms };
        self
    }

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
// INFINITE QUERY
// =============================================================================

struct InfiniteQueryInner<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    client: QueryClient,
    scope: CancellationScope,
    observer: InfiniteQueryObserver<T, P>,
    slot: Rc<ResultSlot<QuerySnapshot<InfiniteData<T, P>>>>,
    reconciler: Reconciler,
    bridge: Option<LazyObservationBridge<Unsubscribe>>,
    unsubscribe: RefCell<Option<Unsubscribe>>,
    listeners: Rc<DoneErrorListeners<InfiniteData<T, P>>>,
    seen_hashes: Rc<RefCell<Vec<QueryHash>>>,
    cumulative: bool,
}

impl<T, P> InfiniteQueryInner<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
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

/// A live infinite query binding. Clones share the controller.
pub struct InfiniteQuery<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    inner: Rc<InfiniteQueryInner<T, P>>,
}

impl<T, P> Clone for InfiniteQuery<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, P> InfiniteQuery<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    pub fn new(config: InfiniteQueryConfig<T, P>) -> Self {
        let InfiniteQueryConfig {
            client,
            key,
            page_fn,
            initial_param,
            next_param,
            previous_param,
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
        let listeners: Rc<DoneErrorListeners<InfiniteData<T, P>>> =
            Rc::new(DoneErrorListeners::new(0, 0));

        let observer_cell: Rc<RefCell<Option<InfiniteQueryObserver<T, P>>>> =
            Rc::new(RefCell::new(None));

        let apply = Rc::new(cloned!(client, observer_cell, seen_hashes, listeners =>
            move |resolved: crate::core::options::ResolvedOptions| {
                let Some(observer) = observer_cell.borrow().clone() else {
                    return;
                };
                let prev_hash = observer.options().hash;
                if prev_hash != resolved.hash {
                    if auto_remove_previous {
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

        let observer = InfiniteQueryObserver::new(
            client.clone(),
            initial,
            page_fn,
            initial_param,
            next_param,
            previous_param,
        );
        *observer_cell.borrow_mut() = Some(observer.clone());

        let optimistic = observer.optimistic_result();
        listeners.reseed(optimistic.data_stamp, optimistic.error_stamp);
        slot.write(optimistic);

        let push = cloned!(slot, listeners => move |snap: QuerySnapshot<InfiniteData<T, P>>| {
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
                        reconciler.install();
                        observer.subscribe(cloned!(push => move |snap| push(snap)))
                    }),
                    cloned!(reconciler => move |unsub: Unsubscribe, _rearm| {
                        reconciler.uninstall();
                        unsub();
                    }),
                    unobserve_delay_ms,
                );
                slot.set_observed_hooks(bridge.hooks());
                Some(bridge)
            }
        };

        let inner = Rc::new(InfiniteQueryInner {
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
            tracing::debug!(%reason, "infinite query teardown");
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

    pub fn result(&self) -> QuerySnapshot<InfiniteData<T, P>> {
        self.inner.slot.read()
    }

    pub fn peek(&self) -> QuerySnapshot<InfiniteData<T, P>> {
        self.inner.slot.peek()
    }

    pub fn data(&self) -> Option<InfiniteData<T, P>> {
        self.result().data
    }

    pub fn status(&self) -> QueryStatus {
        self.result().status
    }

    pub fn error(&self) -> Option<FetchError> {
        self.result().error
    }

    // -- reconfiguration ---------------------------------------------------------

    pub fn update(&self, patch: OptionsPatch) {
        self.inner.reconciler.update(patch);
    }

    // -- fetching ----------------------------------------------------------------

    /// Refetch the whole accumulation: every known page param is replayed in
    /// order. The throw policy is overridable per call.
    pub fn refetch(
        &self,
        throw: Option<ThrowOnError>,
    ) -> QueryResult<QuerySnapshot<InfiniteData<T, P>>> {
        if self.inner.scope.is_aborted() {
            return Err(self.cancelled_error());
        }
        let handle = self.inner.observer.refetch();
        self.await_handle(handle, throw)
    }

    /// Apply a patch, then join the in-flight fetch if one exists, otherwise
    /// refetch. Returns the settled snapshot.
    pub fn start(
        &self,
        patch: Option<OptionsPatch>,
    ) -> QueryResult<QuerySnapshot<InfiniteData<T, P>>> {
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

    /// Fetch and append the next page. A missing next-param function, or one
    /// returning `None`, settles as a no-op success.
    pub fn fetch_next_page(&self) -> QueryResult<QuerySnapshot<InfiniteData<T, P>>> {
        if self.inner.scope.is_aborted() {
            return Err(self.cancelled_error());
        }
        let handle = self.inner.observer.fetch_next_page();
        self.await_handle(handle, None)
    }

    /// Fetch and prepend the previous page.
    pub fn fetch_previous_page(&self) -> QueryResult<QuerySnapshot<InfiniteData<T, P>>> {
        if self.inner.scope.is_aborted() {
            return Err(self.cancelled_error());
        }
        let handle = self.inner.observer.fetch_previous_page();
        self.await_handle(handle, None)
    }

    fn await_handle(
        &self,
        handle: FetchHandle,
        throw: Option<ThrowOnError>,
    ) -> QueryResult<QuerySnapshot<InfiniteData<T, P>>> {
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

    /// Write the accumulation into the cache directly, bypassing fetch.
    pub fn set_data(
        &self,
        updater: impl FnOnce(Option<InfiniteData<T, P>>) -> InfiniteData<T, P>,
    ) {
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

    pub fn on_done(&self, cb: impl Fn(&InfiniteData<T, P>) + 'static) {
        self.inner.listeners.on_done(cb);
    }

    pub fn on_error(&self, cb: impl Fn(&FetchError) + 'static) {
        self.inner.listeners.on_error(cb);
    }

    pub fn signal(&self) -> AbortSignal {
        self.inner.scope.signal()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.scope.is_aborted()
    }

    pub fn destroy(&self) {
        self.inner.scope.abort(AbortReason::Destroyed);
    }
}

impl<T, P> Drop for InfiniteQuery<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.destroy();
        }
    }
}
