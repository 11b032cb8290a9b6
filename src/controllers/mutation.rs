// ============================================================================
// spark-query - Mutation Controller
// One-shot write lifecycle with post-success cache invalidation
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;

use crate::binding::reconcile::{DynamicOptionsFn, Reconciler, ReconcilerConfig};
use crate::binding::result_slot::ResultSlot;
use crate::binding::scope::{AbortSignal, CancellationScope};
use crate::controllers::listeners::DoneErrorListeners;
use crate::core::error::{AbortReason, FetchError, QueryError, QueryResult};
use crate::core::key::{QueryFilter, QueryKey};
use crate::core::options::{
    MergedOptions, OptionsPatch, QueryOptions, ResolvedOptions, ThrowOnError,
};
use crate::core::snapshot::{MutationSnapshot, MutationStatus};
use crate::engine::client::QueryClient;
use crate::engine::fetch::{FetchHandle, FetchOutcome};
use crate::engine::mutation::{MutationFn, MutationObserver};
use crate::engine::observer::Unsubscribe;

/// Which cache entries to mark stale after a successful mutation.
#[derive(Clone, Debug, Default)]
pub enum InvalidateAfter {
    #[default]
    None,
    /// The mutation's own key, prefix-matched.
    OwnKey,
    /// Each listed key, prefix-matched.
    Keys(Vec<QueryKey>),
    Filter(QueryFilter),
    All,
}

// =============================================================================
// CONFIG
// =============================================================================

pub struct MutationConfig<T: Clone + 'static, V: Clone + 'static> {
    client: QueryClient,
    mutation_fn: MutationFn<T, V>,
    key: Option<QueryKey>,
    options: QueryOptions,
    dynamic_options: Option<DynamicOptionsFn>,
    invalidate_after: InvalidateAfter,
    parent_signal: Option<AbortSignal>,
    on_init: Option<Rc<dyn Fn()>>,
    on_destroy: Option<Rc<dyn Fn()>>,
}

impl<T: Clone + 'static, V: Clone + 'static> MutationConfig<T, V> {
    pub fn new(client: QueryClient, mutation_fn: impl Fn(&V) -> Result<T, FetchError> + 'static) -> Self {
        // Mutations surface their errors by default; queries keep them in
        // the snapshot instead.
        let mut options = QueryOptions::default();
        options.throw_on_error = Some(ThrowOnError::Fixed(true));
        Self {
            client,
            mutation_fn: Rc::new(mutation_fn),
            key: None,
            options,
            dynamic_options: None,
            invalidate_after: InvalidateAfter::None,
            parent_signal: None,
            on_init: None,
            on_destroy: None,
        }
    }

    /// An identifying key; also the target of `InvalidateAfter::OwnKey`.
    pub fn key(mut self, key: QueryKey) -> Self {
        self.key = Some(key);
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

    pub fn invalidate_after(mut self, policy: InvalidateAfter) -> Self {
        self.invalidate_after = policy;
        self
    }

    pub fn parent_signal(mut self, signal: AbortSignal) -> Self {
        self.parent_signal = Some(signal);
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
// MUTATION
// =============================================================================

struct MutationCtlInner<T: Clone + 'static, V: Clone + 'static> {
    client: QueryClient,
    scope: CancellationScope,
    observer: MutationObserver<T, V>,
    slot: Rc<ResultSlot<MutationSnapshot<T, V>>>,
    reconciler: Reconciler,
    resolved: Rc<RefCell<ResolvedOptions>>,
    unsubscribe: RefCell<Option<Unsubscribe>>,
    listeners: Rc<DoneErrorListeners<T>>,
    key: Option<QueryKey>,
    invalidate_after: InvalidateAfter,
}

/// A live mutation binding. Clones share the controller.
pub struct Mutation<T: Clone + 'static, V: Clone + 'static> {
    inner: Rc<MutationCtlInner<T, V>>,
}

impl<T: Clone + 'static, V: Clone + 'static> Clone for Mutation<T, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static, V: Clone + 'static> Mutation<T, V> {
    pub fn new(config: MutationConfig<T, V>) -> Self {
        let MutationConfig {
            client,
            mutation_fn,
            key,
            options,
            dynamic_options,
            invalidate_after,
            parent_signal,
            on_init,
            on_destroy,
        } = config;

        let scope = match &parent_signal {
            Some(signal) => CancellationScope::linked(signal),
            None => CancellationScope::new(),
        };
        let slot = Rc::new(ResultSlot::new(MutationSnapshot::idle()));

        // Mutations have no cache entry to retarget, so reconciliation only
        // keeps a resolved-options snapshot current for the throw policy.
        let base_key = key.clone().unwrap_or_default();
        let seed = MergedOptions::merge(&client.default_options(), &[&options])
            .into_resolved(base_key.clone(), client.hash(&base_key), true);
        let resolved_cell = Rc::new(RefCell::new(seed));
        let apply = Rc::new(cloned!(resolved_cell => move |resolved: ResolvedOptions| {
            *resolved_cell.borrow_mut() = resolved;
        }));
        let hash_fn = Rc::new(cloned!(client => move |key: &QueryKey| client.hash(key)));
        let reconciler = Reconciler::new(ReconcilerConfig {
            defaults: client.default_options(),
            base_key,
            base_options: options,
            dynamic_options,
            dynamic_key: None,
            hash_fn,
            on_demand: false,
            requested: slot.requested_cell().clone(),
            signal: scope.signal(),
            apply,
        });
        *resolved_cell.borrow_mut() = reconciler.reconcile_once();

        let observer = MutationObserver::new(client.clone(), mutation_fn);
        let listeners: Rc<DoneErrorListeners<T>> = Rc::new(DoneErrorListeners::new(0, 0));

        let push = cloned!(slot, listeners => move |snap: MutationSnapshot<T, V>| {
            slot.write(snap.clone());
            match snap.status {
                MutationStatus::Success => {
                    listeners.notify(snap.settle_stamp, 0, snap.data.as_ref(), None)
                }
                MutationStatus::Error => {
                    listeners.notify(0, snap.settle_stamp, None, snap.error.as_ref())
                }
                _ => {}
            }
        });
        let unsubscribe = observer.subscribe(push);
        reconciler.install();

        let inner = Rc::new(MutationCtlInner {
            client,
            scope,
            observer,
            slot,
            reconciler,
            resolved: resolved_cell,
            unsubscribe: RefCell::new(Some(unsubscribe)),
            listeners,
            key,
            invalidate_after,
        });

        let weak = Rc::downgrade(&inner);
        inner.scope.on_abort(move |reason| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tracing::debug!(%reason, "mutation teardown");
            inner.reconciler.uninstall();
            if let Some(unsub) = inner.unsubscribe.borrow_mut().take() {
                unsub();
            }
            inner.observer.destroy();
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

    pub fn result(&self) -> MutationSnapshot<T, V> {
        self.inner.slot.read()
    }

    pub fn peek(&self) -> MutationSnapshot<T, V> {
        self.inner.slot.peek()
    }

    pub fn status(&self) -> MutationStatus {
        self.result().status
    }

    pub fn data(&self) -> Option<T> {
        self.result().data
    }

    pub fn error(&self) -> Option<FetchError> {
        self.result().error
    }

    // -- reconfiguration ---------------------------------------------------------

    pub fn update(&self, patch: OptionsPatch) {
        self.inner.reconciler.update(patch);
    }

    // -- mutating ----------------------------------------------------------------

    /// Run the mutation and wait for the settle. Errors surface as `Err`
    /// under the effective throw policy, which is on by default for
    /// mutations; a suppressed error returns the settled error snapshot.
    pub fn mutate(&self, variables: V) -> QueryResult<MutationSnapshot<T, V>> {
        if self.inner.scope.is_aborted() {
            return Err(self.cancelled_error());
        }
        let handle = self.inner.observer.mutate(variables);
        let outcome = self.await_handle(handle)?;
        match outcome {
            FetchOutcome::Success => {
                self.run_invalidation();
                Ok(self.peek())
            }
            FetchOutcome::Failure(error) => {
                let throw = self.inner.resolved.borrow().throw_on_error.clone();
                if throw.should_throw(&error) {
                    Err(QueryError::Fetch(error))
                } else {
                    Ok(self.peek())
                }
            }
            FetchOutcome::Cancelled => Err(self.cancelled_error()),
        }
    }

    fn await_handle(&self, handle: FetchHandle) -> QueryResult<FetchOutcome> {
        loop {
            if let Some(outcome) = handle.outcome() {
                return Ok(outcome);
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

    fn run_invalidation(&self) {
        match &self.inner.invalidate_after {
            InvalidateAfter::None => {}
            InvalidateAfter::OwnKey => {
                if let Some(key) = &self.inner.key {
                    self.inner
                        .client
                        .invalidate_queries(&QueryFilter::prefix(key.clone()));
                }
            }
            InvalidateAfter::Keys(keys) => {
                for key in keys {
                    self.inner
                        .client
                        .invalidate_queries(&QueryFilter::prefix(key.clone()));
                }
            }
            InvalidateAfter::Filter(filter) => self.inner.client.invalidate_queries(filter),
            InvalidateAfter::All => self.inner.client.invalidate_queries(&QueryFilter::all()),
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

    /// Return to the idle snapshot, cancelling a pending run.
    pub fn reset(&self) {
        self.inner.observer.reset();
    }

    // -- listeners / lifecycle ------------------------------------------------------

    pub fn on_done(&self, cb: impl Fn(&T) + 'static) {
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

impl<T: Clone + 'static, V: Clone + 'static> Drop for Mutation<T, V> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.destroy();
        }
    }
}
