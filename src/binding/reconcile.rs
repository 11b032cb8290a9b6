// ============================================================================
// spark-query - Options Reconciler
// Tracked merge of option layers, hash recomputation, on-demand gating
// ============================================================================
//
// The merge runs inside a memoized watcher: every tracked input (dynamic
// options fn, dynamic key fn, enabled predicate, the requested flag, the
// update version) re-runs it, but the apply callback only fires when the
// resolved option set actually differs — equality at the source, not
// post-hoc diffing. The key hash is recomputed on every pass regardless, so
// identity tracking stays correct even when apply is skipped.
//
// On-demand gating is an explicit three-state machine. While Gated, the
// caller's enabled value is not evaluated at all (and so not tracked); the
// requested flag is tracked instead, and its flip re-runs the merge with the
// gate open. No sentinel value exists to collide with.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::binding::scope::AbortSignal;
use crate::core::key::{QueryHash, QueryKey};
use crate::core::options::{
    DefaultOptions, MergedOptions, OptionsPatch, QueryOptions, ResolvedOptions,
};
use crate::reactive::cell::{default_equals, ObservableCell};
use crate::reactive::runtime::untrack;
use crate::reactive::watcher::{watch_memo, Watcher};

/// Recomputed on every reactive pass; later layers win over base options.
pub type DynamicOptionsFn = Rc<dyn Fn() -> QueryOptions>;

/// Recomputed on every reactive pass; replaces the base key.
pub type DynamicKeyFn = Rc<dyn Fn() -> QueryKey>;

/// Receives each resolved option set that differs from the last applied one.
pub type ApplyFn = Rc<dyn Fn(ResolvedOptions)>;

// =============================================================================
// ENABLED GATE
// =============================================================================

/// On-demand gate over the caller's enabled value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledGate {
    /// Not in on-demand mode; enabled passes straight through.
    NotApplicable,
    /// Observation not yet requested: enabled resolves to false and the
    /// caller's value is left unevaluated. The real value is recomputed by
    /// the merge itself once the gate opens, so nothing is captured.
    Gated,
    /// Requested at least once; enabled passes straight through from now on.
    Ungated,
}

// =============================================================================
// RECONCILER
// =============================================================================

pub struct ReconcilerConfig {
    pub defaults: DefaultOptions,
    pub base_key: QueryKey,
    pub base_options: QueryOptions,
    pub dynamic_options: Option<DynamicOptionsFn>,
    pub dynamic_key: Option<DynamicKeyFn>,
    pub hash_fn: Rc<dyn Fn(&QueryKey) -> QueryHash>,
    pub on_demand: bool,
    /// The result slot's first-read flag; tracked while the gate is closed.
    pub requested: ObservableCell<bool>,
    pub signal: AbortSignal,
    pub apply: ApplyFn,
}

struct ReconcilerInner {
    defaults: DefaultOptions,
    base_key: QueryKey,
    base_options: QueryOptions,
    dynamic_options: Option<DynamicOptionsFn>,
    dynamic_key: Option<DynamicKeyFn>,
    hash_fn: Rc<dyn Fn(&QueryKey) -> QueryHash>,
    requested: ObservableCell<bool>,
    signal: AbortSignal,
    apply: ApplyFn,
    patch: RefCell<OptionsPatch>,
    /// Bumped by `update()` so an installed merge watcher re-runs.
    update_version: ObservableCell<u64>,
    gate: Cell<EnabledGate>,
    watcher: RefCell<Option<Watcher>>,
}

impl ReconcilerInner {
    /// One reconciliation pass. Tracked reads: update version, dynamic key,
    /// dynamic options, the requested flag (while gated), and whatever the
    /// enabled predicate itself reads.
    fn merge(&self) -> ResolvedOptions {
        let _ = self.update_version.get();

        let key = match &self.dynamic_key {
            Some(f) => f(),
            None => self.base_key.clone(),
        };
        let dynamic = self.dynamic_options.as_ref().map(|f| f());
        let patch = self.patch.borrow().clone();

        let mut layers: Vec<&QueryOptions> = vec![&self.base_options];
        if let Some(dynamic) = &dynamic {
            layers.push(dynamic);
        }
        layers.push(&patch);
        let merged = MergedOptions::merge(&self.defaults, &layers);

        // Unconditional, even when apply ends up skipped.
        let hash = (self.hash_fn)(&key);

        let enabled = match self.gate.get() {
            EnabledGate::NotApplicable | EnabledGate::Ungated => merged.enabled.evaluate(),
            EnabledGate::Gated => {
                if self.requested.get() {
                    self.gate.set(EnabledGate::Ungated);
                    merged.enabled.evaluate()
                } else {
                    false
                }
            }
        };

        merged.into_resolved(key, hash, enabled)
    }
}

/// Layered option reconciliation bound to one controller. Cheap to clone;
/// clones share state.
pub struct Reconciler {
    inner: Rc<ReconcilerInner>,
}

impl Clone for Reconciler {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        let gate = if config.on_demand {
            EnabledGate::Gated
        } else {
            EnabledGate::NotApplicable
        };
        Self {
            inner: Rc::new(ReconcilerInner {
                defaults: config.defaults,
                base_key: config.base_key,
                base_options: config.base_options,
                dynamic_options: config.dynamic_options,
                dynamic_key: config.dynamic_key,
                hash_fn: config.hash_fn,
                requested: config.requested,
                signal: config.signal,
                apply: config.apply,
                patch: RefCell::new(OptionsPatch::default()),
                update_version: ObservableCell::new(0),
                gate: Cell::new(gate),
                watcher: RefCell::new(None),
            }),
        }
    }

    /// One untracked pass, without applying. Used for the options an
    /// observer is constructed with, before any watcher exists.
    pub fn reconcile_once(&self) -> ResolvedOptions {
        untrack(|| self.inner.merge())
    }

    /// Spawn the merge watcher. The first run applies immediately (the apply
    /// target is expected to treat an unchanged option set as a no-op);
    /// subsequent runs apply only when the resolved set differs.
    pub fn install(&self) {
        if self.inner.watcher.borrow().is_some() {
            return;
        }
        let merge_inner = self.inner.clone();
        let apply = self.inner.apply.clone();
        let watcher = watch_memo(
            move || merge_inner.merge(),
            move |resolved: &ResolvedOptions| {
                tracing::debug!(hash = %resolved.hash, enabled = resolved.enabled, "options applied");
                apply(resolved.clone());
            },
            default_equals,
        );
        *self.inner.watcher.borrow_mut() = Some(watcher);
    }

    /// Dispose the merge watcher. Must run before the subscription it feeds
    /// is severed, so no pass runs against a detached observer.
    pub fn uninstall(&self) {
        if let Some(watcher) = self.inner.watcher.borrow_mut().take() {
            watcher.dispose();
        }
    }

    pub fn is_installed(&self) -> bool {
        self.inner.watcher.borrow().is_some()
    }

    pub fn gate(&self) -> EnabledGate {
        self.inner.gate.get()
    }

    /// Merge an explicit patch over everything else and re-reconcile.
    /// Silent no-op once the scope is aborted.
    pub fn update(&self, patch: OptionsPatch) {
        if self.signal_aborted() {
            tracing::debug!("update ignored: scope aborted");
            return;
        }
        {
            let mut current = self.inner.patch.borrow_mut();
            if let Some(enabled) = patch.enabled {
                current.enabled = Some(enabled);
            }
            if let Some(stale) = patch.stale_time_ms {
                current.stale_time_ms = Some(stale);
            }
            if let Some(retry) = patch.retry {
                current.retry = Some(retry);
            }
            if let Some(notify) = patch.notify {
                current.notify = Some(notify);
            }
            if let Some(throw) = patch.throw_on_error {
                current.throw_on_error = Some(throw);
            }
        }
        let version = self.inner.update_version.peek();
        self.inner.update_version.set(version + 1);

        // With no merge watcher installed (lazy mode, nothing observing),
        // dynamic inputs stay dormant but an explicit patch still applies.
        if self.inner.watcher.borrow().is_none() {
            let resolved = untrack(|| self.inner.merge());
            (self.inner.apply)(resolved);
        }
    }

    fn signal_aborted(&self) -> bool {
        self.inner.signal.is_aborted()
    }
}

// =============================================================================
// TESTS
// =============================================================================
