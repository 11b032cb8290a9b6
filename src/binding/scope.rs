// ============================================================================
// spark-query - Cancellation Scope
// Disposable abort token with linked (parent -> child) cancellation
// ============================================================================
//
// Every controller owns one scope; destroy() is just an abort with the
// Destroyed reason, so explicit destruction and external signal aborts share
// one teardown path and exactly-once semantics fall out of the signal's
// idempotence.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::error::AbortReason;
use crate::reactive::cell::ObservableCell;

// =============================================================================
// ABORT SIGNAL
// =============================================================================

struct SignalInner {
    reason: Cell<Option<AbortReason>>,
    /// Reactive mirror of the aborted flag, so watchers can track it.
    flag: ObservableCell<bool>,
    callbacks: RefCell<Vec<Box<dyn FnOnce(AbortReason)>>>,
}

impl SignalInner {
    fn abort(&self, reason: AbortReason) {
        if self.reason.get().is_some() {
            return;
        }
        self.reason.set(Some(reason));
        self.flag.set(true);

        // Drain before running: a callback aborting this signal again (or
        // registering new callbacks) must not re-enter the list.
        let callbacks: Vec<Box<dyn FnOnce(AbortReason)>> =
            self.callbacks.borrow_mut().drain(..).collect();
        for cb in callbacks {
            cb(reason);
        }
    }
}

/// Observable cancel flag plus reason. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<SignalInner>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            inner: Rc::new(SignalInner {
                reason: Cell::new(None),
                flag: ObservableCell::new(false),
                callbacks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Untracked read of the aborted flag.
    pub fn is_aborted(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// Tracked read, for use inside watchers.
    pub fn observe_aborted(&self) -> bool {
        self.inner.flag.get()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.get()
    }

    /// Register a cleanup, run exactly once, in registration order,
    /// synchronously at abort. On an already-aborted signal the callback
    /// runs immediately.
    pub fn on_abort(&self, cb: impl FnOnce(AbortReason) + 'static) {
        match self.inner.reason.get() {
            Some(reason) => cb(reason),
            None => self.inner.callbacks.borrow_mut().push(Box::new(cb)),
        }
    }

    fn abort(&self, reason: AbortReason) {
        self.inner.abort(reason);
    }
}

// =============================================================================
// CANCELLATION SCOPE
// =============================================================================

/// A disposable abort token, optionally derived from a parent signal.
/// Parent aborts propagate to the child; aborting the child never touches
/// the parent. Double abort is a no-op.
pub struct CancellationScope {
    signal: AbortSignal,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    /// A scope whose signal aborts when `parent` aborts. A child of an
    /// already-aborted parent starts aborted.
    pub fn linked(parent: &AbortSignal) -> Self {
        let scope = Self::new();
        // Weak so an abandoned child does not outlive its handles just
        // because the parent holds a callback.
        let weak: Weak<SignalInner> = Rc::downgrade(&scope.signal.inner);
        parent.on_abort(move |_| {
            if let Some(child) = weak.upgrade() {
                child.abort(AbortReason::Parent);
            }
        });
        scope
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }

    pub fn on_abort(&self, cb: impl FnOnce(AbortReason) + 'static) {
        self.signal.on_abort(cb);
    }

    /// Idempotent: only the first abort runs callbacks.
    pub fn abort(&self, reason: AbortReason) {
        self.signal.abort(reason);
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_idempotent() {
        let scope = CancellationScope::new();
        let count = Rc::new(Cell::new(0));

        let c = count.clone();
        scope.on_abort(move |_| c.set(c.get() + 1));

        scope.abort(AbortReason::Destroyed);
        scope.abort(AbortReason::Fetch);

        assert_eq!(count.get(), 1);
        assert_eq!(scope.signal().reason(), Some(AbortReason::Destroyed));
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let scope = CancellationScope::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let o = order.clone();
            scope.on_abort(move |_| o.borrow_mut().push(i));
        }

        scope.abort(AbortReason::Destroyed);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn registering_on_aborted_scope_runs_immediately() {
        let scope = CancellationScope::new();
        scope.abort(AbortReason::Destroyed);

        let ran = Rc::new(Cell::new(false));
        let rc = ran.clone();
        scope.on_abort(move |reason| {
            assert_eq!(reason, AbortReason::Destroyed);
            rc.set(true);
        });
        assert!(ran.get());
    }

    #[test]
    fn parent_abort_propagates_to_child() {
        let parent = CancellationScope::new();
        let child = CancellationScope::linked(&parent.signal());

        assert!(!child.is_aborted());
        parent.abort(AbortReason::Destroyed);

        assert!(child.is_aborted());
        assert_eq!(child.signal().reason(), Some(AbortReason::Parent));
    }

    #[test]
    fn child_abort_does_not_touch_parent() {
        let parent = CancellationScope::new();
        let child = CancellationScope::linked(&parent.signal());

        child.abort(AbortReason::Destroyed);
        assert!(!parent.is_aborted());
    }

    #[test]
    fn child_of_aborted_parent_starts_aborted() {
        let parent = CancellationScope::new();
        parent.abort(AbortReason::Destroyed);

        let child = CancellationScope::linked(&parent.signal());
        assert!(child.is_aborted());
    }

    #[test]
    fn aborted_flag_is_observable() {
        use crate::reactive::watcher::Watcher;

        let scope = CancellationScope::new();
        let signal = scope.signal();
        let seen = Rc::new(Cell::new(false));

        let (s, sc) = (signal.clone(), seen.clone());
        let _w = Watcher::new(move || {
            sc.set(s.observe_aborted());
        });

        assert!(!seen.get());
        scope.abort(AbortReason::Destroyed);
        assert!(seen.get());
    }
}
