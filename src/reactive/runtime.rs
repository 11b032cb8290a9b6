// ============================================================================
// spark-query - Reactive Runtime
// Thread-local context: active watcher, batching, untracked reads, timers
// ============================================================================
//
// The bindings only need a small slice of a fine-grained reactive runtime:
// observable cells, watchers that re-run when a tracked cell changes,
// batching so multi-field updates notify once, and a deterministic timer
// queue for debounced teardown. This module is that slice. Everything runs
// on one logical thread; "concurrency" is interleaving on this queue.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

// =============================================================================
// TYPE-ERASED TRAITS
// =============================================================================
//
// Cells hold values of different types but the runtime only needs identity
// and notification, so watchers store `Rc<dyn AnyCell>` dependencies and
// cells store `Weak<dyn AnyWatcher>` reactions. Same trick as storing
// heterogeneous sources in one dependency graph.
// =============================================================================

/// Type-erased watcher interface used by cells for notification.
pub(crate) trait AnyWatcher {
    /// Stable identity for deduplication.
    fn watcher_id(&self) -> u64;

    /// Re-run the watcher body with dependency tracking.
    fn notify(self: Rc<Self>);

    /// Whether the watcher has been disposed.
    fn is_disposed(&self) -> bool;

    /// Record a cell this watcher read during its current run.
    fn add_dep(&self, cell: Rc<dyn AnyCell>);
}

/// Type-erased cell interface used by watchers for dependency cleanup.
pub(crate) trait AnyCell {
    /// Remove a watcher from this cell's reaction list.
    /// Fires the unobserved hook when the list becomes empty.
    fn detach_watcher(&self, watcher_id: u64);
}

// =============================================================================
// TIMERS (virtual clock)
// =============================================================================

/// Handle to a scheduled timer, used for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u64);

struct TimerEntry {
    id: TimerId,
    deadline_ms: u64,
    callback: Box<dyn FnOnce()>,
}

// =============================================================================
// RUNTIME CONTEXT
// =============================================================================

/// Thread-local reactive context.
///
/// Holds the currently tracking watcher, the batch depth with its pending
/// notification queue, the untrack flag, and the virtual clock. The clock is
/// virtual so debounce windows are deterministic: time only moves when
/// `advance_clock` is called.
pub struct RuntimeContext {
    active_watcher: RefCell<Option<Weak<dyn AnyWatcher>>>,
    batch_depth: Cell<u32>,
    pending: RefCell<Vec<(u64, Weak<dyn AnyWatcher>)>>,
    untracking: Cell<bool>,
    next_watcher_id: Cell<u64>,
    clock_ms: Cell<u64>,
    timers: RefCell<Vec<TimerEntry>>,
    next_timer_id: Cell<u64>,
}

impl RuntimeContext {
    fn new() -> Self {
        Self {
            active_watcher: RefCell::new(None),
            batch_depth: Cell::new(0),
            pending: RefCell::new(Vec::new()),
            untracking: Cell::new(false),
            next_watcher_id: Cell::new(1),
            clock_ms: Cell::new(0),
            timers: RefCell::new(Vec::new()),
            next_timer_id: Cell::new(1),
        }
    }

    pub(crate) fn set_active_watcher(
        &self,
        watcher: Option<Weak<dyn AnyWatcher>>,
    ) -> Option<Weak<dyn AnyWatcher>> {
        self.active_watcher.replace(watcher)
    }

    pub(crate) fn active_watcher(&self) -> Option<Rc<dyn AnyWatcher>> {
        if self.untracking.get() {
            return None;
        }
        self.active_watcher
            .borrow()
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    pub(crate) fn allocate_watcher_id(&self) -> u64 {
        let id = self.next_watcher_id.get();
        self.next_watcher_id.set(id + 1);
        id
    }

    fn enter_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    fn exit_batch(&self) -> u32 {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        depth
    }

    pub(crate) fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    /// Queue a watcher for execution at batch close (deduplicated by id).
    pub(crate) fn queue_watcher(&self, watcher: &Rc<dyn AnyWatcher>) {
        let id = watcher.watcher_id();
        let mut pending = self.pending.borrow_mut();
        if pending.iter().all(|(pid, _)| *pid != id) {
            pending.push((id, Rc::downgrade(watcher)));
        }
    }

    fn flush_pending(&self) {
        // Watchers may queue more watchers while running, so drain in rounds.
        loop {
            let batch: Vec<_> = self.pending.borrow_mut().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for (_, weak) in batch {
                if let Some(watcher) = weak.upgrade() {
                    if !watcher.is_disposed() {
                        watcher.notify();
                    }
                }
            }
        }
    }
}

thread_local! {
    static CONTEXT: RuntimeContext = RuntimeContext::new();
}

/// Access the thread-local runtime context.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&RuntimeContext) -> R) -> R {
    CONTEXT.with(f)
}

// =============================================================================
// BATCHING / UNTRACK
// =============================================================================

/// Batch multiple cell writes into a single notification cycle.
///
/// Watchers triggered inside the batch run once, when the outermost batch
/// closes. Nested batches are flattened.
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    with_runtime(|ctx| ctx.enter_batch());

    // Guard so the batch closes even if `f` panics.
    struct BatchGuard;

    impl Drop for BatchGuard {
        fn drop(&mut self) {
            let depth = with_runtime(|ctx| ctx.exit_batch());
            if depth == 0 {
                with_runtime(|ctx| ctx.flush_pending());
            }
        }
    }

    let _guard = BatchGuard;
    f()
}

/// Read cells without registering dependencies on the active watcher.
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_runtime(|ctx| {
        let prev = ctx.untracking.get();
        ctx.untracking.set(true);
        prev
    });

    struct UntrackGuard {
        prev: bool,
    }

    impl Drop for UntrackGuard {
        fn drop(&mut self) {
            with_runtime(|ctx| ctx.untracking.set(self.prev));
        }
    }

    let _guard = UntrackGuard { prev };
    f()
}

/// Check if currently inside a batch.
pub fn is_batching() -> bool {
    with_runtime(|ctx| ctx.is_batching())
}

// =============================================================================
// VIRTUAL CLOCK
// =============================================================================

/// Current virtual time in milliseconds.
pub fn now_ms() -> u64 {
    with_runtime(|ctx| ctx.clock_ms.get())
}

/// Schedule a callback to fire once `delay_ms` of virtual time has elapsed.
pub fn set_timeout(delay_ms: u64, callback: impl FnOnce() + 'static) -> TimerId {
    with_runtime(|ctx| {
        let id = TimerId(ctx.next_timer_id.get());
        ctx.next_timer_id.set(id.0 + 1);
        ctx.timers.borrow_mut().push(TimerEntry {
            id,
            deadline_ms: ctx.clock_ms.get().saturating_add(delay_ms),
            callback: Box::new(callback),
        });
        id
    })
}

/// Cancel a scheduled timer. Cancelling an already-fired timer is a no-op.
pub fn cancel_timer(id: TimerId) {
    with_runtime(|ctx| {
        ctx.timers.borrow_mut().retain(|t| t.id != id);
    });
}

/// Advance the virtual clock, firing every timer whose deadline is reached.
///
/// Timers fire in deadline order (creation order for equal deadlines), and a
/// timer scheduled by a firing callback participates in the same advance if
/// its deadline falls within it.
pub fn advance_clock(delta_ms: u64) {
    let target = with_runtime(|ctx| {
        let target = ctx.clock_ms.get().saturating_add(delta_ms);
        ctx.clock_ms.set(target);
        target
    });

    loop {
        let next = with_runtime(|ctx| {
            let mut timers = ctx.timers.borrow_mut();
            let due = timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.deadline_ms <= target)
                .min_by_key(|(_, t)| (t.deadline_ms, t.id.0))
                .map(|(i, _)| i);
            due.map(|i| timers.remove(i))
        });

        match next {
            Some(timer) => (timer.callback)(),
            None => break,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn batch_depth_tracking() {
        assert!(!is_batching());

        batch(|| {
            assert!(is_batching());
            batch(|| assert!(is_batching()));
            assert!(is_batching());
        });

        assert!(!is_batching());
    }

    #[test]
    fn batch_returns_value() {
        assert_eq!(batch(|| 42), 42);
    }

    #[test]
    fn batch_panic_safety() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batch(|| panic!("intentional panic"));
        }));
        assert!(result.is_err());
        assert!(!is_batching());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        let o2 = order.clone();
        let o3 = order.clone();
        set_timeout(30, move || o1.borrow_mut().push(30));
        set_timeout(10, move || o2.borrow_mut().push(10));
        set_timeout(20, move || o3.borrow_mut().push(20));

        advance_clock(25);
        assert_eq!(*order.borrow(), vec![10, 20]);

        advance_clock(10);
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();

        let id = set_timeout(5, move || fired_clone.set(true));
        cancel_timer(id);
        advance_clock(10);

        assert!(!fired.get());
    }

    #[test]
    fn timer_scheduled_during_advance_can_fire_in_same_advance() {
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();

        set_timeout(5, move || {
            let inner = fired_clone.clone();
            set_timeout(2, move || inner.set(true));
        });

        advance_clock(10);
        assert!(fired.get());
    }

    #[test]
    fn zero_delay_timer_fires_on_next_advance() {
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();

        set_timeout(0, move || fired_clone.set(true));
        assert!(!fired.get());

        advance_clock(0);
        assert!(fired.get());
    }
}
