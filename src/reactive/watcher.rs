// ============================================================================
// spark-query - Watcher
// A reaction that re-runs when any cell it read changes
// ============================================================================
//
// Watchers rebuild their dependency list on every run: old deps are detached
// first, then the body executes with this watcher active, re-registering
// whatever it actually reads. A write arriving mid-run marks the watcher
// dirty and it re-runs once after the body returns.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::reactive::cell::EqualsFn;
use crate::reactive::runtime::{untrack, with_runtime, AnyCell, AnyWatcher};

// Bail out of a self-perpetuating watcher instead of hanging the thread.
const MAX_RERUNS: u32 = 1000;

// =============================================================================
// WATCHER INNER
// =============================================================================

pub(crate) struct WatcherInner {
    id: u64,
    func: RefCell<Option<Box<dyn FnMut()>>>,
    deps: RefCell<Vec<Rc<dyn AnyCell>>>,
    disposed: Cell<bool>,
    running: Cell<bool>,
    dirty: Cell<bool>,
    self_weak: RefCell<Weak<WatcherInner>>,
}

impl WatcherInner {
    fn detach_deps(&self) {
        let old: Vec<Rc<dyn AnyCell>> = self.deps.borrow_mut().drain(..).collect();
        for cell in old {
            cell.detach_watcher(self.id);
        }
    }

    fn run(self: &Rc<Self>) {
        if self.disposed.get() {
            return;
        }
        if self.running.get() {
            // Re-entrant notification: re-run after the current pass.
            self.dirty.set(true);
            return;
        }

        self.running.set(true);
        let mut reruns = 0u32;

        loop {
            self.dirty.set(false);
            self.detach_deps();

            let weak: Weak<dyn AnyWatcher> = {
                let rc: Rc<dyn AnyWatcher> = self.clone();
                Rc::downgrade(&rc)
            };
            let prev = with_runtime(|ctx| ctx.set_active_watcher(Some(weak)));

            {
                let mut func = self.func.borrow_mut();
                if let Some(ref mut f) = *func {
                    f();
                }
            }

            with_runtime(|ctx| ctx.set_active_watcher(prev));

            if !self.dirty.get() || self.disposed.get() {
                break;
            }
            reruns += 1;
            if reruns >= MAX_RERUNS {
                tracing::warn!("watcher exceeded {MAX_RERUNS} consecutive re-runs; stopping");
                break;
            }
        }

        self.running.set(false);
    }
}

impl AnyWatcher for WatcherInner {
    fn watcher_id(&self) -> u64 {
        self.id
    }

    fn notify(self: Rc<Self>) {
        self.run();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    fn add_dep(&self, cell: Rc<dyn AnyCell>) {
        let mut deps = self.deps.borrow_mut();
        let ptr = Rc::as_ptr(&cell) as *const ();
        if deps
            .iter()
            .all(|d| Rc::as_ptr(d) as *const () != ptr)
        {
            deps.push(cell);
        }
    }
}

// =============================================================================
// WATCHER (public handle)
// =============================================================================

/// A reaction over reactive cells.
///
/// The body runs immediately on creation (with tracking) and re-runs
/// whenever a tracked cell changes. Disposing — explicitly or by dropping
/// the last handle — detaches all dependencies.
pub struct Watcher {
    inner: Rc<WatcherInner>,
}

impl Watcher {
    /// Create a watcher and run it once immediately.
    pub fn new(f: impl FnMut() + 'static) -> Self {
        let inner = Rc::new(WatcherInner {
            id: with_runtime(|ctx| ctx.allocate_watcher_id()),
            func: RefCell::new(Some(Box::new(f))),
            deps: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
            running: Cell::new(false),
            dirty: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *inner.self_weak.borrow_mut() = Rc::downgrade(&inner);

        inner.run();
        Self { inner }
    }

    /// Dispose the watcher: detach all dependencies and drop the body.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.get() {
            return;
        }
        self.inner.disposed.set(true);
        self.inner.detach_deps();
        *self.inner.func.borrow_mut() = None;
    }

    /// Whether this watcher has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.dispose();
        }
    }
}

// =============================================================================
// MEMOIZED WATCH
// =============================================================================

/// Watch a computation, invoking `on_change` with the computed value on the
/// first run and whenever a re-run produces a value the equality function
/// considers different. Re-runs that yield an unchanged value produce no
/// downstream effect.
pub fn watch_memo<V: 'static>(
    mut compute: impl FnMut() -> V + 'static,
    mut on_change: impl FnMut(&V) + 'static,
    equals: EqualsFn<V>,
) -> Watcher {
    let last: Rc<RefCell<Option<V>>> = Rc::new(RefCell::new(None));

    Watcher::new(move || {
        let value = compute();
        let changed = match &*last.borrow() {
            Some(prev) => !(equals)(prev, &value),
            None => true,
        };
        if changed {
            // The downstream effect must not extend this watcher's deps.
            untrack(|| on_change(&value));
            *last.borrow_mut() = Some(value);
        }
    })
}

// =============================================================================
// TESTS
// =============================================================================
