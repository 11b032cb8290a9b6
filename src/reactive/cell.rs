// ============================================================================
// spark-query - Observable Cell
// A single reactive value with equality checking and observed hooks
// ============================================================================
//
// Reads inside a watcher register the cell as a dependency; writes notify
// dependent watchers (deferred while batching). A cell can additionally
// carry observed/unobserved hooks: the observed hook fires when the watcher
// count goes 0 -> 1, the unobserved hook when it goes back to 0. That is the
// capability the lazy subscription bridge is built on.
// ============================================================================

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::reactive::runtime::{with_runtime, AnyCell, AnyWatcher};

// =============================================================================
// EQUALITY
// =============================================================================

/// Equality function type for comparing cell values.
pub type EqualsFn<T> = fn(&T, &T) -> bool;

/// Default equality using PartialEq.
pub fn default_equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// Equality that always reports "different", forcing notification on every
/// write. Used for wholesale-replacement values like result snapshots.
pub fn never_equals<T>(_: &T, _: &T) -> bool {
    false
}

// =============================================================================
// OBSERVED HOOKS
// =============================================================================

/// Callbacks fired when a cell gains its first watcher / loses its last one.
pub struct ObservedHooks {
    pub on_observed: Box<dyn Fn()>,
    pub on_unobserved: Box<dyn Fn()>,
}

// =============================================================================
// CELL INNER
// =============================================================================

pub(crate) struct CellInner<T> {
    value: RefCell<T>,
    equals: EqualsFn<T>,
    watchers: RefCell<Vec<(u64, Weak<dyn AnyWatcher>)>>,
    hooks: RefCell<Option<ObservedHooks>>,
}

impl<T: 'static> CellInner<T> {
    fn track_read(self: &Rc<Self>) {
        let Some(watcher) = with_runtime(|ctx| ctx.active_watcher()) else {
            return;
        };

        let id = watcher.watcher_id();
        let was_empty = {
            let mut watchers = self.watchers.borrow_mut();
            watchers.retain(|(_, w)| w.strong_count() > 0);
            let was_empty = watchers.is_empty();
            if watchers.iter().all(|(wid, _)| *wid != id) {
                watchers.push((id, Rc::downgrade(&watcher)));
            }
            was_empty
        };

        watcher.add_dep(self.clone() as Rc<dyn AnyCell>);

        if was_empty && !self.watchers.borrow().is_empty() {
            if let Some(hooks) = self.hooks.borrow().as_ref() {
                (hooks.on_observed)();
            }
        }
    }

    fn notify_watchers(&self) {
        // Collect-then-run: a watcher body may mutate this cell's watcher
        // list while executing.
        let live: Vec<Rc<dyn AnyWatcher>> = {
            let mut watchers = self.watchers.borrow_mut();
            watchers.retain(|(_, w)| w.strong_count() > 0);
            watchers.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };

        with_runtime(|ctx| {
            if ctx.is_batching() {
                for watcher in &live {
                    ctx.queue_watcher(watcher);
                }
            } else {
                for watcher in live {
                    if !watcher.is_disposed() {
                        watcher.notify();
                    }
                }
            }
        });
    }
}

impl<T: 'static> AnyCell for CellInner<T> {
    fn detach_watcher(&self, watcher_id: u64) {
        let became_empty = {
            let mut watchers = self.watchers.borrow_mut();
            let had_any = !watchers.is_empty();
            watchers.retain(|(id, w)| *id != watcher_id && w.strong_count() > 0);
            had_any && watchers.is_empty()
        };

        if became_empty {
            if let Some(hooks) = self.hooks.borrow().as_ref() {
                (hooks.on_unobserved)();
            }
        }
    }
}

// =============================================================================
// OBSERVABLE CELL (public handle)
// =============================================================================

/// A reactive cell holding a value of type T.
///
/// Reading inside a watcher registers a dependency; writing notifies
/// dependent watchers when the value changed according to the cell's
/// equality function.
pub struct ObservableCell<T> {
    inner: Rc<CellInner<T>>,
}

impl<T> Clone for ObservableCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> ObservableCell<T> {
    /// Create a cell with the default PartialEq equality.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equals(value, default_equals)
    }

    /// Create a cell with a custom equality function.
    pub fn with_equals(value: T, equals: EqualsFn<T>) -> Self {
        Self {
            inner: Rc::new(CellInner {
                value: RefCell::new(value),
                equals,
                watchers: RefCell::new(Vec::new()),
                hooks: RefCell::new(None),
            }),
        }
    }

    /// Install observed/unobserved hooks. Replaces any previous hooks.
    pub fn set_observed_hooks(&self, hooks: ObservedHooks) {
        *self.inner.hooks.borrow_mut() = Some(hooks);
    }

    /// Read the value, registering a dependency on the active watcher.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.track_read();
        self.inner.value.borrow().clone()
    }

    /// Read the value without tracking.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Access the value with a closure, registering a dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.track_read();
        f(&self.inner.value.borrow())
    }

    /// Write the value. Returns true (and notifies watchers) if it changed
    /// according to the cell's equality function.
    pub fn set(&self, value: T) -> bool {
        let changed = {
            let current = self.inner.value.borrow();
            !(self.inner.equals)(&current, &value)
        };

        if changed {
            *self.inner.value.borrow_mut() = value;
            self.inner.notify_watchers();
        }

        changed
    }

    /// Number of live watchers currently tracking this cell.
    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.inner.watchers.borrow_mut();
        watchers.retain(|(_, w)| w.strong_count() > 0);
        watchers.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
