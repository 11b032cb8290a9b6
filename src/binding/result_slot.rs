// ============================================================================
// spark-query - Reactive Result Slot
// Push snapshots in, tracked reads out, first-read flag for on-demand
// ============================================================================
//
// The slot is the single seam between the engine's push callback and the
// reactive graph: `write` is its only mutation point. Snapshots are replaced
// wholesale, so the cell uses never-equal comparison and every write
// notifies. The first `read` ever flips an observable `requested` flag;
// on-demand gating watches that flag. The flip is guarded by an untracked
// peek, so the read-triggers-write pattern (read -> reconcile -> fetch ->
// push -> write) cannot re-enter.
// ============================================================================

use crate::reactive::cell::{never_equals, ObservableCell, ObservedHooks};
use crate::reactive::runtime::batch;

pub struct ResultSlot<S: Clone + 'static> {
    snapshot: ObservableCell<S>,
    requested: ObservableCell<bool>,
}

impl<S: Clone + 'static> ResultSlot<S> {
    pub fn new(initial: S) -> Self {
        Self {
            snapshot: ObservableCell::with_equals(initial, never_equals),
            requested: ObservableCell::new(false),
        }
    }

    /// Latest snapshot, registering a dependency on the active watcher.
    /// The first read flips the requested flag inside a batch, so gating
    /// logic and the returned value stay consistent.
    pub fn read(&self) -> S {
        if !self.requested.peek() {
            batch(|| {
                self.requested.set(true);
            });
        }
        self.snapshot.get()
    }

    /// Latest snapshot, untracked and without the first-read side effect.
    pub fn peek(&self) -> S {
        self.snapshot.peek()
    }

    /// Total replacement; only the engine's push callback calls this.
    pub fn write(&self, snapshot: S) {
        batch(|| {
            self.snapshot.set(snapshot);
        });
    }

    /// The observable first-read flag, tracked by the options reconciler.
    pub fn requested_cell(&self) -> &ObservableCell<bool> {
        &self.requested
    }

    pub fn observation_requested(&self) -> bool {
        self.requested.peek()
    }

    /// Install observed/unobserved hooks on the snapshot cell (the lazy
    /// bridge plugs in here).
    pub fn set_observed_hooks(&self, hooks: ObservedHooks) {
        self.snapshot.set_observed_hooks(hooks);
    }

    pub fn watcher_count(&self) -> usize {
        self.snapshot.watcher_count()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::watcher::Watcher;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn first_read_flips_requested_once() {
        let slot = ResultSlot::new(0);
        assert!(!slot.observation_requested());

        assert_eq!(slot.read(), 0);
        assert!(slot.observation_requested());

        // Later reads leave the flag alone (no re-notification).
        let flips = Rc::new(Cell::new(0));
        let fc = flips.clone();
        let requested = slot.requested_cell().clone();
        let _w = Watcher::new(move || {
            let _ = requested.get();
            fc.set(fc.get() + 1);
        });
        assert_eq!(flips.get(), 1);

        let _ = slot.read();
        assert_eq!(flips.get(), 1);
    }

    #[test]
    fn peek_has_no_side_effects() {
        let slot = ResultSlot::new(7);
        assert_eq!(slot.peek(), 7);
        assert!(!slot.observation_requested());
    }

    #[test]
    fn every_write_notifies_even_with_equal_values() {
        let slot = Rc::new(ResultSlot::new(1));
        let runs = Rc::new(Cell::new(0));

        let (sc, rc) = (slot.clone(), runs.clone());
        let _w = Watcher::new(move || {
            let _ = sc.read();
            rc.set(rc.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        // Wholesale replacement: equal value still counts as a new snapshot.
        slot.write(1);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn requested_flag_is_watchable_for_gating() {
        let slot = Rc::new(ResultSlot::new(0));
        let gate_opened = Rc::new(Cell::new(false));

        let requested = slot.requested_cell().clone();
        let go = gate_opened.clone();
        let _w = Watcher::new(move || {
            if requested.get() {
                go.set(true);
            }
        });

        assert!(!gate_opened.get());
        let _ = slot.read();
        assert!(gate_opened.get());
    }
}
