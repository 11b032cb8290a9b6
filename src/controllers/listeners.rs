// ============================================================================
// spark-query - Done/Error Listener Registry
// ============================================================================
//
// Listeners fire in registration order, at most once per distinct settle
// stamp, and a single push fires done OR error, never both. Stamps are
// seeded from the optimistic snapshot at construction so pre-existing cache
// data does not fire a spurious done on the first push.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::core::error::FetchError;

pub(crate) struct DoneErrorListeners<T> {
    done: RefCell<Vec<Rc<dyn Fn(&T)>>>,
    error: RefCell<Vec<Rc<dyn Fn(&FetchError)>>>,
    last_done_stamp: Cell<u64>,
    last_error_stamp: Cell<u64>,
}

impl<T> DoneErrorListeners<T> {
    pub(crate) fn new(initial_done_stamp: u64, initial_error_stamp: u64) -> Self {
        Self {
            done: RefCell::new(Vec::new()),
            error: RefCell::new(Vec::new()),
            last_done_stamp: Cell::new(initial_done_stamp),
            last_error_stamp: Cell::new(initial_error_stamp),
        }
    }

    /// Never invoked at registration time, only on later settles.
    pub(crate) fn on_done(&self, cb: impl Fn(&T) + 'static) {
        self.done.borrow_mut().push(Rc::new(cb));
    }

    pub(crate) fn on_error(&self, cb: impl Fn(&FetchError) + 'static) {
        self.error.borrow_mut().push(Rc::new(cb));
    }

    /// Process one push. Fires done when the data stamp advanced, else error
    /// when the error stamp advanced; repeated pushes of the same settle are
    /// ignored. Both stamps fast-forward on every push, so a stale settle
    /// riding along in a snapshot (an old error next to newer data) is
    /// consumed silently rather than replayed by a later push.
    /// Collect-then-run: a callback may register further listeners (or
    /// trigger re-entrant updates) without poisoning the iteration.
    pub(crate) fn notify(
        &self,
        data_stamp: u64,
        error_stamp: u64,
        data: Option<&T>,
        error: Option<&FetchError>,
    ) {
        let done_advanced = data_stamp > self.last_done_stamp.get();
        let error_advanced = error_stamp > self.last_error_stamp.get();
        if done_advanced {
            self.last_done_stamp.set(data_stamp);
        }
        if error_advanced {
            self.last_error_stamp.set(error_stamp);
        }

        if done_advanced {
            if let Some(data) = data {
                let callbacks: Vec<Rc<dyn Fn(&T)>> = self.done.borrow().clone();
                for cb in callbacks {
                    cb(data);
                }
            }
        } else if error_advanced {
            if let Some(error) = error {
                let callbacks: Vec<Rc<dyn Fn(&FetchError)>> = self.error.borrow().clone();
                for cb in callbacks {
                    cb(error);
                }
            }
        }
    }

    /// Raise both baselines, never lowering either. Called when the
    /// controller attaches to a different cache entry: settles already on
    /// that entry predate the attachment and must stay silent.
    pub(crate) fn reseed(&self, done_stamp: u64, error_stamp: u64) {
        if done_stamp > self.last_done_stamp.get() {
            self.last_done_stamp.set(done_stamp);
        }
        if error_stamp > self.last_error_stamp.get() {
            self.last_error_stamp.set(error_stamp);
        }
    }

    pub(crate) fn clear(&self) {
        self.done.borrow_mut().clear();
        self.error.borrow_mut().clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
