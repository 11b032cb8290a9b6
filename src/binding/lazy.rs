// ============================================================================
// spark-query - Lazy Observation Bridge
// Start on first observation, end (debounced) when observation ceases
// ============================================================================
//
// Plugged into an observable cell's observed/unobserved hooks. The end
// callback is debounced: a re-observation inside the delay window cancels
// the pending end, so observer-count micro-fluctuations (a consumer dropping
// and reacquiring within one update pass) cause zero detach/reattach cycles.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::reactive::cell::ObservedHooks;
use crate::reactive::runtime::{cancel_timer, set_timeout, TimerId};

// =============================================================================
// REARM
// =============================================================================

/// Handed to the end callback; calling [`Rearm::rearm`] re-runs the start
/// callback immediately after the end callback returns, for callbacks that
/// discover mid-teardown that they are needed again.
pub struct Rearm {
    requested: Cell<bool>,
}

impl Rearm {
    pub fn rearm(&self) {
        self.requested.set(true);
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

struct BridgeInner<M> {
    on_start: Box<dyn Fn() -> M>,
    on_end: Box<dyn Fn(M, &Rearm)>,
    end_delay_ms: u64,
    metadata: RefCell<Option<M>>,
    pending_end: Cell<Option<TimerId>>,
    started: Cell<bool>,
    disposed: Cell<bool>,
}

impl<M: 'static> BridgeInner<M> {
    fn handle_observed(self: &Rc<Self>) {
        if self.disposed.get() {
            return;
        }
        // A pending end means we were started moments ago; cancelling the
        // timer is the whole debounce.
        if let Some(timer) = self.pending_end.take() {
            cancel_timer(timer);
            return;
        }
        if self.started.get() {
            return;
        }
        self.started.set(true);
        *self.metadata.borrow_mut() = Some((self.on_start)());
        tracing::trace!("lazy bridge started");
    }

    fn handle_unobserved(self: &Rc<Self>) {
        if self.disposed.get() || !self.started.get() || self.pending_end.get().is_some() {
            return;
        }
        let weak = Rc::downgrade(self);
        let timer = set_timeout(self.end_delay_ms, move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_end();
            }
        });
        self.pending_end.set(Some(timer));
    }

    fn run_end(self: &Rc<Self>) {
        self.pending_end.set(None);
        if self.disposed.get() || !self.started.get() {
            return;
        }
        self.started.set(false);
        let Some(metadata) = self.metadata.borrow_mut().take() else {
            return;
        };

        let rearm = Rearm {
            requested: Cell::new(false),
        };
        (self.on_end)(metadata, &rearm);
        tracing::trace!("lazy bridge ended");

        if rearm.requested.get() {
            self.started.set(true);
            *self.metadata.borrow_mut() = Some((self.on_start)());
        }
    }
}

/// Debounced start/end lifecycle keyed to a cell's observation state.
pub struct LazyObservationBridge<M: 'static> {
    inner: Rc<BridgeInner<M>>,
}

impl<M: 'static> LazyObservationBridge<M> {
    pub fn new(
        on_start: impl Fn() -> M + 'static,
        on_end: impl Fn(M, &Rearm) + 'static,
        end_delay_ms: u64,
    ) -> Self {
        Self {
            inner: Rc::new(BridgeInner {
                on_start: Box::new(on_start),
                on_end: Box::new(on_end),
                end_delay_ms,
                metadata: RefCell::new(None),
                pending_end: Cell::new(None),
                started: Cell::new(false),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Hooks to install on the observed cell.
    pub fn hooks(&self) -> ObservedHooks {
        let observed = self.inner.clone();
        let unobserved = self.inner.clone();
        ObservedHooks {
            on_observed: Box::new(move || observed.handle_observed()),
            on_unobserved: Box::new(move || unobserved.handle_unobserved()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.get()
    }

    /// Stop reacting to observation changes and drop any held metadata
    /// WITHOUT running the end callback; teardown that needs the metadata
    /// runs through the controller's own abort path.
    pub fn dispose(&self) -> Option<M> {
        if self.inner.disposed.replace(true) {
            return None;
        }
        if let Some(timer) = self.inner.pending_end.take() {
            cancel_timer(timer);
        }
        self.inner.started.set(false);
        self.inner.metadata.borrow_mut().take()
    }
}

// =============================================================================
// TESTS
// =============================================================================
