// ============================================================================
// spark-query - Mutation Observer
// One-shot writes: idle -> pending -> success/error, never cached
// ============================================================================
//
// Mutations do not live in the query cache; each observer owns its own
// snapshot and pushes every transition to subscribers (the status sequence
// is part of the contract). Jobs go through the same dispatcher as query
// fetches, so manual mode steps mutations too.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::error::FetchError;
use crate::core::snapshot::{MutationSnapshot, MutationStatus};
use crate::engine::client::QueryClient;
use crate::engine::fetch::{FetchHandle, FetchOutcome};
use crate::engine::observer::Unsubscribe;
use crate::reactive::runtime::now_ms;

/// The mutation function, applied to the variables of each `mutate` call.
pub type MutationFn<T, V> = Rc<dyn Fn(&V) -> Result<T, FetchError>>;

// =============================================================================
// MUTATION OBSERVER
// =============================================================================

struct MutationInner<T: Clone + 'static, V: Clone + 'static> {
    client: QueryClient,
    mutation_fn: MutationFn<T, V>,
    state: RefCell<MutationSnapshot<T, V>>,
    subscribers: RefCell<Vec<(u64, Rc<dyn Fn(MutationSnapshot<T, V>)>)>>,
    next_sub_id: Cell<u64>,
    in_flight: RefCell<Option<(FetchHandle, Rc<Cell<bool>>)>>,
    destroyed: Cell<bool>,
    self_weak: RefCell<Weak<MutationInner<T, V>>>,
}

impl<T: Clone + 'static, V: Clone + 'static> MutationInner<T, V> {
    fn push(&self) {
        let snap = self.state.borrow().clone();
        let subs: Vec<Rc<dyn Fn(MutationSnapshot<T, V>)>> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in subs {
            cb(snap.clone());
        }
    }

    fn cancel_in_flight(&self) {
        if let Some((handle, cancelled)) = self.in_flight.borrow_mut().take() {
            cancelled.set(true);
            handle.settle(FetchOutcome::Cancelled);
        }
    }
}

pub struct MutationObserver<T: Clone + 'static, V: Clone + 'static> {
    inner: Rc<MutationInner<T, V>>,
}

impl<T: Clone + 'static, V: Clone + 'static> Clone for MutationObserver<T, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static, V: Clone + 'static> MutationObserver<T, V> {
    pub fn new(client: QueryClient, mutation_fn: MutationFn<T, V>) -> Self {
        let inner = Rc::new(MutationInner {
            client,
            mutation_fn,
            state: RefCell::new(MutationSnapshot::idle()),
            subscribers: RefCell::new(Vec::new()),
            next_sub_id: Cell::new(1),
            in_flight: RefCell::new(None),
            destroyed: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *inner.self_weak.borrow_mut() = Rc::downgrade(&inner);
        Self { inner }
    }

    pub fn current_result(&self) -> MutationSnapshot<T, V> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self, push: impl Fn(MutationSnapshot<T, V>) + 'static) -> Unsubscribe {
        if self.inner.destroyed.get() {
            return Box::new(|| {});
        }
        let id = self.inner.next_sub_id.get();
        self.inner.next_sub_id.set(id + 1);
        self.inner.subscribers.borrow_mut().push((id, Rc::new(push)));

        let weak = self.inner.self_weak.borrow().clone();
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.borrow_mut().retain(|(sid, _)| *sid != id);
            }
        })
    }

    /// Run the mutation. A second call while one is pending joins the
    /// in-flight run instead of starting another.
    pub fn mutate(&self, variables: V) -> FetchHandle {
        if self.inner.destroyed.get() {
            return FetchHandle::settled(FetchOutcome::Cancelled);
        }
        if let Some((handle, _)) = self.inner.in_flight.borrow().as_ref() {
            return handle.clone();
        }

        let handle = FetchHandle::pending();
        let cancelled = Rc::new(Cell::new(false));
        *self.inner.in_flight.borrow_mut() = Some((handle.clone(), cancelled.clone()));

        {
            let mut state = self.inner.state.borrow_mut();
            state.status = MutationStatus::Pending;
            state.variables = Some(variables.clone());
            state.error = None;
        }
        self.inner.push();
        tracing::trace!("mutation dispatched");

        let weak = self.inner.self_weak.borrow().clone();
        let job_handle = handle.clone();
        self.inner.client.dispatch(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if cancelled.get() {
                return;
            }
            let result = (inner.mutation_fn)(&variables);
            if cancelled.get() {
                return;
            }
            let stamp = inner.client.next_stamp();
            let outcome = {
                let mut state = inner.state.borrow_mut();
                state.submitted_at = Some(now_ms());
                state.settle_stamp = stamp;
                match result {
                    Ok(data) => {
                        state.status = MutationStatus::Success;
                        state.data = Some(data);
                        FetchOutcome::Success
                    }
                    Err(error) => {
                        state.status = MutationStatus::Error;
                        state.error = Some(error.clone());
                        FetchOutcome::Failure(error)
                    }
                }
            };
            *inner.in_flight.borrow_mut() = None;
            job_handle.settle(outcome);
            inner.push();
        }));

        handle
    }

    /// Return to the idle snapshot, cancelling a pending run.
    pub fn reset(&self) {
        self.inner.cancel_in_flight();
        *self.inner.state.borrow_mut() = MutationSnapshot::idle();
        self.inner.push();
    }

    pub fn in_flight_handle(&self) -> Option<FetchHandle> {
        self.inner.in_flight.borrow().as_ref().map(|(h, _)| h.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.inner.cancel_in_flight();
        self.inner.subscribers.borrow_mut().clear();
        tracing::trace!("mutation observer destroyed");
    }

    pub(crate) fn client(&self) -> &QueryClient {
        &self.inner.client
    }
}

impl<T: Clone + 'static, V: Clone + 'static> Drop for MutationObserver<T, V> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.destroy();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
