// ============================================================================
// spark-query - Fetch Dispatch
// Deterministic task queue: settle handles and the auto/manual dispatcher
// ============================================================================
//
// All "asynchrony" in the engine is interleaving on one logical thread. A
// fetch is a job handed to the dispatcher; in auto mode jobs run the moment
// they are issued, in manual mode they queue until something drives them
// (`flush_one`, `flush`, or a caller waiting on a handle). Manual mode is
// what makes mid-flight interleavings reproducible in tests.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::core::error::FetchError;

// =============================================================================
// FETCH MODE
// =============================================================================

/// How the engine runs fetch jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Jobs run synchronously when issued.
    #[default]
    Auto,
    /// Jobs queue; `flush_one` / `flush` (or a waiting caller) drive them.
    Manual,
}

// =============================================================================
// FETCH HANDLE
// =============================================================================

/// How a fetch job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success,
    Failure(FetchError),
    /// The governing signal aborted before the job settled.
    Cancelled,
}

/// Shared settle slot for one fetch job.
///
/// Every party interested in the same in-flight fetch holds a clone of the
/// same handle, so a caller that "joins" an in-flight fetch observes the
/// same outcome as the one that started it. The first settle wins; later
/// settles are ignored.
#[derive(Clone)]
pub struct FetchHandle {
    outcome: Rc<RefCell<Option<FetchOutcome>>>,
}

impl FetchHandle {
    pub(crate) fn pending() -> Self {
        Self {
            outcome: Rc::new(RefCell::new(None)),
        }
    }

    pub(crate) fn settled(outcome: FetchOutcome) -> Self {
        Self {
            outcome: Rc::new(RefCell::new(Some(outcome))),
        }
    }

    /// Record the outcome. First settle wins; returns whether this call won.
    pub(crate) fn settle(&self, outcome: FetchOutcome) -> bool {
        let mut slot = self.outcome.borrow_mut();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<FetchOutcome> {
        self.outcome.borrow().clone()
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

pub(crate) struct Dispatcher {
    mode: Cell<FetchMode>,
    queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl Dispatcher {
    pub(crate) fn new(mode: FetchMode) -> Self {
        Self {
            mode: Cell::new(mode),
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn dispatch(&self, job: Box<dyn FnOnce()>) {
        match self.mode.get() {
            FetchMode::Auto => job(),
            FetchMode::Manual => self.queue.borrow_mut().push_back(job),
        }
    }

    /// Run the oldest queued job. Returns false when the queue is empty.
    pub(crate) fn flush_one(&self) -> bool {
        let job = self.queue.borrow_mut().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run queued jobs until the queue is empty, including jobs queued by
    /// running jobs.
    pub(crate) fn flush(&self) {
        while self.flush_one() {}
    }

    pub(crate) fn pending_jobs(&self) -> usize {
        self.queue.borrow().len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
