//! The shared event queue.
//!
//! Events are retryable closures: an aborted transaction re-runs the same
//! event, so the body must be safe to execute any number of times. The queue
//! drains to completion: a worker exits only when no events are left and no
//! peer is still executing one (a running event may enqueue more).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::mutator::{EventError, TxCtx};

type EventBody = dyn Fn(&mut TxCtx<'_>) -> Result<(), EventError> + Send + Sync;

/// One unit of work: a closure executed inside a transaction.
#[derive(Clone)]
pub struct Event {
    body: Arc<EventBody>,
}

impl Event {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut TxCtx<'_>) -> Result<(), EventError> + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(body),
        }
    }

    pub(crate) fn execute(&self, ctx: &mut TxCtx<'_>) -> Result<(), EventError> {
        (self.body)(ctx)
    }
}

struct QueueState {
    events: VecDeque<Event>,
    /// Workers currently executing an event. The pool is done when this hits
    /// zero with the queue empty.
    active_workers: usize,
}

pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                active_workers: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, event: Event) {
        let mut state = self.state.lock().expect("queue lock");
        state.events.push_back(event);
        self.available.notify_one();
    }

    /// Dequeue the next event, or `None` when the pool has drained. `active`
    /// is this worker's execution flag and must start out false.
    pub(crate) fn next(&self, active: &mut bool) -> Option<Event> {
        let mut state = self.state.lock().expect("queue lock");
        if *active {
            state.active_workers -= 1;
            *active = false;
        }

        loop {
            if let Some(event) = state.events.pop_front() {
                state.active_workers += 1;
                *active = true;
                return Some(event);
            }
            if state.active_workers == 0 {
                // Nothing queued and nobody running: wake the others so they
                // can reach the same conclusion.
                self.available.notify_all();
                return None;
            }
            state = self.available.wait(state).expect("queue wait");
        }
    }
}
