//! Per-transaction safepoint gate.
//!
//! The owning mutator holds the gate for the whole time it may touch the
//! heap; it steps out at a pause point or at the top of commit. A collector
//! acquires the gate to know the mutator is stopped, and releases it when
//! relocation is finished.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    mutator_in: bool,
    collector_hold: bool,
}

pub(crate) struct GcGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl GcGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
        }
    }

    /// Mutator side: claim the gate, waiting out any collector that holds it.
    pub(crate) fn enter(&self) {
        let mut state = self.state.lock().expect("gate lock");
        while state.collector_hold {
            state = self.changed.wait(state).expect("gate wait");
        }
        debug_assert!(!state.mutator_in, "gate entered twice by its owner");
        state.mutator_in = true;
    }

    /// Mutator side: step out at a safepoint.
    pub(crate) fn leave(&self) {
        let mut state = self.state.lock().expect("gate lock");
        state.mutator_in = false;
        self.changed.notify_all();
    }

    /// Collector side: wait until the mutator is out, then hold the gate so
    /// it cannot re-enter.
    pub(crate) fn acquire(&self) {
        let mut state = self.state.lock().expect("gate lock");
        while state.mutator_in {
            state = self.changed.wait(state).expect("gate wait");
        }
        debug_assert!(!state.collector_hold, "gate acquired by two collectors");
        state.collector_hold = true;
    }

    /// Collector side: let the mutator back in.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock().expect("gate lock");
        state.collector_hold = false;
        self.changed.notify_all();
    }
}
