//! Petek: a parallel event runtime with transactional memory.
//!
//! # Architecture
//!
//! Closures (events) are drawn from a shared queue by a pool of worker
//! threads. Each execution attempt runs inside a transaction over the
//! managed heap: reads observe a consistent snapshot, writes go to private
//! shadow copies, and commit publishes them atomically or fails, in which
//! case the worker re-runs the event. The heap's copying collector stops all
//! workers at safepoints and relocates objects underneath the running
//! transactions.
//!
//! ```no_run
//! use petek::{Event, HeapSettings, Runtime, StmConfig, Value};
//!
//! let runtime = Runtime::new(StmConfig::default(), HeapSettings::default());
//! runtime.define_object("counter", &[0]).unwrap();
//! for _ in 0..100 {
//!     runtime.enqueue(Event::new(|ctx| {
//!         let h = ctx.open("counter")?;
//!         let n = ctx.load(h, 0)?.to_i64();
//!         ctx.store(h, 0, Value::from_i64(n + 1))?;
//!         Ok(())
//!     }));
//! }
//! let report = runtime.run();
//! assert_eq!(report.committed, 100);
//! ```

mod events;
mod mutator;
mod worker;

pub use events::Event;
pub use mutator::{EventError, TxCtx};

pub use petek_heap::{HeapError, HeapSettings, ObjectKind, Value};
pub use petek_stm::{
    AbortPolicy, AlternatePolicy, Handle, KeepPolicy, Stm, StmConfig, StmStats, Terminated,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use foldhash::fast::FixedState;
use petek_stm::{RootsHook, TxSession};

use events::EventQueue;

/// The shared name → object table. It is the root set the scripts see:
/// every value bound here survives collection and is rewritten in place
/// when its object moves.
pub struct GlobalTable {
    map: Mutex<HashMap<String, Value, FixedState>>,
}

impl GlobalTable {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::default()),
        }
    }

    pub fn set(&self, name: &str, value: Value) {
        self.map
            .lock()
            .expect("globals lock")
            .insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.map.lock().expect("globals lock").get(name).copied()
    }
}

impl RootsHook for GlobalTable {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in self.map.lock().expect("globals lock").values_mut() {
            visitor(value);
        }
    }
}

/// Counters for one drained run of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub committed: u64,
    pub aborted: u64,
    pub gc_cycles: u64,
    pub elapsed: Duration,
}

/// The event runtime: STM coordinator, worker pool, event queue and the
/// global root table.
pub struct Runtime {
    stm: Arc<Stm>,
    queue: EventQueue,
    globals: Arc<GlobalTable>,
    errors: Mutex<Vec<EventError>>,
}

impl Runtime {
    pub fn new(config: StmConfig, heap: HeapSettings) -> Self {
        Self::build(Arc::new(Stm::new(config, heap)))
    }

    pub fn with_policy(
        config: StmConfig,
        heap: HeapSettings,
        policy: Box<dyn AbortPolicy>,
    ) -> Self {
        Self::build(Arc::new(Stm::with_policy(config, heap, policy)))
    }

    fn build(stm: Arc<Stm>) -> Self {
        let globals = Arc::new(GlobalTable::new());
        stm.register_roots(globals.clone());
        Self {
            stm,
            queue: EventQueue::new(),
            globals,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    pub fn globals(&self) -> &GlobalTable {
        &self.globals
    }

    /// Allocate a data object and bind it to a global name. Setup-time
    /// convenience used before the pool runs.
    pub fn define_object(&self, name: &str, values: &[i64]) -> Result<Value, HeapError> {
        let slots: Vec<Value> = values.iter().map(|&n| Value::from_i64(n)).collect();
        let obj = self
            .stm
            .allocate(&TxSession::detached(), ObjectKind::Data, &slots)?;
        self.globals.set(name, obj);
        Ok(obj)
    }

    /// Read one slot of a global object, outside any transaction.
    pub fn read_global_slot(&self, name: &str, slot: usize) -> Option<Value> {
        self.globals.get(name).map(|obj| self.stm.load_slot(obj, slot))
    }

    pub fn enqueue(&self, event: Event) {
        self.queue.push(event);
    }

    /// Drain the queue on the configured number of worker threads and report
    /// the counters for this run.
    pub fn run(&self) -> RunReport {
        let before = self.stm.stats();
        let start = Instant::now();
        let threads = self.stm.config().thread_count.max(1);

        thread::scope(|scope| {
            for index in 0..threads {
                scope.spawn(move || worker::worker_loop(self, index));
            }
        });

        let elapsed = start.elapsed();
        let after = self.stm.stats();
        let report = RunReport {
            committed: after.committed - before.committed,
            aborted: after.aborted - before.aborted,
            gc_cycles: after.gc_cycles - before.gc_cycles,
            elapsed,
        };
        tracing::info!(
            committed = report.committed,
            aborted = report.aborted,
            gc_cycles = report.gc_cycles,
            elapsed_ms = elapsed.as_millis() as u64,
            "runtime drained"
        );
        report
    }

    /// Errors reported by committed events, in arrival order.
    pub fn take_errors(&self) -> Vec<EventError> {
        let mut errors = self.errors.lock().expect("errors lock");
        std::mem::take(&mut *errors)
    }

    pub(crate) fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub(crate) fn push_event(&self, event: Event) {
        self.queue.push(event);
    }

    pub(crate) fn record_error(&self, err: EventError) {
        self.errors.lock().expect("errors lock").push(err);
    }
}
