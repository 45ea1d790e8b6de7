//! The transactional heap handle events run against.
//!
//! `TxCtx` is the only view an event gets of the heap: every named object is
//! fetched from the global table and routed through redirection before each
//! access, so loads observe the transaction's snapshot and stores land on
//! shadow copies until commit.

use std::fmt;

use petek_heap::{HeapError, ObjectKind, Value};
use petek_stm::{Handle, Terminated, TxSession};

use crate::events::Event;
use crate::Runtime;

/// Errors an event body can surface.
///
/// `Terminated` and `HeapExhausted` mean the attempt was aborted; the worker
/// harness discards them and retries. Other variants from a committed attempt
/// are reported to the runtime's error sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A peer aborted this transaction mid-flight.
    Terminated,
    /// The heap refused an allocation even after a collection.
    HeapExhausted,
    /// The named global is not defined.
    UnknownGlobal(String),
    /// Event-specific failure.
    User(String),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Terminated => write!(f, "transaction terminated"),
            EventError::HeapExhausted => write!(f, "heap exhausted"),
            EventError::UnknownGlobal(name) => write!(f, "unknown global '{}'", name),
            EventError::User(msg) => write!(f, "event failed: {}", msg),
        }
    }
}

impl std::error::Error for EventError {}

impl From<Terminated> for EventError {
    fn from(_: Terminated) -> Self {
        EventError::Terminated
    }
}

/// Per-attempt execution context: the runtime plus the current transaction.
pub struct TxCtx<'rt> {
    runtime: &'rt Runtime,
    session: TxSession,
}

impl<'rt> TxCtx<'rt> {
    pub(crate) fn new(runtime: &'rt Runtime, session: TxSession) -> Self {
        Self { runtime, session }
    }

    pub(crate) fn into_session(self) -> TxSession {
        self.session
    }

    pub fn session(&self) -> &TxSession {
        &self.session
    }

    /// Fetch a global and redirect it for reading. The fetch happens after
    /// the safepoint check, so the reference is current even if a collection
    /// just ran.
    pub fn open(&self, name: &str) -> Result<Handle, EventError> {
        let stm = self.runtime.stm();
        stm.safepoint(&self.session);
        let value = self
            .runtime
            .globals()
            .get(name)
            .ok_or_else(|| EventError::UnknownGlobal(name.to_string()))?;
        Ok(stm.redirect_load(&self.session, Handle::Direct(value))?)
    }

    /// Load a slot through redirection.
    pub fn load(&self, handle: Handle, slot: usize) -> Result<Value, EventError> {
        let stm = self.runtime.stm();
        let h = stm.redirect_load(&self.session, handle)?;
        Ok(stm.load_slot(stm.resolve(&self.session, h), slot))
    }

    /// Store to a slot through redirection; the write lands on the shadow.
    pub fn store(&self, handle: Handle, slot: usize, value: Value) -> Result<(), EventError> {
        let stm = self.runtime.stm();
        let h = stm.redirect_store(&self.session, handle)?;
        stm.store_slot(stm.resolve(&self.session, h), slot, value);
        Ok(())
    }

    /// `open` + `load` in one step.
    pub fn get_field(&self, name: &str, slot: usize) -> Result<Value, EventError> {
        let handle = self.open(name)?;
        self.load(handle, slot)
    }

    /// `open` + `store` in one step.
    pub fn set_field(&self, name: &str, slot: usize, value: Value) -> Result<(), EventError> {
        let handle = self.open(name)?;
        self.store(handle, slot, value)
    }

    /// Allocate a fresh object. The reference is unrooted: store it into a
    /// global or an object slot before the next safepoint.
    pub fn alloc(&self, kind: ObjectKind, slots: &[Value]) -> Result<Value, EventError> {
        match self.runtime.stm().allocate(&self.session, kind, slots) {
            Ok(obj) => Ok(obj),
            Err(HeapError::Exhausted { .. }) => {
                if let Some(tx) = self.session.transaction() {
                    tx.abort();
                }
                Err(EventError::HeapExhausted)
            }
        }
    }

    /// Bind a global name. Bindings are shared, non-transactional state;
    /// events should treat the table as append-mostly setup data.
    pub fn set_global(&self, name: &str, value: Value) {
        self.runtime.globals().set(name, value);
    }

    /// Push another event onto the shared queue.
    pub fn enqueue(&self, event: Event) {
        self.runtime.push_event(event);
    }
}
