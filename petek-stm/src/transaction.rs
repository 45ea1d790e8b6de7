//! Per-thread transactional context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use petek_heap::{Heap, Value};

use crate::cell::CellAddr;
use crate::gate::GcGate;
use crate::sets::{ReadSet, WriteSet};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// A redirected object reference as seen by the interpreter.
///
/// `Direct` carries values outside transactional protection (fixnums,
/// callables, anything seen with the STM disabled). `Cell` is a stable handle
/// into the current transaction's sets; it must be re-resolved on every use
/// so that relocation and read-your-writes upgrades take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    Direct(Value),
    Cell(CellAddr),
}

pub(crate) struct TxSets {
    pub(crate) read: ReadSet,
    pub(crate) write: WriteSet,
}

impl TxSets {
    /// Current contents of a cell owned by either set.
    pub(crate) fn deref_cell(&self, addr: CellAddr) -> Value {
        if self.write.contains(addr) {
            self.write.to_of(addr)
        } else {
            debug_assert!(self.read.contains(addr), "cell handle from a foreign map");
            self.read.to_of(addr)
        }
    }

    /// Split a handle into its possibly-owned cell and the object it
    /// currently designates.
    pub(crate) fn parts(&self, handle: Handle) -> (Option<CellAddr>, Value) {
        match handle {
            Handle::Direct(v) => (None, v),
            Handle::Cell(addr) => (Some(addr), self.deref_cell(addr)),
        }
    }

    /// Conflict test against a committing peer: we lose if anything we read
    /// or wrote is in the committer's write set.
    pub(crate) fn conflicts_with(&self, committer: &TxSets) -> bool {
        self.read.intersects(&committer.write) || self.write.intersects(&committer.write)
    }

    pub(crate) fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.read.visit(visitor);
        self.write.visit(visitor);
    }
}

/// One speculative execution: a read set, a write set, the cooperative abort
/// flag and the safepoint gate. Created by `Stm::start_transaction`, consumed
/// by `Stm::commit_transaction`; all redirection happens on the owning
/// thread, while peers may abort it and a committer may inspect its sets.
pub struct Transaction {
    id: u64,
    aborted: AtomicBool,
    pub(crate) sets: Mutex<TxSets>,
    pub(crate) gate: GcGate,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            aborted: AtomicBool::new(false),
            sets: Mutex::new(TxSets {
                read: ReadSet::new(),
                write: WriteSet::new(),
            }),
            gate: GcGate::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the transaction lost. Called by a committing peer; the victim
    /// notices at its next redirection.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Checked by the owner before every redirection. The relaxed load is
    /// enough: the flag only gates entry to the unwind path.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Current value behind a handle.
    pub fn resolve(&self, handle: Handle) -> Value {
        match handle {
            Handle::Direct(v) => v,
            Handle::Cell(addr) => self.sets.lock().expect("transaction sets").deref_cell(addr),
        }
    }

    /// Publish the write set onto the canonical heap. The caller must hold
    /// the commit serialization with every peer stopped or locked.
    pub(crate) fn commit_heap(sets: &TxSets, heap: &mut Heap) {
        sets.write.commit_changes(heap);
    }

    /// Present all cells to the collector.
    pub(crate) fn visit(&self, visitor: &mut dyn FnMut(&mut Value)) {
        self.sets.lock().expect("transaction sets").visit(visitor);
    }
}
