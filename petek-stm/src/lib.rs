//! Software transactional memory over the Petek managed heap.
//!
//! # Architecture
//!
//! Every worker thread runs one transaction at a time. Object references are
//! routed through redirection before each field access: loads resolve to a
//! cell in the transaction's read set, stores to a cell holding a private
//! shadow copy. Commit is serialized process-wide; the committer inspects
//! every peer under its set mutex, pushes aborts onto the conflicting ones
//! and copies its shadows back onto the canonical heap. Losers notice the
//! abort flag at their next redirection and unwind for a retry.
//!
//! - **Reads**: Optimistic. A read cell pins the canonical object; peers may
//!   commit past us, in which case we are aborted rather than validated.
//! - **Writes**: Buffered in shadow copies. The canonical heap changes only
//!   inside commit.
//! - **Collection**: Stop-the-world. A collector claims the `need_gc` flag,
//!   stops every transaction at its safepoint gate, relocates the heap and
//!   rewrites all cells in place.

mod cell;
mod config;
mod errors;
mod gate;
mod policy;
mod sets;
mod transaction;

pub use cell::{CellAddr, CellPair, CellMap, BLOCK_SIZE};
pub use config::StmConfig;
pub use errors::Terminated;
pub use policy::{AbortPolicy, AlternatePolicy, KeepPolicy};
pub use sets::{ReadSet, WriteSet};
pub use transaction::{Handle, Transaction};

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use petek_heap::{Heap, HeapError, HeapSettings, ObjectKind, RootProvider, Value};

/// Additional GC roots beyond the transactions themselves (the runtime's
/// global table, for instance). Visited with every mutator stopped.
pub trait RootsHook: Send + Sync {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value));
}

/// The calling thread's current transaction, handed out by
/// [`Stm::start_transaction`] and consumed by [`Stm::commit_transaction`].
/// Empty when the STM is disabled or for threads outside any transaction.
pub struct TxSession {
    tx: Option<Arc<Transaction>>,
}

impl TxSession {
    /// A session with no transaction: redirection is identity, commit is a
    /// no-op. Used by non-worker threads that still interact with the heap.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.tx.as_deref()
    }

    fn tx(&self) -> Option<&Arc<Transaction>> {
        self.tx.as_ref()
    }
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    gc_cycles: AtomicU64,
}

/// Aggregate counters, reported by the runtime on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmStats {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub gc_cycles: u64,
}

/// The process-wide STM coordinator.
///
/// Owns the heap, the live-transaction list and the three-level lock
/// hierarchy: the commit mutex serializes commits against commits, the
/// transactions mutex freezes the list against registration and collection,
/// and each transaction's gate stops its mutator for a collector. The heap
/// lock comes last everywhere.
pub struct Stm {
    config: StmConfig,
    heap: RwLock<Heap>,
    transactions: Mutex<Vec<Arc<Transaction>>>,
    commit_mutex: Mutex<()>,
    need_gc: AtomicBool,
    gc_sync: Mutex<()>,
    gc_done: Condvar,
    extra_roots: Mutex<Vec<Arc<dyn RootsHook>>>,
    policy: Box<dyn AbortPolicy>,
    stats: Counters,
}

impl Stm {
    pub fn new(config: StmConfig, heap: HeapSettings) -> Self {
        Self::with_policy(config, heap, Box::new(KeepPolicy))
    }

    pub fn with_policy(
        config: StmConfig,
        heap: HeapSettings,
        policy: Box<dyn AbortPolicy>,
    ) -> Self {
        Self {
            config,
            heap: RwLock::new(Heap::new(heap)),
            transactions: Mutex::new(Vec::new()),
            commit_mutex: Mutex::new(()),
            need_gc: AtomicBool::new(false),
            gc_sync: Mutex::new(()),
            gc_done: Condvar::new(),
            extra_roots: Mutex::new(Vec::new()),
            policy,
            stats: Counters::default(),
        }
    }

    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Register a provider of GC roots outside the transaction cells.
    pub fn register_roots(&self, hook: Arc<dyn RootsHook>) {
        self.extra_roots.lock().expect("roots hooks").push(hook);
    }

    pub fn stats(&self) -> StmStats {
        StmStats {
            started: self.stats.started.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            gc_cycles: self.stats.gc_cycles.load(Ordering::Relaxed),
        }
    }

    // ── Transaction lifecycle ───────────────────────────────────────

    /// Begin a transaction for the calling thread. The new transaction holds
    /// its safepoint gate from the start, so it immediately counts as running
    /// for any collector.
    pub fn start_transaction(&self) -> TxSession {
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return TxSession { tx: None };
        }

        let tx = Arc::new(Transaction::new());
        tx.gate.enter();
        self.transactions
            .lock()
            .expect("transactions mutex")
            .push(tx.clone());
        tracing::trace!(tx = tx.id(), "transaction started");
        TxSession { tx: Some(tx) }
    }

    /// Attempt to publish the session's transaction.
    ///
    /// Returns false when the transaction was aborted (by a peer or by the
    /// abort policy); the caller retries the whole event. On success every
    /// conflicting peer has been marked aborted and the canonical heap
    /// reflects the write set.
    pub fn commit_transaction(&self, session: TxSession) -> bool {
        let Some(tx) = session.tx else {
            // Disabled mode: each event runs exactly once.
            self.stats.committed.fetch_add(1, Ordering::Relaxed);
            return true;
        };

        if self.policy.abort_before_commit() {
            tx.abort();
        }

        // Step out of the gate so a pending collection can run while we wait
        // for the commit serialization below.
        tx.gate.leave();
        let _commit_guard = self.commit_mutex.lock().expect("commit mutex");
        let mut txs = self.transactions.lock().expect("transactions mutex");
        tx.gate.enter();

        let committed = if tx.is_aborted() {
            false
        } else {
            // Freeze every peer's sets, list order.
            let guards: Vec<_> = txs
                .iter()
                .map(|t| t.sets.lock().expect("transaction sets"))
                .collect();
            let me = txs
                .iter()
                .position(|t| Arc::ptr_eq(t, &tx))
                .expect("committing transaction not registered");

            for (i, peer) in txs.iter().enumerate() {
                if i == me {
                    continue;
                }
                if guards[i].conflicts_with(&guards[me]) {
                    peer.abort();
                    tracing::debug!(loser = peer.id(), winner = tx.id(), "conflict, peer aborted");
                }
            }

            {
                let mut heap = self.heap.write().expect("heap lock");
                Transaction::commit_heap(&guards[me], &mut heap);
            }

            // Release in reverse acquisition order.
            let mut guards = guards;
            while let Some(guard) = guards.pop() {
                drop(guard);
            }
            true
        };

        txs.retain(|t| !Arc::ptr_eq(t, &tx));
        drop(txs);
        tx.gate.leave();

        if committed {
            self.stats.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(tx = tx.id(), committed, "transaction finished");
        committed
    }

    // ── Redirection ─────────────────────────────────────────────────

    /// Route a load. Returns the handle to read through, or signals that the
    /// transaction was aborted and the caller must unwind.
    pub fn redirect_load(&self, session: &TxSession, handle: Handle) -> Result<Handle, Terminated> {
        let Some(tx) = session.tx() else {
            return Ok(handle);
        };
        if !self.is_protected(handle) {
            return Ok(handle);
        }
        if tx.is_aborted() {
            return Err(Terminated);
        }

        let addr = {
            let mut sets = tx.sets.lock().expect("transaction sets");
            let (current, obj) = sets.parts(handle);
            if let Some(addr) = sets.write.get(current, obj) {
                addr
            } else if let Some(addr) = sets.read.get(current, obj) {
                addr
            } else {
                sets.read.add(obj)
            }
        };

        // Safepoint: the object is rooted in its cell by now, so a pending
        // collection updates it rather than invalidating it.
        self.pause_for_gc(tx);
        Ok(Handle::Cell(addr))
    }

    /// Route a store. The returned handle resolves to the shadow copy all
    /// writes must land on.
    pub fn redirect_store(
        &self,
        session: &TxSession,
        handle: Handle,
    ) -> Result<Handle, Terminated> {
        let Some(tx) = session.tx() else {
            return Ok(handle);
        };
        if !self.is_protected(handle) {
            return Ok(handle);
        }
        if tx.is_aborted() {
            return Err(Terminated);
        }

        // Existing shadow, or pin the object in the read set so the canonical
        // reference survives the safepoint below.
        let pin = {
            let mut sets = tx.sets.lock().expect("transaction sets");
            let (current, obj) = sets.parts(handle);
            if let Some(addr) = sets.write.get(current, obj) {
                drop(sets);
                self.pause_for_gc(tx);
                return Ok(Handle::Cell(addr));
            }
            match sets.read.get(current, obj) {
                Some(addr) => addr,
                None => sets.read.add(obj),
            }
        };
        self.pause_for_gc(tx);

        // The gate stays held from here on: the reference read back from the
        // pin cell cannot move underneath the copy.
        let shadow = {
            let from = tx.sets.lock().expect("transaction sets").read.from_of(pin);
            self.heap.write().expect("heap lock").copy_object(from)
        };
        let shadow = match shadow {
            Ok(shadow) => shadow,
            Err(err) => {
                tracing::debug!(tx = tx.id(), %err, "shadow allocation failed, collecting");
                self.collect_garbage(session);
                let from = tx.sets.lock().expect("transaction sets").read.from_of(pin);
                match self.heap.write().expect("heap lock").copy_object(from) {
                    Ok(shadow) => shadow,
                    Err(err) => {
                        tracing::debug!(tx = tx.id(), %err, "shadow allocation failed twice");
                        tx.abort();
                        return Err(Terminated);
                    }
                }
            }
        };

        let mut sets = tx.sets.lock().expect("transaction sets");
        let from = sets.read.from_of(pin);
        let addr = sets.write.add(from, shadow);
        Ok(Handle::Cell(addr))
    }

    /// Current value behind a handle: the shadow for write cells, the
    /// canonical object for read cells, the value itself otherwise.
    pub fn resolve(&self, session: &TxSession, handle: Handle) -> Value {
        match handle {
            Handle::Direct(v) => v,
            Handle::Cell(_) => session
                .transaction()
                .expect("cell handle outside any transaction")
                .resolve(handle),
        }
    }

    fn is_protected(&self, handle: Handle) -> bool {
        match handle {
            Handle::Cell(_) => true,
            Handle::Direct(v) => {
                v.is_ref()
                    && self.heap.read().expect("heap lock").kind_of(v) == ObjectKind::Data
            }
        }
    }

    // ── Heap access ─────────────────────────────────────────────────

    pub fn load_slot(&self, obj: Value, slot: usize) -> Value {
        self.heap.read().expect("heap lock").load_slot(obj, slot)
    }

    pub fn store_slot(&self, obj: Value, slot: usize, value: Value) {
        self.heap
            .write()
            .expect("heap lock")
            .store_slot(obj, slot, value);
    }

    pub fn slot_count(&self, obj: Value) -> usize {
        self.heap.read().expect("heap lock").slot_count(obj)
    }

    pub fn kind_of(&self, obj: Value) -> ObjectKind {
        self.heap.read().expect("heap lock").kind_of(obj)
    }

    pub fn heap_usage(&self) -> (usize, usize) {
        let heap = self.heap.read().expect("heap lock");
        (heap.used_words(), heap.capacity_words())
    }

    /// Bracket for every allocation: safepoint check first, then exclusive
    /// heap access.
    pub fn allocation_scope(&self, session: &TxSession) -> AllocationScope<'_> {
        if let Some(tx) = session.tx() {
            self.pause_for_gc(tx);
        }
        AllocationScope {
            heap: self.heap.write().expect("heap lock"),
        }
    }

    /// Allocate, collecting once when the heap is past its threshold or
    /// refuses the request.
    pub fn allocate(
        &self,
        session: &TxSession,
        kind: ObjectKind,
        slots: &[Value],
    ) -> Result<Value, HeapError> {
        {
            let mut scope = self.allocation_scope(session);
            if !scope.should_collect() {
                if let Ok(obj) = scope.allocate(kind, slots) {
                    return Ok(obj);
                }
            }
        }
        self.collect_garbage(session);
        let mut scope = self.allocation_scope(session);
        scope.allocate(kind, slots)
    }

    // ── Collection protocol ─────────────────────────────────────────

    /// Safepoint check: when a collection is pending, step out of the gate
    /// and wait for it to finish.
    pub fn safepoint(&self, session: &TxSession) {
        if let Some(tx) = session.tx() {
            self.pause_for_gc(tx);
        }
    }

    fn pause_for_gc(&self, tx: &Transaction) {
        if !self.need_gc.load(Ordering::Acquire) {
            return;
        }
        tx.gate.leave();
        {
            let mut sync = self.gc_sync.lock().expect("gc sync");
            while self.need_gc.load(Ordering::Acquire) {
                sync = self.gc_done.wait(sync).expect("gc wait");
            }
        }
        tx.gate.enter();
    }

    /// Claim the collector role. `None` means another thread is already
    /// collecting; this call has waited the collection out and the caller
    /// should skip its own. `Some` freezes the transaction list and stops
    /// every peer at its gate; dropping the scope resumes the world.
    pub fn enter_collection_scope(&self, session: &TxSession) -> Option<CollectionScope<'_>> {
        if self
            .need_gc
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            match session.tx() {
                Some(tx) => self.pause_for_gc(tx),
                None => {
                    let mut sync = self.gc_sync.lock().expect("gc sync");
                    while self.need_gc.load(Ordering::Acquire) {
                        sync = self.gc_done.wait(sync).expect("gc wait");
                    }
                }
            }
            return None;
        }

        let txs = self.transactions.lock().expect("transactions mutex");
        for t in txs.iter() {
            if session.tx().map_or(false, |own| Arc::ptr_eq(own, t)) {
                continue;
            }
            t.gate.acquire();
        }
        Some(CollectionScope {
            stm: self,
            txs,
            skip: session.tx().cloned(),
        })
    }

    /// Run a full collection: transactions' cells plus every registered
    /// roots hook. Returns false when another thread collected instead.
    pub fn collect_garbage(&self, session: &TxSession) -> bool {
        let Some(scope) = self.enter_collection_scope(session) else {
            return false;
        };
        {
            let hooks = self.extra_roots.lock().expect("roots hooks").clone();
            let mut heap = self.heap.write().expect("heap lock");
            let mut roots = ScopeRoots {
                scope: &scope,
                hooks: &hooks,
            };
            heap.collect(&mut roots);
        }
        self.stats.gc_cycles.fetch_add(1, Ordering::Relaxed);
        drop(scope);
        true
    }
}

/// RAII allocation bracket; derefs to the heap.
pub struct AllocationScope<'stm> {
    heap: RwLockWriteGuard<'stm, Heap>,
}

impl Deref for AllocationScope<'_> {
    type Target = Heap;
    fn deref(&self) -> &Heap {
        &self.heap
    }
}

impl DerefMut for AllocationScope<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }
}

/// The world is stopped while this exists: the transaction list is frozen
/// and every peer sits at its safepoint gate. Dropping it clears the GC
/// request, reopens the gates and wakes the pausers.
pub struct CollectionScope<'stm> {
    stm: &'stm Stm,
    txs: MutexGuard<'stm, Vec<Arc<Transaction>>>,
    skip: Option<Arc<Transaction>>,
}

impl CollectionScope<'_> {
    /// Present every live transaction's cells to the collector.
    pub fn iterate(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for t in self.txs.iter() {
            t.visit(visitor);
        }
    }
}

impl Drop for CollectionScope<'_> {
    fn drop(&mut self) {
        self.stm.need_gc.store(false, Ordering::Release);
        for t in self.txs.iter() {
            if self.skip.as_ref().map_or(false, |own| Arc::ptr_eq(own, t)) {
                continue;
            }
            t.gate.release();
        }
        let _sync = self.stm.gc_sync.lock().expect("gc sync");
        self.stm.gc_done.notify_all();
    }
}

struct ScopeRoots<'a, 'stm> {
    scope: &'a CollectionScope<'stm>,
    hooks: &'a [Arc<dyn RootsHook>],
}

impl RootProvider for ScopeRoots<'_, '_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.scope.iterate(visitor);
        for hook in self.hooks {
            hook.visit_roots(visitor);
        }
    }
}
