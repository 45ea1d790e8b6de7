//! Cell storage for transactional read and write sets.
//!
//! A cell is a stable two-field record `{from, to}`: `from` is the canonical
//! heap object, `to` either the same object (read set) or a private shadow
//! copy (write set). The interpreter holds cell handles in place of object
//! references and dereferences them on every use, so a collection that
//! relocates objects is absorbed inside the cell contents while the handle
//! stays valid.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use foldhash::fast::FixedState;
use petek_heap::{Heap, Value};

/// Cells per block. Blocks are appended, never shrunk or reordered, which is
/// what keeps [`CellAddr`] handles stable for the life of the map.
pub const BLOCK_SIZE: usize = 100;

static NEXT_MAP_ID: AtomicU32 = AtomicU32::new(1);

/// Stable handle to one cell: the owning map's id plus the cell's position.
///
/// Valid from [`CellMap::add_mapping`] until the map is dropped. The map id
/// keeps handles from different maps (e.g. a transaction's read and write
/// sets) distinct even when their positions coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellAddr {
    map: u32,
    block: u32,
    slot: u32,
}

/// One redirection record.
#[derive(Debug, Clone, Copy)]
pub struct CellPair {
    pub from: Value,
    pub to: Value,
}

struct Block {
    cells: Vec<CellPair>,
}

impl Block {
    fn new() -> Self {
        Self {
            cells: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    fn is_full(&self) -> bool {
        self.cells.len() == BLOCK_SIZE
    }
}

/// Associative store of cells with O(1) lookup by object and by handle.
///
/// The block list is authoritative; the location set (handle membership) and
/// the object map (`from` → handle) are derived indices. After a collection
/// rewrites `from` fields the object map is rebuilt from the blocks; the
/// location set is untouched because cells themselves do not move.
pub struct CellMap {
    id: u32,
    blocks: Vec<Block>,
    locations: HashSet<CellAddr, FixedState>,
    objects: HashMap<Value, CellAddr, FixedState>,
}

impl CellMap {
    pub fn new() -> Self {
        Self {
            id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            blocks: Vec::new(),
            locations: HashSet::default(),
            objects: HashMap::default(),
        }
    }

    /// Append a cell for `from → to` and return its stable handle.
    pub fn add_mapping(&mut self, from: Value, to: Value) -> CellAddr {
        if self.blocks.last().map_or(true, Block::is_full) {
            self.blocks.push(Block::new());
        }

        let block = self.blocks.len() - 1;
        let slot = self.blocks[block].cells.len();
        self.blocks[block].cells.push(CellPair { from, to });

        let addr = CellAddr {
            map: self.id,
            block: block as u32,
            slot: slot as u32,
        };
        self.locations.insert(addr);
        self.objects.insert(from, addr);
        addr
    }

    /// Handle of the cell tracking `from`, if any.
    pub fn get_mapping(&self, from: Value) -> Option<CellAddr> {
        self.objects.get(&from).copied()
    }

    /// Whether `addr` names a cell owned by this map.
    pub fn is_mapped(&self, addr: CellAddr) -> bool {
        self.locations.contains(&addr)
    }

    pub fn from_of(&self, addr: CellAddr) -> Value {
        self.pair(addr).from
    }

    pub fn to_of(&self, addr: CellAddr) -> Value {
        self.pair(addr).to
    }

    fn pair(&self, addr: CellAddr) -> &CellPair {
        debug_assert!(self.is_mapped(addr), "cell handle from a foreign map");
        &self.blocks[addr.block as usize].cells[addr.slot as usize]
    }

    pub fn len(&self) -> usize {
        self.blocks
            .last()
            .map_or(0, |b| (self.blocks.len() - 1) * BLOCK_SIZE + b.cells.len())
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &CellPair> {
        self.blocks.iter().flat_map(|b| b.cells.iter())
    }

    /// Copy every cell's shadow bytes back onto its canonical object.
    /// Meaningful only for a write set's map.
    pub fn commit_changes(&self, heap: &mut Heap) {
        for pair in self.pairs() {
            heap.copy_block(pair.from, pair.to);
        }
    }

    /// Present every cell's `from` and `to` to the collector. When any `from`
    /// changed, the object map is rebuilt; handles stay valid throughout.
    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        let mut changed = false;
        for block in &mut self.blocks {
            for pair in &mut block.cells {
                let old_from = pair.from;
                visitor(&mut pair.from);
                visitor(&mut pair.to);
                changed |= pair.from != old_from;
            }
        }

        if changed {
            self.objects.clear();
            for (b, block) in self.blocks.iter().enumerate() {
                for (s, pair) in block.cells.iter().enumerate() {
                    let addr = CellAddr {
                        map: self.id,
                        block: b as u32,
                        slot: s as u32,
                    };
                    self.objects.insert(pair.from, addr);
                }
            }
        }
    }
}

impl Default for CellMap {
    fn default() -> Self {
        Self::new()
    }
}
