//! Read and write sets: thin semantic wrappers around a [`CellMap`].

use petek_heap::{Heap, Value};

use crate::cell::{CellAddr, CellMap};

/// Objects the transaction has observed. Every cell satisfies `from == to`.
pub struct ReadSet {
    map: CellMap,
}

impl ReadSet {
    pub fn new() -> Self {
        Self { map: CellMap::new() }
    }

    /// Two-step lookup: the handle may already be one of our cells, otherwise
    /// the object may be tracked under a different handle.
    pub fn get(&self, current: Option<CellAddr>, obj: Value) -> Option<CellAddr> {
        if let Some(addr) = current {
            if self.map.is_mapped(addr) {
                return Some(addr);
            }
        }
        self.map.get_mapping(obj)
    }

    /// Track `obj`; the new cell redirects to the object itself.
    pub fn add(&mut self, obj: Value) -> CellAddr {
        self.map.add_mapping(obj, obj)
    }

    pub fn contains(&self, addr: CellAddr) -> bool {
        self.map.is_mapped(addr)
    }

    pub fn from_of(&self, addr: CellAddr) -> Value {
        self.map.from_of(addr)
    }

    pub fn to_of(&self, addr: CellAddr) -> Value {
        self.map.to_of(addr)
    }

    /// True when any object this set observed is in `other`'s write set.
    pub fn intersects(&self, other: &WriteSet) -> bool {
        other.pairs_from().any(|from| self.map.get_mapping(from).is_some())
    }

    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.map.visit(visitor);
    }
}

impl Default for ReadSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Objects the transaction has speculatively mutated. Every cell redirects to
/// a shadow copy only the owning transaction may touch.
pub struct WriteSet {
    map: CellMap,
}

impl WriteSet {
    pub fn new() -> Self {
        Self { map: CellMap::new() }
    }

    pub fn get(&self, current: Option<CellAddr>, obj: Value) -> Option<CellAddr> {
        if let Some(addr) = current {
            if self.map.is_mapped(addr) {
                return Some(addr);
            }
        }
        self.map.get_mapping(obj)
    }

    /// Track `from` with its freshly-copied shadow.
    pub fn add(&mut self, from: Value, shadow: Value) -> CellAddr {
        self.map.add_mapping(from, shadow)
    }

    pub fn contains(&self, addr: CellAddr) -> bool {
        self.map.is_mapped(addr)
    }

    pub fn from_of(&self, addr: CellAddr) -> Value {
        self.map.from_of(addr)
    }

    pub fn to_of(&self, addr: CellAddr) -> Value {
        self.map.to_of(addr)
    }

    /// Publish every shadow onto its canonical object.
    pub fn commit_changes(&self, heap: &mut Heap) {
        self.map.commit_changes(heap);
    }

    pub fn intersects(&self, other: &WriteSet) -> bool {
        other.pairs_from().any(|from| self.map.get_mapping(from).is_some())
    }

    fn pairs_from(&self) -> impl Iterator<Item = Value> + '_ {
        self.map.pairs().map(|p| p.from)
    }

    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.map.visit(visitor);
    }
}

impl Default for WriteSet {
    fn default() -> Self {
        Self::new()
    }
}
