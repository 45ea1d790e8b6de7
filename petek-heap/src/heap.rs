use std::fmt;

use crate::value::Value;

/// Kind of a heap object, stored in the header word.
///
/// `Data` objects are mutable structured state; `Callable` objects carry
/// behavior and are never copied or redirected by the transaction machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Data,
    Callable,
}

/// Header word layout: `[slot count | kind bit | 0b11]`.
#[derive(Clone, Copy)]
struct Header(u64);

const HEADER_TAG: u64 = 0b11;
const KIND_BIT: u64 = 0b100;

impl Header {
    fn new(kind: ObjectKind, slots: usize) -> Self {
        let kind_bit = match kind {
            ObjectKind::Data => 0,
            ObjectKind::Callable => KIND_BIT,
        };
        Self(((slots as u64) << 3) | kind_bit | HEADER_TAG)
    }

    fn from_raw(raw: u64) -> Self {
        debug_assert!(Value::from_raw(raw).is_header(), "not a header word");
        Self(raw)
    }

    fn kind(self) -> ObjectKind {
        if self.0 & KIND_BIT == 0 {
            ObjectKind::Data
        } else {
            ObjectKind::Callable
        }
    }

    fn slots(self) -> usize {
        (self.0 >> 3) as usize
    }
}

/// Configuration for the heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total capacity of one space, in words.
    pub capacity_words: usize,
    /// Occupancy fraction (0.0 - 1.0) above which a collection is advised.
    pub gc_threshold: f64,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            capacity_words: 1 << 16,
            gc_threshold: 0.75,
        }
    }
}

/// Typed errors for heap operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Allocation would exceed the space capacity.
    Exhausted { requested: usize, available: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Exhausted {
                requested,
                available,
            } => {
                write!(
                    f,
                    "heap exhausted: requested {} words, {} available",
                    requested, available
                )
            }
        }
    }
}

impl std::error::Error for HeapError {}

/// Consumers implement this to provide GC roots.
///
/// Called with all mutators stopped. The visitor receives `&mut Value` so the
/// collector can update root references in place during relocation.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub live_words: usize,
    pub reclaimed_words: usize,
}

/// The managed heap: a bump-allocated arena of tagged words plus a
/// semispace copying collector.
///
/// All mutation goes through `&mut self`; callers are responsible for
/// serializing access (the STM coordinator keeps the heap behind a lock and
/// only collects with every mutator stopped).
pub struct Heap {
    space: Vec<u64>,
    settings: HeapSettings,
    collections: u64,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        let capacity = settings.capacity_words;
        Self {
            space: Vec::with_capacity(capacity),
            settings,
            collections: 0,
        }
    }

    /// Allocate a fresh object with the given slot values.
    pub fn allocate(&mut self, kind: ObjectKind, slots: &[Value]) -> Result<Value, HeapError> {
        let needed = 1 + slots.len();
        let available = self.settings.capacity_words - self.space.len();
        if needed > available {
            return Err(HeapError::Exhausted {
                requested: needed,
                available,
            });
        }

        let base = self.space.len();
        self.space.push(Header::new(kind, slots.len()).0);
        self.space.extend(slots.iter().map(|v| v.raw()));
        Ok(Value::from_offset(base))
    }

    /// Shallow copy: a fresh object whose own storage is a word-for-word
    /// image of `obj`. Slot contents are shared, not cloned.
    pub fn copy_object(&mut self, obj: Value) -> Result<Value, HeapError> {
        let size = self.size_of(obj);
        let available = self.settings.capacity_words - self.space.len();
        if size > available {
            return Err(HeapError::Exhausted {
                requested: size,
                available,
            });
        }

        let base = self.space.len();
        let src = obj.offset();
        self.space.extend_from_within(src..src + size);
        Ok(Value::from_offset(base))
    }

    /// Raw word copy of the whole object at `src` onto the object at `dst`.
    /// Both objects must have the same size.
    pub fn copy_block(&mut self, dst: Value, src: Value) {
        let size = self.size_of(src);
        assert_eq!(size, self.size_of(dst), "copy_block size mismatch");
        self.space.copy_within(src.offset()..src.offset() + size, dst.offset());
    }

    pub fn load_slot(&self, obj: Value, slot: usize) -> Value {
        debug_assert!(slot < self.slot_count(obj), "slot out of bounds");
        Value::from_raw(self.space[obj.offset() + 1 + slot])
    }

    pub fn store_slot(&mut self, obj: Value, slot: usize, value: Value) {
        debug_assert!(slot < self.slot_count(obj), "slot out of bounds");
        self.space[obj.offset() + 1 + slot] = value.raw();
    }

    /// Total size of the object in words, header included.
    pub fn size_of(&self, obj: Value) -> usize {
        1 + self.header(obj).slots()
    }

    pub fn slot_count(&self, obj: Value) -> usize {
        self.header(obj).slots()
    }

    pub fn kind_of(&self, obj: Value) -> ObjectKind {
        self.header(obj).kind()
    }

    fn header(&self, obj: Value) -> Header {
        debug_assert!(obj.is_ref(), "not a heap reference: {:?}", obj);
        Header::from_raw(self.space[obj.offset()])
    }

    pub fn used_words(&self) -> usize {
        self.space.len()
    }

    pub fn capacity_words(&self) -> usize {
        self.settings.capacity_words
    }

    /// Whether occupancy has crossed the configured collection threshold.
    pub fn should_collect(&self) -> bool {
        let threshold = self.settings.gc_threshold * self.settings.capacity_words as f64;
        self.space.len() as f64 >= threshold
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    /// Semispace collection.
    ///
    /// Evacuates everything reachable from `roots` into a fresh space,
    /// rewriting each visited reference in place. References not visited as
    /// roots are dangling afterwards.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) -> CollectStats {
        let before = self.space.len();
        let mut to: Vec<u64> = Vec::with_capacity(self.settings.capacity_words);
        let from = &mut self.space;

        roots.visit_roots(&mut |value| evacuate(from, &mut to, value));

        // Cheney scan: fields of evacuated objects are themselves evacuated
        // until the to-space stops growing.
        let mut scan = 0;
        while scan < to.len() {
            let slots = Header::from_raw(to[scan]).slots();
            for i in 0..slots {
                let mut field = Value::from_raw(to[scan + 1 + i]);
                evacuate(from, &mut to, &mut field);
                to[scan + 1 + i] = field.raw();
            }
            scan += 1 + slots;
        }

        let stats = CollectStats {
            live_words: to.len(),
            reclaimed_words: before - to.len(),
        };
        self.space = to;
        self.collections += 1;
        tracing::debug!(
            live = stats.live_words,
            reclaimed = stats.reclaimed_words,
            cycle = self.collections,
            "heap collected"
        );
        stats
    }
}

/// Copy one object into to-space unless already forwarded, and rewrite
/// `value` to its new location. Non-references pass through untouched.
fn evacuate(from: &mut [u64], to: &mut Vec<u64>, value: &mut Value) {
    if !value.is_ref() {
        return;
    }

    let base = value.offset();
    let first = Value::from_raw(from[base]);
    if first.is_ref() {
        // Header already replaced by a forwarding entry.
        *value = first;
        return;
    }

    debug_assert!(first.is_header(), "evacuating a non-object");
    let size = 1 + Header::from_raw(first.raw()).slots();
    let new_base = to.len();
    to.extend_from_slice(&from[base..base + size]);
    from[base] = Value::from_offset(new_base).raw();
    *value = Value::from_offset(new_base);
}
