//! Managed object heap for the Petek runtime.
//!
//! # Architecture
//!
//! The heap is a flat arena of 64-bit words. An object is one header word
//! (kind + slot count) followed by its slot words; every slot holds a tagged
//! [`Value`]. References are word offsets into the current space, so they are
//! plain data that can be stored, compared and hashed without touching the
//! heap itself.
//!
//! Collection is a semispace copy: live objects are evacuated into a fresh
//! space, a forwarding entry replaces each evacuated header, and every root
//! the caller exposes through [`RootProvider`] is rewritten in place. A
//! reference is therefore only stable between two collections — holders that
//! survive a collection must either be visited as roots or re-fetched.

mod heap;
mod value;

pub use heap::{CollectStats, Heap, HeapError, HeapSettings, ObjectKind, RootProvider};
pub use value::Value;
