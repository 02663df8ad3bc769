use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering},
};

use crate::segment::NIL_OFFSET;

/// Entry lifecycle states.
///
/// The per-node state word is the map's only writer/reclaimer exclusion
/// mechanism: the `VALID -> WRITING` exchange locks out the reclaimer, the
/// `VALID -> COLLECTING` exchange locks out writers, and the reclaimer's
/// second-phase `fetch_add` walks `COLLECTING -> WAITING_DELETE -> freed`,
/// one sweep window per step.
pub(crate) mod state {
    pub(crate) const VALID: u8 = 0;
    pub(crate) const COLLECTING: u8 = 1;
    pub(crate) const WAITING_DELETE: u8 = 2;
    pub(crate) const WRITING: u8 = 3;
}

/// A map entry, stored in one slab slot and linked by offsets.
///
/// `key` is written once before the node is published to its bucket chain
/// and never changes afterwards. `value` and `expire_at` are rewritten in
/// place under the WRITING state; readers that skip the state word may see
/// either the old or the new value, which is why `V` is required to be
/// trivially copyable at this layer.
#[repr(C)]
pub(crate) struct Node<K, V> {
    /// Next node in the bucket chain, or `NIL_OFFSET`.
    pub(crate) next: AtomicU64,
    key: UnsafeCell<K>,
    value: UnsafeCell<V>,
    /// Absolute expiry in Unix seconds; 0 means the entry never expires.
    pub(crate) expire_at: AtomicI64,
    pub(crate) state: AtomicU8,
    /// Set while the node sits on the garbage list, so a stuck node is
    /// never enlisted twice.
    pub(crate) enlisted: AtomicBool,
    /// Next node in the garbage list, or `NIL_OFFSET`.
    pub(crate) del_next: AtomicU64,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: K, value: V, expire_at: i64) -> Self {
        Self {
            next: AtomicU64::new(NIL_OFFSET),
            key: UnsafeCell::new(key),
            value: UnsafeCell::new(value),
            expire_at: AtomicI64::new(expire_at),
            state: AtomicU8::new(state::VALID),
            enlisted: AtomicBool::new(false),
            del_next: AtomicU64::new(NIL_OFFSET),
        }
    }

    pub(crate) fn key(&self) -> &K {
        // SAFETY: the key is written before publication and is immutable
        // afterwards.
        unsafe { &*self.key.get() }
    }

    pub(crate) fn read_value(&self) -> V
    where
        V: Copy,
    {
        // SAFETY: `V` is trivially copyable; a read racing an in-place
        // update yields one of the two values involved.
        unsafe { *self.value.get() }
    }

    pub(crate) fn write_value(&self, value: V) {
        // SAFETY: callers hold the WRITING state, excluding other writers
        // and the reclaimer.
        unsafe { self.value.get().write(value) };
    }

    pub(crate) fn is_expired(&self, now: i64) -> bool {
        let expire_at = self.expire_at.load(Ordering::Relaxed);
        expire_at != 0 && expire_at < now
    }
}

/// One hash chain: approximate length counter, head anchor, and the tail
/// that inserters exchange against.
#[repr(C)]
pub(crate) struct Bucket {
    pub(crate) count: AtomicU32,
    pub(crate) head: AtomicU64,
    pub(crate) tail: AtomicU64,
}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            head: AtomicU64::new(NIL_OFFSET),
            tail: AtomicU64::new(NIL_OFFSET),
        }
    }
}
