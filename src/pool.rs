//! A fixed-capacity slab allocator with a lock-free free-slot ring.
//!
//! The pool lives entirely inside a [`Segment`]: a metadata record, a ring
//! of free-slot offsets, and a contiguous array of fixed-size slots. Slots
//! are referred to by their byte offset from the start of the slot array, so
//! any process attached to the arena can resolve them.
//!
//! `allocate` and `free` are wait-free apart from a bounded retry: both sides
//! claim a ring position with a fetch-add on a monotonically increasing
//! index and then exchange the offset stored there. The ring carries two
//! spare positions beyond the slot count to absorb transient overshoot
//! between the two indices.

use std::{
    alloc::Layout,
    collections::HashSet,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_utils::Backoff;

use crate::{
    segment::{Segment, NIL_OFFSET},
    Error,
};

const QUEUE_SUFFIX: &str = "_queue";

/// Ring positions beyond the slot count, absorbing transient index overshoot
/// between `read_idx` and `write_idx`.
const RING_SLACK: u64 = 2;

/// Pool metadata, stored in the arena under the pool's name.
#[repr(C)]
struct PoolMeta {
    slot_size: u32,
    obj_size: u32,
    slot_count: u64,
    /// Offset of slot 0; meaningful once `ready` is 1.
    data_offset: AtomicU64,
    /// 0 while the creator lays out the slot array and the ring.
    ready: AtomicU32,
    /// Frees dropped because they would have passed `read_idx`.
    over_free: AtomicU64,
    /// Next ring position a free will publish to.
    write_idx: AtomicU64,
    /// Next ring position an allocation will consume.
    read_idx: AtomicU64,
}

/// One pool slot: the `used` flag followed by the payload.
#[repr(C)]
struct Slot<T> {
    used: AtomicBool,
    data: T,
}

/// A fixed-capacity slab pool handing out slots of `T` by offset.
///
/// `attach` finds or creates the named pool inside the segment; any number
/// of handles (across threads and processes) may attach to the same name,
/// and re-attachment validates that the slot geometry matches.
impl<T> std::fmt::Debug for SlabPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabPool")
            .field("slot_count", &self.slot_count)
            .field("slot_size", &self.slot_size)
            .finish()
    }
}

pub struct SlabPool<T> {
    segment: Arc<dyn Segment>,
    meta: NonNull<PoolMeta>,
    ring: NonNull<AtomicU64>,
    data: NonNull<u8>,
    ring_len: u64,
    slot_count: u64,
    slot_size: u64,
    _marker: PhantomData<T>,
}

// SAFETY: the pool only hands out raw offsets and pointers into the
// segment; the `used` flags, ring entries, and indices that coordinate
// ownership are all atomics. `T` travels between threads through the slots,
// hence the `Send` bound.
unsafe impl<T: Send> Send for SlabPool<T> {}
unsafe impl<T: Send + Sync> Sync for SlabPool<T> {}

impl<T> SlabPool<T> {
    /// Finds or creates the pool named `name` with room for `capacity`
    /// entries of `T`.
    ///
    /// The creator lays out the slot array and fills the free ring; late
    /// openers wait for that publication and then validate geometry.
    pub fn attach(segment: Arc<dyn Segment>, name: &str, capacity: u32) -> Result<Self, Error> {
        assert!(capacity > 0, "pool capacity must be non-zero");

        let slot_size = mem::size_of::<Slot<T>>() as u64;
        let obj_size = mem::size_of::<T>() as u64;
        let slot_count = u64::from(capacity);
        let ring_len = slot_count + RING_SLACK;

        let mut created = false;
        let meta_offset = segment.find_or_construct(name, Layout::new::<PoolMeta>(), &mut |ptr| {
            created = true;
            unsafe {
                ptr.cast::<PoolMeta>().as_ptr().write(PoolMeta {
                    slot_size: slot_size as u32,
                    obj_size: obj_size as u32,
                    slot_count,
                    data_offset: AtomicU64::new(0),
                    ready: AtomicU32::new(0),
                    over_free: AtomicU64::new(0),
                    write_idx: AtomicU64::new(0),
                    read_idx: AtomicU64::new(0),
                });
            }
        })?;
        let meta = segment.ptr_at(meta_offset).cast::<PoolMeta>();

        let queue_name = format!("{name}{QUEUE_SUFFIX}");
        let ring_layout = Layout::array::<AtomicU64>(ring_len as usize)
            .map_err(|_| Error::CapacityOverflow { name: name.into() })?;

        let (data_offset, ring_offset) = if created {
            let data_layout = slot_count
                .checked_mul(slot_size)
                .and_then(|bytes| {
                    Layout::from_size_align(bytes as usize, mem::align_of::<Slot<T>>()).ok()
                })
                .ok_or(Error::CapacityOverflow { name: name.into() })?;
            let data_offset = segment.allocate(data_layout)?;
            unsafe {
                ptr::write_bytes(segment.ptr_at(data_offset).as_ptr(), 0, data_layout.size());
            }

            let ring_offset =
                segment.find_or_construct(&queue_name, ring_layout, &mut |ptr| unsafe {
                    let ring = ptr.cast::<AtomicU64>().as_ptr();
                    for i in 0..ring_len {
                        let value = if i < slot_count { i * slot_size } else { NIL_OFFSET };
                        ring.add(i as usize).write(AtomicU64::new(value));
                    }
                })?;

            let meta_ref = unsafe { meta.as_ref() };
            meta_ref.data_offset.store(data_offset, Ordering::Release);
            meta_ref.ready.store(1, Ordering::Release);
            (data_offset, ring_offset)
        } else {
            let meta_ref = unsafe { meta.as_ref() };
            if meta_ref.slot_size != slot_size as u32
                || meta_ref.obj_size != obj_size as u32
                || meta_ref.slot_count != slot_count
            {
                return Err(Error::PoolMismatch { name: name.into() });
            }

            let backoff = Backoff::new();
            let mut ready = false;
            for _ in 0..1 << 16 {
                if meta_ref.ready.load(Ordering::Acquire) == 1 {
                    ready = true;
                    break;
                }
                backoff.snooze();
            }
            if !ready {
                return Err(Error::Unready { name: name.into() });
            }

            // The creator constructs the ring before publishing `ready`, so
            // this lookup always finds it.
            let ring_offset = segment.find_or_construct(&queue_name, ring_layout, &mut |_| {})?;
            (meta_ref.data_offset.load(Ordering::Acquire), ring_offset)
        };

        let ring = segment.ptr_at(ring_offset).cast::<AtomicU64>();
        let data = segment.ptr_at(data_offset);
        Ok(Self {
            segment,
            meta,
            ring,
            data,
            ring_len,
            slot_count,
            slot_size,
            _marker: PhantomData,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> u64 {
        self.slot_count
    }

    /// Frees dropped because they would have outnumbered allocations.
    pub fn over_free_count(&self) -> u64 {
        self.meta().over_free.load(Ordering::Acquire)
    }

    /// Claims a free slot and returns its offset, or `None` when the pool
    /// is exhausted.
    ///
    /// A claimed ring position can transiently hold `NIL_OFFSET` while a
    /// concurrent free is still publishing, and positions consumed by
    /// earlier failed claims stay empty until the indices lap them. The
    /// claim therefore retries across at most one full ring lap: any offset
    /// published by a free that completed before this call lies within one
    /// lap of the read cursor.
    pub fn allocate(&self) -> Option<u64> {
        let meta = self.meta();
        let backoff = Backoff::new();
        for _ in 0..self.ring_len {
            let idx = meta.read_idx.fetch_add(1, Ordering::AcqRel) % self.ring_len;
            let offset = self.ring_at(idx).swap(NIL_OFFSET, Ordering::AcqRel);
            if offset != NIL_OFFSET {
                let slot = unsafe { self.slot_ptr(offset).as_ref() };
                slot.used.store(true, Ordering::Release);
                return Some(offset);
            }
            // Pause briefly for in-flight frees, but keep a lap over an
            // exhausted ring cheap.
            if !backoff.is_completed() {
                backoff.spin();
            }
        }
        None
    }

    /// Returns the slot at `offset` to the free ring.
    ///
    /// Freeing a slot that is already free is ignored. A free that would
    /// outnumber the allocations ever made is dropped and counted instead
    /// of corrupting the ring.
    pub fn free(&self, offset: u64) {
        let Some(slot) = self.slot_checked(offset) else {
            return;
        };
        if !slot.used.load(Ordering::Acquire) {
            return;
        }

        let meta = self.meta();
        if meta.write_idx.load(Ordering::Acquire) >= meta.read_idx.load(Ordering::Acquire) {
            meta.over_free.fetch_add(1, Ordering::AcqRel);
            log::warn!("slab pool over-free at offset {offset}; dropping the free");
            return;
        }

        slot.used.store(false, Ordering::Release);
        self.push_free(self.slot_start(offset));
    }

    /// Resolves `offset` to the payload it addresses.
    ///
    /// Returns a pointer iff the offset is not the nil sentinel, lies inside
    /// the slot array, and the slot is currently in use. Offsets interior to
    /// a slot resolve to that slot.
    pub fn get(&self, offset: u64) -> Option<NonNull<T>> {
        let slot = self.slot_checked(offset)?;
        if !slot.used.load(Ordering::Acquire) {
            return None;
        }
        NonNull::new(unsafe { ptr::addr_of!(slot.data).cast_mut() })
    }

    /// Reconciles pool bookkeeping with the caller's view of live offsets.
    ///
    /// Advisory, for clean restarts only: a slot marked used whose offset is
    /// absent from `live` is force-freed, and an unused slot that fell out
    /// of the free ring is returned to it. Must not race ordinary traffic.
    pub fn sync_memory(&self, live: &HashSet<u64>) {
        let meta = self.meta();

        // Offsets currently discoverable in the ring, scanning forward from
        // the read cursor.
        let mut in_ring = HashSet::new();
        let mut idx = meta.read_idx.load(Ordering::Acquire);
        for _ in 0..self.ring_len {
            let offset = self.ring_at(idx % self.ring_len).load(Ordering::Acquire);
            if offset == NIL_OFFSET {
                break;
            }
            in_ring.insert(self.slot_start(offset));
            idx += 1;
        }

        for i in 0..self.slot_count {
            let offset = i * self.slot_size;
            let slot = unsafe { self.slot_ptr(offset).as_ref() };
            if slot.used.load(Ordering::Acquire) {
                if !live.contains(&offset) {
                    log::warn!("slab pool reclaiming orphaned slot at offset {offset}");
                    slot.used.store(false, Ordering::Release);
                    self.push_free(offset);
                }
            } else if !in_ring.contains(&offset) {
                log::warn!("slab pool re-ringing lost free slot at offset {offset}");
                self.push_free(offset);
            }
        }
    }

    fn meta(&self) -> &PoolMeta {
        unsafe { self.meta.as_ref() }
    }

    fn ring_at(&self, idx: u64) -> &AtomicU64 {
        debug_assert!(idx < self.ring_len);
        unsafe { &*self.ring.as_ptr().add(idx as usize) }
    }

    /// Rounds an offset down to the start of its slot.
    fn slot_start(&self, offset: u64) -> u64 {
        (offset / self.slot_size) * self.slot_size
    }

    fn slot_checked(&self, offset: u64) -> Option<&Slot<T>> {
        if offset == NIL_OFFSET {
            return None;
        }
        let start = self.slot_start(offset);
        if start >= self.slot_count * self.slot_size {
            return None;
        }
        Some(unsafe { self.slot_ptr(start).as_ref() })
    }

    fn slot_ptr(&self, offset: u64) -> NonNull<Slot<T>> {
        debug_assert_eq!(offset % self.slot_size, 0);
        unsafe {
            NonNull::new_unchecked(self.data.as_ptr().add(offset as usize).cast::<Slot<T>>())
        }
    }

    fn push_free(&self, offset: u64) {
        let meta = self.meta();
        let idx = meta.write_idx.fetch_add(1, Ordering::AcqRel) % self.ring_len;
        self.ring_at(idx).store(offset, Ordering::Release);
    }

    /// Arena backing this pool.
    pub fn segment(&self) -> &Arc<dyn Segment> {
        &self.segment
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> u64 {
        (0..self.ring_len)
            .filter(|&i| self.ring_at(i).load(Ordering::Acquire) != NIL_OFFSET)
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::HeapSegment;

    // The shape the original pool exercises: a value plus an offset link, so
    // a linked list can be threaded through the slab.
    #[repr(C)]
    struct ListRec {
        value: u64,
        next: u64,
    }

    fn pool(capacity: u32) -> SlabPool<ListRec> {
        let segment = Arc::new(HeapSegment::new(1 << 20));
        SlabPool::attach(segment, "pool", capacity).unwrap()
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let p = pool(8);
        assert_eq!(p.free_count(), 8);

        let offset = p.allocate().unwrap();
        assert_eq!(p.free_count(), 7);
        assert!(p.get(offset).is_some());

        p.free(offset);
        assert_eq!(p.free_count(), 8);
        assert!(p.get(offset).is_none(), "freed slots are not addressable");
    }

    #[test]
    fn exhaustion_returns_none_and_recovers() {
        let p = pool(2);
        let a = p.allocate().unwrap();
        let b = p.allocate().unwrap();
        assert_eq!(p.allocate(), None);

        // Offsets published by frees are found even though the failed
        // claim above burned ring positions.
        p.free(a);
        p.free(b);
        assert!(p.allocate().is_some());
        assert!(p.allocate().is_some());
        assert_eq!(p.allocate(), None);
    }

    #[test]
    fn double_free_is_ignored() {
        let p = pool(4);
        let offset = p.allocate().unwrap();
        p.free(offset);
        p.free(offset);
        assert_eq!(p.free_count(), 4);
        assert_eq!(p.over_free_count(), 0);
    }

    #[test]
    fn over_free_is_dropped_and_counted() {
        let p = pool(4);
        let offset = p.allocate().unwrap();
        p.free(offset);

        // Forge a second free of the same slot by marking it used again
        // behind the pool's back.
        unsafe { p.slot_ptr(offset).as_ref() }
            .used
            .store(true, Ordering::Release);
        p.free(offset);
        assert_eq!(p.over_free_count(), 1);
        assert_eq!(p.free_count(), 4, "the forged free must not enter the ring");
    }

    #[test]
    fn offsets_address_distinct_slots() {
        let p = pool(16);
        let offsets: Vec<u64> = (0..16).map(|_| p.allocate().unwrap()).collect();

        for (i, &offset) in offsets.iter().enumerate() {
            let rec = p.get(offset).unwrap();
            unsafe {
                (*rec.as_ptr()).value = i as u64;
            }
        }
        for (i, &offset) in offsets.iter().enumerate() {
            let rec = p.get(offset).unwrap();
            assert_eq!(unsafe { (*rec.as_ptr()).value }, i as u64);
        }
    }

    #[test]
    fn linked_list_threads_through_the_slab() {
        let p = pool(16);

        let head = p.allocate().unwrap();
        let mut tail = head;
        for i in 1..10u64 {
            let offset = p.allocate().unwrap();
            let rec = p.get(offset).unwrap();
            unsafe {
                (*rec.as_ptr()).value = i;
                (*rec.as_ptr()).next = NIL_OFFSET;
            }
            unsafe {
                (*p.get(tail).unwrap().as_ptr()).next = offset;
            }
            tail = offset;
        }

        let mut seen = Vec::new();
        let mut cursor = head;
        while let Some(rec) = p.get(cursor) {
            seen.push(unsafe { (*rec.as_ptr()).value });
            cursor = unsafe { (*rec.as_ptr()).next };
        }
        assert_eq!(seen, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn reattach_validates_geometry() {
        let segment: Arc<HeapSegment> = Arc::new(HeapSegment::new(1 << 20));
        let _p: SlabPool<ListRec> = SlabPool::attach(segment.clone(), "pool", 8).unwrap();

        // Same name, same type, same capacity: fine.
        let again: Result<SlabPool<ListRec>, _> = SlabPool::attach(segment.clone(), "pool", 8);
        assert!(again.is_ok());

        // Different capacity: rejected before any pointer is handed out.
        let wrong: Result<SlabPool<ListRec>, _> = SlabPool::attach(segment.clone(), "pool", 9);
        assert!(matches!(wrong.unwrap_err(), Error::PoolMismatch { .. }));

        // Different payload size: rejected too.
        let wrong: Result<SlabPool<u8>, _> = SlabPool::attach(segment, "pool", 8);
        assert!(matches!(wrong.unwrap_err(), Error::PoolMismatch { .. }));
    }

    #[test]
    fn reattached_handle_sees_existing_state() {
        let segment: Arc<HeapSegment> = Arc::new(HeapSegment::new(1 << 20));
        let first: SlabPool<ListRec> = SlabPool::attach(segment.clone(), "pool", 4).unwrap();
        let offset = first.allocate().unwrap();
        unsafe { (*first.get(offset).unwrap().as_ptr()).value = 99 };

        let second: SlabPool<ListRec> = SlabPool::attach(segment, "pool", 4).unwrap();
        let rec = second.get(offset).unwrap();
        assert_eq!(unsafe { (*rec.as_ptr()).value }, 99);
        assert_eq!(second.free_count(), 3);
    }

    #[test]
    fn sync_memory_reclaims_orphans() {
        let p = pool(4);

        let live = p.allocate().unwrap();
        let orphan = p.allocate().unwrap();
        assert_eq!(p.free_count(), 2);

        // `orphan` is used but unreachable from the caller's live set: a
        // crash between allocation and linking.
        let mut live_set = HashSet::new();
        live_set.insert(live);
        p.sync_memory(&live_set);

        assert_eq!(p.free_count(), 3);
        assert!(p.get(orphan).is_none());
        assert!(p.get(live).is_some(), "live slots stay untouched");
    }

    #[test]
    fn sync_memory_re_rings_lost_free_slots() {
        let p = pool(4);
        let offset = p.allocate().unwrap();

        // Simulate a crash mid-free: the used flag was cleared but the
        // offset never reached the ring.
        unsafe { p.slot_ptr(offset).as_ref() }
            .used
            .store(false, Ordering::Release);
        assert_eq!(p.free_count(), 3);

        p.sync_memory(&HashSet::new());
        assert_eq!(p.free_count(), 4);
    }
}
