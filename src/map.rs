//! The concurrent expiring hash map.
//!
//! Entries live in slab slots inside a [`Segment`] and are linked into
//! per-bucket chains by offset. Ordinary get/insert traffic is lock-free:
//! readers walk chains without taking anything, writers serialize against
//! each other and against the reclaimer through a per-entry state word, and
//! expired entries are reclaimed by [`Map::gc`] through a two-phase
//! quarantine.

mod builder;
pub(crate) mod node;
mod reclaim;

pub use builder::MapBuilder;

use std::{
    hash::{BuildHasher, Hash, Hasher},
    marker::PhantomData,
    ptr::NonNull,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{common::time::Clock, pool::SlabPool, segment::Segment, Error};

use self::node::{state, Bucket, Node};

/// Default number of hash buckets.
pub const DEFAULT_BUCKET_COUNT: u32 = 1024;

pub(crate) const BUCKET_SUFFIX: &str = "_bucket";
pub(crate) const GARBAGE_HEAD_SUFFIX: &str = "_garbage_head";
pub(crate) const GARBAGE_TAIL_SUFFIX: &str = "_garbage_tail";

/// The default hasher, stable across processes.
///
/// Bucket placement is derived from key hashes and shared through the
/// arena, so every process attached to the same map must compute identical
/// hashes. The usual per-process random seeding would scatter one process's
/// keys into another process's buckets; fixed seeds keep the mapping pure.
#[derive(Clone)]
pub struct DeterministicState(ahash::RandomState);

impl Default for DeterministicState {
    fn default() -> Self {
        Self(ahash::RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        ))
    }
}

impl BuildHasher for DeterministicState {
    type Hasher = ahash::AHasher;

    fn build_hasher(&self) -> ahash::AHasher {
        self.0.build_hasher()
    }
}

/// A concurrent expiring hash map whose entries live in a shared arena.
///
/// `Map` is a cheap handle over a shared instance; clone it to share across
/// threads. Keys and values must be trivially copyable: they are stored by
/// value in shared memory, and reads may race in-place updates (a racing
/// reader observes either the old or the new value, never a tear of
/// anything with ownership semantics).
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use shmap::{segment::HeapSegment, Map};
///
/// let segment = Arc::new(HeapSegment::new(1 << 20));
/// let map: Map<u64, u64> = Map::builder("demo", 100).build(segment).unwrap();
///
/// map.insert(1, 100).unwrap();
/// assert_eq!(map.get(&1), Some(100));
/// assert_eq!(map.get(&2), None);
/// ```
pub struct Map<K, V, S = DeterministicState> {
    inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> std::fmt::Debug for Map<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map").finish_non_exhaustive()
    }
}

impl<K, V, S> Clone for Map<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Map<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// Returns a [`MapBuilder`] for a map named `name` holding up to
    /// `capacity` entries.
    pub fn builder(name: impl Into<String>, capacity: u32) -> MapBuilder<K, V> {
        MapBuilder::new(name, capacity)
    }
}

impl<K, V, S> Map<K, V, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    S: BuildHasher,
{
    /// Returns the live value for `key`, or `None` when the key is absent
    /// or its entry has expired.
    ///
    /// Lock-free: never blocks and never transitions entry states. A reader
    /// racing the publication of a brand-new entry may miss it once; the
    /// entry is visible to every later call.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = &*self.inner;
        let now = inner.clock.now_secs();
        let node = inner.find_node(inner.bucket_index(key), key)?;
        let node = unsafe { node.as_ref() };
        if node.is_expired(now) {
            return None;
        }
        Some(node.read_value())
    }

    /// Inserts `key -> value` with no expiry.
    ///
    /// Overwrites in place when a live entry for `key` exists; otherwise
    /// appends a fresh entry. Returns [`Error::NoMemory`] when the slab
    /// pool is exhausted.
    pub fn insert(&self, key: K, value: V) -> Result<(), Error> {
        self.inner.insert(key, value, 0)
    }

    /// Inserts `key -> value`, expiring `ttl` from now.
    ///
    /// Expiry has one-second granularity; a `ttl` below one second rounds
    /// to zero seconds, which means "never expires".
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) -> Result<(), Error> {
        self.inner.insert(key, value, ttl.as_secs() as i64)
    }

    /// Approximate number of live entries.
    ///
    /// Sums the per-bucket counters, which drift transiently under
    /// concurrent insert and reclaim traffic. For observability only.
    pub fn entry_count(&self) -> u64 {
        let inner = &*self.inner;
        (0..inner.bucket_count)
            .map(|i| u64::from(inner.bucket(i).count.load(Ordering::Acquire)))
            .sum()
    }

    /// Collects every key reachable at the time of the walk.
    ///
    /// Best-effort snapshot: entries inserted or reclaimed during the walk
    /// may or may not appear. Must not be called from the thread currently
    /// running [`gc`](Self::gc).
    pub fn keys(&self) -> Vec<K> {
        self.inner.collect(|node| *node.key())
    }

    /// Collects every value reachable at the time of the walk.
    ///
    /// Same snapshot semantics as [`keys`](Self::keys).
    pub fn values(&self) -> Vec<V> {
        self.inner.collect(Node::read_value)
    }

    /// Reconciles the backing pool with the entries actually reachable
    /// from this map.
    ///
    /// Advisory and intended for clean restarts only, not crash recovery
    /// of in-flight operations: a slot marked used that is reachable from
    /// neither a bucket chain nor the garbage list returns to the free
    /// ring, as does an unused slot that fell out of the ring. Must not
    /// race ordinary traffic.
    pub fn sync_memory(&self) {
        self.inner.sync_memory();
    }

    /// Sweeps expired entries and releases quarantined slots.
    ///
    /// Safe to call from any thread at any frequency: a process-local
    /// timestamp gates actual work to at most one sweep per quiescence
    /// window, and losers return immediately.
    pub fn gc(&self) {
        self.inner.gc();
    }

    /// The map's name inside the arena.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Slot capacity of the backing pool.
    pub fn capacity(&self) -> u64 {
        self.inner.pool.capacity()
    }

    /// Number of hash buckets.
    pub fn bucket_count(&self) -> u32 {
        self.inner.bucket_count
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Inner<K, V, S> {
        &self.inner
    }
}

pub(crate) struct Inner<K, V, S> {
    pub(crate) name: String,
    #[allow(dead_code)] // holds the mapping open for the raw pointers below
    pub(crate) segment: Arc<dyn Segment>,
    pub(crate) pool: SlabPool<Node<K, V>>,
    buckets: NonNull<Bucket>,
    pub(crate) bucket_count: u32,
    garbage_head: NonNull<AtomicU64>,
    garbage_tail: NonNull<AtomicU64>,
    /// Wall-clock second of the last sweep this process performed.
    pub(crate) last_gc_ts: CachePadded<AtomicI64>,
    pub(crate) clock: Clock,
    build_hasher: S,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: all shared state behind the raw pointers is either immutable
// (bucket array placement) or accessed through atomics; keys and values are
// `Copy` data moved across threads by value.
unsafe impl<K, V, S> Send for Inner<K, V, S>
where
    K: Copy + Send,
    V: Copy + Send,
    S: Send,
{
}

unsafe impl<K, V, S> Sync for Inner<K, V, S>
where
    K: Copy + Send,
    V: Copy + Send,
    S: Sync,
{
}

impl<K, V, S> Inner<K, V, S> {
    pub(crate) fn new(
        name: String,
        segment: Arc<dyn Segment>,
        pool: SlabPool<Node<K, V>>,
        buckets: NonNull<Bucket>,
        bucket_count: u32,
        garbage_head: NonNull<AtomicU64>,
        garbage_tail: NonNull<AtomicU64>,
        clock: Clock,
        build_hasher: S,
    ) -> Self {
        Self {
            name,
            segment,
            pool,
            buckets,
            bucket_count,
            garbage_head,
            garbage_tail,
            last_gc_ts: CachePadded::new(AtomicI64::new(0)),
            clock,
            build_hasher,
            _marker: PhantomData,
        }
    }

    pub(crate) fn bucket(&self, index: u32) -> &Bucket {
        debug_assert!(index < self.bucket_count);
        unsafe { &*self.buckets.as_ptr().add(index as usize) }
    }

    pub(crate) fn node(&self, offset: u64) -> Option<NonNull<Node<K, V>>> {
        self.pool.get(offset)
    }

    pub(crate) fn garbage_head(&self) -> &AtomicU64 {
        unsafe { self.garbage_head.as_ref() }
    }

    pub(crate) fn garbage_tail(&self) -> &AtomicU64 {
        unsafe { self.garbage_tail.as_ref() }
    }

    /// Gathers every slot offset this map still owns and hands the set to
    /// the pool for reconciliation.
    pub(crate) fn sync_memory(&self) {
        let mut live = std::collections::HashSet::new();
        for index in 0..self.bucket_count {
            let mut offset = self.bucket(index).head.load(Ordering::Acquire);
            while let Some(ptr) = self.node(offset) {
                live.insert(offset);
                offset = unsafe { ptr.as_ref() }.next.load(Ordering::Acquire);
            }
        }
        // Quarantined nodes still own their slots.
        let mut offset = self.garbage_head().load(Ordering::Acquire);
        while let Some(ptr) = self.node(offset) {
            live.insert(offset);
            offset = unsafe { ptr.as_ref() }.del_next.load(Ordering::Acquire);
        }
        self.pool.sync_memory(&live);
    }
}

impl<K, V, S> Inner<K, V, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    S: BuildHasher,
{
    fn bucket_index(&self, key: &K) -> u32 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as u32) % self.bucket_count
    }

    /// Walks the chain for the first node carrying `key`, in chain order.
    fn find_node(&self, index: u32, key: &K) -> Option<NonNull<Node<K, V>>> {
        let mut offset = self.bucket(index).head.load(Ordering::Acquire);
        while let Some(ptr) = self.node(offset) {
            let node = unsafe { ptr.as_ref() };
            if node.key() == key {
                return Some(ptr);
            }
            offset = node.next.load(Ordering::Acquire);
        }
        None
    }

    fn insert(&self, key: K, value: V, ttl_secs: i64) -> Result<(), Error> {
        let index = self.bucket_index(&key);
        let now = self.clock.now_secs();

        let found = match self.find_node(index, &key) {
            Some(ptr) => ptr,
            None => return self.append(index, key, value, ttl_secs, now),
        };
        let node = unsafe { found.as_ref() };
        if node.is_expired(now) {
            // A dead entry is the reclaimer's to unlink; take the append
            // path and let the chain transiently hold both.
            return self.append(index, key, value, ttl_secs, now);
        }

        // Writer lock: VALID -> WRITING. Losing to another writer means
        // waiting it out; losing to the reclaimer means the entry is on its
        // way out and a fresh append takes over.
        let backoff = Backoff::new();
        loop {
            match node.state.compare_exchange(
                state::VALID,
                state::WRITING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(state::WRITING) => backoff.snooze(),
                Err(_) => return self.append(index, key, value, ttl_secs, now),
            }
        }

        node.write_value(value);
        node.expire_at.store(expiry(now, ttl_secs), Ordering::Relaxed);
        node.state.store(state::VALID, Ordering::Release);
        Ok(())
    }

    /// Constructs a fresh node and publishes it at the bucket's tail.
    fn append(&self, index: u32, key: K, value: V, ttl_secs: i64, now: i64) -> Result<(), Error> {
        let offset = self.pool.allocate().ok_or(Error::NoMemory)?;
        // Freshly allocated slots are always addressable.
        let Some(ptr) = self.pool.get(offset) else {
            return Err(Error::NoMemory);
        };
        unsafe { ptr.as_ptr().write(Node::new(key, value, expiry(now, ttl_secs))) };

        let bucket = self.bucket(index);
        let old_tail = bucket.tail.swap(offset, Ordering::AcqRel);
        match self.node(old_tail) {
            // The chain was empty; this node is also the head.
            None => bucket.head.store(offset, Ordering::Release),
            Some(prev) => unsafe { prev.as_ref() }.next.store(offset, Ordering::Release),
        }
        bucket.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn collect<T>(&self, mut f: impl FnMut(&Node<K, V>) -> T) -> Vec<T> {
        let mut out = Vec::new();
        for index in 0..self.bucket_count {
            let mut offset = self.bucket(index).head.load(Ordering::Acquire);
            while let Some(ptr) = self.node(offset) {
                let node = unsafe { ptr.as_ref() };
                out.push(f(node));
                offset = node.next.load(Ordering::Acquire);
            }
        }
        out
    }
}

fn expiry(now: i64, ttl_secs: i64) -> i64 {
    if ttl_secs == 0 {
        0
    } else {
        now + ttl_secs
    }
}
