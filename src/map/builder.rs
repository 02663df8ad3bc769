use std::{alloc::Layout, hash::BuildHasher, marker::PhantomData, ptr, sync::Arc};

use crate::{
    common::time::Clock,
    pool::SlabPool,
    segment::{Segment, NIL_OFFSET},
    Error,
};

use super::{
    node::Bucket, DeterministicState, Inner, Map, BUCKET_SUFFIX, DEFAULT_BUCKET_COUNT,
    GARBAGE_HEAD_SUFFIX, GARBAGE_TAIL_SUFFIX,
};

use std::sync::atomic::AtomicU64;

/// Builds a [`Map`] with the given name, capacity, and knobs.
///
/// The name scopes every arena region the map owns: `"<name>_bucket"`,
/// `"<name>_garbage_head"`, `"<name>_garbage_tail"`, plus the slab pool
/// under `"<name>_pool"` (override with [`pool_name`](Self::pool_name)).
/// Two processes that build with the same name against the same arena
/// attach to the same map and must pass the same geometry.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use shmap::{segment::HeapSegment, Map};
///
/// let segment = Arc::new(HeapSegment::new(1 << 20));
/// let map: Map<u32, u32> = Map::builder("sessions", 10_000)
///     .bucket_count(2048)
///     .build(segment)
///     .unwrap();
/// # let _ = map;
/// ```
pub struct MapBuilder<K, V, S = DeterministicState> {
    name: String,
    capacity: u32,
    bucket_count: u32,
    pool_name: Option<String>,
    build_hasher: S,
    clock: Clock,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> MapBuilder<K, V> {
    /// Starts a builder for a map named `name` holding up to `capacity`
    /// entries.
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
            bucket_count: DEFAULT_BUCKET_COUNT,
            pool_name: None,
            build_hasher: DeterministicState::default(),
            clock: Clock::default(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, S> MapBuilder<K, V, S> {
    /// Sets the number of hash buckets. Zero selects the default.
    pub fn bucket_count(mut self, bucket_count: u32) -> Self {
        self.bucket_count = if bucket_count == 0 {
            DEFAULT_BUCKET_COUNT
        } else {
            bucket_count
        };
        self
    }

    /// Names the slab pool region; defaults to `"<name>_pool"`.
    ///
    /// Useful when several maps of the same node type should draw from one
    /// shared pool region namespace-wise distinct from their own names.
    pub fn pool_name(mut self, pool_name: impl Into<String>) -> Self {
        self.pool_name = Some(pool_name.into());
        self
    }

    /// Replaces the hasher.
    ///
    /// The hasher must be pure and produce identical hashes in every
    /// process attached to the arena; see
    /// [`DeterministicState`][super::DeterministicState].
    pub fn hasher<S2: BuildHasher>(self, build_hasher: S2) -> MapBuilder<K, V, S2> {
        MapBuilder {
            name: self.name,
            capacity: self.capacity,
            bucket_count: self.bucket_count,
            pool_name: self.pool_name,
            build_hasher,
            clock: self.clock,
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl<K, V, S> MapBuilder<K, V, S>
where
    K: Copy + Eq + std::hash::Hash,
    V: Copy,
    S: BuildHasher,
{
    /// Finds or creates the map's regions inside `segment` and returns a
    /// handle.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn build(self, segment: Arc<dyn Segment>) -> Result<Map<K, V, S>, Error> {
        assert!(self.capacity > 0, "map capacity must be non-zero");

        let pool_name = self
            .pool_name
            .unwrap_or_else(|| format!("{}_pool", self.name));
        let pool = SlabPool::attach(Arc::clone(&segment), &pool_name, self.capacity)?;

        let bucket_layout = Layout::array::<Bucket>(self.bucket_count as usize)
            .map_err(|_| Error::CapacityOverflow {
                name: self.name.clone(),
            })?;
        let buckets_offset = segment.find_or_construct(
            &format!("{}{}", self.name, BUCKET_SUFFIX),
            bucket_layout,
            &mut |ptr| unsafe {
                let buckets = ptr.cast::<Bucket>().as_ptr();
                for i in 0..self.bucket_count as usize {
                    ptr::write(buckets.add(i), Bucket::new());
                }
            },
        )?;

        let anchor_layout = Layout::new::<AtomicU64>();
        let mut nil_init = |ptr: std::ptr::NonNull<u8>| unsafe {
            ptr.cast::<AtomicU64>().as_ptr().write(AtomicU64::new(NIL_OFFSET));
        };
        let head_offset = segment.find_or_construct(
            &format!("{}{}", self.name, GARBAGE_HEAD_SUFFIX),
            anchor_layout,
            &mut nil_init,
        )?;
        let tail_offset = segment.find_or_construct(
            &format!("{}{}", self.name, GARBAGE_TAIL_SUFFIX),
            anchor_layout,
            &mut nil_init,
        )?;

        let buckets = segment.ptr_at(buckets_offset).cast::<Bucket>();
        let garbage_head = segment.ptr_at(head_offset).cast::<AtomicU64>();
        let garbage_tail = segment.ptr_at(tail_offset).cast::<AtomicU64>();

        let inner = Inner::new(
            self.name,
            segment,
            pool,
            buckets,
            self.bucket_count,
            garbage_head,
            garbage_tail,
            self.clock,
            self.build_hasher,
        );
        Ok(Map {
            inner: Arc::new(inner),
        })
    }
}
