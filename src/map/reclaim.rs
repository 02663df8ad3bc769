//! Two-phase reclamation of expired entries.
//!
//! A sweep never frees a slot directly. Phase one unlinks expired nodes
//! from their bucket chains onto a single garbage list; phase two, run on
//! every sweep, ticks each listed node's state once and frees a node only
//! after its second tick. Sweeps are at least [`BREAK_TIME_SECS`] apart, so
//! a freed slot has spent at least one full window unreachable — longer
//! than any reader can hold an offset it loaded before the unlink.

use std::{
    hash::{BuildHasher, Hash},
    sync::atomic::Ordering,
};

use crossbeam_utils::Backoff;

use crate::segment::NIL_OFFSET;

use super::{
    node::{state, Bucket, Node},
    Inner,
};

/// Minimum wall-clock gap between sweeps; doubles as the quiescence window.
pub(crate) const BREAK_TIME_SECS: i64 = 2;

/// Extra slack beyond `expire_at` before a node stuck in COLLECTING is
/// considered abandoned by a dead reclaimer and recovered.
pub(crate) const GRACE_SECS: i64 = 10;

impl<K, V, S> Inner<K, V, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    S: BuildHasher,
{
    /// Runs one sweep if this process's quiescence window has elapsed.
    ///
    /// The timestamp exchange admits one winner per window; every other
    /// caller returns immediately.
    pub(crate) fn gc(&self) {
        let now = self.clock.now_secs();
        let last = self.last_gc_ts.load(Ordering::Acquire);
        if now - last < BREAK_TIME_SECS {
            return;
        }
        if self
            .last_gc_ts
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        self.scan(now);
        self.safe_free();
    }

    /// Phase one: move expired nodes from bucket chains to the garbage list.
    fn scan(&self, now: i64) {
        let mut swept = 0u64;
        for index in 0..self.bucket_count {
            let bucket = self.bucket(index);
            swept += self.scan_interior(bucket, now);
            swept += self.scan_head(bucket, now);
        }
        if swept > 0 {
            log::debug!("map {:?}: staged {swept} expired entries", self.name);
        }
    }

    /// Walks nodes that are neither the chain head nor its tail.
    ///
    /// The tail is skipped so the sweep never chases nodes appended after
    /// it started; an expired tail is picked up once something is appended
    /// behind it, or via the head path when the chain drains.
    fn scan_interior(&self, bucket: &Bucket, now: i64) -> u64 {
        let head_offset = bucket.head.load(Ordering::Acquire);
        let Some(head) = self.node(head_offset) else {
            return 0;
        };

        let mut swept = 0;
        let mut p0 = head;
        let mut p1_offset = unsafe { p0.as_ref() }.next.load(Ordering::Acquire);
        while let Some(p1) = self.node(p1_offset) {
            let node = unsafe { p1.as_ref() };
            let next_offset = node.next.load(Ordering::Acquire);
            if next_offset == NIL_OFFSET {
                break;
            }

            if node.is_expired(now) {
                match node.state.compare_exchange(
                    state::VALID,
                    state::COLLECTING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.enlist(p1_offset, node, bucket);
                        unsafe { p0.as_ref() }.next.store(next_offset, Ordering::Release);
                        swept += 1;
                        p1_offset = next_offset;
                        continue;
                    }
                    Err(state::COLLECTING)
                        if node.expire_at.load(Ordering::Relaxed) < now - GRACE_SECS =>
                    {
                        // A reclaimer died mid-collection. Enlist at most
                        // once, and take the node out of the chain either
                        // way.
                        if !node.enlisted.load(Ordering::Acquire) {
                            log::warn!(
                                "map {:?}: recovering stuck entry at offset {p1_offset}",
                                self.name
                            );
                            self.enlist(p1_offset, node, bucket);
                            swept += 1;
                        }
                        unsafe { p0.as_ref() }.next.store(next_offset, Ordering::Release);
                        p1_offset = next_offset;
                        continue;
                    }
                    // A writer owns it, or it is already marked: leave it
                    // for the next window.
                    Err(_) => {}
                }
            }

            p0 = p1;
            p1_offset = next_offset;
        }
        swept
    }

    /// Collects the chain head if it has expired.
    fn scan_head(&self, bucket: &Bucket, now: i64) -> u64 {
        let head_offset = bucket.head.load(Ordering::Acquire);
        let Some(head_ptr) = self.node(head_offset) else {
            return 0;
        };
        let head = unsafe { head_ptr.as_ref() };
        if !head.is_expired(now) {
            return 0;
        }
        if head
            .state
            .compare_exchange(
                state::VALID,
                state::COLLECTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return 0;
        }

        self.enlist(head_offset, head, bucket);

        if bucket.tail.load(Ordering::Acquire) == head_offset {
            if bucket
                .tail
                .compare_exchange(head_offset, NIL_OFFSET, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The chain is now empty.
                bucket.head.store(NIL_OFFSET, Ordering::Release);
                return 1;
            }
            // An inserter took the tail between the load and the exchange;
            // fall through and link its node in as the new head.
        }
        bucket.head.store(self.successor_of(head), Ordering::Release);
        1
    }

    /// Returns `node.next`, waiting out an inserter that has exchanged the
    /// tail but not yet linked its node behind this one.
    fn successor_of(&self, node: &Node<K, V>) -> u64 {
        let backoff = Backoff::new();
        loop {
            let next = node.next.load(Ordering::Acquire);
            if next != NIL_OFFSET {
                return next;
            }
            backoff.snooze();
        }
    }

    /// Appends a claimed node to the garbage list and drops it from the
    /// bucket's counter. Single-writer: only the sweep that won the window
    /// runs this.
    fn enlist(&self, offset: u64, node: &Node<K, V>, bucket: &Bucket) {
        node.enlisted.store(true, Ordering::Release);
        node.del_next.store(NIL_OFFSET, Ordering::Release);

        let head = self.garbage_head();
        let tail = self.garbage_tail();
        if head.load(Ordering::Acquire) == NIL_OFFSET {
            head.store(offset, Ordering::Release);
        } else {
            let tail_offset = tail.load(Ordering::Acquire);
            if let Some(prev) = self.node(tail_offset) {
                unsafe { prev.as_ref() }.del_next.store(offset, Ordering::Release);
            }
        }
        tail.store(offset, Ordering::Release);

        bucket.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Phase two: tick every listed node once; free those seen ticked
    /// before.
    ///
    /// A node enters the list at COLLECTING. Its first tick moves it to
    /// WAITING_DELETE; a tick that finds WAITING_DELETE proves a full
    /// quiescence window passed with the node unreachable, so the slot goes
    /// back to the pool.
    fn safe_free(&self) {
        let head_anchor = self.garbage_head();
        let tail_anchor = self.garbage_tail();

        let mut freed = 0u64;
        let mut prev: Option<std::ptr::NonNull<Node<K, V>>> = None;
        let mut prev_offset = NIL_OFFSET;
        let mut cursor = head_anchor.load(Ordering::Acquire);

        while let Some(ptr) = self.node(cursor) {
            let node = unsafe { ptr.as_ref() };
            let next = node.del_next.load(Ordering::Acquire);

            if node.state.fetch_add(1, Ordering::AcqRel) == state::WAITING_DELETE {
                match prev {
                    None => head_anchor.store(next, Ordering::Release),
                    Some(p0) => unsafe { p0.as_ref() }.del_next.store(next, Ordering::Release),
                }
                node.enlisted.store(false, Ordering::Release);
                self.pool.free(cursor);
                freed += 1;
            } else {
                prev = Some(ptr);
                prev_offset = cursor;
            }
            cursor = next;
        }

        tail_anchor.store(prev_offset, Ordering::Release);
        if freed > 0 {
            log::debug!("map {:?}: released {freed} slots", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        common::{test_utils::IdentityState, time::{Clock, Mock}},
        segment::HeapSegment,
        Map,
    };

    fn mocked_map(
        buckets: u32,
        capacity: u32,
    ) -> (Map<u64, u64, IdentityState>, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        let segment = Arc::new(HeapSegment::new(1 << 20));
        let map = Map::builder("test", capacity)
            .bucket_count(buckets)
            .hasher(IdentityState)
            .clock(clock)
            .build(segment)
            .unwrap();
        (map, mock)
    }

    #[test]
    fn expired_entry_is_invisible_then_reclaimed() {
        let (map, mock) = mocked_map(4, 16);
        let free_at_start = map.inner().pool.free_count();

        map.insert_with_ttl(7, 7, Duration::from_secs(2)).unwrap();
        mock.increment(Duration::from_secs(1));
        assert_eq!(map.get(&7), Some(7));

        mock.increment(Duration::from_secs(2));
        assert_eq!(map.get(&7), None, "expired entries read as absent");

        // First sweep stages the entry; second, a window later, frees it.
        map.gc();
        assert_eq!(map.entry_count(), 0);
        assert_eq!(map.inner().pool.free_count(), free_at_start - 1);

        mock.increment(Duration::from_millis(2500));
        map.gc();
        assert_eq!(map.inner().pool.free_count(), free_at_start);
        assert_eq!(
            map.inner().garbage_head().load(Ordering::Acquire),
            NIL_OFFSET,
            "the garbage list drains completely"
        );
    }

    #[test]
    fn exhausted_pool_recovers_after_two_sweeps() {
        let (map, mock) = mocked_map(4, 2);
        map.insert_with_ttl(1, 1, Duration::from_secs(1)).unwrap();
        map.insert_with_ttl(2, 2, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            map.insert(3, 3),
            Err(crate::Error::NoMemory)
        ));

        mock.increment(Duration::from_secs(3));
        map.gc();
        mock.increment(Duration::from_secs(3));
        map.gc();

        map.insert(3, 3).unwrap();
        assert_eq!(map.get(&3), Some(3));
    }

    #[test]
    fn never_expiring_entries_survive_sweeps() {
        let (map, mock) = mocked_map(4, 16);
        map.insert(1, 10).unwrap();
        map.insert_with_ttl(2, 20, Duration::from_secs(1)).unwrap();

        mock.increment(Duration::from_secs(1000));
        map.gc();
        mock.increment(Duration::from_secs(3));
        map.gc();

        assert_eq!(map.get(&1), Some(10));
        assert_eq!(map.get(&2), None);
        assert_eq!(map.entry_count(), 1);
    }

    #[test]
    fn sweeps_are_throttled_within_a_window() {
        let (map, mock) = mocked_map(4, 16);
        map.insert_with_ttl(1, 1, Duration::from_secs(1)).unwrap();
        mock.increment(Duration::from_secs(3));

        map.gc();
        assert_eq!(map.entry_count(), 0);
        let staged = map.inner().pool.free_count();

        // Within the same window a second call must not run phase two.
        map.gc();
        assert_eq!(map.inner().pool.free_count(), staged);

        mock.increment(Duration::from_secs(BREAK_TIME_SECS as u64));
        map.gc();
        assert_eq!(map.inner().pool.free_count(), staged + 1);
    }

    #[test]
    fn whole_chain_drains_head_first() {
        // One bucket, several expiring entries: the head path and the
        // interior path both run.
        let (map, mock) = mocked_map(1, 8);
        for key in 0..5u64 {
            map.insert_with_ttl(key, key, Duration::from_secs(1)).unwrap();
        }
        let free_after_insert = map.inner().pool.free_count();

        mock.increment(Duration::from_secs(3));
        map.gc();
        mock.increment(Duration::from_secs(3));
        map.gc();
        mock.increment(Duration::from_secs(3));
        map.gc();
        mock.increment(Duration::from_secs(3));
        map.gc();

        assert_eq!(map.entry_count(), 0);
        assert_eq!(map.keys(), Vec::<u64>::new());
        assert_eq!(map.inner().pool.free_count(), free_after_insert + 5);
    }

    #[test]
    fn overwritten_entry_is_not_collected() {
        let (map, mock) = mocked_map(4, 16);
        map.insert_with_ttl(1, 10, Duration::from_secs(1)).unwrap();

        // Refresh before expiry; the sweep must leave the entry alone.
        map.insert_with_ttl(1, 11, Duration::from_secs(1000)).unwrap();
        mock.increment(Duration::from_secs(3));
        map.gc();
        mock.increment(Duration::from_secs(3));
        map.gc();

        assert_eq!(map.get(&1), Some(11));
        assert_eq!(map.entry_count(), 1);
    }

    #[test]
    fn stuck_collecting_entry_is_recovered_after_grace() {
        let (map, mock) = mocked_map(1, 8);

        // Entry 1 sits between two never-expiring neighbors, so it stays
        // interior to the chain for the whole test.
        map.insert(0, 0).unwrap();
        map.insert_with_ttl(1, 1, Duration::from_secs(1)).unwrap();
        map.insert(2, 2).unwrap();
        let free_after_insert = map.inner().pool.free_count();

        // Simulate a reclaimer that died after claiming entry 1 but before
        // enlisting it.
        let node = map.inner().find_node(0, &1).unwrap();
        unsafe { node.as_ref() }
            .state
            .store(state::COLLECTING, Ordering::Release);

        // Within GRACE the sweep leaves the claimed node alone.
        mock.increment(Duration::from_secs(3));
        map.gc();
        assert!(map.keys().contains(&1));

        // Past GRACE it is force-enlisted and eventually freed.
        mock.increment(Duration::from_secs(GRACE_SECS as u64 + 3));
        map.gc();
        assert!(!map.keys().contains(&1));
        mock.increment(Duration::from_secs(3));
        map.gc();

        assert_eq!(map.get(&0), Some(0));
        assert_eq!(map.get(&2), Some(2));
        assert_eq!(map.get(&1), None);
        assert_eq!(map.inner().pool.free_count(), free_after_insert + 1);
    }
}
