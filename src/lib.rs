#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A concurrent expiring hash map backed by a fixed-capacity slab allocator
//! in shared memory.
//!
//! Entries live inside a pre-sized arena and reference each other by byte
//! offset, so the same map can be attached from multiple processes mapping
//! the arena at different base addresses — and from any number of threads
//! within each. Ordinary traffic takes no lock: readers walk bucket chains
//! freely, writers coordinate through a per-entry atomic state word, and
//! expired entries are unlinked and quarantined by a throttled two-phase
//! sweep before their slots return to the pool.
//!
//! # Pieces
//!
//! - [`segment::Segment`] — the arena: offset-addressed bytes plus a
//!   named-region registry. [`segment::ShmSegment`] maps an OS
//!   shared-memory object; [`segment::HeapSegment`] is the process-private
//!   equivalent.
//! - [`pool::SlabPool`] — fixed-size slots handed out by offset through a
//!   lock-free free-slot ring.
//! - [`Map`] — the hash map itself: insert, get, TTL expiry, and the
//!   [`gc`](Map::gc) sweep.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//! use shmap::{segment::HeapSegment, Map};
//!
//! let segment = Arc::new(HeapSegment::new(1 << 20));
//! let map: Map<u64, u64> = Map::builder("sessions", 1000).build(segment).unwrap();
//!
//! map.insert(1, 100).unwrap();
//! map.insert_with_ttl(2, 200, Duration::from_secs(30)).unwrap();
//! assert_eq!(map.get(&1), Some(100));
//!
//! map.gc(); // safe from any thread, self-throttled
//! ```
//!
//! # Caveats
//!
//! Keys and values must be `Copy`: they are stored by value in the arena,
//! and reads may race in-place updates. Counts are approximate. Two
//! processes attaching the same map must agree on geometry and use a
//! deterministic hasher (the default one is).

pub(crate) mod common;
pub mod map;
pub mod pool;
pub mod segment;

pub use common::error::Error;
pub use map::{DeterministicState, Map, MapBuilder};
