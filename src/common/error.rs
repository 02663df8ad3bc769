/// The error type for segment attachment, pool attachment, and map updates.
///
/// Lookup misses are not errors: [`Map::get`][get-method] returns `None` for
/// a missing or expired key.
///
/// [get-method]: crate::Map::get
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The slab pool has no free slot left for a new entry.
    ///
    /// This is also returned when the free ring is transiently empty because
    /// concurrent frees have not finished publishing their offsets; callers
    /// treat both cases the same way.
    #[error("slab pool exhausted")]
    NoMemory,

    /// The arena cannot satisfy an allocation request.
    #[error("arena cannot fit {requested} more bytes ({remaining} remaining)")]
    SegmentFull { requested: usize, remaining: usize },

    /// A named region exists but was created with a different size, which
    /// means another process attached with incompatible parameters.
    #[error("named region {name:?} exists with a different size")]
    RegionMismatch { name: String },

    /// Region names are stored inline in the shared registry and have a
    /// fixed maximum length.
    #[error("region name {name:?} is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },

    /// The shared registry has a fixed number of named-region entries.
    #[error("the named-region table is full")]
    RegistryFull,

    /// The mapped segment does not carry a valid header, or carries one
    /// written by an incompatible version of this crate.
    #[error("segment header is missing or from an incompatible version")]
    BadSegment,

    /// Another process created the named object but has not finished
    /// initializing it.
    #[error("{name:?} was created by another process and is still initializing")]
    Unready { name: String },

    /// The pool metadata found under this name describes a different slot
    /// geometry than the one requested.
    #[error("pool {name:?} exists with a different slot geometry")]
    PoolMismatch { name: String },

    /// The requested capacity does not fit the arena address space.
    #[error("{name:?} geometry overflows the arena address space")]
    CapacityOverflow { name: String },

    /// The operating system refused to create or map the shared memory
    /// object.
    #[error("shared memory mapping failed: {0}")]
    Shmem(#[from] shared_memory::ShmemError),
}
