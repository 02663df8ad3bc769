use std::{
    alloc::Layout,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use crossbeam_utils::Backoff;
use shared_memory::{Shmem, ShmemConf, ShmemError};

use super::{align_up, Segment};
use crate::Error;

const SEGMENT_MAGIC: u64 = 0x5348_4d41_5030_3031; // "SHMAP001"
const SEGMENT_VERSION: u32 = 1;

const MAX_REGIONS: usize = 64;
const MAX_NAME_LEN: usize = 40;

// How long a late opener waits for the creator to publish the header before
// giving up. Each step is a `Backoff::snooze`, which yields once spinning
// stops paying off.
const INIT_WAIT_STEPS: usize = 1 << 16;

#[repr(C)]
struct RegionEntry {
    name: [u8; MAX_NAME_LEN],
    name_len: u32,
    _pad: u32,
    offset: u64,
    size: u64,
}

#[repr(C)]
struct SegmentHeader {
    magic: u64,
    version: u32,
    /// 0 while the creator formats the header, 1 once the arena is usable.
    init_flag: AtomicU32,
    /// Registry spinlock: 0 unlocked, 1 locked.
    lock: AtomicU32,
    region_count: AtomicU32,
    /// Bump cursor for anonymous and named allocations.
    next_offset: AtomicU64,
    regions: [RegionEntry; MAX_REGIONS],
}

/// An arena over an operating system shared-memory object.
///
/// The first bytes of the mapping hold a header with a magic/version word, a
/// bump allocator, and a fixed-size named-region table. Registry writes are
/// serialized by an atomic spinlock; construction of a region's contents
/// happens under that lock, so a name never resolves to a half-initialized
/// region in any process.
///
/// Dropping the handle unmaps only. Unlinking the underlying OS object is
/// the explicit owner's job: call [`set_owner(true)`](Self::set_owner) on
/// exactly one handle if the object should disappear when that handle drops.
pub struct ShmSegment {
    shmem: Shmem,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping stays valid for the lifetime of `shmem`; concurrent
// access to arena contents is synchronized by the atomics embedded in them,
// and registry mutation is serialized by the header spinlock.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Opens the shared-memory object `os_id`, creating and formatting it
    /// when absent.
    ///
    /// Whichever process wins the exclusive create formats the header; every
    /// other process waits for the `init_flag` publication and then
    /// validates the magic and version words.
    pub fn open(os_id: &str, len: usize) -> Result<Self, Error> {
        if len < mem::size_of::<SegmentHeader>() + 64 {
            return Err(Error::BadSegment);
        }

        match ShmemConf::new().size(len).os_id(os_id).create() {
            Ok(shmem) => Self::format(shmem),
            Err(ShmemError::MappingIdExists) => {
                let shmem = ShmemConf::new().os_id(os_id).open()?;
                Self::join(os_id, shmem)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// When `owner` is true, dropping this handle also removes the OS
    /// object. Returns the previous ownership state.
    pub fn set_owner(&mut self, owner: bool) -> bool {
        self.shmem.set_owner(owner)
    }

    fn format(shmem: Shmem) -> Result<Self, Error> {
        let base = NonNull::new(shmem.as_ptr()).ok_or(Error::BadSegment)?;
        let len = shmem.len();

        // Freshly created objects are zero-filled by the OS, so the atomics
        // already read as zero; only the plain words need writing before the
        // release publication below.
        unsafe {
            let header = base.as_ptr().cast::<SegmentHeader>();
            ptr::addr_of_mut!((*header).magic).write(SEGMENT_MAGIC);
            ptr::addr_of_mut!((*header).version).write(SEGMENT_VERSION);
        }

        let segment = Self { shmem, base, len };
        let data_start = align_up(mem::size_of::<SegmentHeader>() as u64, 64);
        segment.header().next_offset.store(data_start, Ordering::Relaxed);
        segment.header().init_flag.store(1, Ordering::Release);
        Ok(segment)
    }

    fn join(os_id: &str, shmem: Shmem) -> Result<Self, Error> {
        let base = NonNull::new(shmem.as_ptr()).ok_or(Error::BadSegment)?;
        let len = shmem.len();
        let segment = Self { shmem, base, len };

        let backoff = Backoff::new();
        let mut ready = false;
        for _ in 0..INIT_WAIT_STEPS {
            if segment.header().init_flag.load(Ordering::Acquire) == 1 {
                ready = true;
                break;
            }
            backoff.snooze();
        }
        if !ready {
            return Err(Error::Unready { name: os_id.into() });
        }

        let header = segment.header();
        if header.magic != SEGMENT_MAGIC || header.version != SEGMENT_VERSION {
            return Err(Error::BadSegment);
        }
        Ok(segment)
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is page-aligned and at least header-sized,
        // checked in `open`.
        unsafe { &*self.base.as_ptr().cast::<SegmentHeader>() }
    }

    fn lock_registry(&self) -> RegistryGuard<'_> {
        let lock = &self.header().lock;
        let backoff = Backoff::new();
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        RegistryGuard { lock }
    }

    /// Bumps the cursor. Must be called with the registry lock held.
    fn bump(&self, layout: Layout) -> Result<u64, Error> {
        let next = &self.header().next_offset;
        let align = (layout.align() as u64).max(8);
        let offset = align_up(next.load(Ordering::Relaxed), align);
        let end = offset
            .checked_add(layout.size() as u64)
            .filter(|&end| end <= self.len as u64)
            .ok_or(Error::SegmentFull {
                requested: layout.size(),
                remaining: (self.len as u64).saturating_sub(next.load(Ordering::Relaxed)) as usize,
            })?;
        next.store(end, Ordering::Relaxed);
        Ok(offset)
    }

    fn entry_ptr(&self, index: usize) -> *mut RegionEntry {
        let header = self.base.as_ptr().cast::<SegmentHeader>();
        unsafe { ptr::addr_of_mut!((*header).regions).cast::<RegionEntry>().add(index) }
    }
}

struct RegistryGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

impl Segment for ShmSegment {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn allocate(&self, layout: Layout) -> Result<u64, Error> {
        let _guard = self.lock_registry();
        self.bump(layout)
    }

    fn find_or_construct(
        &self,
        name: &str,
        layout: Layout,
        init: &mut dyn FnMut(NonNull<u8>),
    ) -> Result<u64, Error> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong {
                name: name.into(),
                max: MAX_NAME_LEN,
            });
        }

        let header = self.header();
        let _guard = self.lock_registry();

        let count = header.region_count.load(Ordering::Acquire) as usize;
        for index in 0..count {
            let entry = unsafe { &*self.entry_ptr(index) };
            if &entry.name[..entry.name_len as usize] == name.as_bytes() {
                if entry.size != layout.size() as u64 {
                    return Err(Error::RegionMismatch { name: name.into() });
                }
                return Ok(entry.offset);
            }
        }

        if count == MAX_REGIONS {
            return Err(Error::RegistryFull);
        }

        let offset = self.bump(layout)?;
        init(self.ptr_at(offset));

        // Record the entry, then publish the new count.
        unsafe {
            let entry = self.entry_ptr(count);
            ptr::addr_of_mut!((*entry).name)
                .cast::<u8>()
                .copy_from_nonoverlapping(name.as_ptr(), name.len());
            ptr::addr_of_mut!((*entry).name_len).write(name.len() as u32);
            ptr::addr_of_mut!((*entry).offset).write(offset);
            ptr::addr_of_mut!((*entry).size).write(layout.size() as u64);
        }
        header.region_count.store(count as u32 + 1, Ordering::Release);
        Ok(offset)
    }
}
