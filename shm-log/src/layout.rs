//! The log structure as it resides in shared memory.
//!
//! ```text
//! +-----------------------------------------------+  0
//! | mark | cell_size | capacity | creation_state  |
//! +-----------------------------------------------+  64
//! | tail                                          |
//! +-----------------------------------------------+  128
//! | next free                                     |
//! +-----------------------------------------------+  192
//! | head link (the `next` of the sentinel)        |
//! +-----------------------------------------------+  256
//! | cell 0 = slot 1:  record bytes ..... | next   |
//! | cell 1 = slot 2:  record bytes ..... | next   |
//! | ...                                           |
//! +-----------------------------------------------+  256 + cell_size * capacity
//! ```
//!
//! Slots are addressed by index, never by pointer, as every process maps the region at a
//! different address. Index `0` is the sentinel: it is never allocated, its `next` link is the
//! head of the chain and a `next` link of `0` marks the end of the chain.
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// The alignment of the header groups and of the slot array.
pub const CACHE_LINE: usize = 64;

/// The reserved index of the head of the chain.
pub const SENTINEL: usize = 0;

/// The bytes of the header preceding the slot array.
pub const HEADER_SIZE: usize = 4 * CACHE_LINE;

const LINK_SIZE: usize = core::mem::size_of::<AtomicUsize>();

const STATE_AVAILABLE: u32 = 0;
const STATE_NOT_AVAILABLE: u32 = 1;

#[repr(C, align(64))]
struct Line<T>(T);

/// Written once by the creator, under the creation guard.
#[repr(C)]
struct Meta {
    mark: AtomicU64,
    cell_size: AtomicUsize,
    capacity: AtomicUsize,
    state: AtomicU32,
}

#[repr(C)]
struct Header {
    meta: Line<Meta>,
    tail: Line<AtomicUsize>,
    unused: Line<AtomicUsize>,
    head: Line<AtomicUsize>,
}

const _: () = assert!(core::mem::size_of::<Header>() == HEADER_SIZE);
const _: () = assert!(core::mem::align_of::<Header>() == CACHE_LINE);

/// The dimensions of a slot array, as agreed on by `initialize` or `check`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub cell_size: usize,
    pub capacity: usize,
}

/// A view of a log region.
///
/// # Safety
///
/// The `'static` lifetime of the header is a lie, the region is owned by whoever passed it to
/// [`LogLayout::from_raw`]. A `Segment` pairs this view with the mapping that keeps it alive and
/// never hands the reference out with its unchanged lifetime.
///
/// All header fields and links are atomics, so we do not need uniqueness of the pointer. Record
/// bytes are written through raw pointers only by the owner of a freshly allocated slot.
pub struct LogLayout {
    header: &'static Header,
    cells: NonNull<u8>,
    cells_len: usize,
    /// Our process internal copy of the geometry. Addressing never trusts the shared header after
    /// it has been validated against the region length.
    geometry: Geometry,
}

// Safety: all shared state is accessed through atomics or through slots owned by one writer.
unsafe impl Send for LogLayout {}
unsafe impl Sync for LogLayout {}

impl LogLayout {
    /// The size of a cell holding a record of `record_size` bytes and its link.
    pub fn cell_size_for(record_size: usize) -> Option<usize> {
        record_size.checked_add(LINK_SIZE)?.checked_next_power_of_two()
    }

    /// The total region size for `capacity` records of `record_size` bytes.
    pub fn total_size(record_size: usize, capacity: usize) -> Option<usize> {
        Self::cell_size_for(record_size)?
            .checked_mul(capacity)?
            .checked_add(HEADER_SIZE)
    }

    /// View a region as a log.
    ///
    /// Returns `None` if the region can not hold the header or is not aligned to a cache line.
    /// The view has no geometry until [`Self::initialize`] or [`Self::check`] succeeds.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an allocation valid for reads and writes of `len` bytes, for as long as
    /// the returned value exists. Memory not yet initialized by a log must be zeroed.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        if len < HEADER_SIZE || ptr.as_ptr() as usize % CACHE_LINE != 0 {
            return None;
        }

        Some(LogLayout {
            header: &*(ptr.as_ptr() as *const Header),
            cells: NonNull::new_unchecked(ptr.as_ptr().add(HEADER_SIZE)),
            cells_len: len - HEADER_SIZE,
            geometry: Geometry::default(),
        })
    }

    /// Write the header, if we win the creation guard.
    ///
    /// Also refuses, returning `false`, a capacity that does not fit into the region.
    pub fn initialize(&mut self, mark: u64, record_size: usize, capacity: usize) -> bool {
        let Some(cell_size) = Self::cell_size_for(record_size) else {
            return false;
        };

        let geometry = Geometry {
            cell_size,
            capacity,
        };

        if !self.fits(geometry) {
            return false;
        }

        let meta = &self.header.meta.0;
        if meta
            .state
            .compare_exchange(
                STATE_AVAILABLE,
                STATE_NOT_AVAILABLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        meta.mark.store(mark, Ordering::Relaxed);
        meta.cell_size.store(cell_size, Ordering::Relaxed);
        meta.capacity.store(capacity, Ordering::Relaxed);
        self.header.tail.0.store(SENTINEL, Ordering::Relaxed);
        self.header.unused.0.store(1, Ordering::Relaxed);
        self.header.head.0.store(SENTINEL, Ordering::Relaxed);
        // Publishes all the stores above to `check`.
        meta.state.store(STATE_AVAILABLE, Ordering::Release);

        self.geometry = geometry;
        true
    }

    /// Validate an initialized header against the expected identity.
    pub fn check(&mut self, mark: u64, record_size: usize) -> bool {
        let meta = &self.header.meta.0;
        if meta.state.load(Ordering::Acquire) != STATE_AVAILABLE {
            return false;
        }

        let Some(cell_size) = Self::cell_size_for(record_size) else {
            return false;
        };

        let geometry = Geometry {
            cell_size: meta.cell_size.load(Ordering::Relaxed),
            capacity: meta.capacity.load(Ordering::Relaxed),
        };

        if meta.mark.load(Ordering::Relaxed) != mark
            || geometry.cell_size != cell_size
            || !self.fits(geometry)
        {
            return false;
        }

        self.geometry = geometry;
        true
    }

    /// Reserve the next unused slot.
    ///
    /// Returns `None` once all `capacity` slots are handed out; this is permanent.
    pub fn allocate(&self) -> Option<usize> {
        let unused = &self.header.unused.0;
        let mut index = unused.load(Ordering::Acquire);

        loop {
            if index == SENTINEL || index > self.geometry.capacity {
                return None;
            }

            match unused.compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(index),
                Err(current) => index = current,
            }
        }
    }

    /// Link an allocated slot to the end of the chain, publishing it.
    ///
    /// The tail is only a hint. A writer that stopped between linking its slot and advancing the
    /// tail leaves a tail with a successor, which the next append advances past.
    ///
    /// # Contract
    ///
    /// `index` must come from [`Self::allocate`] and be appended once, by its single owner. A slot
    /// that is found in the chain already, as the tail or with a successor, is left untouched. Two
    /// concurrent appends of the same slot are not detected and may link it into a cycle.
    pub fn append(&self, index: usize) {
        debug_assert!(
            self.cell_offset(index).is_some(),
            "append of a slot that was never allocated: {index}"
        );

        let Some(own) = self.link(index) else {
            return;
        };

        if index == SENTINEL || own.load(Ordering::Acquire) != SENTINEL {
            return;
        }

        let tail = &self.header.tail.0;
        let mut current = tail.load(Ordering::Acquire);

        loop {
            // Walked onto the slot itself, it is published.
            if current == index {
                break;
            }

            // A tail outside the geometry restarts the walk at the head.
            let link = self.link(current).unwrap_or(&self.header.head.0);

            // CAS 1. Link behind the believed tail, if it has no successor yet. Either way we
            // learn of a better tail.
            let (linked, advanced) =
                match link.compare_exchange(SENTINEL, index, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => (true, index),
                    Err(successor) => (false, successor),
                };

            // CAS 2. Advance the tail, possibly on behalf of another writer.
            current = match tail.compare_exchange(
                current,
                advanced,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => advanced,
                Err(fresh) => fresh,
            };

            if linked {
                break;
            }
        }
    }

    /// The position traversal starts from.
    pub fn first(&self) -> usize {
        SENTINEL
    }

    /// The published successor of `index`, or the sentinel if there is none (yet).
    pub fn next(&self, index: usize) -> usize {
        let Some(link) = self.link(index) else {
            return SENTINEL;
        };

        match link.load(Ordering::Acquire) {
            next if next <= self.geometry.capacity => next,
            _ => SENTINEL,
        }
    }

    /// The record bytes of a slot.
    pub fn content(&self, index: usize) -> Option<*const u8> {
        self.content_mut(index).map(|ptr| ptr as *const u8)
    }

    /// The record bytes of a slot, for its writer.
    pub fn content_mut(&self, index: usize) -> Option<*mut u8> {
        let offset = self.cell_offset(index)?;
        // Safety: `cell_offset` only returns offsets of cells within `cells_len`.
        Some(unsafe { self.cells.as_ptr().add(offset) })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn capacity(&self) -> usize {
        self.geometry.capacity
    }

    pub fn cell_size(&self) -> usize {
        self.geometry.cell_size
    }

    /// The number of slots handed out so far, published or not.
    pub fn allocated(&self) -> usize {
        let unused = self.header.unused.0.load(Ordering::Acquire);
        unused.saturating_sub(1).min(self.geometry.capacity)
    }

    /// The current tail hint.
    pub fn tail(&self) -> usize {
        self.header.tail.0.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn header_state(&self) -> &AtomicU32 {
        &self.header.meta.0.state
    }

    #[cfg(test)]
    pub(crate) fn header_tail(&self) -> &AtomicUsize {
        &self.header.tail.0
    }

    fn fits(&self, geometry: Geometry) -> bool {
        geometry
            .cell_size
            .checked_mul(geometry.capacity)
            .map_or(false, |len| len <= self.cells_len)
    }

    fn cell_offset(&self, index: usize) -> Option<usize> {
        if index == SENTINEL || index > self.geometry.capacity {
            return None;
        }

        Some((index - 1) * self.geometry.cell_size)
    }

    pub(crate) fn link(&self, index: usize) -> Option<&AtomicUsize> {
        if index == SENTINEL {
            return Some(&self.header.head.0);
        }

        let end = self.cell_offset(index)? + self.geometry.cell_size;
        // Safety: in bounds as the cell is. Aligned as the cell size is a power-of-two of at least
        // the link size and the cells start cache line aligned.
        Some(unsafe { &*(self.cells.as_ptr().add(end - LINK_SIZE) as *const AtomicUsize) })
    }
}
