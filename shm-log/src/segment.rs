//! Lifecycle of the named shared memory object backing a log.
use std::collections::hash_map::DefaultHasher;
use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};
use std::io;

use memmap2::{MmapOptions, MmapRaw};

use crate::layout::LogLayout;
use crate::op::{OpenMode, Shm, ShmFd};
use crate::LogError;

/// What a failed `create` or `attach` does with the backing object.
///
/// The default removes the object on every failure after it was opened. This ends the log for
/// every other process still using it, including the winner of a creation race and all
/// participants when one attacher passes a mismatched record size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cleanup {
    /// Remove the object on any failure after it was opened.
    #[default]
    Destroy,
    /// Only remove an object this call created and then failed to size or map.
    Preserve,
}

/// The system name and identity mark of a segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentName {
    path: CString,
    mark: u64,
}

/// A mapped and validated log region.
pub struct Segment {
    // Declared before `map` so the view is gone before the region is unmapped.
    layout: LogLayout,
    map: MmapRaw,
}

impl SegmentName {
    /// Bytes of the user supplied name that go into the system name.
    pub const MAX_NAME: usize = 128;

    pub fn new(name: &str, version: u64) -> Result<Self, LogError> {
        if name.contains(['/', '\0']) {
            return Err(LogError::InvalidName);
        }

        let mut end = name.len().min(Self::MAX_NAME);
        while !name.is_char_boundary(end) {
            end -= 1;
        }

        let path = format!("/{}-{}", &name[..end], version);
        let path = CString::new(path).map_err(|_| LogError::InvalidName)?;

        Ok(SegmentName {
            path,
            mark: Self::mark_of(name, version),
        })
    }

    pub fn path(&self) -> &CStr {
        &self.path
    }

    /// The identity fingerprint stored in the header.
    pub fn mark(&self) -> u64 {
        self.mark
    }

    fn mark_of(name: &str, version: u64) -> u64 {
        // `DefaultHasher::new` uses fixed keys, but its algorithm may change between releases of
        // the standard library. Only processes built by the same toolchain agree on the mark.
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let name_hash = hasher.finish();

        let mut hasher = DefaultHasher::new();
        version.hash(&mut hasher);
        name_hash ^ hasher.finish()
    }
}

impl Segment {
    /// Create, size, map and initialize a new segment.
    ///
    /// Fails without side effects if the object exists already. All later failures unmap and,
    /// subject to `cleanup`, remove the object.
    pub fn create(
        shm: &Shm,
        name: &SegmentName,
        record_size: usize,
        capacity: usize,
        cleanup: Cleanup,
    ) -> Result<Self, LogError> {
        let size = LogLayout::total_size(record_size, capacity).ok_or_else(|| {
            LogError::Resize(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size overflows the address space",
            ))
        })?;

        // The object could never be sized, so fail before creating it.
        if libc::off_t::try_from(size).is_err() {
            return Err(LogError::Resize(io::Error::from_raw_os_error(libc::EFBIG)));
        }

        let fd = shm
            .open(name.path(), OpenMode::CreateExclusive)
            .map_err(LogError::AlreadyExists)?;

        let result = Self::create_in(shm, fd, name, record_size, capacity, size);
        if let Err(err) = &result {
            let ours = matches!(err, LogError::Resize(_) | LogError::Map(_));
            if ours || cleanup == Cleanup::Destroy {
                remove_after(shm, name, err);
            }
        } else {
            tracing::debug!(segment = ?name.path(), size, capacity, "created segment");
        }

        result
    }

    /// Open, map and validate an existing segment.
    ///
    /// With [`Cleanup::Destroy`] every failure, even a missing object or a mismatched record
    /// size, removes the object for all processes.
    pub fn attach(
        shm: &Shm,
        name: &SegmentName,
        record_size: usize,
        cleanup: Cleanup,
    ) -> Result<Self, LogError> {
        let result = Self::attach_in(shm, name, record_size);
        match &result {
            Err(err) if cleanup == Cleanup::Destroy => remove_after(shm, name, err),
            Err(_) => {}
            Ok(segment) => {
                tracing::debug!(
                    segment = ?name.path(),
                    capacity = segment.layout.capacity(),
                    "attached segment"
                );
            }
        }

        result
    }

    /// Remove the backing object for every process.
    ///
    /// Existing mappings, in this or other processes, stay readable until they are unmapped. No
    /// process can attach anymore afterwards.
    pub fn detach(shm: &Shm, name: &SegmentName) -> Result<(), LogError> {
        shm.unlink(name.path()).map_err(LogError::Remove)?;
        tracing::debug!(segment = ?name.path(), "removed segment");
        Ok(())
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    /// The mapped length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    fn create_in(
        shm: &Shm,
        fd: ShmFd,
        name: &SegmentName,
        record_size: usize,
        capacity: usize,
        size: usize,
    ) -> Result<Self, LogError> {
        shm.truncate(&fd, size as u64).map_err(LogError::Resize)?;
        let map = map_shared(&fd, size).map_err(LogError::Map)?;
        drop(fd);

        // Safety: the map is valid for its length and kept alongside the view.
        let mut layout = unsafe { LogLayout::from_raw(map.as_mut_ptr(), map.len()) }
            .ok_or(LogError::IdentityMismatch)?;

        if !layout.initialize(name.mark(), record_size, capacity) {
            return Err(LogError::InitializationRace);
        }

        Ok(Segment { layout, map })
    }

    fn attach_in(shm: &Shm, name: &SegmentName, record_size: usize) -> Result<Self, LogError> {
        let fd = shm.open(name.path(), OpenMode::Existing).map_err(LogError::Open)?;
        let size = shm.size(&fd).map_err(LogError::Stat)?;
        let size = usize::try_from(size).map_err(|_| {
            LogError::Stat(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment larger than the address space",
            ))
        })?;

        let map = map_shared(&fd, size).map_err(LogError::Map)?;
        drop(fd);

        // Safety: the map is valid for its length and kept alongside the view.
        let mut layout = unsafe { LogLayout::from_raw(map.as_mut_ptr(), map.len()) }
            .ok_or(LogError::IdentityMismatch)?;

        if !layout.check(name.mark(), record_size) {
            return Err(LogError::IdentityMismatch);
        }

        Ok(Segment { layout, map })
    }
}

fn map_shared(fd: &ShmFd, len: usize) -> io::Result<MmapRaw> {
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "segment is empty"));
    }

    MmapOptions::new().len(len).map_raw(fd.as_raw_fd())
}

fn remove_after(shm: &Shm, name: &SegmentName, cause: &LogError) {
    if !cause.is_post_open() {
        return;
    }

    tracing::warn!(segment = ?name.path(), %cause, "removing segment after failure");
    if let Err(err) = shm.unlink(name.path()) {
        tracing::warn!(segment = ?name.path(), %err, "failed to remove segment");
    }
}
