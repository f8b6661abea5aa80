use core::marker::PhantomData;

use bytemuck::Pod;

use crate::cursor::{ReadCursor, WriteCursor};
use crate::layout::CACHE_LINE;
use crate::op::Shm;
use crate::segment::{Cleanup, Segment, SegmentName};
use crate::LogError;

/// A typed, per-process handle on a shared log.
///
/// All cooperating processes construct the handle with the same name, version and record type.
/// One of them calls [`Log::create`], the others [`Log::attach`].
///
/// # Unmapping versus destroying
///
/// The mapping is local to this handle. [`Log::close`] drops it and leaves the segment in place
/// for everyone else. [`Log::detach`] *removes the segment for all processes*, and it is what a
/// handle that still holds a mapping does when it is dropped. Call `close` first to keep the log
/// alive beyond this handle.
pub struct Log<T> {
    name: String,
    version: u64,
    capacity: usize,
    cleanup: Cleanup,
    shm: Shm,
    segment: Option<Segment>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Pod> Log<T> {
    const RECORD_ALIGN: () = assert!(
        core::mem::align_of::<T>() <= CACHE_LINE,
        "records must not be aligned beyond a cache line"
    );

    /// A handle for the log `name` at `version`, holding at most `capacity` records once created.
    pub fn new(name: impl Into<String>, version: u64, capacity: usize) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::RECORD_ALIGN;

        Log {
            name: name.into(),
            version,
            capacity,
            cleanup: Cleanup::default(),
            shm: Shm::new(),
            segment: None,
            _record: PhantomData,
        }
    }

    /// Choose what a failed `create` or `attach` does to the backing object.
    pub fn cleanup(mut self, cleanup: Cleanup) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Use another table of OS functions.
    pub fn with_shm(mut self, shm: Shm) -> Self {
        self.shm = shm;
        self
    }

    /// Create the segment. Fails if it already exists.
    pub fn create(&mut self) -> Result<(), LogError> {
        if self.segment.is_some() {
            return Err(LogError::AlreadyMapped);
        }

        let name = self.segment_name()?;
        let segment = Segment::create(
            &self.shm,
            &name,
            core::mem::size_of::<T>(),
            self.capacity,
            self.cleanup,
        )?;

        self.segment = Some(segment);
        Ok(())
    }

    /// Map an existing segment.
    ///
    /// See [`Cleanup`] for the consequences of a failure on other processes.
    pub fn attach(&mut self) -> Result<(), LogError> {
        if self.segment.is_some() {
            return Err(LogError::AlreadyMapped);
        }

        let name = self.segment_name()?;
        let segment = Segment::attach(&self.shm, &name, core::mem::size_of::<T>(), self.cleanup)?;

        self.segment = Some(segment);
        Ok(())
    }

    /// Reserve a slot to construct a record in place. It is published when the cursor drops.
    pub fn write_cursor(&self) -> Result<WriteCursor<'_, T>, LogError> {
        WriteCursor::new(self.mapped()?.layout())
    }

    /// Start a walk over the published records.
    pub fn read_cursor(&self) -> Result<ReadCursor<'_, T>, LogError> {
        Ok(ReadCursor::new(self.mapped()?.layout()))
    }

    /// Publish one record, returning its slot index.
    pub fn push(&self, record: T) -> Result<usize, LogError> {
        let mut cursor = self.write_cursor()?;
        *cursor = record;
        Ok(cursor.index())
    }
}

impl<T> Log<T> {
    /// Remove the segment for every process, then unmap it here.
    ///
    /// Does nothing if the handle holds no mapping.
    pub fn detach(&mut self) -> Result<(), LogError> {
        if self.segment.is_none() {
            return Ok(());
        }

        let name = self.segment_name()?;
        // Unmap regardless of the outcome, the handle is done with the segment.
        self.segment = None;
        Segment::detach(&self.shm, &name)
    }

    /// Unmap the segment from this process, keeping it for everyone else.
    pub fn close(&mut self) {
        self.segment = None;
    }

    pub fn is_mapped(&self) -> bool {
        self.segment.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The capacity of the mapped segment, or the requested one while unmapped.
    pub fn capacity(&self) -> usize {
        self.segment
            .as_ref()
            .map_or(self.capacity, |segment| segment.layout().capacity())
    }

    /// The cell size of the mapped segment.
    pub fn cell_size(&self) -> Option<usize> {
        self.segment.as_ref().map(|segment| segment.layout().cell_size())
    }

    /// The number of slots handed out so far.
    pub fn allocated(&self) -> usize {
        self.segment
            .as_ref()
            .map_or(0, |segment| segment.layout().allocated())
    }

    fn mapped(&self) -> Result<&Segment, LogError> {
        self.segment.as_ref().ok_or(LogError::NotMapped)
    }

    fn segment_name(&self) -> Result<SegmentName, LogError> {
        SegmentName::new(&self.name, self.version)
    }
}

impl<T> Drop for Log<T> {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            tracing::warn!(name = %self.name, version = self.version, %err, "failed to detach log");
        }
    }
}
