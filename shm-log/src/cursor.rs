//! Scoped access to the slots of a log.
use core::marker::PhantomData;
use core::ptr::NonNull;

use bytemuck::Pod;

use crate::layout::LogLayout;
use crate::LogError;

/// Exclusive access to one reserved, not yet published slot.
///
/// The record is published when the cursor is dropped, on every path including unwinding. Until
/// then no reader can observe it. A fresh slot reads as all zero bytes.
pub struct WriteCursor<'log, T> {
    layout: &'log LogLayout,
    index: usize,
    record: NonNull<T>,
    _marker: PhantomData<&'log mut T>,
}

/// A restartable walk along the published chain.
///
/// Readers never modify shared state. Any number of cursors, in any process, can walk the same
/// chain at different positions.
pub struct ReadCursor<'log, T> {
    layout: &'log LogLayout,
    position: usize,
    _marker: PhantomData<&'log T>,
}

impl<'log, T: Pod> WriteCursor<'log, T> {
    /// Reserve a slot.
    ///
    /// The layout's cell size must have been validated for `T`.
    pub(crate) fn new(layout: &'log LogLayout) -> Result<Self, LogError> {
        let index = layout.allocate().ok_or(LogError::CapacityExhausted)?;
        // An allocated index always has content.
        let record = layout
            .content_mut(index)
            .and_then(|ptr| NonNull::new(ptr as *mut T))
            .ok_or(LogError::CapacityExhausted)?;

        Ok(WriteCursor {
            layout,
            index,
            record,
            _marker: PhantomData,
        })
    }

    /// The index of the reserved slot.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T: Pod> core::ops::Deref for WriteCursor<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the slot is ours until drop, large and aligned enough for `T`, and any bytes are
        // a valid `T`.
        unsafe { self.record.as_ref() }
    }
}

impl<T: Pod> core::ops::DerefMut for WriteCursor<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see `deref`, no one else accesses the slot before it is appended.
        unsafe { self.record.as_mut() }
    }
}

impl<T> Drop for WriteCursor<'_, T> {
    fn drop(&mut self) {
        self.layout.append(self.index);
    }
}

impl<'log, T: Pod> ReadCursor<'log, T> {
    pub(crate) fn new(layout: &'log LogLayout) -> Self {
        ReadCursor {
            layout,
            position: layout.first(),
            _marker: PhantomData,
        }
    }

    /// Go back to before the first record.
    pub fn reset(&mut self) {
        self.position = self.layout.first();
    }

    /// Advance to the next published record.
    ///
    /// Returns `false`, staying in place, if nothing was published after the current position
    /// yet. Call again later to poll for new records.
    pub fn next(&mut self) -> bool {
        match self.layout.next(self.position) {
            crate::SENTINEL => false,
            next => {
                self.position = next;
                true
            }
        }
    }

    /// The slot index of the current position, the sentinel before the first `next`.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The record at the current position.
    ///
    /// Published records are immutable for the lifetime of the mapping, so the reference is not
    /// tied to the cursor.
    pub fn record(&self) -> Option<&'log T> {
        let ptr = self.layout.content(self.position)?;
        // Safety: the position was reached through an acquire load of its link, so the writer's
        // stores are visible and no one writes the slot anymore.
        Some(unsafe { &*(ptr as *const T) })
    }
}
