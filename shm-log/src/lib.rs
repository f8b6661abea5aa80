//! A lock-free append log shared between processes.
//!
//! A log is a named POSIX shared memory object holding a fixed number of fixed-size slots. Any
//! process that maps it can publish records and walk the published sequence. After mapping there
//! are no syscalls, locks or coordinator: writers reserve a slot with a bump allocator, construct
//! their record in place and link the slot to the end of a singly-linked list with two
//! compare-and-swap steps. Readers follow the links with acquire loads.
//!
//! ```no_run
//! use shm_log::Log;
//!
//! let mut log = Log::<[u64; 4]>::new("quotes", 1, 1024);
//! log.create().unwrap();
//! log.push([1, 2, 3, 4]).unwrap();
//!
//! let mut reader = log.read_cursor().unwrap();
//! while reader.next() {
//!     println!("{:?}", reader.record());
//! }
//! ```
//!
//! ## The log only grows
//!
//! Slots are never freed or reused. Once all slots are handed out, every further write fails
//! with [`LogError::CapacityExhausted`] for the remaining lifetime of the segment. There is no
//! notification of new records either; readers poll [`ReadCursor::next`].
//!
//! ## Crashes
//!
//! A writer that dies while holding a [`WriteCursor`] leaks its slot, it is never published. A
//! writer that dies after linking its slot but before advancing the tail hint is repaired by the
//! next append of any process.
//!
//! ## Destroying segments
//!
//! Removing the backing object is global, see [`Log`] and [`Cleanup`]. In the default cleanup
//! mode a failed `attach` removes the segment for everyone.
mod cursor;
mod error;
mod layout;
mod log;
mod op;
mod segment;


pub use cursor::{ReadCursor, WriteCursor};
pub use error::LogError;
pub use layout::{Geometry, LogLayout, CACHE_LINE, HEADER_SIZE, SENTINEL};
pub use log::Log;
pub use op::{OpenMode, Shm, ShmVTable};
pub use segment::{Cleanup, Segment, SegmentName};
