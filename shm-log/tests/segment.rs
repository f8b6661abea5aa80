#![cfg(target_family = "unix")]
use core::ffi::c_int;
use std::io;

use shm_log::{
    Cleanup, Geometry, Log, LogError, LogLayout, Segment, SegmentName, Shm, ShmVTable,
};

/// A 40 byte record.
type Quote = [u64; 5];

fn unique(tag: &str) -> String {
    format!("shm-log-segment-{}-{}", std::process::id(), tag)
}

#[test]
fn create_once_then_attach() {
    let name = unique("create-once");

    let mut holder = Log::<Quote>::new(&name, 0x1010_1010, 64);
    holder.create().expect("to create a fresh segment");
    assert_eq!(holder.capacity(), 64);
    assert_eq!(holder.cell_size(), Some(64));

    let mut reader = Log::<Quote>::new(&name, 0x1010_1010, 64);
    assert!(matches!(reader.create(), Err(LogError::AlreadyExists(_))));
    assert!(!reader.is_mapped());

    reader.attach().expect("to attach the existing segment");
    assert_eq!(reader.capacity(), holder.capacity());
    assert_eq!(reader.cell_size(), holder.cell_size());

    holder.push([1, 2, 3, 4, 5]).unwrap();
    let mut cursor = reader.read_cursor().unwrap();
    assert!(cursor.next());
    assert_eq!(cursor.record(), Some(&[1, 2, 3, 4, 5]));
    drop(cursor);

    // The second `create` still fails while attached, and did not remove anything.
    let mut late = Log::<Quote>::new(&name, 0x1010_1010, 64);
    assert!(matches!(late.create(), Err(LogError::AlreadyExists(_))));

    reader.close();
    holder.detach().unwrap();
}

#[test]
fn attach_requires_existing_segment() {
    let mut log = Log::<Quote>::new(unique("missing"), 0, 8);
    match log.attach() {
        Err(LogError::Open(err)) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
        other => panic!("unexpected {:?}", other.err()),
    }
    assert!(!log.is_mapped());
}

#[test]
fn attach_of_other_version_fails() {
    let name = unique("versions");
    let mut holder = Log::<Quote>::new(&name, 1, 8);
    holder.create().unwrap();

    let mut other = Log::<Quote>::new(&name, 2, 8);
    assert!(matches!(other.attach(), Err(LogError::Open(_))));

    let mut same = Log::<Quote>::new(&name, 1, 8);
    same.attach().unwrap();
    same.close();
}

#[test]
fn mismatched_record_removes_segment() {
    let name = unique("mismatch-destroy");
    let mut holder = Log::<Quote>::new(&name, 0, 8);
    holder.create().unwrap();

    let mut wide = Log::<[u64; 8]>::new(&name, 0, 8);
    assert!(matches!(wide.attach(), Err(LogError::IdentityMismatch)));

    // Gone for everyone, including a well-formed attacher.
    let mut fitting = Log::<Quote>::new(&name, 0, 8);
    assert!(matches!(fitting.attach(), Err(LogError::Open(_))));

    // The holder's mapping is still readable.
    holder.push([7; 5]).unwrap();
    assert_eq!(holder.allocated(), 1);
    holder.detach().unwrap();
}

#[test]
fn mismatched_record_preserved_on_request() {
    let name = unique("mismatch-preserve");
    let mut holder = Log::<Quote>::new(&name, 0, 8);
    holder.create().unwrap();

    let mut wide = Log::<[u64; 8]>::new(&name, 0, 8).cleanup(Cleanup::Preserve);
    assert!(matches!(wide.attach(), Err(LogError::IdentityMismatch)));

    let mut fitting = Log::<Quote>::new(&name, 0, 8);
    fitting.attach().unwrap();
    fitting.close();
}

#[test]
fn truncated_names_are_told_apart_by_mark() {
    let prefix = format!("{}{}", unique("truncated"), "p".repeat(SegmentName::MAX_NAME));
    let first = format!("{prefix}first");
    let second = format!("{prefix}second");

    let a = SegmentName::new(&first, 3).unwrap();
    let b = SegmentName::new(&second, 3).unwrap();
    assert_eq!(a.path(), b.path());
    assert_ne!(a.mark(), b.mark());

    let mut holder = Log::<Quote>::new(&first, 3, 4);
    holder.create().unwrap();

    let mut impostor = Log::<Quote>::new(&second, 3, 4).cleanup(Cleanup::Preserve);
    assert!(matches!(impostor.create(), Err(LogError::AlreadyExists(_))));
    assert!(matches!(impostor.attach(), Err(LogError::IdentityMismatch)));
}

#[test]
fn segment_names() {
    let name = SegmentName::new("orders", 7).unwrap();
    assert_eq!(name.path().to_str(), Ok("/orders-7"));
    assert_eq!(name.mark(), SegmentName::new("orders", 7).unwrap().mark());
    assert_ne!(name.mark(), SegmentName::new("orders", 8).unwrap().mark());

    // Truncation keeps whole characters.
    let wide = format!("a{}", "ü".repeat(SegmentName::MAX_NAME));
    let truncated = SegmentName::new(&wide, 0).unwrap();
    let expected = format!("/a{}-0", "ü".repeat(SegmentName::MAX_NAME / 2 - 1));
    assert_eq!(truncated.path().to_str(), Ok(expected.as_str()));

    assert!(matches!(SegmentName::new("a/b", 0), Err(LogError::InvalidName)));
    assert!(matches!(SegmentName::new("a\0b", 0), Err(LogError::InvalidName)));
}

#[test]
fn failed_resize_removes_created_object() {
    fn _truncate(_: c_int, _: u64) -> c_int {
        -1
    }

    fn _errno() -> c_int {
        libc::ENOSPC
    }

    let shm = unsafe {
        Shm::new_unchecked(ShmVTable {
            truncate: _truncate,
            errno: _errno,
            ..ShmVTable::new_libc()
        })
    };

    let name = unique("resize");
    // Even when asked to preserve, an object we created and could not size is removed.
    let mut log = Log::<Quote>::new(&name, 0, 8)
        .with_shm(shm)
        .cleanup(Cleanup::Preserve);

    match log.create() {
        Err(LogError::Resize(err)) => assert_eq!(err.raw_os_error(), Some(libc::ENOSPC)),
        other => panic!("unexpected {:?}", other.err()),
    }

    let mut attacher = Log::<Quote>::new(&name, 0, 8).cleanup(Cleanup::Preserve);
    assert!(matches!(attacher.attach(), Err(LogError::Open(_))));

    // And the name is free again.
    let mut retry = Log::<Quote>::new(&name, 0, 8);
    retry.create().unwrap();
}

/// Sizes the object, then takes the creation guard as a concurrent initializer would.
fn racing_shm() -> Shm {
    fn _truncate(fd: c_int, len: u64) -> c_int {
        let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if ret < 0 {
            return ret;
        }

        // The creation state word follows mark, cell size and capacity.
        let held = 1u32.to_ne_bytes();
        let written = unsafe { libc::pwrite(fd, held.as_ptr().cast(), held.len(), 24) };
        assert_eq!(written, held.len() as isize);
        ret
    }

    unsafe {
        Shm::new_unchecked(ShmVTable {
            truncate: _truncate,
            ..ShmVTable::new_libc()
        })
    }
}

#[test]
fn lost_initialization_removes_segment() {
    let name = unique("race-destroy");
    let mut log = Log::<Quote>::new(&name, 0, 8).with_shm(racing_shm());
    assert!(matches!(log.create(), Err(LogError::InitializationRace)));
    assert!(!log.is_mapped());

    let mut late = Log::<Quote>::new(&name, 0, 8).cleanup(Cleanup::Preserve);
    match late.attach() {
        Err(LogError::Open(err)) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
        other => panic!("unexpected {:?}", other.err()),
    }
}

#[test]
fn lost_initialization_preserved_on_request() {
    let name = unique("race-preserve");
    let mut log = Log::<Quote>::new(&name, 0, 8)
        .with_shm(racing_shm())
        .cleanup(Cleanup::Preserve);
    assert!(matches!(log.create(), Err(LogError::InitializationRace)));
    assert!(!log.is_mapped());

    // The object is still there, still guarded by the other initializer.
    let mut late = Log::<Quote>::new(&name, 0, 8).cleanup(Cleanup::Preserve);
    assert!(matches!(late.attach(), Err(LogError::IdentityMismatch)));
    assert!(matches!(late.create(), Err(LogError::AlreadyExists(_))));

    let segment = SegmentName::new(&name, 0).unwrap();
    Segment::detach(&Shm::new(), &segment).unwrap();
}

#[test]
fn unsizable_segment_is_never_created() {
    let name = unique("unsizable");
    // 64 byte cells, a total just past what `off_t` can describe.
    let mut log = Log::<[u64; 7]>::new(&name, 0, 1usize << 57);
    match log.create() {
        Err(LogError::Resize(err)) => assert_eq!(err.raw_os_error(), Some(libc::EFBIG)),
        other => panic!("unexpected {:?}", other.err()),
    }

    let mut late = Log::<[u64; 7]>::new(&name, 0, 8).cleanup(Cleanup::Preserve);
    match late.attach() {
        Err(LogError::Open(err)) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
        other => panic!("unexpected {:?}", other.err()),
    }
}

#[test]
fn segment_dimensions() {
    let shm = Shm::new();
    let name = SegmentName::new(&unique("dimensions"), 0).unwrap();

    let created = Segment::create(&shm, &name, 40, 8, Cleanup::Destroy).unwrap();
    assert_eq!(Some(created.len()), LogLayout::total_size(40, 8));
    assert_eq!(
        created.layout().geometry(),
        Geometry {
            cell_size: 64,
            capacity: 8,
        }
    );

    // Any record of the same cell size agrees on the geometry.
    let attached = Segment::attach(&shm, &name, 56, Cleanup::Destroy).unwrap();
    assert_eq!(attached.len(), created.len());
    assert_eq!(attached.layout().geometry(), created.layout().geometry());

    drop(attached);
    drop(created);
    Segment::detach(&shm, &name).unwrap();
}

#[test]
fn close_keeps_and_detach_removes() {
    let name = unique("lifecycle");

    let mut writer = Log::<Quote>::new(&name, 0, 8);
    writer.create().unwrap();
    writer.push([1; 5]).unwrap();
    writer.close();
    assert!(!writer.is_mapped());
    drop(writer);

    let mut reader = Log::<Quote>::new(&name, 0, 8);
    reader.attach().unwrap();
    assert_eq!(reader.allocated(), 1);
    reader.detach().unwrap();
    assert!(!reader.is_mapped());
    // Detaching an unmapped handle does nothing.
    reader.detach().unwrap();

    let mut late = Log::<Quote>::new(&name, 0, 8);
    assert!(matches!(late.attach(), Err(LogError::Open(_))));
}

#[test]
fn drop_removes_segment() {
    let name = unique("drop");
    {
        let mut log = Log::<Quote>::new(&name, 0, 8);
        log.create().unwrap();
    }

    let mut late = Log::<Quote>::new(&name, 0, 8);
    assert!(matches!(late.attach(), Err(LogError::Open(_))));
}

#[test]
fn handle_misuse() {
    let name = unique("misuse");
    let mut log = Log::<Quote>::new(&name, 0, 8);
    assert!(matches!(log.write_cursor(), Err(LogError::NotMapped)));
    assert!(matches!(log.read_cursor(), Err(LogError::NotMapped)));
    assert!(matches!(log.push([0; 5]), Err(LogError::NotMapped)));

    log.create().unwrap();
    assert!(matches!(log.create(), Err(LogError::AlreadyMapped)));
    assert!(matches!(log.attach(), Err(LogError::AlreadyMapped)));
}
