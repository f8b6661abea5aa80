//! Interact with `shm_*` and related calls.
use core::ffi::{c_int, CStr};
use std::io;
use std::sync::Arc;

/// Handle to the OS functions used for segment lifecycle.
#[derive(Clone)]
pub struct Shm {
    inner: Arc<ShmInner>,
}

struct ShmInner {
    vtable: ShmVTable,
}

/// How [`ShmVTable::open`] treats the named object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the object, failing if it exists (`O_CREAT | O_EXCL | O_RDWR`).
    CreateExclusive,
    /// Open an object that must exist already (`O_RDWR`).
    Existing,
}

/// A table of OS functions.
///
/// This enumerates the functions required to manage a named shared memory object. A vtable must
/// contain functions that behave according the POSIX/libc's specification of the correspondingly
/// named functions, see Safety precondition of [`Shm::new_unchecked`]. A default table is
/// available with [`ShmVTable::new_libc`].
///
/// Overriding single entries is the intended way of injecting failures into the lifecycle.
pub struct ShmVTable {
    /// Simplified `shm_open`, with mode `0600`.
    pub open: fn(&CStr, OpenMode) -> c_int,
    pub truncate: fn(c_int, u64) -> c_int,
    /// Simplified `fstat`, writing only the size of the object.
    pub size: fn(c_int, &mut u64) -> c_int,
    pub close: fn(c_int) -> c_int,
    pub unlink: fn(&CStr) -> c_int,
    pub errno: fn() -> c_int,
}

/// An open file descriptor of a shared memory object, closed on drop.
pub(crate) struct ShmFd {
    fd: c_int,
    shm: Shm,
}

impl Shm {
    /// Create an `Shm` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain functions that implement the `shm*` interface. In particular, a
    /// file descriptor returned from `open` must be valid to map with the size reported by `size`.
    pub unsafe fn new_unchecked(vtable: ShmVTable) -> Self {
        Shm {
            inner: Arc::new(ShmInner { vtable }),
        }
    }

    pub fn new() -> Self {
        unsafe { Self::new_unchecked(ShmVTable::new_libc()) }
    }

    pub(crate) fn open(&self, name: &CStr, mode: OpenMode) -> io::Result<ShmFd> {
        let fd = (self.inner.vtable.open)(name, mode);

        if fd < 0 {
            return Err(self.last_error());
        }

        Ok(ShmFd {
            fd,
            shm: self.clone(),
        })
    }

    pub(crate) fn truncate(&self, fd: &ShmFd, len: u64) -> io::Result<()> {
        if (self.inner.vtable.truncate)(fd.fd, len) < 0 {
            return Err(self.last_error());
        }

        Ok(())
    }

    pub(crate) fn size(&self, fd: &ShmFd) -> io::Result<u64> {
        let mut size = 0;
        if (self.inner.vtable.size)(fd.fd, &mut size) < 0 {
            return Err(self.last_error());
        }

        Ok(size)
    }

    /// Remove the named object. A missing object is not an error.
    pub(crate) fn unlink(&self, name: &CStr) -> io::Result<()> {
        if (self.inner.vtable.unlink)(name) < 0 {
            let err = self.last_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
        }

        Ok(())
    }

    fn last_error(&self) -> io::Error {
        io::Error::from_raw_os_error((self.inner.vtable.errno)())
    }
}

impl Default for Shm {
    fn default() -> Self {
        Shm::new()
    }
}

impl ShmFd {
    pub(crate) fn as_raw_fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for ShmFd {
    fn drop(&mut self) {
        // The mapping stays valid after the descriptor is closed.
        let _ = (self.shm.inner.vtable.close)(self.fd);
    }
}

impl ShmVTable {
    pub fn new_libc() -> Self {
        fn _open(name: &CStr, mode: OpenMode) -> c_int {
            let flags = match mode {
                OpenMode::CreateExclusive => libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                OpenMode::Existing => libc::O_RDWR,
            };

            let perm = (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t;
            unsafe { libc::shm_open(name.as_ptr(), flags, perm) }
        }

        fn _truncate(fd: c_int, len: u64) -> c_int {
            let Ok(len) = libc::off_t::try_from(len) else {
                return -1;
            };

            unsafe { libc::ftruncate(fd, len) }
        }

        fn _size(fd: c_int, size: &mut u64) -> c_int {
            let mut uninit = core::mem::MaybeUninit::<libc::stat>::zeroed();
            // Safety: passing the correct pointer to a struct of libc::stat.
            let ret = unsafe { libc::fstat(fd, uninit.as_mut_ptr()) };

            if ret == 0 {
                // Safety: always initialized on return with success.
                let lstat = unsafe { uninit.assume_init() };
                *size = u64::try_from(lstat.st_size).unwrap_or(0);
            }

            ret
        }

        fn _close_inner(fd: c_int) -> c_int {
            unsafe { libc::close(fd) }
        }

        fn _unlink(name: &CStr) -> c_int {
            unsafe { libc::shm_unlink(name.as_ptr()) }
        }

        fn _errno() -> c_int {
            io::Error::last_os_error().raw_os_error().unwrap_or(0)
        }

        ShmVTable {
            open: _open,
            truncate: _truncate,
            size: _size,
            close: _close_inner,
            unlink: _unlink,
            errno: _errno,
        }
    }
}
