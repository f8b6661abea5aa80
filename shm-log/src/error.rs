use std::io;

/// An error from creating, attaching or using a log.
///
/// Variants that carry an [`io::Error`] wrap the failing OS call. Which of them imply that the
/// backing object was removed depends on the [`Cleanup`](crate::Cleanup) policy of the call.
#[derive(Debug)]
pub enum LogError {
    /// The name can not be turned into a shared memory object name.
    InvalidName,
    /// The exclusive open on `create` failed, usually because the segment exists already.
    ///
    /// The existing object is left untouched.
    AlreadyExists(io::Error),
    /// The segment could not be opened on `attach`.
    Open(io::Error),
    /// The object could not be sized to hold the requested capacity.
    Resize(io::Error),
    /// The size of an existing object could not be determined.
    Stat(io::Error),
    /// The object could not be mapped into this process.
    Map(io::Error),
    /// Another initializer held the creation guard.
    InitializationRace,
    /// The header does not match the expected name, version, record size or mapped length.
    IdentityMismatch,
    /// Every slot of the segment has been handed out. This is permanent.
    CapacityExhausted,
    /// The handle holds no mapping; call `create` or `attach` first.
    NotMapped,
    /// The handle already holds a mapping.
    AlreadyMapped,
    /// Removing the backing object failed.
    Remove(io::Error),
}

impl LogError {
    /// Whether the error was produced after the backing object was opened by this call.
    ///
    /// Only these failures are subject to the cleanup policy.
    pub(crate) fn is_post_open(&self) -> bool {
        !matches!(self, LogError::AlreadyExists(_) | LogError::InvalidName)
    }
}

impl core::fmt::Display for LogError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LogError::InvalidName => write!(f, "invalid segment name"),
            LogError::AlreadyExists(err) => write!(f, "segment already exists: {err}"),
            LogError::Open(err) => write!(f, "failed to open segment: {err}"),
            LogError::Resize(err) => write!(f, "failed to size segment: {err}"),
            LogError::Stat(err) => write!(f, "failed to stat segment: {err}"),
            LogError::Map(err) => write!(f, "failed to map segment: {err}"),
            LogError::InitializationRace => write!(f, "lost the segment initialization race"),
            LogError::IdentityMismatch => write!(f, "segment identity does not match"),
            LogError::CapacityExhausted => write!(f, "segment capacity exhausted"),
            LogError::NotMapped => write!(f, "log is not mapped"),
            LogError::AlreadyMapped => write!(f, "log is already mapped"),
            LogError::Remove(err) => write!(f, "failed to remove segment: {err}"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::AlreadyExists(err)
            | LogError::Open(err)
            | LogError::Resize(err)
            | LogError::Stat(err)
            | LogError::Map(err)
            | LogError::Remove(err) => Some(err),
            _ => None,
        }
    }
}
