use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Queue is full, try again later")]
    WouldBlock,
    #[error("Commit out of order: expected index {expected}, found {found}")]
    OutOfOrder { expected: u32, found: u32 },
    #[error("Operation not supported by the backend: {0}")]
    Unsupported(&'static str),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("API version mismatch: expected {expected}, found {found}")]
    ApiVersion { expected: u32, found: u32 },
    #[error("Mmap: {0}")]
    Mmap(Errno),
    #[error("Backend: {0}")]
    Backend(#[from] Errno),
}

impl Error {
    /// The negative errno status for this error, as reported through the integer-status surface.
    pub fn errno(&self) -> i32 {
        let e = match self {
            Error::InvalidArgument(_) | Error::ApiVersion { .. } => Errno::EINVAL,
            Error::WouldBlock | Error::OutOfOrder { .. } => Errno::EAGAIN,
            Error::Unsupported(_) => Errno::ENOSYS,
            Error::ResourceExhausted(_) => Errno::ENOMEM,
            Error::Mmap(e) | Error::Backend(e) => *e,
        };
        -(e as i32)
    }

    /// Whether the caller is expected to retry the same call later.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::OutOfOrder { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Folds an operation result into the integer status convention: the non-negative value on
/// success, the negative errno on failure.
pub fn status<T: TryInto<i64>>(res: Result<T>) -> i64 {
    match res {
        Ok(v) => v.try_into().unwrap_or(i64::MAX),
        Err(e) => e.errno() as i64,
    }
}
