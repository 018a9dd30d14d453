use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result of an asynchronous operation.
///
/// Futures resolve to an `AsyncResult`; the error side is [`Error`], which is
/// cheap to clone (payloads live behind `Arc`) and `Send`, so a failure can
/// fan out through a shared future or cross a core boundary without touching
/// the originating reactor's allocator.
pub type AsyncResult<T> = Result<T, Error>;

/// Errors produced by the shoal runtime.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The producing promise was dropped without being fulfilled.
    #[error("broken promise")]
    BrokenPromise,
    /// A kernel I/O operation failed.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(&'static str),
    /// A pending operation was aborted by the application.
    #[error("aborted")]
    Aborted,
    /// Read past end-of-file where exact length was required.
    #[error("end of file")]
    Eof,
    /// The remote side did not recognize an RPC verb.
    #[error("unknown rpc verb {0}")]
    UnknownVerb(u64),
    /// An RPC call failed on the remote side.
    #[error("remote error: {0}")]
    Remote(Arc<str>),
    /// A wire-protocol violation.
    #[error("protocol error: {0}")]
    Protocol(Arc<str>),
    /// Invalid configuration value.
    #[error("configuration: {0}")]
    Config(Arc<str>),
    /// A system resource limit was hit (e.g. RLIMIT_NOFILE).
    #[error("resource limit: {0}")]
    ResourceLimit(Arc<str>),
    /// Application-defined failure.
    #[error("{0}")]
    Message(Arc<str>),
}

impl Error {
    /// Application-defined failure with an arbitrary message.
    pub fn message(msg: impl Into<String>) -> Error {
        Error::Message(msg.into().into())
    }

    /// Failure from a raw errno value (negated CQE results).
    pub fn from_errno(errno: i32) -> Error {
        Error::Io(Arc::new(io::Error::from_raw_os_error(errno)))
    }

    /// The underlying OS error number, if this is an I/O error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        let e = Error::from_errno(libc::EINVAL);
        assert_eq!(e.errno(), Some(libc::EINVAL));
        assert_eq!(Error::BrokenPromise.errno(), None);
    }

    #[test]
    fn clone_preserves_errno() {
        let e = Error::from_errno(libc::ENOENT);
        assert_eq!(e.clone().errno(), Some(libc::ENOENT));
    }

    #[test]
    fn message_display() {
        let e = Error::message("bad shard");
        assert_eq!(e.to_string(), "bad shard");
    }
}
