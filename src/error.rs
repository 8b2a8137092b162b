//! The error taxonomy shared by the scheduler and its tasks.
//!
//! Errors travel as ordinary `Result`s through every I/O call and the event
//! loop discriminates them at exactly one place, the dispatch boundary. Some
//! variants are not failures at all but control flow: [`Error::HalfClose`]
//! asks for flush-then-close, [`Error::GracefulClose`] finalizes it once the
//! outbound queue drains, and [`Error::Shutdown`] unwinds the whole loop.

use nix::errno::Errno;

/// A result of scheduler and task operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer misbehaved; the task is closed.
    #[error("client error: {0}")]
    Client(String),
    /// A syscall failed, with the errno and the calling location.
    #[error("c error: {errno:?} ({}) {msg} @ {file}:{line}", .errno.desc())]
    C {
        msg: &'static str,
        errno: Errno,
        file: &'static str,
        line: u32,
    },
    /// A contract inside the runtime was broken.
    #[error("internal error: {0}")]
    Internal(String),
    /// The peer closed its write side in an orderly way.
    #[error("end of stream")]
    EndOfStream,
    /// Stop reading, flush anything queued, then close.
    #[error("{0}")]
    HalfClose(&'static str),
    /// Raised once the outbound queue of a half-closed task drains.
    #[error("{0}")]
    GracefulClose(&'static str),
    /// Out-of-band signal that unwinds the event loop.
    #[error("{0}")]
    Shutdown(&'static str),
}

impl Error {
    pub fn client<M: Into<String>>(msg: M) -> Error {
        Error::Client(msg.into())
    }

    pub fn internal<M: Into<String>>(msg: M) -> Error {
        Error::Internal(msg.into())
    }

    /// A failed syscall. `EINTR` means a signal arrived and becomes
    /// [`Error::Shutdown`] so delivery unwinds the loop cleanly.
    pub fn c(msg: &'static str, errno: Errno, file: &'static str, line: u32) -> Error {
        if errno == Errno::EINTR {
            return Error::Shutdown("program interrupted");
        }
        Error::C {
            msg,
            errno,
            file,
            line,
        }
    }

    pub fn from_nix(err: nix::Error, msg: &'static str, file: &'static str, line: u32) -> Error {
        Error::c(msg, errno(err), file, line)
    }

    pub fn from_io(err: &std::io::Error, msg: &'static str, file: &'static str, line: u32) -> Error {
        Error::c(msg, Errno::from_i32(err.raw_os_error().unwrap_or(0)), file, line)
    }
}

/// The errno behind a nix error, `UnknownErrno` if it carried none.
pub(crate) fn errno(err: nix::Error) -> Errno {
    err.as_errno().unwrap_or(Errno::UnknownErrno)
}

/// Evaluate a `nix` call and convert failure into [`Error::C`] with the
/// calling location, like the C idiom `check(expr)`.
#[macro_export]
macro_rules! check {
    ($expr:expr, $what:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => return Err($crate::Error::from_nix(err, $what, file!(), line!())),
        }
    };
}

/// Raise [`Error::C`] with the current `errno` and the calling location.
#[macro_export]
macro_rules! fail {
    ($what:expr) => {
        return Err($crate::Error::c(
            $what,
            ::nix::errno::Errno::last(),
            file!(),
            line!(),
        ))
    };
}
