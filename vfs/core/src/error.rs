//! Errno-native error surface.
//!
//! Every failure in the VFS is an errno plus a short `"subsystem.op"` context
//! string. The libc stub layer that wraps these entry points is what turns an
//! `Err` into `-1` and a thread-local `errno`; inside the library we keep the
//! `Result` form so `?` composes.

use std::fmt;
use std::io::ErrorKind;

/// A POSIX errno value.
///
/// Thin wrapper over the raw `libc` constants so errnos stay comparable and
/// printable without losing exotic values a handler may produce.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const PERM: Errno = Errno(libc::EPERM);
    pub const NOENT: Errno = Errno(libc::ENOENT);
    pub const INTR: Errno = Errno(libc::EINTR);
    pub const BADF: Errno = Errno(libc::EBADF);
    pub const AGAIN: Errno = Errno(libc::EAGAIN);
    pub const NOMEM: Errno = Errno(libc::ENOMEM);
    pub const ACCES: Errno = Errno(libc::EACCES);
    pub const FAULT: Errno = Errno(libc::EFAULT);
    pub const BUSY: Errno = Errno(libc::EBUSY);
    pub const EXIST: Errno = Errno(libc::EEXIST);
    pub const XDEV: Errno = Errno(libc::EXDEV);
    pub const NODEV: Errno = Errno(libc::ENODEV);
    pub const NOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const ISDIR: Errno = Errno(libc::EISDIR);
    pub const INVAL: Errno = Errno(libc::EINVAL);
    pub const MFILE: Errno = Errno(libc::EMFILE);
    pub const NOTTY: Errno = Errno(libc::ENOTTY);
    pub const FBIG: Errno = Errno(libc::EFBIG);
    pub const NOSPC: Errno = Errno(libc::ENOSPC);
    pub const SPIPE: Errno = Errno(libc::ESPIPE);
    pub const ROFS: Errno = Errno(libc::EROFS);
    pub const PIPE: Errno = Errno(libc::EPIPE);
    pub const RANGE: Errno = Errno(libc::ERANGE);
    pub const NAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    pub const NOSYS: Errno = Errno(libc::ENOSYS);
    pub const NOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const LOOP: Errno = Errno(libc::ELOOP);
    pub const OVERFLOW: Errno = Errno(libc::EOVERFLOW);
    pub const NOTSOCK: Errno = Errno(libc::ENOTSOCK);
    pub const OPNOTSUPP: Errno = Errno(libc::EOPNOTSUPP);
    pub const AFNOSUPPORT: Errno = Errno(libc::EAFNOSUPPORT);
    pub const ADDRINUSE: Errno = Errno(libc::EADDRINUSE);
    pub const CONNREFUSED: Errno = Errno(libc::ECONNREFUSED);
    pub const NOTCONN: Errno = Errno(libc::ENOTCONN);
    pub const ISCONN: Errno = Errno(libc::EISCONN);
    pub const TIMEDOUT: Errno = Errno(libc::ETIMEDOUT);

    pub const fn from_raw(raw: i32) -> Errno {
        Errno(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Best-effort conversion from a host `std::io::Error`.
    ///
    /// The raw OS errno wins when present; otherwise the `ErrorKind` is
    /// mapped. Values that alias on some platforms (`EAGAIN`/`EWOULDBLOCK`,
    /// `ENOTSUP`/`EOPNOTSUPP`) collapse to the canonical constant.
    pub fn from_io_error(err: &std::io::Error) -> Errno {
        if let Some(raw) = err.raw_os_error() {
            if raw == libc::EWOULDBLOCK {
                return Errno::AGAIN;
            }
            if raw == libc::ENOTSUP {
                return Errno::OPNOTSUPP;
            }
            return Errno(raw);
        }
        match err.kind() {
            ErrorKind::NotFound => Errno::NOENT,
            ErrorKind::PermissionDenied => Errno::ACCES,
            ErrorKind::AlreadyExists => Errno::EXIST,
            ErrorKind::InvalidInput => Errno::INVAL,
            ErrorKind::BrokenPipe => Errno::PIPE,
            ErrorKind::WouldBlock => Errno::AGAIN,
            ErrorKind::Interrupted => Errno::INTR,
            ErrorKind::TimedOut => Errno::TIMEDOUT,
            ErrorKind::Unsupported => Errno::OPNOTSUPP,
            ErrorKind::OutOfMemory => Errno::NOMEM,
            _ => Errno::INVAL,
        }
    }

    fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            libc::EPERM => "EPERM",
            libc::ENOENT => "ENOENT",
            libc::EINTR => "EINTR",
            libc::EBADF => "EBADF",
            libc::EAGAIN => "EAGAIN",
            libc::ENOMEM => "ENOMEM",
            libc::EACCES => "EACCES",
            libc::EFAULT => "EFAULT",
            libc::EBUSY => "EBUSY",
            libc::EEXIST => "EEXIST",
            libc::EXDEV => "EXDEV",
            libc::ENODEV => "ENODEV",
            libc::ENOTDIR => "ENOTDIR",
            libc::EISDIR => "EISDIR",
            libc::EINVAL => "EINVAL",
            libc::EMFILE => "EMFILE",
            libc::ENOTTY => "ENOTTY",
            libc::EFBIG => "EFBIG",
            libc::ENOSPC => "ENOSPC",
            libc::ESPIPE => "ESPIPE",
            libc::EROFS => "EROFS",
            libc::EPIPE => "EPIPE",
            libc::ERANGE => "ERANGE",
            libc::ENAMETOOLONG => "ENAMETOOLONG",
            libc::ENOSYS => "ENOSYS",
            libc::ENOTEMPTY => "ENOTEMPTY",
            libc::ELOOP => "ELOOP",
            libc::EOVERFLOW => "EOVERFLOW",
            libc::ENOTSOCK => "ENOTSOCK",
            libc::EOPNOTSUPP => "EOPNOTSUPP",
            libc::EAFNOSUPPORT => "EAFNOSUPPORT",
            libc::EADDRINUSE => "EADDRINUSE",
            libc::ECONNREFUSED => "ECONNREFUSED",
            libc::ENOTCONN => "ENOTCONN",
            libc::EISCONN => "EISCONN",
            libc::ETIMEDOUT => "ETIMEDOUT",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "errno {}", self.0),
        }
    }
}

/// An errno with the VFS operation that produced it.
#[derive(Clone, Copy, Debug)]
pub struct VfsError {
    errno: Errno,
    context: &'static str,
}

impl VfsError {
    pub const fn new(errno: Errno, context: &'static str) -> Self {
        Self { errno, context }
    }

    pub const fn errno(&self) -> Errno {
        self.errno
    }

    pub const fn context(&self) -> &'static str {
        self.context
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.errno, self.context)
    }
}

impl std::error::Error for VfsError {}

pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_maps_raw_errno_first() {
        let err = std::io::Error::from_raw_os_error(libc::ENOTDIR);
        assert_eq!(Errno::from_io_error(&err), Errno::NOTDIR);
    }

    #[test]
    fn io_error_wouldblock_collapses_to_eagain() {
        let err = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        assert_eq!(Errno::from_io_error(&err), Errno::AGAIN);
    }

    #[test]
    fn error_display_carries_context() {
        let err = VfsError::new(Errno::NOENT, "vfs.open");
        assert_eq!(err.to_string(), "ENOENT (vfs.open)");
        assert_eq!(err.errno(), Errno::NOENT);
        assert_eq!(err.context(), "vfs.open");
    }
}
