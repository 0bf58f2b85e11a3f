//! Flag types shared across the dispatch surface.
//!
//! These are bit-for-bit the host `libc` values; the stub layer can pass raw
//! integers through `from_bits_retain` without translation tables.

use bitflags::bitflags;

bitflags! {
    /// `open(2)` flags.
    ///
    /// `O_RDONLY` is zero and therefore not a named flag; use
    /// [`OpenFlags::access_mode`] to classify the access mode.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const NOCTTY = libc::O_NOCTTY;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
        const NONBLOCK = libc::O_NONBLOCK;
        const DIRECTORY = libc::O_DIRECTORY;
        const NOFOLLOW = libc::O_NOFOLLOW;
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    /// Per-OFD status flags `F_SETFL` may change.
    pub const STATUS_MASK: OpenFlags =
        OpenFlags::from_bits_truncate(libc::O_APPEND | libc::O_NONBLOCK);

    pub fn access_mode(self) -> AccessMode {
        match self.bits() & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMode::WriteOnly,
            libc::O_RDWR => AccessMode::ReadWrite,
            _ => AccessMode::ReadOnly,
        }
    }

    pub fn is_readable(self) -> bool {
        self.access_mode() != AccessMode::WriteOnly
    }

    pub fn is_writable(self) -> bool {
        self.access_mode() != AccessMode::ReadOnly
    }

    /// True when the open carries write intent: a writable access mode, or
    /// creation/truncation side effects.
    pub fn wants_write(self) -> bool {
        self.is_writable() || self.intersects(OpenFlags::CREAT | OpenFlags::TRUNC)
    }

    /// Whether an `open` with these flags may consult the preopen cache.
    ///
    /// Only a plain read-only open qualifies; `O_LARGEFILE` (ignored by the
    /// host libc, and 0 on 64-bit Linux) and `O_CLOEXEC` are tolerated.
    pub fn is_preopen_eligible(self) -> bool {
        self.bits() & !(libc::O_LARGEFILE | libc::O_CLOEXEC) == 0
    }
}

bitflags! {
    /// `mmap(2)`/`mprotect(2)` protection bits. Empty means `PROT_NONE`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ProtFlags: i32 {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

bitflags! {
    /// `mmap(2)` mapping flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: i32 {
        const SHARED = libc::MAP_SHARED;
        const PRIVATE = libc::MAP_PRIVATE;
        const FIXED = libc::MAP_FIXED;
        const ANONYMOUS = libc::MAP_ANONYMOUS;
    }
}

bitflags! {
    /// `send(2)`/`recv(2)` flags. Unknown bits are ignored by the local
    /// socket implementation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MsgFlags: i32 {
        const PEEK = libc::MSG_PEEK;
        const DONTWAIT = libc::MSG_DONTWAIT;
        const NOSIGNAL = libc::MSG_NOSIGNAL;
        const TRUNC = libc::MSG_TRUNC;
    }
}
