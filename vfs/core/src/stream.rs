//! The stream contract: the uniform operation set every open object exposes.
//!
//! Each operation has a default that fails with the documented errno for its
//! family, so stream kinds only override what is meaningful for them. Common
//! metadata lives in an embedded [`StreamCore`] rather than a base class.

use std::any::Any;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Errno, VfsError, VfsResult};
use crate::flags::{MapFlags, MsgFlags, OpenFlags, ProtFlags};
use crate::metadata::{Stat, StatFs};
use crate::permission::{Permission, ROOT_UID};
use crate::poll::PollEvents;

/// Seek origin for `lseek`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: i32) -> Option<Whence> {
        match raw {
            libc::SEEK_SET => Some(Whence::Set),
            libc::SEEK_CUR => Some(Whence::Cur),
            libc::SEEK_END => Some(Whence::End),
            _ => None,
        }
    }
}

/// `shutdown(2)` direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// Socket addresses the layer understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketAddress {
    /// AF_UNIX, by pathname or abstract name.
    Unix(String),
    /// AF_INET / AF_INET6.
    Inet(std::net::SocketAddr),
}

/// The ioctl requests the built-in streams answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlRequest {
    /// Bytes available to read without blocking.
    Fionread,
}

/// Handle streams use to wake anything blocked on the process-wide readiness
/// condition variable.
#[derive(Clone)]
pub struct ReadySignal {
    cond: Arc<Condvar>,
}

impl ReadySignal {
    pub(crate) fn new(cond: Arc<Condvar>) -> Self {
        Self { cond }
    }

    /// Standalone signal for tests that construct streams directly.
    pub fn detached() -> Self {
        Self {
            cond: Arc::new(Condvar::new()),
        }
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }
}

/// Metadata every stream carries: the path it was opened with (empty for
/// sockets, pipes and the like), the open flags, and the permission derived
/// at open time.
pub struct StreamCore {
    pathname: String,
    oflag: AtomicI32,
    permission: Mutex<Permission>,
}

impl StreamCore {
    pub fn new(pathname: String, oflag: OpenFlags) -> Self {
        Self {
            pathname,
            oflag: AtomicI32::new(oflag.bits()),
            permission: Mutex::new(Permission::new(ROOT_UID, true)),
        }
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    pub fn oflag(&self) -> OpenFlags {
        OpenFlags::from_bits_retain(self.oflag.load(Ordering::Relaxed))
    }

    pub fn set_oflag(&self, oflag: OpenFlags) {
        self.oflag.store(oflag.bits(), Ordering::Relaxed);
    }

    /// Apply `F_SETFL`: only the status bits change.
    pub fn set_status_flags(&self, flags: OpenFlags) {
        let status = flags & OpenFlags::STATUS_MASK;
        let kept = self.oflag() - OpenFlags::STATUS_MASK;
        self.set_oflag(kept | status);
    }

    pub fn permission(&self) -> Permission {
        *self.permission.lock()
    }

    pub fn set_permission(&self, permission: Permission) {
        *self.permission.lock() = permission;
    }
}

fn unsupported<T>(errno: Errno, context: &'static str) -> VfsResult<T> {
    Err(VfsError::new(errno, context))
}

impl std::fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.stream_type()).finish()
    }
}

/// An open object: file, directory, socket, pipe end, epoll set or anonymous
/// mapping.
///
/// Streams never sleep; an operation that cannot make progress returns
/// `EAGAIN` and the dispatch layer decides whether to block on the readiness
/// condition variable.
pub trait Stream: Send + Sync {
    fn core(&self) -> &StreamCore;

    /// Short identifier for logs and debug dumps ("local_socket", "epoll",
    /// ...).
    fn stream_type(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Typed recovery of an AF_UNIX socket from a shared stream handle; the
    /// dispatch layer needs the concrete type to wire peers together.
    fn into_local_socket(self: Arc<Self>) -> Option<Arc<crate::streams::local::LocalSocket>> {
        None
    }

    fn pathname(&self) -> &str {
        self.core().pathname()
    }

    fn oflag(&self) -> OpenFlags {
        self.core().oflag()
    }

    fn permission(&self) -> Permission {
        self.core().permission()
    }

    fn is_blocking(&self) -> bool {
        !self.oflag().contains(OpenFlags::NONBLOCK)
    }

    // File operations.

    fn read(&self, _buf: &mut [u8]) -> VfsResult<usize> {
        unsupported(Errno::INVAL, "stream.read")
    }

    fn write(&self, _buf: &[u8]) -> VfsResult<usize> {
        unsupported(Errno::INVAL, "stream.write")
    }

    fn pread(&self, _buf: &mut [u8], _offset: i64) -> VfsResult<usize> {
        unsupported(Errno::SPIPE, "stream.pread")
    }

    fn pwrite(&self, _buf: &[u8], _offset: i64) -> VfsResult<usize> {
        unsupported(Errno::SPIPE, "stream.pwrite")
    }

    /// Scatter read. Stops early on a short read; an error after partial
    /// progress reports the partial byte count.
    fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> VfsResult<usize> {
        let mut total = 0;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            match self.read(buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(_) if total > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Gather write, symmetric with [`Stream::readv`].
    fn writev(&self, bufs: &[IoSlice<'_>]) -> VfsResult<usize> {
        let mut total = 0;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            match self.write(buf) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(_) if total > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    fn lseek(&self, _offset: i64, _whence: Whence) -> VfsResult<i64> {
        unsupported(Errno::SPIPE, "stream.lseek")
    }

    fn fstat(&self) -> VfsResult<Stat> {
        unsupported(Errno::INVAL, "stream.fstat")
    }

    fn fstatfs(&self) -> VfsResult<StatFs> {
        unsupported(Errno::NOSYS, "stream.fstatfs")
    }

    fn ftruncate(&self, _length: i64) -> VfsResult<()> {
        unsupported(Errno::INVAL, "stream.ftruncate")
    }

    fn fsync(&self) -> VfsResult<()> {
        unsupported(Errno::INVAL, "stream.fsync")
    }

    fn fdatasync(&self) -> VfsResult<()> {
        self.fsync()
    }

    fn ioctl(&self, _request: IoctlRequest) -> VfsResult<i64> {
        unsupported(Errno::NOTTY, "stream.ioctl")
    }

    // Memory mapping.

    /// Map `length` bytes of this stream at `offset`. Returns the address of
    /// the new mapping. `length` is already page-rounded and `offset`
    /// page-aligned when the dispatch layer calls this.
    fn mmap(
        &self,
        _addr: usize,
        _length: usize,
        _prot: ProtFlags,
        _flags: MapFlags,
        _offset: i64,
    ) -> VfsResult<usize> {
        unsupported(Errno::NODEV, "stream.mmap")
    }

    fn munmap(&self, _addr: usize, _length: usize) -> VfsResult<()> {
        unsupported(Errno::INVAL, "stream.munmap")
    }

    fn mprotect(&self, _addr: usize, _length: usize, _prot: ProtFlags) -> VfsResult<()> {
        unsupported(Errno::INVAL, "stream.mprotect")
    }

    fn madvise(&self, _addr: usize, _length: usize, _advice: i32) -> VfsResult<()> {
        unsupported(Errno::NOSYS, "stream.madvise")
    }

    // Socket operations.

    fn connect(&self, _addr: &SocketAddress) -> VfsResult<()> {
        unsupported(Errno::NOTSOCK, "stream.connect")
    }

    fn bind(&self, _addr: &SocketAddress) -> VfsResult<()> {
        unsupported(Errno::NOTSOCK, "stream.bind")
    }

    fn listen(&self, _backlog: i32) -> VfsResult<()> {
        unsupported(Errno::NOTSOCK, "stream.listen")
    }

    /// Take one pending connection off a listening socket.
    fn accept(&self) -> VfsResult<Arc<dyn Stream>> {
        unsupported(Errno::NOTSOCK, "stream.accept")
    }

    fn send(&self, _buf: &[u8], _flags: MsgFlags) -> VfsResult<usize> {
        unsupported(Errno::NOTSOCK, "stream.send")
    }

    fn sendto(
        &self,
        _buf: &[u8],
        _flags: MsgFlags,
        _addr: Option<&SocketAddress>,
    ) -> VfsResult<usize> {
        unsupported(Errno::NOTSOCK, "stream.sendto")
    }

    fn sendmsg(&self, _bufs: &[IoSlice<'_>], _flags: MsgFlags) -> VfsResult<usize> {
        unsupported(Errno::NOTSOCK, "stream.sendmsg")
    }

    fn recv(&self, _buf: &mut [u8], _flags: MsgFlags) -> VfsResult<usize> {
        unsupported(Errno::NOTSOCK, "stream.recv")
    }

    fn recvfrom(
        &self,
        _buf: &mut [u8],
        _flags: MsgFlags,
    ) -> VfsResult<(usize, Option<SocketAddress>)> {
        unsupported(Errno::NOTSOCK, "stream.recvfrom")
    }

    fn recvmsg(&self, _bufs: &mut [IoSliceMut<'_>], _flags: MsgFlags) -> VfsResult<usize> {
        unsupported(Errno::NOTSOCK, "stream.recvmsg")
    }

    fn getsockopt(&self, _level: i32, _optname: i32, _optval: &mut [u8]) -> VfsResult<usize> {
        unsupported(Errno::NOTSOCK, "stream.getsockopt")
    }

    fn setsockopt(&self, _level: i32, _optname: i32, _optval: &[u8]) -> VfsResult<()> {
        unsupported(Errno::NOTSOCK, "stream.setsockopt")
    }

    fn shutdown(&self, _how: ShutdownHow) -> VfsResult<()> {
        unsupported(Errno::NOTSOCK, "stream.shutdown")
    }

    fn getpeername(&self) -> VfsResult<SocketAddress> {
        unsupported(Errno::NOTSOCK, "stream.getpeername")
    }

    fn getsockname(&self) -> VfsResult<SocketAddress> {
        unsupported(Errno::NOTSOCK, "stream.getsockname")
    }

    // Readiness predicates. Regular files are always ready, which is also
    // the right default for stream kinds that never block.

    fn is_select_read_ready(&self) -> bool {
        true
    }

    fn is_select_write_ready(&self) -> bool {
        true
    }

    fn is_select_exception_ready(&self) -> bool {
        false
    }

    fn poll_events(&self) -> PollEvents {
        let mut events = PollEvents::empty();
        if self.is_select_read_ready() {
            events |= PollEvents::IN;
        }
        if self.is_select_write_ready() {
            events |= PollEvents::OUT;
        }
        if self.is_select_exception_ready() {
            events |= PollEvents::ERR;
        }
        events
    }
}

/// Stable identity of a stream object, independent of how many descriptors
/// alias it. Used by epoll registration (open-file-description semantics).
pub fn stream_key(stream: &Arc<dyn Stream>) -> usize {
    Arc::as_ptr(stream) as *const () as usize
}
