//! AF_UNIX sockets and pipes.
//!
//! A local socket is one end of an in-process byte or message channel. Ends
//! are linked symmetrically but hold only weak references to each other, so
//! the descriptor table stays the sole owner: when one side's last
//! descriptor closes, the peer observes EOF on read and `EPIPE` on write.
//!
//! `pipe2` builds a read-only/write-only pair, `socketpair` a read-write
//! pair, and `bind`/`listen`/`connect`/`accept` run through the per-VFS
//! abstract name table.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::{IoSlice, IoSliceMut};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Errno, VfsError, VfsResult};
use crate::flags::{MsgFlags, OpenFlags};
use crate::metadata::Stat;
use crate::poll::PollEvents;
use crate::stream::{
    IoctlRequest, ReadySignal, ShutdownHow, SocketAddress, Stream, StreamCore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalSocketMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalSocketType {
    Stream,
    Datagram,
    SeqPacket,
}

impl LocalSocketType {
    pub fn from_raw(raw: i32) -> Option<LocalSocketType> {
        match raw {
            libc::SOCK_STREAM => Some(LocalSocketType::Stream),
            libc::SOCK_DGRAM => Some(LocalSocketType::Datagram),
            libc::SOCK_SEQPACKET => Some(LocalSocketType::SeqPacket),
            _ => None,
        }
    }

    fn preserves_boundaries(self) -> bool {
        !matches!(self, LocalSocketType::Stream)
    }
}

enum SocketBuffer {
    Stream(BytesMut),
    Packets(VecDeque<Bytes>),
}

impl SocketBuffer {
    fn new(sock_type: LocalSocketType) -> Self {
        if sock_type.preserves_boundaries() {
            SocketBuffer::Packets(VecDeque::new())
        } else {
            SocketBuffer::Stream(BytesMut::new())
        }
    }

    fn len(&self) -> usize {
        match self {
            SocketBuffer::Stream(buf) => buf.len(),
            SocketBuffer::Packets(packets) => packets.iter().map(Bytes::len).sum(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            SocketBuffer::Stream(buf) => buf.is_empty(),
            SocketBuffer::Packets(packets) => packets.is_empty(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        match self {
            SocketBuffer::Stream(buf) => buf.extend_from_slice(data),
            SocketBuffer::Packets(packets) => packets.push_back(Bytes::copy_from_slice(data)),
        }
    }

    /// Move up to `out.len()` bytes into `out`. A datagram larger than the
    /// buffer is truncated, per SOCK_DGRAM semantics.
    fn pop(&mut self, out: &mut [u8]) -> usize {
        match self {
            SocketBuffer::Stream(buf) => {
                let n = out.len().min(buf.len());
                let chunk = buf.split_to(n);
                out[..n].copy_from_slice(&chunk);
                n
            }
            SocketBuffer::Packets(packets) => match packets.pop_front() {
                Some(packet) => {
                    let n = out.len().min(packet.len());
                    out[..n].copy_from_slice(&packet[..n]);
                    n
                }
                None => 0,
            },
        }
    }
}

struct LocalInner {
    buffer: SocketBuffer,
    peer: Option<Weak<LocalSocket>>,
    /// Set once a peer existed; EOF is then distinguishable from
    /// not-yet-connected.
    connected: bool,
    shut_read: bool,
    shut_write: bool,
    listen_backlog: Option<usize>,
    pending: VecDeque<Arc<LocalSocket>>,
    bound_name: Option<String>,
    peer_name: Option<String>,
}

pub struct LocalSocket {
    core: StreamCore,
    mode: LocalSocketMode,
    sock_type: LocalSocketType,
    signal: ReadySignal,
    inner: Mutex<LocalInner>,
}

impl LocalSocket {
    pub fn new(
        oflag: OpenFlags,
        sock_type: LocalSocketType,
        mode: LocalSocketMode,
        signal: ReadySignal,
    ) -> Arc<LocalSocket> {
        Arc::new(LocalSocket {
            core: StreamCore::new(String::new(), oflag),
            mode,
            sock_type,
            signal,
            inner: Mutex::new(LocalInner {
                buffer: SocketBuffer::new(sock_type),
                peer: None,
                connected: false,
                shut_read: false,
                shut_write: false,
                listen_backlog: None,
                pending: VecDeque::new(),
                bound_name: None,
                peer_name: None,
            }),
        })
    }

    pub fn sock_type(&self) -> LocalSocketType {
        self.sock_type
    }

    /// Link two freshly created ends together (pipes, socketpair).
    pub fn link_pair(a: &Arc<LocalSocket>, b: &Arc<LocalSocket>) {
        {
            let mut inner = a.inner.lock();
            inner.peer = Some(Arc::downgrade(b));
            inner.connected = true;
        }
        {
            let mut inner = b.inner.lock();
            inner.peer = Some(Arc::downgrade(a));
            inner.connected = true;
        }
    }

    fn peer(&self) -> Option<Arc<LocalSocket>> {
        self.inner.lock().peer.as_ref().and_then(Weak::upgrade)
    }

    fn can_read(&self) -> bool {
        self.mode != LocalSocketMode::WriteOnly
    }

    fn can_write(&self) -> bool {
        self.mode != LocalSocketMode::ReadOnly
    }

    fn read_impl(&self, buf: &mut [u8]) -> VfsResult<usize> {
        if !self.can_read() {
            return Err(VfsError::new(Errno::BADF, "local_socket.read"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let peer = self.peer();
        let mut inner = self.inner.lock();
        if inner.shut_read {
            return Ok(0);
        }
        if !inner.buffer.is_empty() {
            let n = inner.buffer.pop(buf);
            drop(inner);
            // The writer may be blocked on buffer growth watchers.
            self.signal.notify();
            return Ok(n);
        }
        if !inner.connected {
            return Err(VfsError::new(Errno::NOTCONN, "local_socket.read"));
        }
        match peer {
            // Peer alive and nothing buffered.
            Some(peer) if !peer.inner.lock().shut_write => {
                Err(VfsError::new(Errno::AGAIN, "local_socket.read"))
            }
            // Peer gone or done writing: EOF.
            _ => Ok(0),
        }
    }

    fn write_impl(&self, buf: &[u8]) -> VfsResult<usize> {
        if !self.can_write() {
            return Err(VfsError::new(Errno::BADF, "local_socket.write"));
        }
        {
            let inner = self.inner.lock();
            if inner.shut_write {
                return Err(VfsError::new(Errno::PIPE, "local_socket.write"));
            }
            if !inner.connected {
                return Err(VfsError::new(Errno::NOTCONN, "local_socket.write"));
            }
        }
        let Some(peer) = self.peer() else {
            return Err(VfsError::new(Errno::PIPE, "local_socket.write"));
        };
        {
            let mut peer_inner = peer.inner.lock();
            if peer_inner.shut_read {
                return Err(VfsError::new(Errno::PIPE, "local_socket.write"));
            }
            peer_inner.buffer.push(buf);
        }
        self.signal.notify();
        Ok(buf.len())
    }

    // Listener-side surface, used by the dispatch layer's connect path.

    pub(crate) fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub(crate) fn set_bound_name(&self, name: &str) {
        self.inner.lock().bound_name = Some(name.to_string());
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.inner.lock().listen_backlog.is_some()
    }

    /// Create the server-side end for `client` and enqueue it on this
    /// listening socket.
    pub(crate) fn enqueue_connection(&self, client: &Arc<LocalSocket>) -> VfsResult<()> {
        let mut inner = self.inner.lock();
        let Some(backlog) = inner.listen_backlog else {
            return Err(VfsError::new(Errno::CONNREFUSED, "local_socket.connect"));
        };
        if inner.pending.len() >= backlog {
            return Err(VfsError::new(Errno::CONNREFUSED, "local_socket.connect"));
        }
        let server = LocalSocket::new(
            OpenFlags::RDWR,
            self.sock_type,
            LocalSocketMode::ReadWrite,
            self.signal.clone(),
        );
        LocalSocket::link_pair(client, &server);
        {
            let mut server_inner = server.inner.lock();
            server_inner.bound_name = inner.bound_name.clone();
            server_inner.peer_name = client.inner.lock().bound_name.clone();
        }
        client.inner.lock().peer_name = inner.bound_name.clone();
        inner.pending.push_back(server);
        drop(inner);
        self.signal.notify();
        Ok(())
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        // Wake any reader blocked on the (now broken) peer link.
        self.signal.notify();
    }
}

impl Stream for LocalSocket {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_type(&self) -> &'static str {
        "local_socket"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_local_socket(self: Arc<Self>) -> Option<Arc<LocalSocket>> {
        Some(self)
    }

    fn read(&self, buf: &mut [u8]) -> VfsResult<usize> {
        self.read_impl(buf)
    }

    fn write(&self, buf: &[u8]) -> VfsResult<usize> {
        self.write_impl(buf)
    }

    fn fstat(&self) -> VfsResult<Stat> {
        Ok(Stat {
            mode: libc::S_IFSOCK | 0o777,
            blksize: 4096,
            nlink: 1,
            ..Stat::default()
        })
    }

    fn ioctl(&self, request: IoctlRequest) -> VfsResult<i64> {
        match request {
            IoctlRequest::Fionread => Ok(self.inner.lock().buffer.len() as i64),
        }
    }

    fn connect(&self, _addr: &SocketAddress) -> VfsResult<()> {
        // Name lookup happens in the dispatch layer; reaching the stream
        // means the socket was already connected.
        Err(VfsError::new(Errno::ISCONN, "local_socket.connect"))
    }

    fn bind(&self, _addr: &SocketAddress) -> VfsResult<()> {
        Err(VfsError::new(Errno::INVAL, "local_socket.bind"))
    }

    fn listen(&self, backlog: i32) -> VfsResult<()> {
        let mut inner = self.inner.lock();
        if inner.bound_name.is_none() {
            return Err(VfsError::new(Errno::INVAL, "local_socket.listen"));
        }
        inner.listen_backlog = Some(backlog.max(1) as usize);
        trace!(backlog, "local socket listening");
        Ok(())
    }

    fn accept(&self) -> VfsResult<Arc<dyn Stream>> {
        let mut inner = self.inner.lock();
        if inner.listen_backlog.is_none() {
            return Err(VfsError::new(Errno::INVAL, "local_socket.accept"));
        }
        match inner.pending.pop_front() {
            Some(server) => Ok(server),
            None => Err(VfsError::new(Errno::AGAIN, "local_socket.accept")),
        }
    }

    fn send(&self, buf: &[u8], _flags: MsgFlags) -> VfsResult<usize> {
        self.write_impl(buf)
    }

    fn sendto(
        &self,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<&SocketAddress>,
    ) -> VfsResult<usize> {
        if addr.is_some() {
            // Unconnected datagram sends by name are not supported.
            return Err(VfsError::new(Errno::OPNOTSUPP, "local_socket.sendto"));
        }
        self.send(buf, flags)
    }

    fn sendmsg(&self, bufs: &[IoSlice<'_>], flags: MsgFlags) -> VfsResult<usize> {
        // Gather first so datagram sockets emit a single message.
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut data = Vec::with_capacity(total);
        for buf in bufs {
            data.extend_from_slice(buf);
        }
        self.send(&data, flags)
    }

    fn recv(&self, buf: &mut [u8], _flags: MsgFlags) -> VfsResult<usize> {
        self.read_impl(buf)
    }

    fn recvfrom(
        &self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> VfsResult<(usize, Option<SocketAddress>)> {
        let n = self.recv(buf, flags)?;
        let peer_name = self.inner.lock().peer_name.clone();
        Ok((n, peer_name.map(SocketAddress::Unix)))
    }

    fn recvmsg(&self, bufs: &mut [IoSliceMut<'_>], flags: MsgFlags) -> VfsResult<usize> {
        // Scatter one message across the caller's buffers.
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut data = vec![0u8; total];
        let n = self.recv(&mut data, flags)?;
        let mut copied = 0;
        for buf in bufs.iter_mut() {
            if copied >= n {
                break;
            }
            let take = buf.len().min(n - copied);
            buf[..take].copy_from_slice(&data[copied..copied + take]);
            copied += take;
        }
        Ok(n)
    }

    fn getsockopt(&self, level: i32, optname: i32, optval: &mut [u8]) -> VfsResult<usize> {
        if level == libc::SOL_SOCKET && optname == libc::SO_ERROR && optval.len() >= 4 {
            optval[..4].copy_from_slice(&0i32.to_ne_bytes());
            return Ok(4);
        }
        Err(VfsError::new(Errno::OPNOTSUPP, "local_socket.getsockopt"))
    }

    fn setsockopt(&self, level: i32, _optname: i32, _optval: &[u8]) -> VfsResult<()> {
        if level == libc::SOL_SOCKET {
            // Accepted and ignored; buffers are unbounded in-process.
            return Ok(());
        }
        Err(VfsError::new(Errno::OPNOTSUPP, "local_socket.setsockopt"))
    }

    fn shutdown(&self, how: ShutdownHow) -> VfsResult<()> {
        {
            let mut inner = self.inner.lock();
            match how {
                ShutdownHow::Read => inner.shut_read = true,
                ShutdownHow::Write => inner.shut_write = true,
                ShutdownHow::Both => {
                    inner.shut_read = true;
                    inner.shut_write = true;
                }
            }
        }
        self.signal.notify();
        Ok(())
    }

    fn getpeername(&self) -> VfsResult<SocketAddress> {
        match self.inner.lock().peer_name.clone() {
            Some(name) => Ok(SocketAddress::Unix(name)),
            None => Err(VfsError::new(Errno::NOTCONN, "local_socket.getpeername")),
        }
    }

    fn getsockname(&self) -> VfsResult<SocketAddress> {
        let name = self.inner.lock().bound_name.clone().unwrap_or_default();
        Ok(SocketAddress::Unix(name))
    }

    fn is_select_read_ready(&self) -> bool {
        let inner = self.inner.lock();
        if !self.can_read() {
            return false;
        }
        if !inner.buffer.is_empty() || inner.shut_read {
            return true;
        }
        if inner.listen_backlog.is_some() {
            return !inner.pending.is_empty();
        }
        if !inner.connected {
            return false;
        }
        // EOF is readable.
        match inner.peer.as_ref().and_then(Weak::upgrade) {
            Some(peer) => peer.inner.lock().shut_write,
            None => true,
        }
    }

    fn is_select_write_ready(&self) -> bool {
        // Buffers are unbounded, so a connected writable end never blocks.
        self.can_write() && self.inner.lock().connected
    }

    fn poll_events(&self) -> PollEvents {
        let mut events = PollEvents::empty();
        if self.is_select_read_ready() {
            events |= PollEvents::IN;
        }
        let inner = self.inner.lock();
        let peer_alive = inner
            .peer
            .as_ref()
            .map(|peer| peer.upgrade().is_some())
            .unwrap_or(false);
        if inner.connected && !peer_alive {
            events |= PollEvents::HUP;
        }
        if self.can_write() && inner.connected && peer_alive && !inner.shut_write {
            events |= PollEvents::OUT;
        }
        events
    }
}

/// Per-VFS table of bound AF_UNIX names.
///
/// Entries hold weak references; a socket whose descriptors are all closed
/// simply stops being connectable.
pub struct AbstractSocketNamespace {
    names: HashMap<String, Weak<LocalSocket>>,
}

impl AbstractSocketNamespace {
    pub fn new() -> Self {
        Self {
            names: HashMap::new(),
        }
    }

    pub fn bind(&mut self, name: &str, socket: &Arc<LocalSocket>) -> VfsResult<()> {
        if let Some(existing) = self.names.get(name) {
            if existing.upgrade().is_some() {
                return Err(VfsError::new(Errno::ADDRINUSE, "socket_namespace.bind"));
            }
        }
        self.names.insert(name.to_string(), Arc::downgrade(socket));
        socket.set_bound_name(name);
        Ok(())
    }

    pub fn lookup(&mut self, name: &str) -> Option<Arc<LocalSocket>> {
        match self.names.get(name).and_then(Weak::upgrade) {
            Some(socket) => Some(socket),
            None => {
                self.names.remove(name);
                None
            }
        }
    }
}

impl Default for AbstractSocketNamespace {
    fn default() -> Self {
        Self::new()
    }
}
