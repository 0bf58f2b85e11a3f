//! The virtual file system: one object, one lock, the whole POSIX surface.
//!
//! Every public entry point acquires the global mutex, resolves its path or
//! descriptor, and delegates to the matching handler or stream. Blocking
//! behavior (pipes, sockets, preopen waits, poll/select/epoll) rides a single
//! process-wide condition variable that is broadcast whenever any stream's
//! readiness may have changed.

use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{info, trace, warn};

use crate::env::ProcessEnvironment;
use crate::error::{Errno, VfsError, VfsResult};
use crate::fd_table::{FdTable, RawFd};
use crate::flags::{MapFlags, MsgFlags, OpenFlags, ProtFlags};
use crate::handler::FileSystemHandler;
use crate::inode::InodeTable;
use crate::memory::{MemoryRegionMap, BAD_INODE};
use crate::metadata::{Stat, StatFs, StatVfs, TimeVal};
use crate::mount::MountPointManager;
use crate::pages;
use crate::path::{self, NormalizeMode};
use crate::permission::{is_app_uid, Permission, ROOT_GID, ROOT_UID};
use crate::poll::{
    deadline_after_ms, EpollEvent, EpollOp, FdSet, PollEvents, PollFd,
};
use crate::preopen::PreopenCache;
use crate::stream::{
    IoctlRequest, ReadySignal, ShutdownHow, SocketAddress, Stream, Whence,
};
use crate::streams::{
    AbstractSocketNamespace, AnonymousStream, DirEnt, DirectoryStream, EpollStream, LocalSocket,
    LocalSocketMode, LocalSocketType,
};

const MAX_SYMLINK_HOPS: usize = 40;
const PATH_MAX: usize = 4096;

const STDOUT_LOG_PATH: &str = "/var/log/app_stdout.log";
const STDERR_LOG_PATH: &str = "/var/log/app_stderr.log";

/// Embedder-tunable knobs. There is no CLI; the VFS is a library embedded in
/// a host process.
#[derive(Clone, Copy, Debug)]
pub struct VfsOptions {
    pub min_fd: RawFd,
    pub max_fd: RawFd,
    /// Tee stdout/stderr writes into fixed log files once the host is ready.
    pub save_logs_to_file: bool,
    /// Start the preopen worker when the host signals ready.
    pub enable_preopen: bool,
    /// Abort on a mapping the region map cannot record; otherwise it is a
    /// soft `ENODEV`.
    pub abort_on_unexpected_memory_maps: bool,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            min_fd: 3,
            max_fd: 1023,
            save_logs_to_file: false,
            enable_preopen: false,
            abort_on_unexpected_memory_maps: true,
        }
    }
}

/// Factory for AF_INET/AF_INET6 streams. The concrete network backends live
/// outside this crate; without a factory, inet `socket()` fails with
/// `EAFNOSUPPORT`.
pub trait InetSocketFactory: Send + Sync {
    fn tcp(&self, fd: RawFd, family: i32, oflag: OpenFlags) -> VfsResult<Arc<dyn Stream>>;
    fn udp(&self, fd: RawFd, family: i32, oflag: OpenFlags) -> VfsResult<Arc<dyn Stream>>;
}

/// Host hook behind `pathconf`/`fpathconf`.
pub type FsConfHook = Box<dyn Fn(&StatFs, i32) -> VfsResult<i64> + Send + Sync>;

/// `fcntl` commands the dispatch layer understands.
#[derive(Clone, Copy, Debug)]
pub enum FcntlCmd {
    DupFd(RawFd),
    GetFd,
    SetFd(i32),
    GetFl,
    SetFl(OpenFlags),
}

#[derive(Clone)]
struct DebugFd {
    target: Option<RawFd>,
    path: &'static str,
}

struct VfsState {
    env: Arc<dyn ProcessEnvironment>,
    mount_points: MountPointManager,
    fd_table: FdTable,
    memory: MemoryRegionMap,
    inodes: InodeTable,
    preopen: PreopenCache,
    abstract_sockets: AbstractSocketNamespace,
    debug_fds: HashMap<RawFd, DebugFd>,
    host_ready: bool,
    preopen_started: bool,
}

pub struct Vfs {
    state: Mutex<VfsState>,
    cond: Arc<Condvar>,
    opts: VfsOptions,
    main_thread: OnceLock<ThreadId>,
    fs_conf: OnceLock<FsConfHook>,
    inet_factory: OnceLock<Arc<dyn InetSocketFactory>>,
}

impl Vfs {
    pub fn new(
        root_handler: Arc<dyn FileSystemHandler>,
        env: Arc<dyn ProcessEnvironment>,
        opts: VfsOptions,
    ) -> Arc<Vfs> {
        let mut debug_fds = HashMap::new();
        if opts.save_logs_to_file {
            debug_fds.insert(
                libc::STDOUT_FILENO,
                DebugFd {
                    target: None,
                    path: STDOUT_LOG_PATH,
                },
            );
            debug_fds.insert(
                libc::STDERR_FILENO,
                DebugFd {
                    target: None,
                    path: STDERR_LOG_PATH,
                },
            );
        }
        Arc::new(Vfs {
            state: Mutex::new(VfsState {
                env,
                mount_points: MountPointManager::new(root_handler),
                fd_table: FdTable::new(opts.min_fd, opts.max_fd),
                memory: MemoryRegionMap::new(),
                inodes: InodeTable::new(),
                preopen: PreopenCache::new(),
                abstract_sockets: AbstractSocketNamespace::new(),
                debug_fds,
                host_ready: false,
                preopen_started: false,
            }),
            cond: Arc::new(Condvar::new()),
            opts,
            main_thread: OnceLock::new(),
            fs_conf: OnceLock::new(),
            inet_factory: OnceLock::new(),
        })
    }

    pub fn min_fd(&self) -> RawFd {
        self.opts.min_fd
    }

    pub fn max_fd(&self) -> RawFd {
        self.opts.max_fd
    }

    /// Record the calling thread as the main/UI thread. Handler lookups from
    /// it become fatal: handlers may block on host IPC, and blocking that
    /// thread deadlocks the host.
    pub fn register_main_thread(&self) {
        if self.main_thread.set(thread::current().id()).is_err() {
            warn!("main thread registered twice");
        }
    }

    pub fn set_fs_conf_hook(&self, hook: FsConfHook) {
        if self.fs_conf.set(hook).is_err() {
            warn!("fs_conf hook registered twice");
        }
    }

    pub fn set_inet_socket_factory(&self, factory: Arc<dyn InetSocketFactory>) {
        if self.inet_factory.set(factory).is_err() {
            warn!("inet socket factory registered twice");
        }
    }

    fn ready_signal(&self) -> ReadySignal {
        ReadySignal::new(self.cond.clone())
    }

    fn assert_not_main_thread(&self) {
        if let Some(main) = self.main_thread.get() {
            if *main == thread::current().id() {
                panic!("filesystem handlers must not be used on the main thread");
            }
        }
    }

    /// Wait on the readiness condvar. Returns true on timeout.
    fn wait_until(&self, guard: &mut MutexGuard<'_, VfsState>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.cond.wait_until(guard, deadline).timed_out(),
            None => {
                self.cond.wait(guard);
                false
            }
        }
    }

    // ---- Path normalization ------------------------------------------------

    fn resolve_symlinks_locked(&self, state: &VfsState, path: &mut String) -> VfsResult<()> {
        let mut hops = 0;
        loop {
            let Some(handler) = state.mount_points.handler(path) else {
                return Ok(());
            };
            match handler.readlink(path) {
                Ok(target) => {
                    if hops >= MAX_SYMLINK_HOPS {
                        return Err(VfsError::new(Errno::LOOP, "vfs.normalize"));
                    }
                    hops += 1;
                    debug_assert_ne!(*path, target, "self-referential symlink");
                    // The whole accumulated path is replaced by the target;
                    // relative targets are a known limitation.
                    *path = target;
                }
                Err(_) => return Ok(()),
            }
        }
    }

    fn normalize_locked(
        &self,
        state: &VfsState,
        pathname: &str,
        mode: NormalizeMode,
    ) -> VfsResult<String> {
        let mut p = pathname.to_string();
        let mut mode = mode;

        path::remove_trailing_slashes(&mut p);
        // lstat("/link_to_dir/.") must resolve the link: "." is itself the
        // final component.
        if mode == NormalizeMode::ResolveParentSymlinks && p.ends_with("/.") {
            mode = NormalizeMode::ResolveSymlinks;
        }
        path::remove_single_dots_and_redundant_slashes(&mut p);
        if p.is_empty() {
            return Ok(p);
        }

        if p == "." {
            p = state.env.current_directory();
            path::remove_trailing_slashes(&mut p);
        } else if !p.starts_with('/') {
            p.insert_str(0, &state.env.current_directory());
        }

        let components: Vec<&str> = p.split('/').filter(|c| !c.is_empty()).collect();
        let last = components.len().saturating_sub(1);
        let mut out = String::new();
        for (i, component) in components.iter().enumerate() {
            if *component == ".." {
                if !out.is_empty() {
                    let pos = out.rfind('/').expect("absolute accumulator");
                    out.truncate(pos);
                }
                continue;
            }
            out.push('/');
            out.push_str(component);
            let resolve_here = match mode {
                NormalizeMode::ResolveSymlinks => true,
                NormalizeMode::ResolveParentSymlinks => i != last,
            };
            if resolve_here {
                self.resolve_symlinks_locked(state, &mut out)?;
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        trace!(from = pathname, to = %out, "normalized path");
        Ok(out)
    }

    /// Normalized form of `pathname` with every symlink resolved. Public for
    /// embedder glue and tests.
    pub fn normalize(&self, pathname: &str) -> VfsResult<String> {
        let state = self.state.lock();
        self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)
    }

    // ---- Handler resolution ------------------------------------------------

    fn get_handler_locked(
        &self,
        state: &VfsState,
        path: &str,
    ) -> VfsResult<(Arc<dyn FileSystemHandler>, Permission)> {
        let Some((mount, _)) = state.mount_points.get(path) else {
            return Err(VfsError::new(Errno::NOENT, "vfs.handler"));
        };
        let handler = mount.handler.clone();
        let owner_uid = mount.owner_uid;

        if !handler.is_initialized() {
            info!(handler = handler.name(), "initializing handler");
            let started = Instant::now();
            handler.initialize();
            info!(
                handler = handler.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "handler initialized"
            );
            debug_assert!(handler.is_initialized());
        }

        // Writable when the caller is not an app, owns the mount, or the
        // handler opens the path to everyone.
        let uid = state.env.current_uid();
        let is_writable = !is_app_uid(uid) || owner_uid == uid || handler.is_world_writable(path);

        // Handlers may block on host IPC, which is not allowed on the main
        // thread.
        self.assert_not_main_thread();
        Ok((handler, Permission::new(owner_uid, is_writable)))
    }

    /// Linux checks existence before permission: a failing `stat` errno
    /// (`ENOENT`, `ENOTDIR`) is preferred over `EACCES`.
    fn deny_access_for_modify(
        &self,
        path: &str,
        handler: &Arc<dyn FileSystemHandler>,
        context: &'static str,
    ) -> VfsError {
        let err = match handler.stat(path) {
            Ok(_) => VfsError::new(Errno::ACCES, context),
            Err(err) => VfsError::new(err.errno(), context),
        };
        trace!(path, errno = %err.errno(), "denying access");
        err
    }

    fn deny_access_for_create(
        &self,
        path: &str,
        handler: &Arc<dyn FileSystemHandler>,
        context: &'static str,
    ) -> VfsError {
        self.deny_access_for_modify(&path::dir_name(path), handler, context)
    }

    // ---- open / close / dup ------------------------------------------------

    pub fn open(&self, pathname: &str, oflag: OpenFlags, mode: u32) -> VfsResult<RawFd> {
        let mut state = self.state.lock();
        self.open_locked(&mut state, pathname, oflag, mode, true)
    }

    fn open_locked(
        &self,
        guard: &mut MutexGuard<'_, VfsState>,
        pathname: &str,
        oflag: OpenFlags,
        mode: u32,
        use_preopened: bool,
    ) -> VfsResult<RawFd> {
        // Crash early: with a preopen hit this could otherwise succeed on
        // the main thread and fail intermittently.
        self.assert_not_main_thread();

        if oflag.access_mode() == crate::flags::AccessMode::ReadOnly
            && oflag.contains(OpenFlags::TRUNC)
        {
            warn!(pathname, "O_RDONLY|O_TRUNC requested");
        }

        let resolved = self.normalize_locked(guard, pathname, NormalizeMode::ResolveSymlinks)?;

        if use_preopened && oflag.is_preopen_eligible() {
            loop {
                if let Some(result) = guard.preopen.take_realized(&resolved) {
                    return result.map_err(|errno| VfsError::new(errno, "vfs.open.preopen"));
                }
                if !guard.preopen.has_pending(&resolved) {
                    break;
                }
                warn!(path = %resolved, "waiting for a slow preopen");
                self.cond.wait(guard);
            }
        }

        let (handler, permission) = self.get_handler_locked(guard, &resolved)?;

        if oflag.wants_write() && !permission.is_writable() {
            if oflag.contains(OpenFlags::CREAT) {
                if let Ok(st) = handler.stat(&resolved) {
                    if st.is_dir() {
                        // With O_CREAT the kernel prefers EISDIR over EACCES
                        // for directories.
                        return Err(VfsError::new(Errno::ISDIR, "vfs.open"));
                    }
                    if oflag.contains(OpenFlags::EXCL) {
                        // And EEXIST over EACCES for O_CREAT|O_EXCL.
                        return Err(VfsError::new(Errno::EXIST, "vfs.open"));
                    }
                }
                return Err(self.deny_access_for_create(&resolved, &handler, "vfs.open"));
            }
            return Err(self.deny_access_for_modify(&resolved, &handler, "vfs.open"));
        }

        let fd = guard
            .fd_table
            .first_unused()
            .ok_or(VfsError::new(Errno::MFILE, "vfs.open"))?;
        match handler.open(fd, &resolved, oflag, mode) {
            Ok(stream) => {
                stream.core().set_permission(permission);
                guard.fd_table.set(fd, stream);
                if !oflag.is_preopen_eligible() {
                    // A mutating open may create or truncate the file; any
                    // cached preopen result for the path is now stale.
                    self.close_preopened_guarded(guard, &resolved);
                }
                Ok(fd)
            }
            Err(err) => {
                guard.fd_table.remove(fd);
                Err(err)
            }
        }
    }

    pub fn close(&self, fd: RawFd) -> VfsResult<()> {
        let mut state = self.state.lock();
        self.close_locked(&mut state, fd)
    }

    fn close_locked(&self, state: &mut VfsState, fd: RawFd) -> VfsResult<()> {
        if state.fd_table.get(fd).is_none() {
            return Err(VfsError::new(Errno::BADF, "vfs.close"));
        }
        state.fd_table.remove(fd);
        // Dropping the stream may break a pipe peer or unblock a poller.
        self.cond.notify_all();
        Ok(())
    }

    pub fn dup(&self, fd: RawFd) -> VfsResult<RawFd> {
        let mut state = self.state.lock();
        self.dup_locked(&mut state, fd, None)
    }

    pub fn dup2(&self, fd: RawFd, newfd: RawFd) -> VfsResult<RawFd> {
        let mut state = self.state.lock();
        self.dup_locked(&mut state, fd, Some(newfd))
    }

    fn dup_locked(
        &self,
        state: &mut VfsState,
        fd: RawFd,
        newfd: Option<RawFd>,
    ) -> VfsResult<RawFd> {
        if state.fd_table.is_reserved(fd) {
            // A descriptor may be reserved ahead of its stream; duplicating
            // it yields another reserved slot.
            warn!(fd, "dup of a reserved descriptor");
            return match newfd {
                None => state
                    .fd_table
                    .first_unused()
                    .ok_or(VfsError::new(Errno::MFILE, "vfs.dup")),
                Some(newfd) if newfd == fd => Ok(newfd),
                Some(newfd) => {
                    if !state.fd_table.in_range(newfd) {
                        return Err(VfsError::new(Errno::BADF, "vfs.dup2"));
                    }
                    let _ = self.close_locked(state, newfd);
                    state.fd_table.reserve(newfd);
                    Ok(newfd)
                }
            };
        }

        let stream = state
            .fd_table
            .get(fd)
            .ok_or(VfsError::new(Errno::BADF, "vfs.dup"))?;
        let newfd = match newfd {
            None => state
                .fd_table
                .first_unused()
                .ok_or(VfsError::new(Errno::MFILE, "vfs.dup"))?,
            Some(newfd) => {
                if !state.fd_table.in_range(newfd) {
                    return Err(VfsError::new(Errno::BADF, "vfs.dup2"));
                }
                newfd
            }
        };
        if fd == newfd {
            // dup2(fd, fd) is a no-op. dup3 differs here; do not reuse.
            return Ok(newfd);
        }
        let _ = self.close_locked(state, newfd);
        state.fd_table.set(newfd, stream);
        Ok(newfd)
    }

    pub fn is_known_descriptor(&self, fd: RawFd) -> bool {
        self.state.lock().fd_table.is_known(fd)
    }

    /// Bind an externally created stream to a specific descriptor (stdio
    /// bootstrap). Fails when the descriptor is already taken.
    pub fn register_stream(&self, fd: RawFd, stream: Arc<dyn Stream>) -> bool {
        let mut state = self.state.lock();
        if state.fd_table.is_known(fd) {
            return false;
        }
        state.fd_table.set(fd, stream);
        true
    }

    fn stream_for(&self, state: &VfsState, fd: RawFd, context: &'static str) -> VfsResult<Arc<dyn Stream>> {
        state
            .fd_table
            .get(fd)
            .ok_or(VfsError::new(Errno::BADF, context))
    }

    // ---- Descriptor I/O ----------------------------------------------------

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.read")?;
        loop {
            match stream.read(buf) {
                Err(err) if err.errno() == Errno::AGAIN && stream.is_blocking() => {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn write(&self, fd: RawFd, buf: &[u8]) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.write")?;
        loop {
            match stream.write(buf) {
                Err(err) if err.errno() == Errno::AGAIN && stream.is_blocking() => {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.readv")?;
        loop {
            match stream.readv(bufs) {
                Err(err) if err.errno() == Errno::AGAIN && stream.is_blocking() => {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.writev")?;
        loop {
            match stream.writev(bufs) {
                Err(err) if err.errno() == Errno::AGAIN && stream.is_blocking() => {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: i64) -> VfsResult<usize> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.pread")?.pread(buf, offset)
    }

    pub fn pwrite(&self, fd: RawFd, buf: &[u8], offset: i64) -> VfsResult<usize> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.pwrite")?.pwrite(buf, offset)
    }

    pub fn lseek(&self, fd: RawFd, offset: i64, whence: Whence) -> VfsResult<i64> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.lseek")?.lseek(offset, whence)
    }

    pub fn ftruncate(&self, fd: RawFd, length: i64) -> VfsResult<()> {
        let state = self.state.lock();
        if length < 0 {
            return Err(VfsError::new(Errno::INVAL, "vfs.ftruncate"));
        }
        self.stream_for(&state, fd, "vfs.ftruncate")?.ftruncate(length)
    }

    pub fn fsync(&self, fd: RawFd) -> VfsResult<()> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.fsync")?.fsync()
    }

    pub fn fdatasync(&self, fd: RawFd) -> VfsResult<()> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.fdatasync")?.fdatasync()
    }

    pub fn fstat(&self, fd: RawFd) -> VfsResult<Stat> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.fstat")?;
        let mut st = stream.fstat()?;
        stream.permission().fill_stat(&mut st);
        if st.ino == 0 && !stream.pathname().is_empty() {
            st.ino = state.inodes.get_or_assign(stream.pathname());
        }
        Ok(st)
    }

    pub fn fstatfs(&self, fd: RawFd) -> VfsResult<StatFs> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.fstatfs")?.fstatfs()
    }

    pub fn fcntl(&self, fd: RawFd, cmd: FcntlCmd) -> VfsResult<i64> {
        let mut state = self.state.lock();
        match state.fd_table.get(fd) {
            Some(stream) => match cmd {
                FcntlCmd::DupFd(lower) => {
                    if lower < 0 {
                        return Err(VfsError::new(Errno::INVAL, "vfs.fcntl"));
                    }
                    let newfd = state
                        .fd_table
                        .first_unused_from(lower)
                        .ok_or(VfsError::new(Errno::MFILE, "vfs.fcntl"))?;
                    state.fd_table.set(newfd, stream);
                    Ok(newfd as i64)
                }
                FcntlCmd::GetFd => Ok(0),
                FcntlCmd::SetFd(_) => Ok(0),
                FcntlCmd::GetFl => Ok(stream.oflag().bits() as i64),
                FcntlCmd::SetFl(flags) => {
                    stream.core().set_status_flags(flags);
                    Ok(0)
                }
            },
            None if state.fd_table.is_known(fd) => {
                // Socket with a reserved fd but no stream yet; accept and
                // ignore.
                warn!(fd, "ignoring fcntl on a reserved descriptor");
                Ok(0)
            }
            None => Err(VfsError::new(Errno::BADF, "vfs.fcntl")),
        }
    }

    pub fn ioctl(&self, fd: RawFd, request: IoctlRequest) -> VfsResult<i64> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.ioctl")?.ioctl(request)
    }

    pub fn getdents(&self, fd: RawFd, max_bytes: usize) -> VfsResult<Vec<DirEnt>> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.getdents")?;
        let Some(dir) = stream.as_any().downcast_ref::<DirectoryStream>() else {
            return Err(VfsError::new(Errno::NOTDIR, "vfs.getdents"));
        };
        dir.getdents_locked(&mut state.inodes, max_bytes)
    }

    // ---- Path operations ---------------------------------------------------

    pub fn stat(&self, pathname: &str) -> VfsResult<Stat> {
        let mut state = self.state.lock();
        self.stat_locked(&mut state, pathname)
    }

    fn stat_locked(&self, state: &mut VfsState, pathname: &str) -> VfsResult<Stat> {
        let resolved = self.normalize_locked(state, pathname, NormalizeMode::ResolveSymlinks)?;
        let (handler, permission) = self.get_handler_locked(state, &resolved)?;
        let mut st = handler.stat(&resolved)?;
        permission.fill_stat(&mut st);
        if st.ino == 0 {
            st.ino = state.inodes.get_or_assign(&resolved);
        }
        Ok(st)
    }

    pub fn lstat(&self, pathname: &str) -> VfsResult<Stat> {
        let mut state = self.state.lock();
        let normalized =
            self.normalize_locked(&state, pathname, NormalizeMode::ResolveParentSymlinks)?;
        let Some(handler) = state.mount_points.handler(&normalized) else {
            return Err(VfsError::new(Errno::NOENT, "vfs.lstat"));
        };
        match handler.readlink(&normalized) {
            Ok(target) => Ok(Stat {
                // The unresolved path names the link itself, which is what
                // gets the inode here.
                ino: state.inodes.get_or_assign(&normalized),
                mode: libc::S_IFLNK | 0o777,
                nlink: 1,
                uid: ROOT_UID,
                gid: ROOT_GID,
                size: target.len() as i64,
                blksize: 4096,
                ..Stat::default()
            }),
            Err(_) => self.stat_locked(&mut state, &normalized),
        }
    }

    pub fn readlink(&self, pathname: &str) -> VfsResult<String> {
        let state = self.state.lock();
        let normalized =
            self.normalize_locked(&state, pathname, NormalizeMode::ResolveParentSymlinks)?;
        let Some(handler) = state.mount_points.handler(&normalized) else {
            return Err(VfsError::new(Errno::NOENT, "vfs.readlink"));
        };
        match handler.readlink(&normalized) {
            Ok(target) => Ok(target),
            Err(_) => match handler.stat(&normalized) {
                Ok(_) => Err(VfsError::new(Errno::INVAL, "vfs.readlink")),
                Err(_) => Err(VfsError::new(Errno::NOENT, "vfs.readlink")),
            },
        }
    }

    pub fn statfs(&self, pathname: &str) -> VfsResult<StatFs> {
        let state = self.state.lock();
        let resolved = self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)?;
        let (handler, _) = self.get_handler_locked(&state, &resolved)?;
        handler.statfs(&resolved)
    }

    pub fn statvfs(&self, pathname: &str) -> VfsResult<StatVfs> {
        Ok(StatVfs::from(self.statfs(pathname)?))
    }

    pub fn pathconf(&self, pathname: &str, name: i32) -> VfsResult<i64> {
        let hook = self
            .fs_conf
            .get()
            .ok_or(VfsError::new(Errno::NOSYS, "vfs.pathconf"))?;
        let statfs = self.statfs(pathname)?;
        hook(&statfs, name)
    }

    pub fn fpathconf(&self, fd: RawFd, name: i32) -> VfsResult<i64> {
        let hook = self
            .fs_conf
            .get()
            .ok_or(VfsError::new(Errno::NOSYS, "vfs.fpathconf"))?;
        let statfs = self.fstatfs(fd)?;
        hook(&statfs, name)
    }

    pub fn access(&self, pathname: &str, amode: i32) -> VfsResult<()> {
        let mut state = self.state.lock();
        let st = self.stat_locked(&mut state, pathname)?;

        // Apps cannot write system files unless explicitly world-writable.
        if amode & libc::W_OK != 0
            && st.mode & libc::S_IWOTH as u32 == 0
            && is_app_uid(state.env.current_uid())
            && !is_app_uid(st.uid)
        {
            return Err(VfsError::new(Errno::ACCES, "vfs.access"));
        }
        if amode & libc::X_OK != 0 && st.mode & libc::S_IXUSR as u32 == 0 {
            return Err(VfsError::new(Errno::ACCES, "vfs.access"));
        }
        // Read access is unrestricted.
        Ok(())
    }

    pub fn mkdir(&self, pathname: &str, mode: u32) -> VfsResult<()> {
        let state = self.state.lock();
        let resolved = self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)?;
        let (handler, permission) = self.get_handler_locked(&state, &resolved)?;
        if !permission.is_writable() {
            if handler.stat(&resolved).is_ok() {
                return Err(VfsError::new(Errno::EXIST, "vfs.mkdir"));
            }
            return Err(self.deny_access_for_create(&resolved, &handler, "vfs.mkdir"));
        }
        handler.mkdir(&resolved, mode)
    }

    pub fn rmdir(&self, pathname: &str) -> VfsResult<()> {
        let mut state = self.state.lock();
        let resolved = self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)?;
        let (handler, permission) = self.get_handler_locked(&state, &resolved)?;
        if !permission.is_writable() {
            return Err(self.deny_access_for_modify(&resolved, &handler, "vfs.rmdir"));
        }
        handler.rmdir(&resolved)?;
        state.inodes.remove(&resolved);
        Ok(())
    }

    pub fn unlink(&self, pathname: &str) -> VfsResult<()> {
        let mut state = self.state.lock();
        // The link itself is removed, not its target.
        let resolved =
            self.normalize_locked(&state, pathname, NormalizeMode::ResolveParentSymlinks)?;
        let (handler, permission) = self.get_handler_locked(&state, &resolved)?;
        if !permission.is_writable() {
            return Err(self.deny_access_for_modify(&resolved, &handler, "vfs.unlink"));
        }
        self.close_preopened_guarded(&mut state, &resolved);
        handler.unlink(&resolved)?;
        state.inodes.remove(&resolved);
        Ok(())
    }

    pub fn remove(&self, pathname: &str) -> VfsResult<()> {
        let mut state = self.state.lock();
        let resolved =
            self.normalize_locked(&state, pathname, NormalizeMode::ResolveParentSymlinks)?;
        let (handler, permission) = self.get_handler_locked(&state, &resolved)?;
        if !permission.is_writable() {
            return Err(self.deny_access_for_modify(&resolved, &handler, "vfs.remove"));
        }
        self.close_preopened_guarded(&mut state, &resolved);
        handler.remove(&resolved)?;
        state.inodes.remove(&resolved);
        Ok(())
    }

    pub fn rename(&self, oldpath: &str, newpath: &str) -> VfsResult<()> {
        let mut state = self.state.lock();
        let resolved_old = self.normalize_locked(&state, oldpath, NormalizeMode::ResolveSymlinks)?;
        let (handler, permission_old) = self.get_handler_locked(&state, &resolved_old)?;
        let resolved_new = self.normalize_locked(&state, newpath, NormalizeMode::ResolveSymlinks)?;
        let (another_handler, permission_new) = self.get_handler_locked(&state, &resolved_new)?;
        if !Arc::ptr_eq(&handler, &another_handler) {
            return Err(VfsError::new(Errno::XDEV, "vfs.rename"));
        }

        if resolved_new == resolved_old {
            // Renaming onto itself succeeds iff the file exists, even on a
            // read-only mount.
            return self.stat_locked(&mut state, &resolved_new).map(|_| ());
        }

        if !permission_old.is_writable() || !permission_new.is_writable() {
            let old_errno = self
                .deny_access_for_modify(&resolved_old, &handler, "vfs.rename")
                .errno();
            let new_errno = self
                .deny_access_for_create(&resolved_new, &handler, "vfs.rename")
                .errno();
            // ext4 prefers ENOTDIR over ENOENT over EACCES; merge both
            // sides by that order.
            for errno in [Errno::NOTDIR, Errno::NOENT] {
                if old_errno == errno || new_errno == errno {
                    return Err(VfsError::new(errno, "vfs.rename"));
                }
            }
            return Err(VfsError::new(Errno::ACCES, "vfs.rename"));
        }

        self.close_preopened_guarded(&mut state, &resolved_old);
        self.close_preopened_guarded(&mut state, &resolved_new);

        handler.rename(&resolved_old, &resolved_new)?;
        state.inodes.reassign(&resolved_old, &resolved_new);
        Ok(())
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> VfsResult<()> {
        let state = self.state.lock();
        let resolved_new = self.normalize_locked(&state, linkpath, NormalizeMode::ResolveSymlinks)?;
        let parent = path::dir_name(&resolved_new);
        let (handler, permission) = self.get_handler_locked(&state, &resolved_new)?;
        if handler.stat(&parent).is_err() {
            return Err(VfsError::new(Errno::NOENT, "vfs.symlink"));
        }
        if !permission.is_writable() {
            if handler.stat(&resolved_new).is_ok() {
                return Err(VfsError::new(Errno::EXIST, "vfs.symlink"));
            }
            return Err(self.deny_access_for_modify(&parent, &handler, "vfs.symlink"));
        }
        handler.symlink(target, &resolved_new)
    }

    pub fn truncate(&self, pathname: &str, length: i64) -> VfsResult<()> {
        let state = self.state.lock();
        if length < 0 {
            return Err(VfsError::new(Errno::INVAL, "vfs.truncate"));
        }
        let resolved = self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)?;
        let (handler, permission) = self.get_handler_locked(&state, &resolved)?;
        if !permission.is_writable() {
            return Err(self.deny_access_for_modify(&resolved, &handler, "vfs.truncate"));
        }
        handler.truncate(&resolved, length)
    }

    pub fn utime(&self, pathname: &str, actime: i64, modtime: i64) -> VfsResult<()> {
        self.utimes(
            pathname,
            &[
                TimeVal {
                    sec: actime,
                    usec: 0,
                },
                TimeVal {
                    sec: modtime,
                    usec: 0,
                },
            ],
        )
    }

    pub fn utimes(&self, pathname: &str, times: &[TimeVal; 2]) -> VfsResult<()> {
        let state = self.state.lock();
        let resolved = self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)?;
        let (handler, permission) = self.get_handler_locked(&state, &resolved)?;
        if !permission.is_writable() {
            return Err(self.deny_access_for_modify(&resolved, &handler, "vfs.utimes"));
        }
        handler.utimes(&resolved, times)
    }

    pub fn chown(&self, pathname: &str, owner_uid: u32) -> VfsResult<()> {
        let mut state = self.state.lock();
        if is_app_uid(state.env.current_uid()) {
            return Err(VfsError::new(Errno::PERM, "vfs.chown"));
        }
        let resolved = self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)?;
        let st = self.stat_locked(&mut state, &resolved)?;
        if st.is_dir() && !resolved.ends_with('/') {
            state
                .mount_points
                .change_owner(&format!("{resolved}/"), owner_uid);
        } else {
            state.mount_points.change_owner(&resolved, owner_uid);
        }
        Ok(())
    }

    pub fn chdir(&self, pathname: &str) -> VfsResult<()> {
        let mut state = self.state.lock();
        if pathname.is_empty() {
            return Err(VfsError::new(Errno::NOENT, "vfs.chdir"));
        }
        // chdir("dir/") must work even though stat("dir/") would not.
        let trimmed = pathname.trim_end_matches('/');
        let new_path = if trimmed.is_empty() {
            String::new()
        } else {
            self.normalize_locked(&state, trimmed, NormalizeMode::ResolveSymlinks)?
        };
        if !new_path.is_empty() {
            let st = self.stat_locked(&mut state, &new_path)?;
            if !st.is_dir() {
                return Err(VfsError::new(Errno::NOTDIR, "vfs.chdir"));
            }
        }
        // The stored CWD always keeps its trailing slash.
        state.env.set_current_directory(format!("{new_path}/"));
        Ok(())
    }

    fn cwd_without_trailing_slash(&self, state: &VfsState) -> String {
        let mut cwd = state.env.current_directory();
        debug_assert!(cwd.ends_with('/'));
        if cwd.len() > 1 {
            cwd.pop();
        }
        cwd
    }

    /// `getcwd` with a caller buffer: fails with `EINVAL` on an empty buffer
    /// and `ERANGE` when the path plus NUL does not fit. Returns the number
    /// of bytes written, including the NUL.
    pub fn getcwd(&self, buf: &mut [u8]) -> VfsResult<usize> {
        let state = self.state.lock();
        let cwd = self.cwd_without_trailing_slash(&state);
        if buf.is_empty() {
            return Err(VfsError::new(Errno::INVAL, "vfs.getcwd"));
        }
        if buf.len() <= cwd.len() {
            return Err(VfsError::new(Errno::RANGE, "vfs.getcwd"));
        }
        buf[..cwd.len()].copy_from_slice(cwd.as_bytes());
        buf[cwd.len()] = 0;
        Ok(cwd.len() + 1)
    }

    /// `getcwd(NULL, size)`: allocates. `size == 0` sizes the buffer exactly
    /// (path length plus NUL); a non-zero `size` smaller than that fails
    /// with `ERANGE`.
    pub fn getcwd_alloc(&self, size: usize) -> VfsResult<String> {
        let state = self.state.lock();
        let cwd = self.cwd_without_trailing_slash(&state);
        if size != 0 && size <= cwd.len() {
            return Err(VfsError::new(Errno::RANGE, "vfs.getcwd"));
        }
        Ok(cwd)
    }

    pub fn umask(&self, mask: u32) -> u32 {
        let state = self.state.lock();
        let old = state.env.current_umask();
        state.env.set_current_umask(mask);
        old
    }

    pub fn realpath(&self, pathname: &str) -> VfsResult<String> {
        let mut state = self.state.lock();
        // Nonexistent paths have no real path.
        self.stat_locked(&mut state, pathname)?;
        let resolved = self.normalize_locked(&state, pathname, NormalizeMode::ResolveSymlinks)?;
        if resolved.len() >= PATH_MAX {
            return Err(VfsError::new(Errno::NAMETOOLONG, "vfs.realpath"));
        }
        Ok(resolved)
    }

    // ---- Memory mapping ----------------------------------------------------

    pub fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: RawFd,
        offset: i64,
    ) -> VfsResult<usize> {
        let mut state = self.state.lock();

        if length == 0 {
            return Err(VfsError::new(Errno::INVAL, "vfs.mmap"));
        }
        let mut addr = addr;
        if !pages::is_page_aligned(addr) {
            // Linux accepts an unaligned hint unless MAP_FIXED; check the
            // flag here so the errno is consistent across stream kinds.
            if flags.contains(MapFlags::FIXED) {
                return Err(VfsError::new(Errno::INVAL, "vfs.mmap"));
            }
            let aligned = pages::page_align_down(addr);
            trace!(addr, aligned, "realigning mmap hint");
            addr = aligned;
        }
        if offset < 0 || !pages::is_page_aligned(offset as usize) {
            return Err(VfsError::new(Errno::INVAL, "vfs.mmap"));
        }

        let stream: Arc<dyn Stream> = if flags.contains(MapFlags::ANONYMOUS) {
            AnonymousStream::new()
        } else {
            self.stream_for(&state, fd, "vfs.mmap")?
        };

        let length = pages::round_up_to_page_size(length);
        let new_addr = stream.mmap(addr, length, prot, flags, offset)?;
        debug_assert!(pages::is_page_aligned(new_addr));

        if flags.contains(MapFlags::FIXED) {
            // The host mapping in [addr, addr+length) was already replaced
            // by the call above; drop the bookkeeping without munmap.
            let _ = state.memory.remove_range(addr, length, false);
        }

        let inode = if stream.pathname().is_empty() {
            BAD_INODE
        } else {
            state.inodes.get_or_assign(stream.pathname())
        };
        let inserted = state
            .memory
            .insert(new_addr, length, stream.clone(), offset, prot, flags, inode);
        if !inserted {
            if self.opts.abort_on_unexpected_memory_maps {
                panic!(
                    "unregisterable memory map at {:#x} (+{:#x}) backed by {}\n{}",
                    new_addr,
                    length,
                    stream.stream_type(),
                    state.memory.to_debug_string()
                );
            }
            warn!(
                addr = new_addr,
                length,
                stream = stream.stream_type(),
                "unregisterable memory map"
            );
            return Err(VfsError::new(Errno::NODEV, "vfs.mmap"));
        }
        Ok(new_addr)
    }

    pub fn munmap(&self, addr: usize, length: usize) -> VfsResult<()> {
        let mut state = self.state.lock();
        if !pages::is_page_aligned(addr) || length == 0 {
            return Err(VfsError::new(Errno::INVAL, "vfs.munmap"));
        }
        let length = pages::round_up_to_page_size(length);
        state.memory.remove_range(addr, length, true)
    }

    pub fn mprotect(&self, addr: usize, length: usize, prot: ProtFlags) -> VfsResult<()> {
        let mut state = self.state.lock();
        // A zero length is fine; the per-region walk just does nothing.
        if !pages::is_page_aligned(addr) {
            return Err(VfsError::new(Errno::INVAL, "vfs.mprotect"));
        }
        let length = pages::round_up_to_page_size(length);
        state.memory.change_protection(addr, length, prot)
    }

    pub fn madvise(&self, addr: usize, length: usize, advice: i32) -> VfsResult<()> {
        let mut state = self.state.lock();
        if !pages::is_page_aligned(addr) {
            return Err(VfsError::new(Errno::INVAL, "vfs.madvise"));
        }
        let length = pages::round_up_to_page_size(length);
        state.memory.advise(addr, length, advice)
    }

    /// Whether any writable mapping is backed by `inode`; handlers consult
    /// this before trusting read caches.
    pub fn is_write_mapped(&self, inode: u64) -> bool {
        self.state.lock().memory.is_write_mapped(inode)
    }

    pub fn is_memory_range_available(&self, addr: usize, length: usize) -> bool {
        let state = self.state.lock();
        !state
            .memory
            .overlaps(addr, pages::round_up_to_page_size(length))
    }

    pub fn memory_map_as_string(&self) -> String {
        self.state.lock().memory.to_debug_string()
    }

    pub fn memory_region_count(&self) -> usize {
        self.state.lock().memory.region_count()
    }

    // ---- poll / select / epoll ---------------------------------------------

    fn poll_ready_locked(&self, state: &VfsState, fds: &mut [PollFd], apply: bool) -> usize {
        let mut count = 0;
        for pollfd in fds.iter_mut() {
            let mask = pollfd.events | PollEvents::HUP | PollEvents::ERR | PollEvents::NVAL;
            let events = match state.fd_table.get(pollfd.fd) {
                Some(stream) => stream.poll_events(),
                None => PollEvents::NVAL,
            } & mask;
            if !events.is_empty() {
                count += 1;
            }
            if apply {
                pollfd.revents = events;
            }
        }
        count
    }

    pub fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> VfsResult<usize> {
        let mut state = self.state.lock();
        if timeout_ms != 0 {
            let deadline = deadline_after_ms(timeout_ms);
            while self.poll_ready_locked(&state, fds, false) == 0 {
                if self.wait_until(&mut state, deadline) {
                    break;
                }
            }
        }
        Ok(self.poll_ready_locked(&state, fds, true))
    }

    fn select_kind_ready(stream: &Arc<dyn Stream>, kind: usize) -> bool {
        match kind {
            0 => stream.is_select_read_ready(),
            1 => stream.is_select_write_ready(),
            _ => stream.is_select_exception_ready(),
        }
    }

    fn select_ready_count(
        &self,
        state: &VfsState,
        nfds: RawFd,
        set: Option<&FdSet>,
        kind: usize,
    ) -> usize {
        let Some(set) = set else { return 0 };
        let mut count = 0;
        for fd in 0..nfds {
            if !set.is_set(fd) {
                continue;
            }
            let Some(stream) = state.fd_table.get(fd) else {
                continue;
            };
            if Self::select_kind_ready(&stream, kind) {
                count += 1;
            }
        }
        count
    }

    fn select_apply(
        &self,
        state: &VfsState,
        nfds: RawFd,
        set: Option<&mut FdSet>,
        kind: usize,
    ) -> usize {
        let Some(set) = set else { return 0 };
        let mut count = 0;
        for fd in 0..nfds {
            if !set.is_set(fd) {
                continue;
            }
            let ready = state
                .fd_table
                .get(fd)
                .map(|stream| Self::select_kind_ready(&stream, kind))
                .unwrap_or(false);
            if ready {
                count += 1;
            } else {
                set.clear(fd);
            }
        }
        count
    }

    pub fn select(
        &self,
        nfds: RawFd,
        mut readfds: Option<&mut FdSet>,
        mut writefds: Option<&mut FdSet>,
        mut exceptfds: Option<&mut FdSet>,
        mut timeout: Option<&mut std::time::Duration>,
    ) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let nfds = nfds.clamp(0, crate::poll::FD_SETSIZE as RawFd);

        // A zero timeout is a pure poll.
        let is_polling = timeout.as_deref().map(|t| t.is_zero()).unwrap_or(false);
        let deadline = timeout.as_deref().map(|t| Instant::now() + *t);
        if !is_polling {
            loop {
                let ready = self.select_ready_count(&state, nfds, readfds.as_deref(), 0)
                    + self.select_ready_count(&state, nfds, writefds.as_deref(), 1)
                    + self.select_ready_count(&state, nfds, exceptfds.as_deref(), 2);
                if ready > 0 {
                    break;
                }
                if self.wait_until(&mut state, deadline) {
                    break;
                }
            }
            // Linux updates the remaining time; POSIX merely allows it.
            if let Some(t) = timeout.as_deref_mut() {
                let deadline = deadline.expect("deadline exists when timeout does");
                *t = deadline.saturating_duration_since(Instant::now());
            }
        }

        let nread = self.select_apply(&state, nfds, readfds.take(), 0);
        let nwrite = self.select_apply(&state, nfds, writefds.take(), 1);
        let nexcept = self.select_apply(&state, nfds, exceptfds.take(), 2);
        Ok(nread + nwrite + nexcept)
    }

    pub fn epoll_create1(&self, _flags: i32) -> VfsResult<RawFd> {
        let mut state = self.state.lock();
        let fd = state
            .fd_table
            .first_unused()
            .ok_or(VfsError::new(Errno::MFILE, "vfs.epoll_create1"))?;
        let stream = EpollStream::new(OpenFlags::RDWR);
        state.fd_table.set(fd, stream);
        Ok(fd)
    }

    pub fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: EpollOp,
        fd: RawFd,
        event: Option<EpollEvent>,
    ) -> VfsResult<()> {
        let state = self.state.lock();
        let epoll_stream = self.stream_for(&state, epfd, "vfs.epoll_ctl")?;
        let target = self.stream_for(&state, fd, "vfs.epoll_ctl")?;
        if epfd == fd {
            return Err(VfsError::new(Errno::INVAL, "vfs.epoll_ctl"));
        }
        let Some(epoll) = epoll_stream.as_any().downcast_ref::<EpollStream>() else {
            return Err(VfsError::new(Errno::INVAL, "vfs.epoll_ctl"));
        };
        epoll.ctl(op, &target, event)
    }

    pub fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [EpollEvent],
        timeout_ms: i32,
    ) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, epfd, "vfs.epoll_wait")?;
        let Some(epoll) = stream.as_any().downcast_ref::<EpollStream>() else {
            return Err(VfsError::new(Errno::INVAL, "vfs.epoll_wait"));
        };
        if events.is_empty() {
            return Err(VfsError::new(Errno::INVAL, "vfs.epoll_wait"));
        }
        let deadline = deadline_after_ms(timeout_ms);
        loop {
            let count = epoll.collect_ready(events);
            if count > 0 || timeout_ms == 0 {
                return Ok(count);
            }
            if self.wait_until(&mut state, deadline) {
                return Ok(epoll.collect_ready(events));
            }
        }
    }

    // ---- Sockets and pipes -------------------------------------------------

    pub fn socket(&self, family: i32, socket_type: i32, protocol: i32) -> VfsResult<RawFd> {
        let mut state = self.state.lock();
        let type_bits = socket_type & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let mut oflag = OpenFlags::RDWR;
        if socket_type & libc::SOCK_NONBLOCK != 0 {
            oflag |= OpenFlags::NONBLOCK;
        }
        if socket_type & libc::SOCK_CLOEXEC != 0 {
            oflag |= OpenFlags::CLOEXEC;
        }

        let fd = state
            .fd_table
            .first_unused()
            .ok_or(VfsError::new(Errno::MFILE, "vfs.socket"))?;

        let is_inet = family == libc::AF_INET || family == libc::AF_INET6;
        let stream: VfsResult<Arc<dyn Stream>> = if is_inet {
            match self.inet_factory.get() {
                Some(factory) if type_bits == libc::SOCK_STREAM => factory.tcp(fd, family, oflag),
                Some(factory) if type_bits == libc::SOCK_DGRAM => factory.udp(fd, family, oflag),
                _ => Err(VfsError::new(Errno::AFNOSUPPORT, "vfs.socket")),
            }
        } else if family == libc::AF_UNIX {
            match LocalSocketType::from_raw(type_bits) {
                Some(sock_type) => {
                    let socket = LocalSocket::new(
                        oflag,
                        sock_type,
                        LocalSocketMode::ReadWrite,
                        self.ready_signal(),
                    );
                    Ok(socket)
                }
                None => Err(VfsError::new(Errno::AFNOSUPPORT, "vfs.socket")),
            }
        } else {
            warn!(family, socket_type, protocol, "unsupported socket request");
            Err(VfsError::new(Errno::AFNOSUPPORT, "vfs.socket"))
        };

        match stream {
            Ok(stream) => {
                state.fd_table.set(fd, stream);
                Ok(fd)
            }
            Err(err) => {
                state.fd_table.remove(fd);
                Err(err)
            }
        }
    }

    pub fn socketpair(&self, family: i32, socket_type: i32, protocol: i32) -> VfsResult<[RawFd; 2]> {
        if family != libc::AF_UNIX {
            return Err(VfsError::new(Errno::AFNOSUPPORT, "vfs.socketpair"));
        }
        if protocol != 0 {
            return Err(VfsError::new(Errno::OPNOTSUPP, "vfs.socketpair"));
        }
        let type_bits = socket_type & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let Some(sock_type) = LocalSocketType::from_raw(type_bits) else {
            return Err(VfsError::new(Errno::OPNOTSUPP, "vfs.socketpair"));
        };
        let mut oflag = OpenFlags::RDWR;
        if socket_type & libc::SOCK_NONBLOCK != 0 {
            oflag |= OpenFlags::NONBLOCK;
        }

        let mut state = self.state.lock();
        let fd1 = state
            .fd_table
            .first_unused()
            .ok_or(VfsError::new(Errno::MFILE, "vfs.socketpair"))?;
        let Some(fd2) = state.fd_table.first_unused() else {
            state.fd_table.remove(fd1);
            return Err(VfsError::new(Errno::MFILE, "vfs.socketpair"));
        };
        let sock1 = LocalSocket::new(
            oflag,
            sock_type,
            LocalSocketMode::ReadWrite,
            self.ready_signal(),
        );
        let sock2 = LocalSocket::new(
            oflag,
            sock_type,
            LocalSocketMode::ReadWrite,
            self.ready_signal(),
        );
        LocalSocket::link_pair(&sock1, &sock2);
        state.fd_table.set(fd1, sock1);
        state.fd_table.set(fd2, sock2);
        Ok([fd1, fd2])
    }

    pub fn pipe2(&self, flags: OpenFlags) -> VfsResult<[RawFd; 2]> {
        let mut state = self.state.lock();
        let read_fd = state
            .fd_table
            .first_unused()
            .ok_or(VfsError::new(Errno::MFILE, "vfs.pipe2"))?;
        let Some(write_fd) = state.fd_table.first_unused() else {
            state.fd_table.remove(read_fd);
            return Err(VfsError::new(Errno::MFILE, "vfs.pipe2"));
        };
        let read_sock = LocalSocket::new(
            flags,
            LocalSocketType::Stream,
            LocalSocketMode::ReadOnly,
            self.ready_signal(),
        );
        let write_sock = LocalSocket::new(
            flags,
            LocalSocketType::Stream,
            LocalSocketMode::WriteOnly,
            self.ready_signal(),
        );
        LocalSocket::link_pair(&read_sock, &write_sock);
        state.fd_table.set(read_fd, read_sock);
        state.fd_table.set(write_fd, write_sock);
        Ok([read_fd, write_fd])
    }

    pub fn bind(&self, fd: RawFd, addr: &SocketAddress) -> VfsResult<()> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.bind")?;
        if let Some(local) = stream.clone().into_local_socket() {
            let SocketAddress::Unix(name) = addr else {
                return Err(VfsError::new(Errno::AFNOSUPPORT, "vfs.bind"));
            };
            if name.is_empty() {
                return Err(VfsError::new(Errno::INVAL, "vfs.bind"));
            }
            return state.abstract_sockets.bind(name, &local);
        }
        stream.bind(addr)
    }

    pub fn listen(&self, fd: RawFd, backlog: i32) -> VfsResult<()> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.listen")?.listen(backlog)
    }

    pub fn connect(&self, fd: RawFd, addr: &SocketAddress) -> VfsResult<()> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.connect")?;
        if let Some(local) = stream.clone().into_local_socket() {
            if local.is_connected() {
                return Err(VfsError::new(Errno::ISCONN, "vfs.connect"));
            }
            let SocketAddress::Unix(name) = addr else {
                return Err(VfsError::new(Errno::AFNOSUPPORT, "vfs.connect"));
            };
            let Some(listener) = state.abstract_sockets.lookup(name) else {
                return Err(VfsError::new(Errno::CONNREFUSED, "vfs.connect"));
            };
            if !listener.is_listening() || listener.sock_type() != local.sock_type() {
                return Err(VfsError::new(Errno::CONNREFUSED, "vfs.connect"));
            }
            return listener.enqueue_connection(&local);
        }
        stream.connect(addr)
    }

    pub fn accept(&self, fd: RawFd) -> VfsResult<(RawFd, Option<SocketAddress>)> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.accept")?;
        loop {
            match stream.accept() {
                Ok(connection) => {
                    let newfd = state
                        .fd_table
                        .first_unused()
                        .ok_or(VfsError::new(Errno::MFILE, "vfs.accept"))?;
                    let addr = connection.getpeername().ok();
                    state.fd_table.set(newfd, connection);
                    return Ok((newfd, addr));
                }
                Err(err) if err.errno() == Errno::AGAIN && stream.is_blocking() => {
                    self.cond.wait(&mut state);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_nonblocking_io(stream: &Arc<dyn Stream>, flags: MsgFlags) -> bool {
        !stream.is_blocking() || flags.contains(MsgFlags::DONTWAIT)
    }

    pub fn send(&self, fd: RawFd, buf: &[u8], flags: MsgFlags) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.send")?;
        loop {
            match stream.send(buf, flags) {
                Err(err)
                    if err.errno() == Errno::AGAIN && !Self::is_nonblocking_io(&stream, flags) =>
                {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn sendto(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<&SocketAddress>,
    ) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.sendto")?;
        loop {
            match stream.sendto(buf, flags, addr) {
                Err(err)
                    if err.errno() == Errno::AGAIN && !Self::is_nonblocking_io(&stream, flags) =>
                {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn sendmsg(&self, fd: RawFd, bufs: &[IoSlice<'_>], flags: MsgFlags) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.sendmsg")?;
        loop {
            match stream.sendmsg(bufs, flags) {
                Err(err)
                    if err.errno() == Errno::AGAIN && !Self::is_nonblocking_io(&stream, flags) =>
                {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn recv(&self, fd: RawFd, buf: &mut [u8], flags: MsgFlags) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.recv")?;
        loop {
            match stream.recv(buf, flags) {
                Err(err)
                    if err.errno() == Errno::AGAIN && !Self::is_nonblocking_io(&stream, flags) =>
                {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> VfsResult<(usize, Option<SocketAddress>)> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.recvfrom")?;
        loop {
            match stream.recvfrom(buf, flags) {
                Err(err)
                    if err.errno() == Errno::AGAIN && !Self::is_nonblocking_io(&stream, flags) =>
                {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn recvmsg(
        &self,
        fd: RawFd,
        bufs: &mut [IoSliceMut<'_>],
        flags: MsgFlags,
    ) -> VfsResult<usize> {
        let mut state = self.state.lock();
        let stream = self.stream_for(&state, fd, "vfs.recvmsg")?;
        loop {
            match stream.recvmsg(bufs, flags) {
                Err(err)
                    if err.errno() == Errno::AGAIN && !Self::is_nonblocking_io(&stream, flags) =>
                {
                    self.cond.wait(&mut state);
                }
                result => return result,
            }
        }
    }

    pub fn getsockopt(
        &self,
        fd: RawFd,
        level: i32,
        optname: i32,
        optval: &mut [u8],
    ) -> VfsResult<usize> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.getsockopt")?
            .getsockopt(level, optname, optval)
    }

    pub fn setsockopt(&self, fd: RawFd, level: i32, optname: i32, optval: &[u8]) -> VfsResult<()> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.setsockopt")?
            .setsockopt(level, optname, optval)
    }

    pub fn shutdown(&self, fd: RawFd, how: ShutdownHow) -> VfsResult<()> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.shutdown")?.shutdown(how)
    }

    pub fn getpeername(&self, fd: RawFd) -> VfsResult<SocketAddress> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.getpeername")?.getpeername()
    }

    pub fn getsockname(&self, fd: RawFd) -> VfsResult<SocketAddress> {
        let state = self.state.lock();
        self.stream_for(&state, fd, "vfs.getsockname")?.getsockname()
    }

    // ---- Mounts and caches -------------------------------------------------

    pub fn mount(&self, path: &str, handler: Arc<dyn FileSystemHandler>) {
        let mut state = self.state.lock();
        state.mount_points.add(path, handler);
    }

    pub fn unmount(&self, path: &str) {
        let mut state = self.state.lock();
        state.mount_points.remove(path);
    }

    pub fn change_mount_point_owner(&self, path: &str, owner_uid: u32) {
        let mut state = self.state.lock();
        state.mount_points.change_owner(path, owner_uid);
    }

    pub fn invalidate_caches(&self) {
        let state = self.state.lock();
        for handler in state.mount_points.all_handlers() {
            handler.invalidate_cache();
        }
    }

    pub fn add_to_cache(&self, path: &str, stat: &Stat, exists: bool) {
        let state = self.state.lock();
        let Ok(resolved) = self.normalize_locked(&state, path, NormalizeMode::ResolveSymlinks)
        else {
            return;
        };
        // The mount table is consulted directly so this stays safe on the
        // main thread (no lazy handler initialization).
        match state.mount_points.handler(&resolved) {
            Some(handler) => handler.add_to_cache(&resolved, stat, exists),
            None => warn!(path, "add_to_cache: no handler for path"),
        }
    }

    // ---- Host readiness and preopen ---------------------------------------

    pub fn set_host_ready(self: &Arc<Self>) {
        let mut state = self.state.lock();
        assert!(!state.host_ready, "set_host_ready called twice");
        state.host_ready = true;
        info!("host is ready");
        if self.opts.enable_preopen {
            self.start_preopen_locked(&mut state);
        }
        self.cond.notify_all();
    }

    pub fn is_host_ready(&self) -> bool {
        self.state.lock().host_ready
    }

    /// Queue `path` for speculative opening by the worker. Must happen
    /// before the host becomes ready.
    pub fn schedule_preopen(&self, path: &str) -> VfsResult<()> {
        let mut state = self.state.lock();
        assert!(
            !state.preopen_started,
            "schedule_preopen called after the preopen worker started"
        );
        let resolved = self.normalize_locked(&state, path, NormalizeMode::ResolveSymlinks)?;
        state.preopen.schedule(&resolved);
        Ok(())
    }

    fn start_preopen_locked(self: &Arc<Self>, state: &mut VfsState) {
        assert!(!state.preopen_started, "preopen worker started twice");
        state.preopen_started = true;
        let vfs = Arc::clone(self);
        // Detached on purpose: in-flight preopens at shutdown leak their
        // descriptors to the OS, which is fine for a process-local VFS.
        thread::Builder::new()
            .name("preopen".to_string())
            .spawn(move || vfs.perform_preopens())
            .expect("failed to start the preopen worker");
    }

    fn perform_preopens(&self) {
        let mut state = self.state.lock();
        for resolved in state.preopen.scheduled_paths() {
            if !state.preopen.has_pending(&resolved) {
                // Already invalidated by a mutating call.
                continue;
            }
            let result =
                match self.open_locked(&mut state, &resolved, OpenFlags::RDONLY, 0, false) {
                    Ok(fd) => Ok(fd),
                    Err(err) => {
                        trace!(path = %resolved, errno = %err.errno(), "preopen failed");
                        Err(err.errno())
                    }
                };
            if !state.preopen.fill_pending(&resolved, result) {
                if let Ok(fd) = result {
                    let _ = self.close_locked(&mut state, fd);
                }
            }
            // Wake any open() blocked on this entry.
            self.cond.notify_all();
        }
    }

    fn close_preopened_guarded(&self, state: &mut VfsState, resolved: &str) {
        let fds = state.preopen.invalidate(resolved);
        for fd in fds {
            warn!(path = resolved, fd, "invalidating a preopened descriptor");
            let _ = self.close_locked(state, fd);
        }
    }

    // ---- Debug log teeing --------------------------------------------------

    /// Mirror a write to stdout/stderr into the configured log file. Called
    /// by the embedder's logging glue; silently does nothing until the host
    /// is ready.
    pub fn debug_write(&self, fd: RawFd, buf: &[u8]) {
        let mut state = self.state.lock();
        if !state.host_ready {
            return;
        }
        let Some(debug_fd) = state.debug_fds.get(&fd).cloned() else {
            return;
        };
        let stream = match debug_fd.target {
            Some(target) => state.fd_table.get(target),
            None => {
                let Some(newfd) = state.fd_table.first_unused() else {
                    return;
                };
                let opened = self
                    .get_handler_locked(&state, debug_fd.path)
                    .and_then(|(handler, permission)| {
                        let stream = handler.open(
                            newfd,
                            debug_fd.path,
                            OpenFlags::CREAT | OpenFlags::RDWR,
                            0o600,
                        )?;
                        stream.core().set_permission(permission);
                        Ok(stream)
                    });
                match opened {
                    Ok(stream) => {
                        state.fd_table.set(newfd, stream.clone());
                        state.debug_fds.get_mut(&fd).expect("entry").target = Some(newfd);
                        Some(stream)
                    }
                    Err(err) => {
                        warn!(path = debug_fd.path, errno = %err.errno(), "debug log open failed");
                        state.fd_table.remove(newfd);
                        None
                    }
                }
            }
        };
        if let Some(stream) = stream {
            let _ = stream.write(buf);
        }
    }
}
