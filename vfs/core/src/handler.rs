//! The handler contract: one implementor owns all path-based operations
//! under one mount prefix.
//!
//! All paths a handler sees are already normalized by the VFS. Mutating
//! operations default to `EPERM` so read-only handlers stay small; `remove`
//! defaults to the stat-then-unlink-or-rmdir dance so most handlers never
//! implement it.

use std::sync::Arc;

use crate::error::{Errno, VfsError, VfsResult};
use crate::fd_table::RawFd;
use crate::flags::OpenFlags;
use crate::metadata::{Stat, StatFs, TimeVal};
use crate::stream::Stream;

/// Entry kinds a directory listing can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirEntryType {
    Regular,
    Directory,
    Symlink,
}

impl DirEntryType {
    /// The `d_type` byte of a `dirent64`.
    pub fn dtype(self) -> u8 {
        match self {
            DirEntryType::Regular => libc::DT_REG,
            DirEntryType::Directory => libc::DT_DIR,
            DirEntryType::Symlink => libc::DT_LNK,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub entry_type: DirEntryType,
}

/// Directory contents produced by a handler and drained lazily by the VFS
/// through `getdents`.
#[derive(Clone, Debug, Default)]
pub struct DirContents {
    entries: Vec<DirEntry>,
    pos: usize,
}

impl DirContents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents pre-seeded with the `.` and `..` entries every directory
    /// carries.
    pub fn with_dot_entries() -> Self {
        let mut contents = Self::new();
        contents.add(".", DirEntryType::Directory);
        contents.add("..", DirEntryType::Directory);
        contents
    }

    pub fn add(&mut self, name: impl Into<String>, entry_type: DirEntryType) {
        self.entries.push(DirEntry {
            name: name.into(),
            entry_type,
        });
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Entry at the cursor, without consuming it.
    pub fn peek(&self) -> Option<&DirEntry> {
        self.entries.get(self.pos)
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A filesystem backend mounted at one or more prefixes.
pub trait FileSystemHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handlers that talk to the host may defer expensive setup; the VFS
    /// calls [`FileSystemHandler::initialize`] on first lookup, under the
    /// VFS lock. Implementations must not re-enter the VFS from it.
    fn is_initialized(&self) -> bool {
        true
    }

    fn initialize(&self) {}

    fn on_mounted(&self, _path: &str) {}

    fn on_unmounted(&self, _path: &str) {}

    /// Drop any host-state caches. Called on global cache invalidation.
    fn invalidate_cache(&self) {}

    /// Warm the handler's metadata cache with an externally known result.
    fn add_to_cache(&self, _path: &str, _stat: &Stat, _exists: bool) {}

    /// Whether `path` is writable regardless of the caller's UID.
    fn is_world_writable(&self, _path: &str) -> bool {
        false
    }

    /// Open `path` and produce a stream. `fd` is the descriptor the stream
    /// will be bound to (already reserved by the VFS).
    fn open(
        &self,
        fd: RawFd,
        path: &str,
        oflag: OpenFlags,
        mode: u32,
    ) -> VfsResult<Arc<dyn Stream>>;

    fn stat(&self, path: &str) -> VfsResult<Stat>;

    fn statfs(&self, _path: &str) -> VfsResult<StatFs> {
        Err(VfsError::new(Errno::NOSYS, "handler.statfs"))
    }

    fn mkdir(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::new(Errno::PERM, "handler.mkdir"))
    }

    fn rmdir(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::new(Errno::PERM, "handler.rmdir"))
    }

    fn unlink(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::new(Errno::PERM, "handler.unlink"))
    }

    /// `remove(3)` semantics: unlink files and symlinks, rmdir directories.
    fn remove(&self, path: &str) -> VfsResult<()> {
        match self.stat(path) {
            Ok(st) if st.is_dir() => self.rmdir(path),
            Ok(_) => self.unlink(path),
            Err(err) => Err(err),
        }
    }

    fn rename(&self, _old_path: &str, _new_path: &str) -> VfsResult<()> {
        Err(VfsError::new(Errno::PERM, "handler.rename"))
    }

    fn truncate(&self, _path: &str, _length: i64) -> VfsResult<()> {
        Err(VfsError::new(Errno::PERM, "handler.truncate"))
    }

    fn utimes(&self, _path: &str, _times: &[TimeVal; 2]) -> VfsResult<()> {
        Err(VfsError::new(Errno::PERM, "handler.utimes"))
    }

    /// Target of the symlink at `path`. `EINVAL` when `path` is not a link,
    /// which is what the path normalizer probes for.
    fn readlink(&self, _path: &str) -> VfsResult<String> {
        Err(VfsError::new(Errno::INVAL, "handler.readlink"))
    }

    fn symlink(&self, _target: &str, _link_path: &str) -> VfsResult<()> {
        Err(VfsError::new(Errno::PERM, "handler.symlink"))
    }

    /// Listing of the directory at `path`, drained by the VFS via
    /// `getdents` on a directory stream.
    fn on_directory_contents_needed(&self, _path: &str) -> VfsResult<DirContents> {
        Err(VfsError::new(Errno::NOSYS, "handler.directory_contents"))
    }
}
