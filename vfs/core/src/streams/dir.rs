//! Directory stream returned by `open(O_DIRECTORY)`.
//!
//! Contents come lazily from the owning handler's
//! `on_directory_contents_needed`; child inode numbers come from the inode
//! table at drain time, which is why `getdents` runs through the dispatch
//! layer rather than the plain stream trait.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Errno, VfsError, VfsResult};
use crate::flags::OpenFlags;
use crate::handler::{DirContents, DirEntryType, FileSystemHandler};
use crate::inode::InodeTable;
use crate::metadata::{Stat, StatFs};
use crate::path::dir_name;
use crate::stream::{Stream, StreamCore, Whence};

/// One `dirent64`-shaped record produced by `getdents`.
#[derive(Clone, Debug)]
pub struct DirEnt {
    pub ino: u64,
    pub entry_type: DirEntryType,
    pub name: String,
}

// Fixed part of a struct dirent64: d_ino + d_off + d_reclen + d_type.
const DIRENT64_HEADER_LEN: usize = 19;

fn dirent64_record_len(name: &str) -> usize {
    // Name plus NUL, padded to an 8-byte boundary.
    (DIRENT64_HEADER_LEN + name.len() + 1 + 7) & !7
}

pub struct DirectoryStream {
    core: StreamCore,
    handler: Arc<dyn FileSystemHandler>,
    contents: Mutex<Option<DirContents>>,
}

impl DirectoryStream {
    pub fn new(
        pathname: String,
        oflag: OpenFlags,
        handler: Arc<dyn FileSystemHandler>,
    ) -> Arc<DirectoryStream> {
        Arc::new(DirectoryStream {
            core: StreamCore::new(pathname, oflag),
            handler,
            contents: Mutex::new(None),
        })
    }

    /// Drain up to `max_bytes` worth of `dirent64` records.
    ///
    /// Inode numbers: `.` is the directory itself, `..` its parent, anything
    /// else the child path. Called with the VFS lock held so the inode table
    /// can assign lazily.
    pub fn getdents_locked(
        &self,
        inodes: &mut InodeTable,
        max_bytes: usize,
    ) -> VfsResult<Vec<DirEnt>> {
        let mut guard = self.contents.lock();
        if guard.is_none() {
            *guard = Some(self.handler.on_directory_contents_needed(self.pathname())?);
        }
        let contents = guard.as_mut().expect("contents");

        let mut out = Vec::new();
        let mut used = 0;
        while let Some(entry) = contents.peek() {
            let record_len = dirent64_record_len(&entry.name);
            if used + record_len > max_bytes {
                if out.is_empty() {
                    // Not even one record fits in the caller's buffer.
                    return Err(VfsError::new(Errno::INVAL, "dir.getdents"));
                }
                break;
            }
            let dir_path = self.pathname();
            let child_path;
            let ino_path: &str = match entry.name.as_str() {
                "." => dir_path,
                ".." => {
                    child_path = dir_name(dir_path);
                    child_path.as_str()
                }
                name => {
                    child_path = if dir_path == "/" {
                        format!("/{name}")
                    } else {
                        format!("{dir_path}/{name}")
                    };
                    child_path.as_str()
                }
            };
            out.push(DirEnt {
                ino: inodes.get_or_assign(ino_path),
                entry_type: entry.entry_type,
                name: entry.name.clone(),
            });
            used += record_len;
            contents.advance();
        }
        Ok(out)
    }
}

impl Stream for DirectoryStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_type(&self) -> &'static str {
        "dir"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn read(&self, _buf: &mut [u8]) -> VfsResult<usize> {
        Err(VfsError::new(Errno::ISDIR, "dir.read"))
    }

    fn write(&self, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::new(Errno::BADF, "dir.write"))
    }

    /// `lseek(0, SEEK_SET)` rewinds the directory; nothing else is
    /// supported.
    fn lseek(&self, offset: i64, whence: Whence) -> VfsResult<i64> {
        if offset == 0 && whence == Whence::Set {
            let mut guard = self.contents.lock();
            if let Some(contents) = guard.as_mut() {
                contents.rewind();
            }
            return Ok(0);
        }
        Err(VfsError::new(Errno::INVAL, "dir.lseek"))
    }

    fn fstat(&self) -> VfsResult<Stat> {
        self.handler.stat(self.pathname())
    }

    fn fstatfs(&self) -> VfsResult<StatFs> {
        self.handler.statfs(self.pathname())
    }
}
