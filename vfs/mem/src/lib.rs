//! In-memory filesystem handler.
//!
//! Everything lives in one path-keyed table: regular files are shared
//! byte buffers, directories are markers whose children are found by prefix
//! scan, symlinks store their target verbatim. The handler backs `/tmp`-like
//! mounts and is the primary fixture for exercising the VFS itself.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use ptfs_core::pages;
use ptfs_core::path::{base_name, dir_name};
use ptfs_core::stream::Whence;
use ptfs_core::{
    DirContents, DirEntryType, DirectoryStream, Errno, FileSystemHandler, MapFlags, OpenFlags,
    ProtFlags, RawFd, Stat, StatFs, Stream, StreamCore, TimeSpec, TimeVal, VfsError, VfsResult,
};

fn now() -> TimeSpec {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => TimeSpec {
            sec: elapsed.as_secs() as i64,
            nsec: elapsed.subsec_nanos() as i64,
        },
        Err(_) => TimeSpec::default(),
    }
}

#[derive(Clone, Copy, Debug)]
struct FileTimes {
    atime: TimeSpec,
    mtime: TimeSpec,
    ctime: TimeSpec,
}

impl FileTimes {
    fn fresh() -> Self {
        let t = now();
        Self {
            atime: t,
            mtime: t,
            ctime: t,
        }
    }
}

#[derive(Debug)]
struct FileNode {
    data: RwLock<Vec<u8>>,
    times: RwLock<FileTimes>,
}

impl FileNode {
    fn new() -> Arc<FileNode> {
        Arc::new(FileNode {
            data: RwLock::new(Vec::new()),
            times: RwLock::new(FileTimes::fresh()),
        })
    }
}

#[derive(Debug)]
struct DirNode {
    times: RwLock<FileTimes>,
}

impl DirNode {
    fn new() -> Arc<DirNode> {
        Arc::new(DirNode {
            times: RwLock::new(FileTimes::fresh()),
        })
    }
}

#[derive(Clone, Debug)]
enum MemNode {
    File(Arc<FileNode>),
    Dir(Arc<DirNode>),
    Symlink(String),
}

/// Path-keyed in-memory filesystem.
pub struct MemHandler {
    self_ref: Weak<MemHandler>,
    nodes: RwLock<BTreeMap<String, MemNode>>,
    world_writable: bool,
}

impl MemHandler {
    pub fn new() -> Arc<MemHandler> {
        Self::with_world_writable(false)
    }

    /// A handler whose paths are writable to every UID, regardless of the
    /// mount owner.
    pub fn with_world_writable(world_writable: bool) -> Arc<MemHandler> {
        Arc::new_cyclic(|self_ref| {
            let mut nodes = BTreeMap::new();
            nodes.insert("/".to_string(), MemNode::Dir(DirNode::new()));
            MemHandler {
                self_ref: self_ref.clone(),
                nodes: RwLock::new(nodes),
                world_writable,
            }
        })
    }

    fn arc_self(&self) -> Arc<dyn FileSystemHandler> {
        self.self_ref.upgrade().expect("handler alive")
    }

    fn lookup(&self, path: &str) -> Option<MemNode> {
        self.nodes.read().expect("lock").get(path).cloned()
    }

    /// `ENOENT` when the parent is missing, `ENOTDIR` when it is not a
    /// directory: the errno order the access checks rely on.
    fn check_parent_dir(&self, path: &str, context: &'static str) -> VfsResult<()> {
        let parent = dir_name(path);
        match self.lookup(&parent) {
            Some(MemNode::Dir(_)) => Ok(()),
            Some(_) => Err(VfsError::new(Errno::NOTDIR, context)),
            None => Err(VfsError::new(Errno::NOENT, context)),
        }
    }

    fn child_prefix(path: &str) -> String {
        if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = Self::child_prefix(path);
        self.nodes
            .read()
            .expect("lock")
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .any(|(key, _)| key.as_str() != path)
    }

    fn create_file(&self, path: &str, context: &'static str) -> VfsResult<Arc<FileNode>> {
        self.check_parent_dir(path, context)?;
        let node = FileNode::new();
        self.nodes
            .write()
            .expect("lock")
            .insert(path.to_string(), MemNode::File(node.clone()));
        Ok(node)
    }
}

impl FileSystemHandler for MemHandler {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn is_world_writable(&self, _path: &str) -> bool {
        self.world_writable
    }

    fn on_mounted(&self, path: &str) {
        // Make sure the mount root exists so lookups under it work.
        let root = path.trim_end_matches('/');
        let root = if root.is_empty() { "/" } else { root };
        let mut nodes = self.nodes.write().expect("lock");
        nodes
            .entry(root.to_string())
            .or_insert_with(|| MemNode::Dir(DirNode::new()));
    }

    fn open(
        &self,
        _fd: RawFd,
        path: &str,
        oflag: OpenFlags,
        _mode: u32,
    ) -> VfsResult<Arc<dyn Stream>> {
        match self.lookup(path) {
            Some(MemNode::Dir(_)) => {
                if oflag.wants_write() {
                    return Err(VfsError::new(Errno::ISDIR, "mem.open"));
                }
                Ok(DirectoryStream::new(path.to_string(), oflag, self.arc_self()))
            }
            Some(MemNode::File(node)) => {
                if oflag.contains(OpenFlags::DIRECTORY) {
                    return Err(VfsError::new(Errno::NOTDIR, "mem.open"));
                }
                if oflag.contains(OpenFlags::CREAT) && oflag.contains(OpenFlags::EXCL) {
                    return Err(VfsError::new(Errno::EXIST, "mem.open"));
                }
                if oflag.contains(OpenFlags::TRUNC) {
                    node.data.write().expect("lock").clear();
                    node.times.write().expect("lock").mtime = now();
                }
                Ok(MemFileStream::new(path.to_string(), oflag, node))
            }
            Some(MemNode::Symlink(_)) => {
                // The VFS resolves links before calling open; reaching one
                // here means a dangling or NOFOLLOW access.
                Err(VfsError::new(Errno::LOOP, "mem.open"))
            }
            None => {
                if !oflag.contains(OpenFlags::CREAT) {
                    return Err(VfsError::new(Errno::NOENT, "mem.open"));
                }
                if oflag.contains(OpenFlags::DIRECTORY) {
                    return Err(VfsError::new(Errno::NOENT, "mem.open"));
                }
                let node = self.create_file(path, "mem.open")?;
                Ok(MemFileStream::new(path.to_string(), oflag, node))
            }
        }
    }

    fn stat(&self, path: &str) -> VfsResult<Stat> {
        match self.lookup(path) {
            Some(MemNode::File(node)) => {
                let times = *node.times.read().expect("lock");
                Ok(Stat {
                    mode: libc::S_IFREG,
                    nlink: 1,
                    size: node.data.read().expect("lock").len() as i64,
                    blksize: 4096,
                    atime: times.atime,
                    mtime: times.mtime,
                    ctime: times.ctime,
                    ..Stat::default()
                })
            }
            Some(MemNode::Dir(node)) => {
                let times = *node.times.read().expect("lock");
                Ok(Stat {
                    mode: libc::S_IFDIR,
                    nlink: 2,
                    blksize: 4096,
                    atime: times.atime,
                    mtime: times.mtime,
                    ctime: times.ctime,
                    ..Stat::default()
                })
            }
            Some(MemNode::Symlink(target)) => Ok(Stat {
                mode: libc::S_IFLNK | 0o777,
                nlink: 1,
                size: target.len() as i64,
                blksize: 4096,
                ..Stat::default()
            }),
            None => {
                // Distinguish ENOTDIR ("/file/x") from plain ENOENT.
                let parent = dir_name(path);
                match self.lookup(&parent) {
                    Some(MemNode::Dir(_)) | None => Err(VfsError::new(Errno::NOENT, "mem.stat")),
                    Some(_) => Err(VfsError::new(Errno::NOTDIR, "mem.stat")),
                }
            }
        }
    }

    fn statfs(&self, _path: &str) -> VfsResult<StatFs> {
        Ok(StatFs {
            fs_type: libc::TMPFS_MAGIC as i64,
            bsize: 4096,
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 16,
            ffree: 1 << 15,
            fsid: 0,
            namelen: 255,
            frsize: 4096,
        })
    }

    fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<()> {
        if self.lookup(path).is_some() {
            return Err(VfsError::new(Errno::EXIST, "mem.mkdir"));
        }
        self.check_parent_dir(path, "mem.mkdir")?;
        self.nodes
            .write()
            .expect("lock")
            .insert(path.to_string(), MemNode::Dir(DirNode::new()));
        Ok(())
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        match self.lookup(path) {
            Some(MemNode::Dir(_)) => {
                if self.has_children(path) {
                    return Err(VfsError::new(Errno::NOTEMPTY, "mem.rmdir"));
                }
                if path == "/" {
                    return Err(VfsError::new(Errno::BUSY, "mem.rmdir"));
                }
                self.nodes.write().expect("lock").remove(path);
                Ok(())
            }
            Some(_) => Err(VfsError::new(Errno::NOTDIR, "mem.rmdir")),
            None => Err(VfsError::new(Errno::NOENT, "mem.rmdir")),
        }
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        match self.lookup(path) {
            Some(MemNode::Dir(_)) => Err(VfsError::new(Errno::ISDIR, "mem.unlink")),
            Some(_) => {
                self.nodes.write().expect("lock").remove(path);
                Ok(())
            }
            None => Err(VfsError::new(Errno::NOENT, "mem.unlink")),
        }
    }

    fn rename(&self, old_path: &str, new_path: &str) -> VfsResult<()> {
        let old_node = self
            .lookup(old_path)
            .ok_or(VfsError::new(Errno::NOENT, "mem.rename"))?;
        self.check_parent_dir(new_path, "mem.rename")?;

        let old_is_dir = matches!(old_node, MemNode::Dir(_));
        if let Some(new_node) = self.lookup(new_path) {
            match (&old_node, &new_node) {
                (MemNode::Dir(_), MemNode::Dir(_)) => {
                    if self.has_children(new_path) {
                        return Err(VfsError::new(Errno::NOTEMPTY, "mem.rename"));
                    }
                }
                (MemNode::Dir(_), _) => {
                    return Err(VfsError::new(Errno::NOTDIR, "mem.rename"));
                }
                (_, MemNode::Dir(_)) => {
                    return Err(VfsError::new(Errno::ISDIR, "mem.rename"));
                }
                _ => {}
            }
        }

        let mut nodes = self.nodes.write().expect("lock");
        nodes.remove(new_path);
        let node = nodes.remove(old_path).expect("checked above");
        nodes.insert(new_path.to_string(), node);
        if old_is_dir {
            // Re-key the whole subtree.
            let old_prefix = Self::child_prefix(old_path);
            let new_prefix = Self::child_prefix(new_path);
            let moved: Vec<String> = nodes
                .range(old_prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&old_prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in moved {
                let node = nodes.remove(&key).expect("key listed");
                let new_key = format!("{new_prefix}{}", &key[old_prefix.len()..]);
                nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    fn truncate(&self, path: &str, length: i64) -> VfsResult<()> {
        match self.lookup(path) {
            Some(MemNode::File(node)) => {
                node.data.write().expect("lock").resize(length as usize, 0);
                node.times.write().expect("lock").mtime = now();
                Ok(())
            }
            Some(MemNode::Dir(_)) => Err(VfsError::new(Errno::ISDIR, "mem.truncate")),
            Some(MemNode::Symlink(_)) => Err(VfsError::new(Errno::INVAL, "mem.truncate")),
            None => Err(VfsError::new(Errno::NOENT, "mem.truncate")),
        }
    }

    fn utimes(&self, path: &str, times: &[TimeVal; 2]) -> VfsResult<()> {
        let set = |file_times: &RwLock<FileTimes>| {
            let mut guard = file_times.write().expect("lock");
            guard.atime = times[0].to_timespec();
            guard.mtime = times[1].to_timespec();
        };
        match self.lookup(path) {
            Some(MemNode::File(node)) => {
                set(&node.times);
                Ok(())
            }
            Some(MemNode::Dir(node)) => {
                set(&node.times);
                Ok(())
            }
            Some(MemNode::Symlink(_)) => Ok(()),
            None => Err(VfsError::new(Errno::NOENT, "mem.utimes")),
        }
    }

    fn readlink(&self, path: &str) -> VfsResult<String> {
        match self.lookup(path) {
            Some(MemNode::Symlink(target)) => Ok(target),
            Some(_) => Err(VfsError::new(Errno::INVAL, "mem.readlink")),
            None => Err(VfsError::new(Errno::NOENT, "mem.readlink")),
        }
    }

    fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        if self.lookup(link_path).is_some() {
            return Err(VfsError::new(Errno::EXIST, "mem.symlink"));
        }
        self.check_parent_dir(link_path, "mem.symlink")?;
        self.nodes
            .write()
            .expect("lock")
            .insert(link_path.to_string(), MemNode::Symlink(target.to_string()));
        Ok(())
    }

    fn on_directory_contents_needed(&self, path: &str) -> VfsResult<DirContents> {
        match self.lookup(path) {
            Some(MemNode::Dir(_)) => {}
            Some(_) => return Err(VfsError::new(Errno::NOTDIR, "mem.directory_contents")),
            None => return Err(VfsError::new(Errno::NOENT, "mem.directory_contents")),
        }
        let prefix = Self::child_prefix(path);
        let mut contents = DirContents::with_dot_entries();
        let nodes = self.nodes.read().expect("lock");
        for (key, node) in nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            if key.as_str() == path || key[prefix.len()..].contains('/') {
                continue;
            }
            let entry_type = match node {
                MemNode::File(_) => DirEntryType::Regular,
                MemNode::Dir(_) => DirEntryType::Directory,
                MemNode::Symlink(_) => DirEntryType::Symlink,
            };
            contents.add(base_name(key), entry_type);
        }
        Ok(contents)
    }
}

/// An open regular file.
struct MemFileStream {
    core: StreamCore,
    node: Arc<FileNode>,
    pos: RwLock<i64>,
}

impl MemFileStream {
    fn new(pathname: String, oflag: OpenFlags, node: Arc<FileNode>) -> Arc<dyn Stream> {
        Arc::new(MemFileStream {
            core: StreamCore::new(pathname, oflag),
            node,
            pos: RwLock::new(0),
        })
    }

    fn check_readable(&self) -> VfsResult<()> {
        if self.oflag().is_readable() {
            Ok(())
        } else {
            Err(VfsError::new(Errno::BADF, "mem_file.read"))
        }
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.oflag().is_writable() {
            Ok(())
        } else {
            Err(VfsError::new(Errno::BADF, "mem_file.write"))
        }
    }

    fn read_at(&self, buf: &mut [u8], offset: i64) -> usize {
        let data = self.node.data.read().expect("lock");
        let offset = offset.max(0) as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: i64) -> usize {
        let mut data = self.node.data.write().expect("lock");
        let offset = offset.max(0) as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.node.times.write().expect("lock").mtime = now();
        buf.len()
    }
}

impl Stream for MemFileStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_type(&self) -> &'static str {
        "mem_file"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn read(&self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_readable()?;
        let mut pos = self.pos.write().expect("lock");
        let n = self.read_at(buf, *pos);
        *pos += n as i64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> VfsResult<usize> {
        self.check_writable()?;
        let mut pos = self.pos.write().expect("lock");
        if self.oflag().contains(OpenFlags::APPEND) {
            *pos = self.node.data.read().expect("lock").len() as i64;
        }
        let n = self.write_at(buf, *pos);
        *pos += n as i64;
        Ok(n)
    }

    fn pread(&self, buf: &mut [u8], offset: i64) -> VfsResult<usize> {
        self.check_readable()?;
        if offset < 0 {
            return Err(VfsError::new(Errno::INVAL, "mem_file.pread"));
        }
        Ok(self.read_at(buf, offset))
    }

    fn pwrite(&self, buf: &[u8], offset: i64) -> VfsResult<usize> {
        self.check_writable()?;
        if offset < 0 {
            return Err(VfsError::new(Errno::INVAL, "mem_file.pwrite"));
        }
        Ok(self.write_at(buf, offset))
    }

    fn lseek(&self, offset: i64, whence: Whence) -> VfsResult<i64> {
        let mut pos = self.pos.write().expect("lock");
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => *pos,
            Whence::End => self.node.data.read().expect("lock").len() as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(VfsError::new(Errno::INVAL, "mem_file.lseek"));
        }
        *pos = target;
        Ok(target)
    }

    fn fstat(&self) -> VfsResult<Stat> {
        let times = *self.node.times.read().expect("lock");
        Ok(Stat {
            mode: libc::S_IFREG,
            nlink: 1,
            size: self.node.data.read().expect("lock").len() as i64,
            blksize: 4096,
            atime: times.atime,
            mtime: times.mtime,
            ctime: times.ctime,
            ..Stat::default()
        })
    }

    fn fstatfs(&self) -> VfsResult<StatFs> {
        Ok(StatFs {
            fs_type: libc::TMPFS_MAGIC as i64,
            bsize: 4096,
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 16,
            ffree: 1 << 15,
            fsid: 0,
            namelen: 255,
            frsize: 4096,
        })
    }

    fn ftruncate(&self, length: i64) -> VfsResult<()> {
        self.check_writable()?;
        self.node
            .data
            .write()
            .expect("lock")
            .resize(length as usize, 0);
        self.node.times.write().expect("lock").mtime = now();
        Ok(())
    }

    fn fsync(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Private copy-in mapping: anonymous pages filled from the file.
    ///
    /// MAP_SHARED write-back needs a host-backed file and is downgraded to a
    /// private copy here.
    fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: i64,
    ) -> VfsResult<usize> {
        if flags.contains(MapFlags::SHARED) {
            warn!(path = self.pathname(), "MAP_SHARED on a memory file is private");
        }
        let writable_prot = prot | ProtFlags::READ | ProtFlags::WRITE;
        let mapped = pages::map_anonymous(
            addr,
            length,
            writable_prot,
            flags.contains(MapFlags::FIXED),
        )?;
        {
            let data = self.node.data.read().expect("lock");
            let offset = offset.max(0) as usize;
            if offset < data.len() {
                let n = length.min(data.len() - offset);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data[offset..].as_ptr(),
                        mapped as *mut u8,
                        n,
                    );
                }
            }
        }
        if writable_prot != prot {
            pages::protect(mapped, length, prot)?;
        }
        Ok(mapped)
    }

    fn munmap(&self, addr: usize, length: usize) -> VfsResult<()> {
        pages::unmap(addr, length)
    }

    fn mprotect(&self, addr: usize, length: usize, prot: ProtFlags) -> VfsResult<()> {
        pages::protect(addr, length, prot)
    }

    fn madvise(&self, addr: usize, length: usize, advice: i32) -> VfsResult<()> {
        pages::advise(addr, length, advice)
    }
}
