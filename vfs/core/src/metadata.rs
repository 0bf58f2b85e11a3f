//! File metadata carried between handlers, streams, and the dispatch layer.

/// Seconds/nanoseconds pair used for file timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

/// Seconds/microseconds pair used by `utimes`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i64,
}

impl TimeVal {
    pub fn to_timespec(self) -> TimeSpec {
        TimeSpec {
            sec: self.sec,
            nsec: self.usec * 1_000,
        }
    }
}

/// `struct stat` equivalent.
///
/// Handlers fill everything except `ino`, `uid` and the permission bits of
/// `mode`; the dispatch layer stamps the inode from the inode table and the
/// ownership from the mount point's [`Permission`](crate::Permission).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

impl Stat {
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == libc::S_IFLNK
    }
}

/// `struct statfs` equivalent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatFs {
    pub fs_type: i64,
    pub bsize: i64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: i64,
    pub frsize: i64,
}

/// `struct statvfs` equivalent, derived from [`StatFs`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl From<StatFs> for StatVfs {
    fn from(fs: StatFs) -> Self {
        StatVfs {
            bsize: fs.bsize as u64,
            frsize: fs.bsize as u64,
            blocks: fs.blocks,
            bfree: fs.bfree,
            bavail: fs.bavail,
            files: fs.files,
            ffree: fs.ffree,
            favail: fs.ffree,
            fsid: fs.fsid,
            flag: 0,
            namemax: fs.namelen as u64,
        }
    }
}
