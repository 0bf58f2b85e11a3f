//! Process-local POSIX translation layer.
//!
//! Application code calls the familiar POSIX verbs; this crate dispatches
//! each call through an in-process virtual file system to the handler
//! mounted for the path or to the stream bound to the descriptor. Concrete
//! backends (host files, network sockets, device emulation) plug in through
//! the [`FileSystemHandler`] and [`Stream`] traits; the crate itself owns
//! path resolution, the descriptor table, memory-map bookkeeping, the
//! readiness engine, and the preopen prefetcher.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptfs_core::{SystemEnvironment, Vfs, VfsOptions};
//!
//! # fn root_handler() -> Arc<dyn ptfs_core::FileSystemHandler> { unimplemented!() }
//! let env = Arc::new(SystemEnvironment::new());
//! let vfs = Vfs::new(root_handler(), env, VfsOptions::default());
//! let fd = vfs.open("/etc/hosts", ptfs_core::OpenFlags::RDONLY, 0)?;
//! let mut buf = [0u8; 128];
//! let n = vfs.read(fd, &mut buf)?;
//! vfs.close(fd)?;
//! # Ok::<(), ptfs_core::VfsError>(())
//! ```

mod error;
mod fd_table;
mod flags;
mod inode;
mod memory;
mod metadata;
mod mount;
mod preopen;
mod vfs;

pub mod env;
pub mod handler;
pub mod pages;
pub mod path;
pub mod permission;
pub mod poll;
pub mod stream;
pub mod streams;

pub use env::{ProcessEnvironment, SystemEnvironment};
pub use error::{Errno, VfsError, VfsResult};
pub use fd_table::{FdTable, RawFd};
pub use flags::{AccessMode, MapFlags, MsgFlags, OpenFlags, ProtFlags};
pub use handler::{DirContents, DirEntry, DirEntryType, FileSystemHandler};
pub use inode::InodeTable;
pub use memory::{MappedRegion, MemoryRegionMap, BAD_INODE};
pub use metadata::{Stat, StatFs, StatVfs, TimeSpec, TimeVal};
pub use mount::{MountPoint, MountPointManager};
pub use path::NormalizeMode;
pub use permission::{is_app_uid, Permission, Uid, FIRST_APP_UID, ROOT_UID};
pub use poll::{EpollEvent, EpollEvents, EpollOp, FdSet, PollEvents, PollFd, FD_SETSIZE};
pub use preopen::{PreopenCache, PreopenEntry};
pub use stream::{
    IoctlRequest, ReadySignal, ShutdownHow, SocketAddress, Stream, StreamCore, Whence,
};
pub use streams::{DirEnt, DirectoryStream};
pub use vfs::{FcntlCmd, FsConfHook, InetSocketFactory, Vfs, VfsOptions};
