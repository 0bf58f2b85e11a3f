//! Stream backing `MAP_ANONYMOUS` mappings.
//!
//! The stream has no file-like surface at all; it exists so anonymous pages
//! flow through the same region bookkeeping as file mappings.

use std::any::Any;
use std::sync::Arc;

use crate::error::{Errno, VfsError, VfsResult};
use crate::flags::{MapFlags, OpenFlags, ProtFlags};
use crate::pages;
use crate::stream::{Stream, StreamCore};

pub struct AnonymousStream {
    core: StreamCore,
}

impl AnonymousStream {
    pub fn new() -> Arc<AnonymousStream> {
        Arc::new(AnonymousStream {
            core: StreamCore::new(String::new(), OpenFlags::RDWR),
        })
    }
}

impl Stream for AnonymousStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_type(&self) -> &'static str {
        "anonymous"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: i64,
    ) -> VfsResult<usize> {
        if offset != 0 {
            return Err(VfsError::new(Errno::INVAL, "anonymous.mmap"));
        }
        pages::map_anonymous(addr, length, prot, flags.contains(MapFlags::FIXED))
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
