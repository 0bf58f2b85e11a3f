//! Descriptor-to-stream table.
//!
//! Descriptors live in a contiguous `[min_fd, max_fd]` range and are handed
//! out lowest-first. A descriptor can be *reserved* before its stream exists
//! (sockets and handler opens allocate the fd first); such entries are known
//! to the table but yield no stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::stream::Stream;

pub type RawFd = i32;

enum FdEntry {
    Reserved,
    Stream(Arc<dyn Stream>),
}

pub struct FdTable {
    min_fd: RawFd,
    max_fd: RawFd,
    entries: BTreeMap<RawFd, FdEntry>,
}

impl FdTable {
    pub fn new(min_fd: RawFd, max_fd: RawFd) -> Self {
        assert!(min_fd >= 0 && min_fd <= max_fd);
        Self {
            min_fd,
            max_fd,
            entries: BTreeMap::new(),
        }
    }

    pub fn min_fd(&self) -> RawFd {
        self.min_fd
    }

    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    /// Reserve and return the lowest unused descriptor, or `None` when the
    /// range is exhausted.
    pub fn first_unused(&mut self) -> Option<RawFd> {
        self.first_unused_from(self.min_fd)
    }

    /// Reserve and return the lowest unused descriptor that is `>= lower`
    /// (the `F_DUPFD` contract).
    pub fn first_unused_from(&mut self, lower: RawFd) -> Option<RawFd> {
        let start = lower.max(self.min_fd);
        let fd = (start..=self.max_fd).find(|fd| !self.entries.contains_key(fd))?;
        self.entries.insert(fd, FdEntry::Reserved);
        Some(fd)
    }

    /// Bind `stream` to `fd`. The slot may be fresh (dup2 targets, stdio
    /// registration below `min_fd`) or previously reserved.
    pub fn set(&mut self, fd: RawFd, stream: Arc<dyn Stream>) {
        debug_assert!(fd >= 0, "negative fd");
        self.entries.insert(fd, FdEntry::Stream(stream));
    }

    /// Mark `fd` reserved without a stream.
    pub fn reserve(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0, "negative fd");
        self.entries.insert(fd, FdEntry::Reserved);
    }

    /// Drop the entry for `fd`, returning its stream if one was bound.
    pub fn remove(&mut self, fd: RawFd) -> Option<Arc<dyn Stream>> {
        match self.entries.remove(&fd) {
            Some(FdEntry::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<dyn Stream>> {
        match self.entries.get(&fd) {
            Some(FdEntry::Stream(stream)) => Some(stream.clone()),
            _ => None,
        }
    }

    /// True for both bound and reserved descriptors.
    pub fn is_known(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn is_reserved(&self, fd: RawFd) -> bool {
        matches!(self.entries.get(&fd), Some(FdEntry::Reserved))
    }

    pub fn in_range(&self, fd: RawFd) -> bool {
        fd >= self.min_fd && fd <= self.max_fd
    }

    /// Descriptors currently bound to streams, in ascending order.
    pub fn bound_fds(&self) -> Vec<RawFd> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e, FdEntry::Stream(_)))
            .map(|(fd, _)| *fd)
            .collect()
    }
}
