//! Speculative-open cache.
//!
//! Paths scheduled before the host is ready are opened by a background
//! worker; the first eligible `open` for the same path takes the cached
//! descriptor instead of paying the host round trip. Entries are
//! single-shot and die on any mutating operation for their path.

use std::collections::HashMap;

use crate::error::Errno;
use crate::fd_table::RawFd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreopenEntry {
    /// Scheduled; the worker has not reached it yet.
    Pending,
    /// The worker's open succeeded.
    Opened(RawFd),
    /// The worker's open failed with this errno.
    Failed(Errno),
}

pub struct PreopenCache {
    entries: HashMap<String, Vec<PreopenEntry>>,
    schedule: Vec<String>,
}

impl PreopenCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            schedule: Vec::new(),
        }
    }

    pub fn schedule(&mut self, path: &str) {
        self.schedule.push(path.to_string());
        self.entries
            .entry(path.to_string())
            .or_default()
            .push(PreopenEntry::Pending);
    }

    /// Scheduled paths in scheduling order, for the worker.
    pub fn scheduled_paths(&self) -> Vec<String> {
        self.schedule.clone()
    }

    pub fn has_entries(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn has_pending(&self, path: &str) -> bool {
        self.entries
            .get(path)
            .map(|slots| slots.contains(&PreopenEntry::Pending))
            .unwrap_or(false)
    }

    /// Extract the first realized entry for `path`. `None` means nothing is
    /// realized (yet); the caller distinguishes "pending" from "absent" via
    /// [`PreopenCache::has_pending`].
    pub fn take_realized(&mut self, path: &str) -> Option<Result<RawFd, Errno>> {
        let slots = self.entries.get_mut(path)?;
        let idx = slots
            .iter()
            .position(|slot| !matches!(slot, PreopenEntry::Pending))?;
        let slot = slots.remove(idx);
        if slots.is_empty() {
            self.entries.remove(path);
        }
        match slot {
            PreopenEntry::Opened(fd) => Some(Ok(fd)),
            PreopenEntry::Failed(errno) => Some(Err(errno)),
            PreopenEntry::Pending => unreachable!(),
        }
    }

    /// Store the worker's result into the first pending slot for `path`.
    /// Returns false when every slot was invalidated in the meantime.
    pub fn fill_pending(&mut self, path: &str, result: Result<RawFd, Errno>) -> bool {
        let Some(slots) = self.entries.get_mut(path) else {
            return false;
        };
        let Some(slot) = slots
            .iter_mut()
            .find(|slot| matches!(slot, PreopenEntry::Pending))
        else {
            return false;
        };
        *slot = match result {
            Ok(fd) => PreopenEntry::Opened(fd),
            Err(errno) => PreopenEntry::Failed(errno),
        };
        true
    }

    /// Drop every entry for `path`, returning the descriptors that must be
    /// closed by the caller.
    pub fn invalidate(&mut self, path: &str) -> Vec<RawFd> {
        match self.entries.remove(path) {
            Some(slots) => slots
                .into_iter()
                .filter_map(|slot| match slot {
                    PreopenEntry::Opened(fd) => Some(fd),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

impl Default for PreopenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_fill_take_round_trip() {
        let mut cache = PreopenCache::new();
        cache.schedule("/etc/hosts");
        assert!(cache.has_pending("/etc/hosts"));
        assert!(cache.take_realized("/etc/hosts").is_none());

        assert!(cache.fill_pending("/etc/hosts", Ok(7)));
        assert!(!cache.has_pending("/etc/hosts"));
        assert_eq!(cache.take_realized("/etc/hosts"), Some(Ok(7)));
        // Single-shot: the entry is gone.
        assert!(!cache.has_entries("/etc/hosts"));
    }

    #[test]
    fn failed_preopen_surfaces_errno() {
        let mut cache = PreopenCache::new();
        cache.schedule("/missing");
        assert!(cache.fill_pending("/missing", Err(Errno::NOENT)));
        assert_eq!(cache.take_realized("/missing"), Some(Err(Errno::NOENT)));
    }

    #[test]
    fn invalidate_returns_open_fds_and_blocks_fill() {
        let mut cache = PreopenCache::new();
        cache.schedule("/a");
        cache.schedule("/a");
        assert!(cache.fill_pending("/a", Ok(5)));
        let fds = cache.invalidate("/a");
        assert_eq!(fds, vec![5]);
        // The worker arriving late finds nothing to fill.
        assert!(!cache.fill_pending("/a", Ok(6)));
        assert!(!cache.has_entries("/a"));
    }

    #[test]
    fn multiple_schedules_stack() {
        let mut cache = PreopenCache::new();
        cache.schedule("/x");
        cache.schedule("/x");
        assert!(cache.fill_pending("/x", Ok(3)));
        assert!(cache.has_pending("/x"));
        assert_eq!(cache.take_realized("/x"), Some(Ok(3)));
        assert!(cache.has_pending("/x"));
    }
}
