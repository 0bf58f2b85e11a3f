//! Bookkeeping for every mapped address range.
//!
//! The map owns non-overlapping, page-granular half-open intervals. Removal
//! and protection changes split intervals at range boundaries so the
//! per-stream callbacks see exactly the affected pieces; inserts merge with
//! compatible neighbors to keep the map small.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ops::Bound;
use std::sync::Arc;

use crate::error::VfsResult;
use crate::flags::{MapFlags, ProtFlags};
use crate::stream::{stream_key, Stream};

/// Inode value used for mappings with no backing path.
pub const BAD_INODE: u64 = 0;

pub struct MappedRegion {
    pub len: usize,
    pub stream: Arc<dyn Stream>,
    /// File offset at the start of the interval.
    pub offset: i64,
    pub prot: ProtFlags,
    pub flags: MapFlags,
    /// Inode of the backing path, captured at mmap time so write-alias
    /// checks survive later renames. [`BAD_INODE`] for anonymous mappings.
    pub inode: u64,
}

pub struct MemoryRegionMap {
    regions: BTreeMap<usize, MappedRegion>,
}

impl MemoryRegionMap {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn overlaps(&self, addr: usize, len: usize) -> bool {
        if len == 0 {
            return false;
        }
        let end = addr + len;
        if let Some((&start, region)) = self.regions.range(..=addr).next_back() {
            if start + region.len > addr {
                return true;
            }
        }
        self.regions
            .range((Bound::Excluded(addr), Bound::Excluded(end)))
            .next()
            .is_some()
    }

    /// Record a new mapping. Fails (returning `false`) when the range
    /// overlaps an existing region; the caller decides whether that is fatal.
    pub fn insert(
        &mut self,
        addr: usize,
        len: usize,
        stream: Arc<dyn Stream>,
        offset: i64,
        prot: ProtFlags,
        flags: MapFlags,
        inode: u64,
    ) -> bool {
        if len == 0 || self.overlaps(addr, len) {
            return false;
        }

        let mut addr = addr;
        let mut len = len;
        let mut offset = offset;

        // Merge with a compatible left neighbor.
        if let Some((&left_start, left)) = self.regions.range(..addr).next_back() {
            if left_start + left.len == addr
                && stream_key(&left.stream) == stream_key(&stream)
                && left.prot == prot
                && left.flags == flags
                && left.inode == inode
                && left.offset + left.len as i64 == offset
            {
                addr = left_start;
                len += left.len;
                offset = left.offset;
                self.regions.remove(&left_start);
            }
        }
        // And with a compatible right neighbor.
        let end = addr + len;
        if let Some(right) = self.regions.get(&end) {
            if stream_key(&right.stream) == stream_key(&stream)
                && right.prot == prot
                && right.flags == flags
                && right.inode == inode
                && offset + len as i64 == right.offset
            {
                let right = self.regions.remove(&end).expect("neighbor");
                len += right.len;
            }
        }

        self.regions.insert(
            addr,
            MappedRegion {
                len,
                stream,
                offset,
                prot,
                flags,
                inode,
            },
        );
        true
    }

    /// Split the region spanning `point`, if any, so `point` becomes a
    /// region boundary.
    fn split_at(&mut self, point: usize) {
        let Some((&start, region)) = self.regions.range_mut(..point).next_back() else {
            return;
        };
        let end = start + region.len;
        if point >= end {
            return;
        }
        let tail_len = end - point;
        region.len = point - start;
        let tail = MappedRegion {
            len: tail_len,
            stream: region.stream.clone(),
            offset: region.offset + (point - start) as i64,
            prot: region.prot,
            flags: region.flags,
            inode: region.inode,
        };
        self.regions.insert(point, tail);
    }

    fn keys_in_range(&self, addr: usize, end: usize) -> Vec<usize> {
        self.regions
            .range(addr..end)
            .map(|(&start, _)| start)
            .collect()
    }

    /// Remove every region piece inside `[addr, addr+len)`.
    ///
    /// With `invoke_munmap` the backing stream's `munmap` runs for each
    /// removed piece; a `MAP_FIXED` replacement passes `false` because the
    /// host mapping was already replaced. Bookkeeping is dropped either way;
    /// the first stream error is reported after the sweep.
    pub fn remove_range(&mut self, addr: usize, len: usize, invoke_munmap: bool) -> VfsResult<()> {
        let end = addr + len;
        self.split_at(addr);
        self.split_at(end);
        let mut first_err = None;
        for start in self.keys_in_range(addr, end) {
            let region = self.regions.remove(&start).expect("split region");
            if invoke_munmap {
                if let Err(err) = region.stream.munmap(start, region.len) {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Change protection of every region piece inside `[addr, addr+len)`.
    ///
    /// Pieces are processed in address order; a failing piece stops the walk
    /// and leaves earlier pieces changed (partial application is permitted).
    pub fn change_protection(&mut self, addr: usize, len: usize, prot: ProtFlags) -> VfsResult<()> {
        let end = addr + len;
        self.split_at(addr);
        self.split_at(end);
        for start in self.keys_in_range(addr, end) {
            let region = self.regions.get_mut(&start).expect("split region");
            region.stream.mprotect(start, region.len, prot)?;
            region.prot = prot;
        }
        Ok(())
    }

    /// Forward `madvise` advice to each region intersecting the range.
    /// Unmapped gaps are ignored.
    pub fn advise(&mut self, addr: usize, len: usize, advice: i32) -> VfsResult<()> {
        let end = addr + len;
        let mut targets = Vec::new();
        if let Some((&start, region)) = self.regions.range(..=addr).next_back() {
            if start + region.len > addr {
                targets.push(start);
            }
        }
        targets.extend(
            self.regions
                .range((Bound::Excluded(addr), Bound::Excluded(end)))
                .map(|(&start, _)| start),
        );
        for start in targets {
            let region = &self.regions[&start];
            let piece_start = start.max(addr);
            let piece_end = (start + region.len).min(end);
            region
                .stream
                .madvise(piece_start, piece_end - piece_start, advice)?;
        }
        Ok(())
    }

    /// Whether any writable mapping is backed by `inode`. Host-backed file
    /// handlers use this to decide when read caches must be flushed.
    pub fn is_write_mapped(&self, inode: u64) -> bool {
        if inode == BAD_INODE {
            return false;
        }
        self.regions
            .values()
            .any(|region| region.inode == inode && region.prot.contains(ProtFlags::WRITE))
    }

    pub fn regions(&self) -> impl Iterator<Item = (usize, &MappedRegion)> {
        self.regions.iter().map(|(&start, region)| (start, region))
    }

    /// Human-readable dump in smaps-like order, for fatal reports and
    /// debugging.
    pub fn to_debug_string(&self) -> String {
        let mut out = String::new();
        for (start, region) in self.regions.iter() {
            let _ = writeln!(
                out,
                "{:#014x}-{:#014x} prot={:?} flags={:?} inode={} type={} path={}",
                start,
                start + region.len,
                region.prot,
                region.flags,
                region.inode,
                region.stream.stream_type(),
                region.stream.pathname(),
            );
        }
        out
    }
}

impl Default for MemoryRegionMap {
    fn default() -> Self {
        Self::new()
    }
}
