//! Lazily assigned inode numbers keyed by normalized path.

use std::collections::HashMap;

use tracing::trace;

/// Some filesystems reserve zero and very small inode numbers for special
/// purposes (ext4 keeps 0..=10 to itself), so numbering starts well above
/// them.
const FIRST_INODE: u64 = 128;

pub struct InodeTable {
    inodes: HashMap<String, u64>,
    next_inode: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            inodes: HashMap::new(),
            next_inode: FIRST_INODE,
        }
    }

    /// Inode for `path`, assigning a fresh number on first use.
    ///
    /// Numbers are never reused; reuse would break write-alias detection in
    /// the memory-region map.
    pub fn get_or_assign(&mut self, path: &str) -> u64 {
        debug_assert!(!path.is_empty());
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        trace!(path, ino, "assigning inode");
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    pub fn lookup(&self, path: &str) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    pub fn remove(&mut self, path: &str) {
        self.inodes.remove(path);
    }

    /// Move the inode of `old_path` to `new_path`.
    ///
    /// When `old_path` was never stat'ed there is nothing to move, but a
    /// stale inode for `new_path` must still be dropped:
    ///   open("/a", O_CREAT);   // may not assign an inode
    ///   open("/b", O_CREAT);
    ///   stat("/b");            // assigns an inode to /b
    ///   rename("/a", "/b");    // /b's old inode must go away
    pub fn reassign(&mut self, old_path: &str, new_path: &str) {
        match self.inodes.remove(old_path) {
            Some(ino) => {
                self.inodes.insert(new_path.to_string(), ino);
            }
            None => {
                self.inodes.remove(new_path);
            }
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_lazy_and_stable() {
        let mut table = InodeTable::new();
        let a = table.get_or_assign("/a");
        assert!(a >= FIRST_INODE);
        assert_eq!(table.get_or_assign("/a"), a);
        assert_ne!(table.get_or_assign("/b"), a);
    }

    #[test]
    fn reassign_moves_inode() {
        let mut table = InodeTable::new();
        let a = table.get_or_assign("/a");
        table.reassign("/a", "/b");
        assert_eq!(table.lookup("/b"), Some(a));
        assert_eq!(table.lookup("/a"), None);
    }

    #[test]
    fn reassign_from_unassigned_source_clears_destination() {
        let mut table = InodeTable::new();
        let b = table.get_or_assign("/b");
        table.reassign("/a", "/b");
        assert_eq!(table.lookup("/b"), None);
        // A later stat must produce a fresh number.
        assert_ne!(table.get_or_assign("/b"), b);
    }

    #[test]
    fn numbers_are_never_reused() {
        let mut table = InodeTable::new();
        let a = table.get_or_assign("/a");
        table.remove("/a");
        let a2 = table.get_or_assign("/a");
        assert!(a2 > a);
    }
}
