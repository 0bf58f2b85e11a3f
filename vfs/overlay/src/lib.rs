//! Virtual symlinks layered over another handler.
//!
//! The overlay keeps two tables: link path → target, and directory path →
//! the link names it contains. `readlink` answers from the first, directory
//! listings are augmented from the second, and everything else passes
//! through to the wrapped handler. The VFS path normalizer is what makes
//! the redirection visible: it probes `readlink` on every component.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use ptfs_core::path::{base_name, dir_name};
use ptfs_core::{
    DirContents, DirEntryType, DirectoryStream, Errno, FileSystemHandler, OpenFlags, RawFd, Stat,
    StatFs, Stream, TimeVal, VfsError, VfsResult,
};

struct RedirectState {
    /// link path → target path.
    symlinks: HashMap<String, String>,
    /// directory path → names of the links living directly in it.
    dir_to_links: HashMap<String, Vec<String>>,
    mount_point: String,
}

pub struct RedirectHandler {
    self_ref: Weak<RedirectHandler>,
    underlying: Arc<dyn FileSystemHandler>,
    initialized: AtomicBool,
    state: RwLock<RedirectState>,
}

impl RedirectHandler {
    /// Wrap `underlying`, pre-seeding `(target, link_path)` symlinks.
    pub fn new(
        underlying: Arc<dyn FileSystemHandler>,
        symlinks: &[(&str, &str)],
    ) -> Arc<RedirectHandler> {
        let handler = Arc::new_cyclic(|self_ref| RedirectHandler {
            self_ref: self_ref.clone(),
            underlying,
            initialized: AtomicBool::new(false),
            state: RwLock::new(RedirectState {
                symlinks: HashMap::new(),
                dir_to_links: HashMap::new(),
                mount_point: String::new(),
            }),
        });
        for (target, link_path) in symlinks {
            handler.add_symlink(target, link_path);
        }
        handler
    }

    fn arc_self(&self) -> Arc<dyn FileSystemHandler> {
        self.self_ref.upgrade().expect("handler alive")
    }

    fn add_symlink(&self, target: &str, link_path: &str) {
        debug_assert!(!link_path.ends_with('/'), "link path: {link_path}");
        let mut state = self.state.write().expect("lock");
        let replaced = state
            .symlinks
            .insert(link_path.to_string(), target.to_string());
        debug_assert!(replaced.is_none(), "duplicate symlink: {link_path}");
        let dir = dir_name(link_path);
        let name = base_name(link_path).to_string();
        debug_assert!(!name.is_empty(), "link path: {link_path}");
        state.dir_to_links.entry(dir).or_default().push(name);
    }

    fn symlink_target(&self, link_path: &str) -> Option<String> {
        self.state
            .read()
            .expect("lock")
            .symlinks
            .get(link_path)
            .cloned()
    }

    /// Drop `link_path` from both tables. False when it was not a link.
    fn remove_symlink(&self, link_path: &str) -> bool {
        let mut state = self.state.write().expect("lock");
        if state.symlinks.remove(link_path).is_none() {
            return false;
        }
        let dir = dir_name(link_path);
        let name = base_name(link_path);
        if let Some(names) = state.dir_to_links.get_mut(&dir) {
            names.retain(|n| n != name);
            if names.is_empty() {
                state.dir_to_links.remove(&dir);
            }
        }
        true
    }
}

impl FileSystemHandler for RedirectHandler {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn is_initialized(&self) -> bool {
        self.underlying.is_initialized() && self.initialized.load(Ordering::Acquire)
    }

    fn initialize(&self) {
        if !self.underlying.is_initialized() {
            self.underlying.initialize();
        }
        self.initialized.store(true, Ordering::Release);
    }

    fn on_mounted(&self, path: &str) {
        {
            let mut state = self.state.write().expect("lock");
            state.mount_point = path.trim_end_matches('/').to_string();
        }
        self.underlying.on_mounted(path);
    }

    fn on_unmounted(&self, path: &str) {
        self.underlying.on_unmounted(path);
    }

    fn invalidate_cache(&self) {
        self.underlying.invalidate_cache();
    }

    fn add_to_cache(&self, path: &str, stat: &Stat, exists: bool) {
        self.underlying.add_to_cache(path, stat, exists);
    }

    fn is_world_writable(&self, path: &str) -> bool {
        self.underlying.is_world_writable(path)
    }

    fn open(
        &self,
        fd: RawFd,
        path: &str,
        oflag: OpenFlags,
        mode: u32,
    ) -> VfsResult<Arc<dyn Stream>> {
        // The path is already canonicalized: the VFS resolved overlay links
        // through readlink before dispatching here. The same holds for every
        // other method.
        let stream = self.underlying.open(fd, path, oflag, mode)?;
        if stream.as_any().downcast_ref::<DirectoryStream>().is_some() {
            // Re-wrap directories so getdents sees the augmented listing.
            return Ok(DirectoryStream::new(
                stream.pathname().to_string(),
                oflag,
                self.arc_self(),
            ));
        }
        Ok(stream)
    }

    fn stat(&self, path: &str) -> VfsResult<Stat> {
        self.underlying.stat(path)
    }

    fn statfs(&self, path: &str) -> VfsResult<StatFs> {
        self.underlying.statfs(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.underlying.mkdir(path, mode)
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.underlying.rmdir(path)
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        if self.remove_symlink(path) {
            return Ok(());
        }
        self.underlying.unlink(path)
    }

    fn remove(&self, path: &str) -> VfsResult<()> {
        if self.remove_symlink(path) {
            return Ok(());
        }
        self.underlying.remove(path)
    }

    fn rename(&self, old_path: &str, new_path: &str) -> VfsResult<()> {
        // Renaming a virtual link itself is not supported; files pass
        // through.
        self.underlying.rename(old_path, new_path)
    }

    fn truncate(&self, path: &str, length: i64) -> VfsResult<()> {
        self.underlying.truncate(path, length)
    }

    fn utimes(&self, path: &str, times: &[TimeVal; 2]) -> VfsResult<()> {
        self.underlying.utimes(path, times)
    }

    fn readlink(&self, path: &str) -> VfsResult<String> {
        if let Some(target) = self.symlink_target(path) {
            return Ok(target);
        }
        self.underlying.readlink(path)
    }

    fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        let mount_point = self.state.read().expect("lock").mount_point.clone();
        // The mount point itself may be shadowed by a link; anything else
        // that already exists may not.
        if self.symlink_target(link_path).is_some()
            || (link_path != mount_point && self.underlying.stat(link_path).is_ok())
        {
            return Err(VfsError::new(Errno::EXIST, "redirect.symlink"));
        }
        self.add_symlink(target, link_path);
        Ok(())
    }

    fn on_directory_contents_needed(&self, path: &str) -> VfsResult<DirContents> {
        let mut contents = self.underlying.on_directory_contents_needed(path)?;
        let state = self.state.read().expect("lock");
        if let Some(names) = state.dir_to_links.get(path) {
            for name in names {
                contents.add(name.clone(), DirEntryType::Symlink);
            }
        }
        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptfs_mem::MemHandler;

    fn overlay_over_mem() -> Arc<RedirectHandler> {
        let mem = MemHandler::new();
        mem.mkdir("/system", 0o755).expect("mkdir");
        mem.mkdir("/system/lib", 0o755).expect("mkdir");
        mem.open(
            3,
            "/system/lib/libc.so",
            OpenFlags::WRONLY | OpenFlags::CREAT,
            0o644,
        )
        .expect("create");
        RedirectHandler::new(mem, &[("/system/lib", "/lib")])
    }

    #[test]
    fn readlink_answers_from_the_link_table() {
        let overlay = overlay_over_mem();
        assert_eq!(overlay.readlink("/lib").expect("readlink"), "/system/lib");
        assert_eq!(
            overlay.readlink("/nope").expect_err("not a link").errno(),
            Errno::NOENT
        );
    }

    #[test]
    fn stat_passes_through_to_the_underlying_handler() {
        let overlay = overlay_over_mem();
        assert!(overlay.stat("/system/lib").expect("stat").is_dir());
        // The link path itself is unknown to the underlying handler.
        assert_eq!(
            overlay.stat("/lib").expect_err("virtual").errno(),
            Errno::NOENT
        );
    }

    #[test]
    fn symlink_refuses_existing_paths() {
        let overlay = overlay_over_mem();
        assert_eq!(
            overlay
                .symlink("/elsewhere", "/lib")
                .expect_err("already a link")
                .errno(),
            Errno::EXIST
        );
        assert_eq!(
            overlay
                .symlink("/elsewhere", "/system/lib")
                .expect_err("exists below")
                .errno(),
            Errno::EXIST
        );
        overlay.symlink("/system/lib", "/lib2").expect("fresh link");
        assert_eq!(overlay.readlink("/lib2").expect("readlink"), "/system/lib");
    }

    #[test]
    fn unlink_drops_links_before_delegating() {
        let overlay = overlay_over_mem();
        overlay.unlink("/lib").expect("unlink link");
        assert_eq!(
            overlay.readlink("/lib").expect_err("gone").errno(),
            Errno::NOENT
        );
        // A second unlink falls through to the underlying handler.
        assert_eq!(
            overlay.unlink("/lib").expect_err("gone").errno(),
            Errno::NOENT
        );
    }

    #[test]
    fn listings_are_augmented_with_link_entries() {
        let overlay = overlay_over_mem();
        let mut contents = overlay
            .on_directory_contents_needed("/")
            .expect("contents");
        let mut names = Vec::new();
        while let Some(entry) = contents.peek() {
            names.push((entry.name.clone(), entry.entry_type));
            contents.advance();
        }
        assert!(names.contains(&("system".to_string(), DirEntryType::Directory)));
        assert!(names.contains(&("lib".to_string(), DirEntryType::Symlink)));
    }
}
