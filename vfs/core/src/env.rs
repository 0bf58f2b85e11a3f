//! Process-wide environment the VFS consults but does not own.
//!
//! The working directory, umask and caller UID live outside the VFS lock;
//! implementations synchronize internally. `chdir` and `umask` are the only
//! entry points that write through this object.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::permission::{Uid, ROOT_UID};

pub trait ProcessEnvironment: Send + Sync {
    /// The current working directory. Always absolute and always ends with
    /// `/` (so `"/"` for the root).
    fn current_directory(&self) -> String;

    /// Replace the working directory. `dir` must end with `/`.
    fn set_current_directory(&self, dir: String);

    fn current_umask(&self) -> u32;

    fn set_current_umask(&self, mask: u32);

    /// UID of the calling process (constant for the process lifetime in the
    /// default implementation).
    fn current_uid(&self) -> Uid;
}

/// Default in-process environment.
pub struct SystemEnvironment {
    cwd: RwLock<String>,
    umask: AtomicU32,
    uid: AtomicU32,
}

impl SystemEnvironment {
    pub fn new() -> Self {
        Self {
            cwd: RwLock::new("/".to_string()),
            umask: AtomicU32::new(0o022),
            uid: AtomicU32::new(ROOT_UID),
        }
    }

    /// Pretend to be the given UID. Intended for embedder bootstrap and
    /// tests exercising the app/system permission split.
    pub fn set_uid(&self, uid: Uid) {
        self.uid.store(uid, Ordering::Relaxed);
    }
}

impl Default for SystemEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEnvironment for SystemEnvironment {
    fn current_directory(&self) -> String {
        self.cwd.read().expect("lock").clone()
    }

    fn set_current_directory(&self, dir: String) {
        debug_assert!(dir.ends_with('/'), "cwd must end with a slash: {dir}");
        *self.cwd.write().expect("lock") = dir;
    }

    fn current_umask(&self) -> u32 {
        self.umask.load(Ordering::Relaxed)
    }

    fn set_current_umask(&self, mask: u32) {
        self.umask.store(mask & 0o777, Ordering::Relaxed);
    }

    fn current_uid(&self) -> Uid {
        self.uid.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cwd_round_trip() {
        let env = SystemEnvironment::new();
        assert_eq!(env.current_directory(), "/");
        env.set_current_directory("/data/".to_string());
        assert_eq!(env.current_directory(), "/data/");
    }

    #[test]
    fn umask_is_masked_to_permission_bits() {
        let env = SystemEnvironment::new();
        env.set_current_umask(0o1777);
        assert_eq!(env.current_umask(), 0o777);
    }
}
