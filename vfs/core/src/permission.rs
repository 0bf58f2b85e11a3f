//! Coarse app-vs-system ownership model.
//!
//! The only permission distinction the layer honors is "does this path belong
//! to the calling app or to the system image"; everything finer is the
//! responsibility of individual handlers.

use crate::metadata::Stat;

pub type Uid = u32;

pub const ROOT_UID: Uid = 0;
pub const ROOT_GID: u32 = 0;

/// First UID handed out to installed applications.
pub const FIRST_APP_UID: Uid = 10_000;

pub fn is_app_uid(uid: Uid) -> bool {
    uid >= FIRST_APP_UID
}

/// Ownership and writability of a path, derived from the mount point that
/// matched it and the caller's UID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permission {
    file_uid: Uid,
    is_writable: bool,
}

// Files created by apps must not be readable by other users; this is what a
// conformance suite checks. System files keep the usual image permissions.
const DEFAULT_USER_FILE_MODE: u32 = 0o600;
const DEFAULT_USER_DIR_MODE: u32 = 0o700;
const DEFAULT_SYSTEM_FILE_MODE: u32 = 0o644;
const DEFAULT_SYSTEM_DIR_MODE: u32 = 0o755;

impl Permission {
    pub const fn new(file_uid: Uid, is_writable: bool) -> Self {
        Self {
            file_uid,
            is_writable,
        }
    }

    pub const fn file_uid(&self) -> Uid {
        self.file_uid
    }

    pub const fn is_writable(&self) -> bool {
        self.is_writable
    }

    /// Stamp ownership into a handler-produced `Stat` and, when the handler
    /// left the permission bits at zero, fill them from the file type and
    /// owner.
    pub fn fill_stat(&self, st: &mut Stat) {
        st.uid = self.file_uid;
        st.gid = ROOT_GID;
        let file_type = st.file_type();
        let perm = st.mode & 0o777;
        if file_type != 0 && perm == 0 {
            let is_dir = file_type == libc::S_IFDIR;
            let perm = if is_app_uid(st.uid) {
                if is_dir {
                    DEFAULT_USER_DIR_MODE
                } else {
                    DEFAULT_USER_FILE_MODE
                }
            } else if is_dir {
                DEFAULT_SYSTEM_DIR_MODE
            } else {
                DEFAULT_SYSTEM_FILE_MODE
            };
            st.mode = file_type | perm;
        }
    }
}
