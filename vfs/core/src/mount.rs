//! Mount-point table: longest-prefix path to handler resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::handler::FileSystemHandler;
use crate::permission::{Uid, ROOT_UID};

pub struct MountPoint {
    pub handler: Arc<dyn FileSystemHandler>,
    pub owner_uid: Uid,
}

/// Prefix → handler table. Directory mounts are stored with a trailing
/// slash; `change_owner` may additionally record single-file entries.
pub struct MountPointManager {
    mounts: BTreeMap<String, MountPoint>,
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

impl MountPointManager {
    /// The table is born with a root handler; the root mount cannot be
    /// removed, so lookup never comes back empty.
    pub fn new(root_handler: Arc<dyn FileSystemHandler>) -> Self {
        let mut mounts = BTreeMap::new();
        root_handler.on_mounted("/");
        mounts.insert(
            "/".to_string(),
            MountPoint {
                handler: root_handler,
                owner_uid: ROOT_UID,
            },
        );
        Self { mounts }
    }

    pub fn add(&mut self, path: &str, handler: Arc<dyn FileSystemHandler>) {
        let prefix = with_trailing_slash(path);
        if self.mounts.contains_key(&prefix) {
            warn!(%prefix, "replacing existing mount point");
        }
        handler.on_mounted(&prefix);
        self.mounts.insert(
            prefix,
            MountPoint {
                handler,
                owner_uid: ROOT_UID,
            },
        );
    }

    pub fn remove(&mut self, path: &str) {
        let prefix = with_trailing_slash(path);
        if prefix == "/" {
            warn!("refusing to unmount the root handler");
            return;
        }
        if let Some(mount) = self.mounts.remove(&prefix) {
            mount.handler.on_unmounted(&prefix);
        }
    }

    /// Handler and owner UID for the longest mount prefix matching `path`.
    ///
    /// `path` must be normalized. Single-file entries (from `change_owner`)
    /// match exactly; directory prefixes match themselves and everything
    /// below them.
    pub fn get(&self, path: &str) -> Option<(&MountPoint, &str)> {
        // Exact single-file entry first: it is the longest possible match.
        if let Some((prefix, mount)) = self.mounts.get_key_value(path) {
            return Some((mount, prefix.as_str()));
        }
        let dir_prefix = with_trailing_slash(path);
        if let Some((prefix, mount)) = self.mounts.get_key_value(&dir_prefix) {
            return Some((mount, prefix.as_str()));
        }
        // Walk ancestors from the longest: "/a/b/c" probes "/a/b/", "/a/",
        // "/".
        let mut rest = path;
        while let Some(pos) = rest.rfind('/') {
            let candidate = &path[..pos + 1];
            if let Some((prefix, mount)) = self.mounts.get_key_value(candidate) {
                return Some((mount, prefix.as_str()));
            }
            rest = &path[..pos];
        }
        None
    }

    pub fn handler(&self, path: &str) -> Option<Arc<dyn FileSystemHandler>> {
        self.get(path).map(|(mount, _)| mount.handler.clone())
    }

    /// Record `owner_uid` for `path`, inserting a derived mount entry when
    /// no exact one exists. Directory paths should carry a trailing slash so
    /// the new entry also covers children.
    pub fn change_owner(&mut self, path: &str, owner_uid: Uid) {
        if let Some(mount) = self.mounts.get_mut(path) {
            mount.owner_uid = owner_uid;
            return;
        }
        let Some(handler) = self.handler(path.trim_end_matches('/')) else {
            warn!(path, "change_owner: no handler for path");
            return;
        };
        self.mounts.insert(
            path.to_string(),
            MountPoint { handler, owner_uid },
        );
    }

    pub fn all_handlers(&self) -> Vec<Arc<dyn FileSystemHandler>> {
        self.mounts
            .values()
            .map(|mount| mount.handler.clone())
            .collect()
    }
}
