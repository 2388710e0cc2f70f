// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Free-space probe for the artifact root.

use std::path::{Path, PathBuf};
use sysinfo::Disks;

use super::store::ArtifactStoreError;

pub trait DiskSpace: Send + Sync {
    /// Bytes available to the process on the filesystem holding `path`.
    fn free_bytes(&self, path: &Path) -> Result<u64, ArtifactStoreError>;
}

/// Reads mounted filesystems through `sysinfo` and picks the one with the
/// longest mount point that prefixes `path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoDiskSpace;

impl DiskSpace for SysinfoDiskSpace {
    fn free_bytes(&self, path: &Path) -> Result<u64, ArtifactStoreError> {
        let target = resolve(path);
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                ArtifactStoreError::Backend(format!(
                    "no mounted filesystem contains {}",
                    target.display()
                ))
            })
    }
}

/// Canonical form of `path`, or of its nearest existing ancestor.
fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute
        .ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or(absolute)
}
