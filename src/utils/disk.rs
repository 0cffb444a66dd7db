use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskStats {
    pub mount_point: PathBuf,
    pub total: u64,
    pub free: u64,
    pub available: bool,
}

/// Capacity and free space of the device holding `path`.
///
/// The disk with the longest mount point that prefixes the canonical path
/// wins. Unknown devices report `available: false` and zero sizes.
pub fn get_path_stats(path: &Path) -> DiskStats {
    let path = match path.canonicalize() {
        Ok(p) => p,
        Err(_) => return DiskStats::default(),
    };

    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match best {
        Some(disk) => {
            debug!(
                "{} is on {} ({} of {} bytes free)",
                path.display(),
                disk.mount_point().display(),
                disk.available_space(),
                disk.total_space()
            );
            DiskStats {
                mount_point: disk.mount_point().to_path_buf(),
                total: disk.total_space(),
                free: disk.available_space(),
                available: true,
            }
        }
        None => DiskStats::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_unavailable() {
        let stats = get_path_stats(Path::new("/definitely/not/a/mount/here"));
        assert!(!stats.available);
        assert_eq!(stats.free, 0);
    }
}
