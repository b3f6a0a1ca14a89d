use std::path::Path;

use mockall::automock;
use sysinfo::Disks;

/// Reports free space on the snapshot volume. Advisory: read before
/// admission, no lock held.
#[automock]
pub trait DiskGuard: Send + Sync {
    fn free_bytes(&self, path: &Path) -> u64;
}

/// Resolves `path` to the mounted filesystem containing it and reports the
/// available space there.
#[derive(Debug, Default)]
pub struct MountedDiskGuard;

impl DiskGuard for MountedDiskGuard {
    fn free_bytes(&self, path: &Path) -> u64 {
        let disks = Disks::new_with_refreshed_list();
        // Longest mount-point prefix wins, so /data/snapshots resolves to a
        // /data mount rather than /.
        let mut best: Option<(&Path, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                match best {
                    Some((current, _)) if mount.as_os_str().len() <= current.as_os_str().len() => {}
                    _ => best = Some((mount, disk.available_space())),
                }
            }
        }
        match best {
            Some((_, available)) => available,
            None => {
                tracing::warn!(path = %path.display(), "No mounted filesystem found for path, reporting 0 free bytes");
                0
            }
        }
    }
}

/// Fixed-value guard for tests and dry runs.
#[derive(Debug)]
pub struct StaticDiskGuard {
    free: u64,
}

impl StaticDiskGuard {
    pub fn new(free: u64) -> Self {
        Self { free }
    }
}

impl DiskGuard for StaticDiskGuard {
    fn free_bytes(&self, _path: &Path) -> u64 {
        self.free
    }
}
