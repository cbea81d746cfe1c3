use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::Disks;
use tracing::warn;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Watches free space on the volume holding the output directory and raises a
/// one-shot halt flag when it drops below the configured floor.
///
/// The guard never clears the flag and never terminates in-flight work: a
/// worker consults [`DiskGuard::check`] between tasks and drains gracefully,
/// so a half-written commit is never interrupted.
pub struct DiskGuard {
    path: PathBuf,
    threshold_bytes: u64,
    halted: AtomicBool,
    state: Mutex<SampleState>,
}

struct SampleState {
    last_sample: Option<Instant>,
    last_free: Option<u64>,
}

impl DiskGuard {
    pub fn new(path: impl AsRef<Path>, min_disk_gb: f64) -> Self {
        let threshold_bytes = (min_disk_gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64;
        Self::with_threshold_bytes(path, threshold_bytes)
    }

    pub fn with_threshold_bytes(path: impl AsRef<Path>, threshold_bytes: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            threshold_bytes,
            halted: AtomicBool::new(false),
            state: Mutex::new(SampleState {
                last_sample: None,
                last_free: None,
            }),
        }
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    /// Most recent free-space sample, if any was taken.
    pub fn last_free_bytes(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.last_free)
    }

    /// Sample free space (rate-limited) and return the halt flag. Called by
    /// every worker before pulling a new task.
    pub fn check(&self) -> bool {
        if self.halted() {
            return true;
        }
        if self.threshold_bytes == 0 {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return self.halted();
        };
        let now = Instant::now();
        if state
            .last_sample
            .is_some_and(|at| now.duration_since(at) < SAMPLE_INTERVAL)
        {
            return self.halted();
        }
        state.last_sample = Some(now);

        match free_bytes_for_path(&self.path) {
            Some(free) => {
                state.last_free = Some(free);
                if free < self.threshold_bytes {
                    // Set exactly once; later samples cannot clear it.
                    if !self.halted.swap(true, Ordering::Relaxed) {
                        warn!(
                            "disk guard: free space {:.1} GB below threshold {:.1} GB; halting new tasks",
                            free as f64 / 1e9,
                            self.threshold_bytes as f64 / 1e9
                        );
                    }
                }
            }
            None => {
                warn!(
                    "disk guard: cannot determine free space for {}; guard inactive",
                    self.path.display()
                );
            }
        }
        self.halted()
    }
}

/// Free bytes on the disk whose mount point is the longest prefix of `path`.
fn free_bytes_for_path(path: &Path) -> Option<u64> {
    let abs = std::path::absolute(path).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| abs.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threshold_never_halts() {
        let guard = DiskGuard::with_threshold_bytes(".", 0);
        assert!(!guard.check());
        assert!(!guard.halted());
    }

    #[test]
    fn impossible_threshold_halts_once_and_stays_halted() {
        let guard = DiskGuard::with_threshold_bytes(".", u64::MAX);
        assert!(guard.check());
        assert!(guard.halted());
        // Idempotent: still halted, never cleared.
        assert!(guard.check());
        assert!(guard.halted());
    }

    #[test]
    fn generous_threshold_does_not_halt() {
        // 1 byte of free space is a safe assumption on any test host.
        let guard = DiskGuard::with_threshold_bytes(".", 1);
        guard.check();
        assert!(!guard.halted());
    }
}
