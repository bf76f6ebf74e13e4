// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Recursive disk measurement with a wall-clock budget per pass. Sandboxes can be huge;
//! enforcement must never stall the event loop waiting on a full walk, so a scan carries its
//! walk state across calls and only complete passes update the reported totals.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use walkdir::WalkDir;

/// Entries examined between deadline checks.
const CHECK_EVERY: usize = 64;

pub struct DiskScan {
    root: PathBuf,
    walk: Option<walkdir::IntoIter>,
    bytes_in_progress: u64,
    files_in_progress: u64,
    last_complete_bytes: Option<u64>,
    last_complete_files: u64,
}

impl DiskScan {
    pub fn new(root: PathBuf) -> DiskScan {
        DiskScan {
            root,
            walk: None,
            bytes_in_progress: 0,
            files_in_progress: 0,
            last_complete_bytes: None,
            last_complete_files: 0,
        }
    }

    /// Totals from the most recent complete pass, if any pass has ever completed.
    pub fn last_complete(&self) -> Option<(u64, u64)> {
        self.last_complete_bytes.map(|b| (b, self.last_complete_files))
    }

    ///
    /// Walk for at most `budget`, resuming where the previous call stopped. Returns true when
    /// this call finished a pass (and the complete totals were updated).
    ///
    pub fn advance(&mut self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        let mut walk = self.walk.take().unwrap_or_else(|| {
            self.bytes_in_progress = 0;
            self.files_in_progress = 0;
            WalkDir::new(&self.root).follow_links(false).into_iter()
        });

        loop {
            for _ in 0..CHECK_EVERY {
                match walk.next() {
                    Some(Ok(entry)) => {
                        if entry.file_type().is_file() {
                            self.bytes_in_progress +=
                                entry.metadata().map(|m| m.len()).unwrap_or(0);
                            self.files_in_progress += 1;
                        }
                    }
                    Some(Err(_)) => {
                        // Entries that vanish mid-walk are expected: sandboxes are deleted
                        // underneath us.
                    }
                    None => {
                        self.last_complete_bytes = Some(self.bytes_in_progress);
                        self.last_complete_files = self.files_in_progress;
                        return true;
                    }
                }
            }
            if Instant::now() >= deadline {
                self.walk = Some(walk);
                return false;
            }
        }
    }
}

/// One unbounded pass: total file bytes and file count under `root`. Symlinks are counted as
/// their own size, not their target's.
pub fn measure(root: &std::path::Path) -> (u64, u64) {
    let mut bytes = 0;
    let mut files = 0;
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_file() {
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            files += 1;
        }
    }
    (bytes, files)
}

pub const MEGA: u64 = 1024 * 1024;

/// Bytes rounded up to whole megabytes, the unit resource accounting runs in.
pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(MEGA)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{bytes_to_mb, measure, DiskScan};

    #[test]
    fn measure_sums_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0_u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0_u8; 50]).unwrap();
        let (bytes, files) = measure(dir.path());
        assert_eq!(bytes, 150);
        assert_eq!(files, 2);
    }

    #[test]
    fn scan_reports_only_complete_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0_u8; 100]).unwrap();

        let mut scan = DiskScan::new(dir.path().to_owned());
        assert_eq!(scan.last_complete(), None);
        assert!(scan.advance(Duration::from_secs(3)));
        assert_eq!(scan.last_complete(), Some((100, 1)));
    }

    #[test]
    fn megabyte_rounding_is_up() {
        assert_eq!(bytes_to_mb(0), 0);
        assert_eq!(bytes_to_mb(1), 1);
        assert_eq!(bytes_to_mb(1024 * 1024), 1);
        assert_eq!(bytes_to_mb(1024 * 1024 + 1), 2);
    }
}
