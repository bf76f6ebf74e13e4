// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Two views of what this worker has: `local` (measured from the machine, possibly overridden
//! by the operator) and `total` (what was last reported to the manager). Memory and disk run
//! in MB throughout.

use std::path::Path;
use std::time::{Duration, Instant};

use store::disk::{bytes_to_mb, DiskScan};
use sysinfo::{System, SystemExt};

pub const CHECK_RESOURCES_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_TIME_ON_MEASUREMENT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Resource {
    pub total: i64,
    pub inuse: i64,
    pub smallest: i64,
    pub largest: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Identifies the task arrival this snapshot was current for.
    pub tag: i64,
    pub cores: Resource,
    pub memory: Resource,
    pub disk: Resource,
    pub gpus: Resource,
}

impl ResourceSnapshot {
    pub fn totals(&self) -> protocol::WorkerTotals {
        protocol::WorkerTotals {
            cores: self.cores.total,
            memory: self.memory.total,
            disk: self.disk.total,
            gpus: self.gpus.total,
        }
    }

    /// The lines of a resource update block, minus the terminator the caller appends.
    pub fn update_lines(&self) -> Vec<String> {
        let line = |name: &str, r: &Resource| {
            format!(
                "resource {name} {} {} {} {}",
                r.total, r.inuse, r.largest, r.smallest
            )
        };
        vec![
            line("cores", &self.cores),
            line("memory", &self.memory),
            line("disk", &self.disk),
            line("gpus", &self.gpus),
            format!("resource tag {}", self.tag),
        ]
    }
}

/// Operator overrides from the command line or environment. `None` means measure.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualResources {
    pub cores: Option<i64>,
    pub memory: Option<i64>,
    pub disk: Option<i64>,
    pub gpus: Option<i64>,
    pub wall_time_secs: Option<u64>,
}

pub struct ResourceMonitor {
    manual: ManualResources,
    pub local: ResourceSnapshot,
    pub total: ResourceSnapshot,
    system: System,
    cache_scan: Option<DiskScan>,
    last_measurement: Option<Instant>,
}

impl ResourceMonitor {
    pub fn new(manual: ManualResources) -> ResourceMonitor {
        ResourceMonitor {
            manual,
            local: ResourceSnapshot::default(),
            total: ResourceSnapshot::default(),
            system: System::new(),
            cache_scan: None,
            last_measurement: None,
        }
    }

    pub fn manual_disk(&self) -> Option<i64> {
        self.manual.disk
    }

    pub fn manual_memory(&self) -> Option<i64> {
        self.manual.memory
    }

    /// Drop the measurement timestamp so the next `measure` call runs regardless of the
    /// interval. Used when a connection starts.
    pub fn force_next(&mut self) {
        self.last_measurement = None;
    }

    ///
    /// Re-measure local cores/memory/disk at most once per interval. The cache directory is
    /// the only disk we measure here; running sandboxes measure themselves and their sizes
    /// arrive via `sandbox_mb`. Returns true if a measurement ran.
    ///
    pub fn measure(
        &mut self,
        workspace: &Path,
        cache_dir: &Path,
        sandbox_mb: i64,
        last_task_received: i64,
    ) -> bool {
        if let Some(last) = self.last_measurement {
            if last.elapsed() < CHECK_RESOURCES_INTERVAL {
                return false;
            }
        }

        let r = &mut self.local;

        r.cores.total = self.manual.cores.unwrap_or_else(|| num_cpus::get() as i64);

        self.system.refresh_memory();
        r.memory.total = match self.manual.memory {
            Some(mb) => mb,
            // sysinfo reports KB.
            None => (self.system.total_memory() / 1024) as i64,
        };
        r.memory.inuse = (self.system.used_memory() / 1024) as i64;

        let disk_avail_mb = statvfs_available_mb(workspace);
        r.disk.total = match self.manual.disk {
            Some(mb) => std::cmp::min(disk_avail_mb, mb),
            None => disk_avail_mb,
        };

        // GPUs are never probed: zero unless the operator says otherwise.
        r.gpus.total = self.manual.gpus.unwrap_or(0);

        r.cores.smallest = r.cores.total;
        r.cores.largest = r.cores.total;
        r.memory.smallest = r.memory.total;
        r.memory.largest = r.memory.total;
        r.disk.smallest = r.disk.total;
        r.disk.largest = r.disk.total;
        r.gpus.smallest = r.gpus.total;
        r.gpus.largest = r.gpus.total;

        let scan = self
            .cache_scan
            .get_or_insert_with(|| DiskScan::new(cache_dir.to_owned()));
        scan.advance(MAX_TIME_ON_MEASUREMENT);
        let cache_mb = scan
            .last_complete()
            .map(|(bytes, _)| bytes_to_mb(bytes) as i64)
            .unwrap_or(0);
        r.disk.inuse = cache_mb + sandbox_mb;

        r.tag = last_task_received;
        self.total = *r;
        self.last_measurement = Some(Instant::now());
        true
    }
}

fn statvfs_available_mb(path: &Path) -> i64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            bytes_to_mb(bytes) as i64
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{ManualResources, ResourceMonitor};

    #[test]
    fn manual_overrides_win_and_gpus_default_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let manual = ManualResources {
            cores: Some(4),
            memory: Some(2048),
            ..ManualResources::default()
        };
        let mut monitor = ResourceMonitor::new(manual);
        assert!(monitor.measure(dir.path(), dir.path(), 0, 0));

        assert_eq!(monitor.local.cores.total, 4);
        assert_eq!(monitor.local.memory.total, 2048);
        assert_eq!(monitor.local.gpus.total, 0);
        assert!(monitor.local.disk.total > 0);
        assert_eq!(monitor.local.cores.largest, 4);

        // Within the interval, measurement is skipped.
        assert!(!monitor.measure(dir.path(), dir.path(), 0, 0));
    }

    #[test]
    fn update_block_has_one_line_per_resource() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = ResourceMonitor::new(ManualResources {
            cores: Some(2),
            memory: Some(100),
            disk: Some(500),
            gpus: Some(1),
            wall_time_secs: None,
        });
        monitor.measure(dir.path(), dir.path(), 0, 7);

        let lines = monitor.total.update_lines();
        assert!(lines.iter().any(|l| l.starts_with("resource cores 2 ")));
        assert!(lines.iter().any(|l| l.starts_with("resource memory 100 ")));
        assert!(lines.iter().any(|l| l.starts_with("resource gpus 1 ")));
        assert!(lines.contains(&"resource tag 7".to_owned()));
    }
}
