// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! GPUs are assigned by specific index, not just by count: a task granted two GPUs learns
//! which two via `CUDA_VISIBLE_DEVICES`, and those indices stay unavailable until it ends.

use itertools::Itertools;

/// Per-index assignment table mapping GPU index to owning task id; `None` is free.
#[derive(Debug, Default)]
pub struct GpuTable {
    owners: Vec<Option<i64>>,
}

impl GpuTable {
    /// Match the table to the measured GPU count, keeping existing assignments when the
    /// count is unchanged.
    pub fn resize(&mut self, total: usize) {
        self.owners.resize(total, None);
    }

    pub fn total(&self) -> usize {
        self.owners.len()
    }

    pub fn free_count(&self) -> usize {
        self.owners.iter().filter(|owner| owner.is_none()).count()
    }

    /// Claim `count` specific free indices for the task. Fails without claiming anything if
    /// not enough are free.
    pub fn allocate(&mut self, count: usize, task_id: i64) -> bool {
        if self.free_count() < count {
            return false;
        }
        let mut remaining = count;
        for owner in self.owners.iter_mut() {
            if remaining == 0 {
                break;
            }
            if owner.is_none() {
                *owner = Some(task_id);
                remaining -= 1;
            }
        }
        true
    }

    pub fn free_for_task(&mut self, task_id: i64) {
        for owner in self.owners.iter_mut() {
            if *owner == Some(task_id) {
                *owner = None;
            }
        }
    }

    pub fn all_free(&self) -> bool {
        self.owners.iter().all(|owner| owner.is_none())
    }

    /// The `CUDA_VISIBLE_DEVICES` value for the task's assigned indices.
    pub fn visible_devices(&self, task_id: i64) -> String {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(task_id))
            .map(|(index, _)| index.to_string())
            .join(",")
    }
}
