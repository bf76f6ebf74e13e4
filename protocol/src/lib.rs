// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod commands;
#[cfg(test)]
mod commands_tests;

pub use crate::commands::{read_task_block, ManagerCommand};

/// Version of the line protocol spoken on the manager link, sent in the opening handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// How a mount binds its cache object into the sandbox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountFlags(u32);

impl MountFlags {
    const UNPACK: u32 = 0x1;
    const PONCHO_UNPACK: u32 = 0x2;
    const SYMLINK: u32 = 0x4;

    pub fn from_wire(bits: u32) -> MountFlags {
        MountFlags(bits)
    }

    pub fn to_wire(self) -> u32 {
        self.0
    }

    pub fn unpack(self) -> bool {
        self.0 & Self::UNPACK != 0
    }

    pub fn poncho_unpack(self) -> bool {
        self.0 & Self::PONCHO_UNPACK != 0
    }

    pub fn symlink(self) -> bool {
        self.0 & Self::SYMLINK != 0
    }
}

/// A binding between a cache object and a path relative to the task sandbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    pub cached_name: String,
    pub remote_name: String,
    pub flags: MountFlags,
}

///
/// The resources a task claims. Any field ≤ 0 means "unspecified": when all four of
/// cores/memory/disk/gpus are unspecified the task claims the whole worker, otherwise
/// unspecified fields become zero.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resources {
    pub cores: i64,
    /// MB.
    pub memory: i64,
    /// MB.
    pub disk: i64,
    pub gpus: i64,
    /// Seconds of wall time from execution start; 0 = unlimited.
    pub wall_time: u64,
    /// Absolute end time in microseconds since the epoch; 0 = none.
    pub end: u64,
}

impl Default for Resources {
    fn default() -> Resources {
        Resources {
            cores: -1,
            memory: -1,
            disk: -1,
            gpus: -1,
            wall_time: 0,
            end: 0,
        }
    }
}

/// The worker totals a fully-unspecified request expands to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerTotals {
    pub cores: i64,
    pub memory: i64,
    pub disk: i64,
    pub gpus: i64,
}

impl Resources {
    pub fn normalize(&mut self, whole_worker: &WorkerTotals) {
        if self.cores < 0 && self.memory < 0 && self.disk < 0 && self.gpus < 0 {
            self.cores = whole_worker.cores;
            self.memory = whole_worker.memory;
            self.disk = whole_worker.disk;
            self.gpus = whole_worker.gpus;
        } else {
            self.cores = self.cores.max(0);
            self.memory = self.memory.max(0);
            self.disk = self.disk.max(0);
            self.gpus = self.gpus.max(0);
        }
    }
}

///
/// The unit of work dispatched from manager to worker: a shell command plus its named
/// input/output bindings and resource claim.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Task {
    pub task_id: i64,
    pub command: String,
    pub category: Option<String>,
    /// In arrival order. `None` value means the variable is unset for the task.
    pub env: Vec<(String, Option<String>)>,
    pub input_mounts: Vec<Mount>,
    pub output_mounts: Vec<Mount>,
    pub empty_dirs: Vec<String>,
    pub resources: Resources,
    pub needs_library: Option<String>,
    pub provides_library: Option<String>,
}

impl Task {
    pub fn new(task_id: i64) -> Task {
        Task {
            task_id,
            ..Task::default()
        }
    }

    /// A function task runs against a resident library; a library task is that resident
    /// process. The two attributes are mutually exclusive.
    pub fn validate(&self) -> Result<(), String> {
        if self.needs_library.is_some() && self.provides_library.is_some() {
            return Err(format!(
                "task {} both needs and provides a library",
                self.task_id
            ));
        }
        Ok(())
    }
}

/// The outcome of a task as reported to the manager, orthogonal to the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskResult {
    Success,
    InputMissing,
    OutputMissing,
    ResourceExhaustion,
    MaxWallTime,
    MaxEndTime,
    Forsaken,
    Killed,
}

impl TaskResult {
    pub fn code(self) -> u32 {
        match self {
            TaskResult::Success => 0,
            TaskResult::InputMissing => 1,
            TaskResult::OutputMissing => 2,
            TaskResult::ResourceExhaustion => 3,
            TaskResult::MaxWallTime => 4,
            TaskResult::MaxEndTime => 5,
            TaskResult::Forsaken => 6,
            TaskResult::Killed => 7,
        }
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskResult::Success => "success",
            TaskResult::InputMissing => "input missing",
            TaskResult::OutputMissing => "output missing",
            TaskResult::ResourceExhaustion => "resource exhaustion",
            TaskResult::MaxWallTime => "max wall time",
            TaskResult::MaxEndTime => "max end time",
            TaskResult::Forsaken => "forsaken",
            TaskResult::Killed => "killed",
        };
        write!(f, "{name}")
    }
}
