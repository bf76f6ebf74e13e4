// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Mini-tasks produce single cache entries on demand (server-side file transformations).
//! They run through the same sandbox and child-process machinery as ordinary tasks, but
//! synchronously within the store's materializer, outside resource accounting.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use protocol::Task;
use store::{MiniTaskRunner, Store, Trash};

use crate::process::{kill_process_group, task_command, ManagedChild, TaskProcess};
use crate::sandbox::{inputs_status, stagein, Stagein};

/// How long a mini-task may run when it declares no wall time of its own.
const DEFAULT_WALL_TIME: Duration = Duration::from_secs(3600);

/// How long to wait for the mini-task's own inputs to materialize.
const INPUT_WAIT: Duration = Duration::from_secs(3600);

pub struct SupervisorMiniTasks {
    workspace_root: PathBuf,
    store: Store,
    trash: Trash,
    symlink_fallback: bool,
}

impl SupervisorMiniTasks {
    pub fn new(
        workspace_root: PathBuf,
        store: Store,
        trash: Trash,
        symlink_fallback: bool,
    ) -> SupervisorMiniTasks {
        SupervisorMiniTasks {
            workspace_root,
            store,
            trash,
            symlink_fallback,
        }
    }
}

#[async_trait]
impl MiniTaskRunner for SupervisorMiniTasks {
    async fn run(&self, task: Task, dest: &Path) -> Result<(), String> {
        let process = TaskProcess::new(task, &self.workspace_root, true);
        let result = self.run_in_sandbox(&process, dest).await;
        self.trash.trash(&process.sandbox);
        result
    }
}

impl SupervisorMiniTasks {
    async fn run_in_sandbox(&self, process: &TaskProcess, dest: &Path) -> Result<(), String> {
        let output_mount = process
            .task
            .output_mounts
            .first()
            .ok_or_else(|| "mini task declares no output".to_owned())?
            .clone();

        // Inputs may themselves still be materializing; poll them like the scheduler would.
        let input_deadline = tokio::time::Instant::now() + INPUT_WAIT;
        loop {
            match inputs_status(process, &self.store) {
                Stagein::Ready => break,
                Stagein::NeedsWait => {
                    if tokio::time::Instant::now() >= input_deadline {
                        return Err("mini task inputs never materialized".to_owned());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Stagein::Failed(message) => return Err(message),
            }
        }
        stagein(process, &self.store, self.symlink_fallback)?;

        let stdout = std::fs::File::create(process.stdout_file())
            .map_err(|e| format!("could not open mini task stdout: {e}"))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| format!("could not open mini task stdout: {e}"))?;
        let mut command = task_command(process, None);
        command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));

        let child = ManagedChild::spawn(&mut command)?;
        let pid = child.pid();
        debug!(
            "mini task {} running as pid {pid}: {}",
            process.task_id(),
            process.task.command
        );

        let wall_time = match process.task.resources.wall_time {
            0 => DEFAULT_WALL_TIME,
            secs => Duration::from_secs(secs),
        };
        let status = match tokio::time::timeout(wall_time, child.wait()).await {
            Ok(status) => status.map_err(|e| format!("could not reap mini task: {e}"))?,
            Err(_) => {
                kill_process_group(pid);
                return Err(format!(
                    "mini task {} exceeded {}s",
                    process.task_id(),
                    wall_time.as_secs()
                ));
            }
        };

        if !status.success() {
            let output = std::fs::read_to_string(process.stdout_file()).unwrap_or_default();
            return Err(format!(
                "mini task {} failed ({status}): {}",
                process.task_id(),
                output.trim()
            ));
        }

        let produced = process.sandbox.join(&output_mount.remote_name);
        tokio::fs::rename(&produced, dest)
            .await
            .map_err(|e| format!("mini task produced no {}: {e}", output_mount.remote_name))
    }
}
