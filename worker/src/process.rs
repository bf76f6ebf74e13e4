// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use nix::sys::signal;
use nix::unistd::Pid;
use protocol::{Task, TaskResult};
use store::disk::{bytes_to_mb, DiskScan};
use store::Store;
use tokio::process::Command;

use crate::library::LibraryState;
use crate::resources::MAX_TIME_ON_MEASUREMENT;

pub const STDOUT_FILE: &str = ".taskvine.stdout";
pub const TMP_DIR: &str = ".taskvine.tmp";

/// Sending a signal to a child younger than this risks arriving before the child has entered
/// its own process group, losing the signal.
const YOUNG_CHILD_GUARD: Duration = Duration::from_secs(3);

///
/// A child process running in its own session, so that the whole process group can be
/// signalled later. Used for task commands, library processes, and mini-tasks alike.
///
pub struct ManagedChild {
    child: tokio::process::Child,
    pid: u32,
}

impl ManagedChild {
    pub fn spawn(command: &mut Command) -> Result<ManagedChild, String> {
        // `kill_on_drop` backstops the explicit group kill: tokio reaps the direct child if
        // the handle is ever dropped while running.
        command.kill_on_drop(true);

        // Enter a fresh session (and thus process group) before exec, so killing the group
        // reaches everything the task forks.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_session| ())
                    .map_err(|e| std::io::Error::other(format!("could not create session: {e}")))
            });
        }

        let child = command
            .spawn()
            .map_err(|e| format!("error launching process: {e}"))?;
        let pid = child
            .id()
            .ok_or_else(|| "spawned process had no pid".to_owned())?;
        Ok(ManagedChild { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Option<tokio::process::ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Consume the handle, waiting for exit. Run inside a spawned task so the event loop
    /// never blocks on a child.
    pub async fn wait(mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// SIGKILL the process group rooted at `pid`.
pub fn kill_process_group(pid: u32) {
    let _ = signal::kill(Pid::from_raw(-(pid as i32)), signal::Signal::SIGKILL);
}

/// How the worker executes a task once its sandbox is staged.
pub enum Runner {
    /// An OS child process (ordinary commands, libraries, mini-tasks).
    Child { pid: u32, spawned: tokio::time::Instant },
    /// An in-worker invocation against a resident library.
    Function { invocation: tokio::task::JoinHandle<()> },
}

///
/// A `Task` in the worker's hands: its sandbox, its runner once started, and the result it
/// will report. The process owns the sandbox directory; deleting the process trashes it.
///
pub struct TaskProcess {
    pub task: Task,
    pub sandbox: PathBuf,
    pub runner: Option<Runner>,
    pub execution_start: u64,
    pub execution_end: u64,
    pub result: TaskResult,
    pub exit_code: i32,
    /// Disk budget for enforcement, in MB; negative when the task set none.
    pub disk_budget_mb: i64,
    pub sandbox_size_mb: i64,
    pub sandbox_file_count: u64,
    sandbox_scan: Option<DiskScan>,
    /// Present on library tasks once spawned.
    pub library: Option<Arc<LibraryState>>,
    /// For function tasks: the task id of the library serving them.
    pub serving_library: Option<i64>,
    pub is_mini: bool,
}

impl TaskProcess {
    pub fn new(task: Task, workspace_root: &std::path::Path, is_mini: bool) -> TaskProcess {
        let prefix = if is_mini { "m" } else { "t" };
        let sandbox = workspace_root.join(format!("{prefix}.{}", task.task_id));
        TaskProcess {
            task,
            sandbox,
            runner: None,
            execution_start: 0,
            execution_end: 0,
            result: TaskResult::Success,
            exit_code: 0,
            disk_budget_mb: -1,
            sandbox_size_mb: 0,
            sandbox_file_count: 0,
            sandbox_scan: None,
            library: None,
            serving_library: None,
            is_mini,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task.task_id
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.sandbox.join(TMP_DIR)
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.sandbox.join(STDOUT_FILE)
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_some()
    }

    ///
    /// The disk a task may write is its stated budget minus the inputs it links from the
    /// cache, since those are shared and counted against the cache, not the sandbox.
    ///
    pub fn compute_disk_budget(&mut self, store: &Store) {
        let mut budget = self.task.resources.disk;
        if budget < 0 {
            self.disk_budget_mb = -1;
            return;
        }
        for mount in &self.task.input_mounts {
            if let Ok(meta) = std::fs::metadata(store.full_path(&mount.cached_name)) {
                budget -= bytes_to_mb(meta.len()) as i64;
            }
        }
        self.disk_budget_mb = budget.max(-1);
    }

    /// Record exit-code-or-signal from a reaped status.
    pub fn set_exit_status(&mut self, status: ExitStatus) {
        match status.code() {
            Some(code) => {
                self.exit_code = code;
                debug!("task {} exited normally with code {code}", self.task_id());
            }
            None => {
                let signal = status.signal().unwrap_or(0);
                self.exit_code = signal;
                debug!(
                    "task {} exited abnormally with signal {signal}",
                    self.task_id()
                );
            }
        }
    }

    /// Bounded measurement of the sandbox, for disk enforcement.
    pub fn measure_sandbox(&mut self) {
        let scan = self
            .sandbox_scan
            .get_or_insert_with(|| DiskScan::new(self.sandbox.clone()));
        scan.advance(MAX_TIME_ON_MEASUREMENT);
        if let Some((bytes, files)) = scan.last_complete() {
            self.sandbox_size_mb = bytes_to_mb(bytes) as i64;
            self.sandbox_file_count = files;
        }
    }

    ///
    /// Stop the runner. For a child process, SIGKILL its whole group, waiting out the
    /// young-child guard first (asynchronously, so the event loop never sleeps). For a
    /// function invocation, abort it.
    ///
    pub fn kill(&mut self) {
        match self.runner.take() {
            Some(Runner::Child { pid, spawned }) => {
                let elapsed = spawned.elapsed();
                debug!("terminating task {} pid {pid}", self.task_id());
                if elapsed < YOUNG_CHILD_GUARD {
                    let wait = YOUNG_CHILD_GUARD - elapsed;
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        kill_process_group(pid);
                    });
                } else {
                    kill_process_group(pid);
                }
            }
            Some(Runner::Function { invocation }) => {
                invocation.abort();
            }
            None => {}
        }
    }
}

/// The baseline command for a task: `/bin/sh -c` in the sandbox, with the resource values and
/// the task's own environment exported, and the sandbox scratch dir winning the TMPDIR war.
pub fn task_command(process: &TaskProcess, cuda_devices: Option<String>) -> Command {
    let task = &process.task;
    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&task.command)
        .current_dir(&process.sandbox)
        .env_remove("DISPLAY")
        .stdin(Stdio::null());

    if task.resources.cores > 0 {
        command.env("CORES", task.resources.cores.to_string());
        command.env("OMP_NUM_THREADS", task.resources.cores.to_string());
    }
    if task.resources.memory > 0 {
        command.env("MEMORY", task.resources.memory.to_string());
    }
    if task.resources.disk > 0 {
        command.env("DISK", task.resources.disk.to_string());
    }
    if task.resources.gpus > 0 {
        command.env("GPUS", task.resources.gpus.to_string());
        if let Some(devices) = cuda_devices {
            command.env("CUDA_VISIBLE_DEVICES", devices);
        }
    }

    for (name, value) in &task.env {
        match value {
            Some(value) => command.env(name, value),
            None => command.env_remove(name),
        };
    }

    // After the task's own list, so a task cannot point TMPDIR outside its sandbox.
    let tmp = process.tmp_dir();
    command.env("TMPDIR", &tmp).env("TEMP", &tmp).env("TMP", &tmp);
    command.env("WORK_QUEUE_SANDBOX", &process.sandbox);

    command
}
