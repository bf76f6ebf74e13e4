// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Foreman mode: the worker re-exports a manager endpoint on a local port, forming a tree.
//! Tasks arriving from upstream are recorded in an unfinished-task table and dispatched to
//! downstream workers over the same wire protocol this worker speaks upward; completions are
//! forwarded upstream as result reports. The foreman's cache directory doubles as the file
//! source for downstream staging.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use protocol::{Task, WorkerTotals};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use wire::transfer::{put_item, TransferMode};
use wire::{url_encode, Link, LinkError};

use crate::options::Options;
use crate::workspace::Workspace;

const DOWNSTREAM_IO_TIMEOUT: Duration = Duration::from_secs(3600);
const DOWNSTREAM_SLICE: Duration = Duration::from_secs(5);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(45);

/// A completion to be forwarded upstream.
#[derive(Debug)]
pub struct ForemanResult {
    pub task_id: i64,
    pub result_code: u32,
    pub exit_code: i32,
    pub execution_start: u64,
    pub execution_end: u64,
    pub stdout: Vec<u8>,
}

#[derive(Default)]
struct DownstreamWorker {
    totals: WorkerTotals,
    cores_assigned: i64,
}

#[derive(Default)]
struct State {
    /// Every task accepted from upstream and not yet completed.
    tasks: HashMap<i64, Task>,
    queued: VecDeque<i64>,
    /// Task id to the downstream session currently running it.
    assigned: HashMap<i64, u64>,
    /// Kills to relay, per downstream session.
    kill_requests: HashMap<u64, Vec<i64>>,
    workers: HashMap<u64, DownstreamWorker>,
    next_session: u64,
    tasks_complete: u64,
}

struct Shared {
    state: parking_lot::Mutex<State>,
    work_available: Notify,
    cache_dir: PathBuf,
    password: Option<String>,
    project: Option<String>,
    results_tx: mpsc::UnboundedSender<ForemanResult>,
}

pub struct Foreman {
    shared: Arc<Shared>,
    results_rx: Option<mpsc::UnboundedReceiver<ForemanResult>>,
    accept_loop: tokio::task::JoinHandle<()>,
    announce_loop: Option<tokio::task::JoinHandle<()>>,
    port: u16,
}

impl Foreman {
    pub async fn start(
        options: &Options,
        executor: &task_executor::Executor,
        workspace: &Workspace,
    ) -> Result<Foreman, String> {
        let port = options.foreman_port.unwrap_or(0);
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| format!("could not bind foreman port {port}: {e}"))?;
        let port = listener
            .local_addr()
            .map_err(|e| format!("foreman endpoint has no local address: {e}"))?
            .port();
        info!("foreman endpoint listening on port {port}");

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: parking_lot::Mutex::default(),
            work_available: Notify::new(),
            cache_dir: workspace.cache_dir(),
            password: options.password.clone(),
            project: options.foreman_project.clone(),
            results_tx,
        });

        let accept_shared = shared.clone();
        let accept_executor = executor.clone();
        let accept_loop = executor.native_spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("foreman accept failed: {e}");
                        continue;
                    }
                };
                debug!("downstream worker connected from {peer}");
                let shared = accept_shared.clone();
                accept_executor.native_spawn(async move {
                    let session_id = {
                        let mut state = shared.state.lock();
                        state.next_session += 1;
                        let session_id = state.next_session;
                        state.workers.insert(session_id, DownstreamWorker::default());
                        session_id
                    };
                    let _ = serve_downstream(&shared, session_id, Link::from_tcp(stream)).await;
                    release_session(&shared, session_id);
                });
            }
        });

        let announce_loop = shared.project.clone().map(|project| {
            let shared = shared.clone();
            let catalog = options.catalog.clone();
            executor.native_spawn(async move {
                let hostname = crate::serve::hostname();
                let starttime = store::now_usec() / 1_000_000;
                loop {
                    let summary = {
                        let state = shared.state.lock();
                        let totals = aggregate(&state);
                        catalog::ManagerSummary {
                            project: project.clone(),
                            name: hostname.clone(),
                            port,
                            owner: whoami(),
                            starttime,
                            tasks_waiting: state.queued.len() as u64,
                            tasks_running: state.assigned.len() as u64,
                            tasks_complete: state.tasks_complete,
                            workers_ready: state.workers.len() as u64,
                            cores_total: totals.cores,
                            memory_total: totals.memory,
                            disk_total: totals.disk,
                            version: env!("CARGO_PKG_VERSION").to_owned(),
                            ..catalog::ManagerSummary::default()
                        }
                    };
                    if let Err(e) = summary.announce(&catalog.0, catalog.1).await {
                        debug!("{e}");
                    }
                    tokio::time::sleep(ANNOUNCE_INTERVAL).await;
                }
            })
        });

        Ok(Foreman {
            shared,
            results_rx: Some(results_rx),
            accept_loop,
            announce_loop,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Record an upstream task and offer it downstream.
    pub fn submit(&self, task: Task) {
        let mut state = self.shared.state.lock();
        let task_id = task.task_id;
        state.tasks.insert(task_id, task);
        state.queued.push_back(task_id);
        drop(state);
        self.shared.work_available.notify_waiters();
    }

    pub fn kill(&self, task_id: i64) {
        let mut state = self.shared.state.lock();
        state.queued.retain(|id| *id != task_id);
        state.tasks.remove(&task_id);
        if let Some(session) = state.assigned.remove(&task_id) {
            state.kill_requests.entry(session).or_default().push(task_id);
        }
        drop(state);
        self.shared.work_available.notify_waiters();
    }

    pub fn kill_all(&self) {
        let doomed: Vec<i64> = self.shared.state.lock().tasks.keys().copied().collect();
        for task_id in doomed {
            self.kill(task_id);
        }
    }

    /// Tasks accepted from upstream and not yet completed.
    pub fn tasks_outstanding(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Sum of downstream worker totals, reported upward as this worker's own capacity.
    pub fn aggregate_totals(&self) -> WorkerTotals {
        aggregate(&self.shared.state.lock())
    }

    pub fn take_results(&mut self) -> Option<mpsc::UnboundedReceiver<ForemanResult>> {
        self.results_rx.take()
    }

    pub fn put_back_results(&mut self, rx: mpsc::UnboundedReceiver<ForemanResult>) {
        self.results_rx = Some(rx);
    }

    pub fn stop(self) {
        self.accept_loop.abort();
        if let Some(announce) = self.announce_loop {
            announce.abort();
        }
    }
}

fn aggregate(state: &State) -> WorkerTotals {
    let mut totals = WorkerTotals::default();
    for worker in state.workers.values() {
        totals.cores += worker.totals.cores;
        totals.memory += worker.totals.memory;
        totals.disk += worker.totals.disk;
        totals.gpus += worker.totals.gpus;
    }
    totals
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned())
}

/// A worker session ended: put whatever it was running back on the queue for someone else.
fn release_session(shared: &Shared, session_id: u64) {
    let mut state = shared.state.lock();
    state.workers.remove(&session_id);
    state.kill_requests.remove(&session_id);
    let orphaned: Vec<i64> = state
        .assigned
        .iter()
        .filter(|(_, session)| **session == session_id)
        .map(|(task_id, _)| *task_id)
        .collect();
    for task_id in orphaned {
        state.assigned.remove(&task_id);
        if state.tasks.contains_key(&task_id) {
            debug!("requeueing task {task_id} from departed worker");
            state.queued.push_front(task_id);
        }
    }
    drop(state);
    shared.work_available.notify_waiters();
}

/// Claim the first queued task this session can hold whose inputs are all present in the
/// foreman's cache.
fn claim_task(shared: &Shared, session_id: u64) -> Option<Task> {
    let mut state = shared.state.lock();

    let capacity = {
        let worker = state.workers.get(&session_id)?;
        worker.totals.cores - worker.cores_assigned
    };

    let mut claimed = None;
    for (index, task_id) in state.queued.iter().enumerate() {
        let task = match state.tasks.get(task_id) {
            Some(task) => task,
            None => continue,
        };
        if task.resources.cores.max(1) > capacity {
            continue;
        }
        let inputs_present = task
            .input_mounts
            .iter()
            .all(|mount| shared.cache_dir.join(&mount.cached_name).exists());
        if inputs_present {
            claimed = Some((index, *task_id));
            break;
        }
    }

    let (index, task_id) = claimed?;
    state.queued.remove(index);
    state.assigned.insert(task_id, session_id);
    let cores = state.tasks.get(&task_id).map(|t| t.resources.cores.max(1));
    if let Some(worker) = state.workers.get_mut(&session_id) {
        worker.cores_assigned += cores.unwrap_or(1);
    }
    state.tasks.get(&task_id).cloned()
}

fn unassign(shared: &Shared, session_id: u64, task_id: i64, completed: bool) {
    let mut state = shared.state.lock();
    state.assigned.remove(&task_id);
    let cores = state.tasks.get(&task_id).map(|t| t.resources.cores.max(1));
    if let Some(worker) = state.workers.get_mut(&session_id) {
        worker.cores_assigned -= cores.unwrap_or(1);
    }
    if completed {
        state.tasks.remove(&task_id);
        state.tasks_complete += 1;
    }
}

async fn send_line(link: &mut Link, line: &str) -> Result<(), LinkError> {
    debug!("foreman tx: {line}");
    link.write_line(line, Instant::now() + DOWNSTREAM_IO_TIMEOUT)
        .await
}

/// Ship one cached input downstream, as a `file` or `dir` message.
async fn send_input(link: &mut Link, shared: &Shared, cached_name: &str) -> Result<(), LinkError> {
    let path = shared.cache_dir.join(cached_name);
    let stop = Instant::now() + DOWNSTREAM_IO_TIMEOUT;
    let meta = match std::fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) => {
            warn!("foreman cannot stage {cached_name}: {e}");
            return Ok(());
        }
    };
    if meta.is_dir() {
        send_line(link, &format!("dir {}", url_encode(cached_name))).await?;
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            put_item(link, &entry.path(), &name, TransferMode::Any, stop).await?;
        }
        send_line(link, "end").await
    } else {
        let mode = std::os::unix::fs::PermissionsExt::mode(&meta.permissions()) & 0o7777;
        send_line(
            link,
            &format!("file {} {} {mode:o}", url_encode(cached_name), meta.len()),
        )
        .await?;
        let mut file = tokio::fs::File::open(&path).await?;
        link.stream_from_file(&mut file, meta.len(), stop).await
    }
}

async fn send_task_block(link: &mut Link, task: &Task) -> Result<(), LinkError> {
    let stop = Instant::now() + DOWNSTREAM_IO_TIMEOUT;
    send_line(link, &format!("task {}", task.task_id)).await?;
    if let Some(category) = &task.category {
        send_line(link, &format!("category {category}")).await?;
    }
    send_line(link, &format!("cmd {}", task.command.len())).await?;
    link.write_all(task.command.as_bytes(), stop).await?;
    link.write_all(b"\n", stop).await?;
    for mount in &task.input_mounts {
        send_line(
            link,
            &format!(
                "infile {} {} {}",
                url_encode(&mount.cached_name),
                url_encode(&mount.remote_name),
                mount.flags.to_wire()
            ),
        )
        .await?;
    }
    for mount in &task.output_mounts {
        send_line(
            link,
            &format!(
                "outfile {} {} {}",
                url_encode(&mount.cached_name),
                url_encode(&mount.remote_name),
                mount.flags.to_wire()
            ),
        )
        .await?;
    }
    for dir in &task.empty_dirs {
        send_line(link, &format!("dir {}", url_encode(dir))).await?;
    }
    send_line(link, &format!("cores {}", task.resources.cores)).await?;
    send_line(link, &format!("memory {}", task.resources.memory)).await?;
    send_line(link, &format!("disk {}", task.resources.disk)).await?;
    send_line(link, &format!("gpus {}", task.resources.gpus)).await?;
    if task.resources.wall_time > 0 {
        send_line(link, &format!("wall_time {}", task.resources.wall_time)).await?;
    }
    if task.resources.end > 0 {
        send_line(link, &format!("end_time {}", task.resources.end)).await?;
    }
    for (name, value) in &task.env {
        let entry = match value {
            Some(value) => format!("{name}={value}"),
            None => name.clone(),
        };
        send_line(link, &format!("env {}", entry.len())).await?;
        link.write_all(entry.as_bytes(), stop).await?;
        link.write_all(b"\n", stop).await?;
    }
    send_line(link, "end").await
}

async fn serve_downstream(
    shared: &Shared,
    session_id: u64,
    mut link: Link,
) -> Result<(), LinkError> {
    let auth_stop = Instant::now() + Duration::from_secs(60);
    if let Some(password) = &shared.password {
        wire::auth::authenticate_accept(&mut link, password, auth_stop).await?;
    }

    // Inputs already shipped to this worker's cache; shipping twice would collide.
    let mut staged: HashSet<String> = HashSet::new();

    loop {
        let slice_stop = Instant::now() + DOWNSTREAM_SLICE;
        tokio::select! {
            line = link.read_line(Instant::now() + DOWNSTREAM_IO_TIMEOUT) => {
                let line = line?;
                debug!("foreman rx: {line}");
                handle_downstream_line(shared, session_id, &mut link, &line).await?;
            }
            _ = shared.work_available.notified() => {}
            _ = tokio::time::sleep_until(slice_stop) => {}
        }

        // Relay any kills aimed at this session.
        let kills: Vec<i64> = {
            let mut state = shared.state.lock();
            state
                .kill_requests
                .get_mut(&session_id)
                .map(std::mem::take)
                .unwrap_or_default()
        };
        for task_id in kills {
            send_line(&mut link, &format!("kill {task_id}")).await?;
            unassign(shared, session_id, task_id, false);
        }

        // Offer work while there is capacity and stageable input.
        while let Some(task) = claim_task(shared, session_id) {
            for mount in &task.input_mounts {
                if staged.insert(mount.cached_name.clone()) {
                    send_input(&mut link, shared, &mount.cached_name).await?;
                }
            }
            send_task_block(&mut link, &task).await?;
        }
    }
}

async fn handle_downstream_line(
    shared: &Shared,
    session_id: u64,
    link: &mut Link,
    line: &str,
) -> Result<(), LinkError> {
    let stop = Instant::now() + DOWNSTREAM_IO_TIMEOUT;
    let mut words = line.split_ascii_whitespace();
    let tag = words.next().unwrap_or("");
    let args: Vec<&str> = words.collect();

    match tag {
        "taskvine" | "alive" | "feature" | "transfer-address" | "info" | "end" => {}
        "name" => {
            let project = shared.project.clone().unwrap_or_default();
            send_line(link, &project).await?;
        }
        "resource" => {
            if let ["cores" | "memory" | "disk" | "gpus", rest @ ..] = args.as_slice() {
                if let Some(total) = rest.first().and_then(|v| v.parse::<i64>().ok()) {
                    let mut state = shared.state.lock();
                    if let Some(worker) = state.workers.get_mut(&session_id) {
                        match args[0] {
                            "cores" => worker.totals.cores = total,
                            "memory" => worker.totals.memory = total,
                            "disk" => worker.totals.disk = total,
                            _ => worker.totals.gpus = total,
                        }
                    }
                }
            }
        }
        "available_results" => {
            send_line(link, "send_results 1000").await?;
        }
        "result" => {
            // result RESULT EXIT_CODE STDOUT_LEN START END TASK_ID
            if args.len() != 6 {
                return Err(LinkError::Protocol(format!("bad result record: {line}")));
            }
            let parse =
                |s: &str| -> Result<u64, LinkError> {
                    s.parse()
                        .map_err(|_| LinkError::Protocol(format!("bad result record: {line}")))
                };
            let result_code = parse(args[0])? as u32;
            let exit_code = args[1].parse::<i32>().unwrap_or(1);
            let stdout_len = parse(args[2])?;
            let execution_start = parse(args[3])?;
            let execution_end = parse(args[4])?;
            let task_id = args[5]
                .parse::<i64>()
                .map_err(|_| LinkError::Protocol(format!("bad result record: {line}")))?;

            let mut stdout = vec![0_u8; stdout_len as usize];
            link.read_exact(&mut stdout, stop).await?;

            unassign(shared, session_id, task_id, true);
            let _ = shared.results_tx.send(ForemanResult {
                task_id,
                result_code,
                exit_code,
                execution_start,
                execution_end,
                stdout,
            });
            // The downstream worker keeps the task until acknowledged.
            send_line(link, &format!("kill {task_id}")).await?;
        }
        "cache-update" => {}
        "cache-invalid" => {
            // Drain the error payload so the stream stays in sync.
            if let Some(length) = args.get(1).and_then(|v| v.parse::<usize>().ok()) {
                let mut payload = vec![0_u8; length];
                link.read_exact(&mut payload, stop).await?;
            }
        }
        _ => {
            debug!("ignoring downstream message: {line}");
        }
    }
    Ok(())
}
