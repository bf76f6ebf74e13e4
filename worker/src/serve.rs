// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The worker's life is a cycle of sessions: find a manager (directly or via the catalog),
//! serve it exclusively until released, idle, or broken, then clean up and look again.
//! Within a session, a single async state machine multiplexes manager commands, child
//! exits, cache completions, and enforcement ticks.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use protocol::{ManagerCommand, Task, TaskResult};
use rand::seq::SliceRandom;
use regex::Regex;
use store::{CacheLevel, Store, StoreEvent, Trash};
use task_executor::Executor;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use wire::{url_encode, Link, LinkError};

use crate::foreman::{Foreman, ForemanResult};
use crate::gpus::GpuTable;
use crate::library::LibraryState;
use crate::mini_task::SupervisorMiniTasks;
use crate::options::{Mode, Options};
use crate::process::{task_command, ManagedChild, Runner, TaskProcess};
use crate::resources::{ResourceMonitor, ResourceSnapshot};
use crate::sandbox::{self, is_safe_relative, Stagein};
use crate::transfer_server::TransferServer;
use crate::workspace::Workspace;

/// Maximum time to send or receive any given file or message.
const ACTIVE_TIMEOUT: Duration = Duration::from_secs(3600);

/// A manager that recently refused us is skipped for this long.
const BAD_MANAGER_EXPIRY: Duration = Duration::from_secs(15);

/// How long the manager may be silent before we volunteer a keepalive.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

const EVENT_LOOP_SLICE: Duration = Duration::from_secs(5);

const LIBRARY_UPDATE_STARTED: u32 = 1;
const LIBRARY_UPDATE_FAILURE: u32 = 2;

/// Set by signal handlers; the serve loop drains to a clean disconnect when it fires.
pub struct AbortState {
    flag: AtomicBool,
    signal: AtomicI32,
    pub notify: Notify,
}

impl AbortState {
    pub fn new() -> AbortState {
        AbortState {
            flag: AtomicBool::new(false),
            signal: AtomicI32::new(0),
            notify: Notify::new(),
        }
    }

    pub fn set(&self, signal: i32) {
        self.flag.store(true, Ordering::SeqCst);
        self.signal.store(signal, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> i32 {
        self.signal.load(Ordering::SeqCst)
    }
}

/// Completions delivered into the serve loop from spawned waiters.
enum Reaped {
    Exit {
        task_id: i64,
        status: std::process::ExitStatus,
    },
    Function {
        task_id: i64,
        result: Result<(), String>,
    },
    LibraryReady {
        task_id: i64,
        result: Result<(), String>,
    },
}

/// Why a session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Released,
    Idle,
    Abort,
    ManagerLeft,
    PromiseBroken,
}

enum Dispatch {
    Handled,
    End(SessionEnd),
}

enum ReadyCheck {
    Yes,
    Wait,
    InputFailed(String),
}

pub struct Worker {
    options: Options,
    executor: Executor,
    workspace: Workspace,
    abort: Arc<AbortState>,
    resources: ResourceMonitor,
    last_sent_resources: Option<ResourceSnapshot>,
    gpus: GpuTable,
    features: BTreeSet<String>,
    worker_id: String,
    /// Absolute end of this worker's own life in usec; 0 when unbounded.
    end_time_usec: u64,

    procs: HashMap<i64, TaskProcess>,
    waiting: VecDeque<i64>,
    running: BTreeSet<i64>,
    complete: VecDeque<i64>,
    cores_allocated: i64,
    memory_allocated: i64,
    disk_allocated: i64,
    gpus_allocated: i64,

    results_msg_sent: bool,
    last_task_received: i64,
    released: bool,
    total_tasks_executed: u64,
    total_task_execution_usec: u64,
    last_limit_check: Option<Instant>,

    reap_tx: mpsc::UnboundedSender<Reaped>,
    reap_rx: mpsc::UnboundedReceiver<Reaped>,

    bad_managers: HashMap<(String, u16), std::time::Instant>,

    foreman: Option<Foreman>,
    foreman_results: VecDeque<ForemanResult>,
}

impl Worker {
    pub fn new(
        options: Options,
        executor: Executor,
        workspace: Workspace,
        abort: Arc<AbortState>,
    ) -> Worker {
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let start_time_usec = store::now_usec();
        let end_time_usec = options
            .manual
            .wall_time_secs
            .map(|secs| start_time_usec + secs * 1_000_000)
            .unwrap_or(0);
        let resources = ResourceMonitor::new(options.manual);
        Worker {
            options,
            executor,
            workspace,
            abort,
            resources,
            last_sent_resources: None,
            gpus: GpuTable::default(),
            features: BTreeSet::new(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            end_time_usec,
            procs: HashMap::new(),
            waiting: VecDeque::new(),
            running: BTreeSet::new(),
            complete: VecDeque::new(),
            cores_allocated: 0,
            memory_allocated: 0,
            disk_allocated: 0,
            gpus_allocated: 0,
            results_msg_sent: false,
            last_task_received: 0,
            released: false,
            total_tasks_executed: 0,
            total_task_execution_usec: 0,
            last_limit_check: None,
            reap_tx,
            reap_rx,
            bad_managers: HashMap::new(),
            foreman: None,
            foreman_results: VecDeque::new(),
        }
    }

    pub fn add_features(&mut self, features: &[String]) {
        self.features.extend(features.iter().cloned());
    }

    fn parent_died(&self) -> bool {
        match self.options.initial_ppid {
            Some(initial) => nix::unistd::getppid().as_raw() as u32 != initial,
            None => false,
        }
    }

    fn past_own_end_time(&self) -> bool {
        self.end_time_usec > 0 && store::now_usec() > self.end_time_usec
    }

    ///
    /// The outermost loop: keep finding and serving managers until aborted, out of time, or
    /// (in single-shot mode) done with the first one.
    ///
    pub async fn run(mut self) -> i32 {
        if self.options.foreman_port.is_some() {
            match Foreman::start(&self.options, &self.executor, &self.workspace).await {
                Ok(foreman) => self.foreman = Some(foreman),
                Err(e) => {
                    eprintln!("vine_worker: could not start foreman endpoint: {e}");
                    return 1;
                }
            }
        }

        let mut connect_stop = std::time::Instant::now()
            + Duration::from_secs(self.options.connect_timeout);
        let mut backoff = self.options.min_backoff;

        loop {
            if self.abort.is_set() {
                break;
            }
            if self.parent_died() {
                debug!("parent process exited, shutting down");
                break;
            }
            if self.past_own_end_time() {
                warn!(
                    "vine_worker: reached the wall time limit of {}s",
                    self.options.manual.wall_time_secs.unwrap_or(0)
                );
                break;
            }

            let served = match self.options.mode.clone() {
                Mode::Project(pattern) => {
                    let regex = match Regex::new(&pattern) {
                        Ok(regex) => regex,
                        Err(e) => {
                            eprintln!("vine_worker: bad project pattern {pattern:?}: {e}");
                            return 1;
                        }
                    };
                    self.serve_by_project(&regex).await
                }
                Mode::Direct(addresses) => self.serve_by_list(&addresses).await,
            };

            if served {
                backoff = self.options.min_backoff;
                connect_stop = std::time::Instant::now()
                    + Duration::from_secs(self.options.connect_timeout);
                if self.options.single_shot {
                    break;
                }
            } else {
                if std::time::Instant::now() > connect_stop {
                    info!(
                        "vine_worker: giving up after {}s without finding a manager",
                        self.options.connect_timeout
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = std::cmp::min(backoff * 2, self.options.max_backoff);
            }
        }

        if let Some(foreman) = self.foreman.take() {
            foreman.stop();
        }
        self.workspace.delete();
        0
    }

    async fn serve_by_list(&mut self, addresses: &[(String, u16)]) -> bool {
        for (host, port) in addresses {
            if self
                .serve_manager(host, *port, None, self.options.ssl)
                .await
            {
                return true;
            }
        }
        false
    }

    ///
    /// Query the catalog, shuffle matching managers to distribute load, and try candidates
    /// until one accepts us. Managers that recently refused us are skipped to avoid
    /// reconnection storms.
    ///
    async fn serve_by_project(&mut self, project_regex: &Regex) -> bool {
        let (catalog_host, catalog_port) = self.options.catalog.clone();
        let mut entries = match catalog::query_managers(&catalog_host, catalog_port).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("{e}");
                return false;
            }
        };
        entries.retain(|entry| entry.matches(project_regex));
        debug!("project pattern matches {} managers", entries.len());
        entries.shuffle(&mut rand::rng());

        self.bad_managers
            .retain(|_, refused| refused.elapsed() < BAD_MANAGER_EXPIRY);

        for entry in entries {
            // The CLI override wins over the manager's hint; the advertised interface list
            // is the fallback when the chosen address does not work out.
            let preference = self
                .options
                .connection_mode
                .clone()
                .or(entry.preferred_connection.clone());
            let mut candidates: Vec<String> = match preference.as_deref() {
                Some("by_hostname") => vec![entry.name.clone()],
                Some("by_apparent_ip") => vec![entry.address.clone()],
                _ => vec![entry.address.clone()],
            };
            for interface in &entry.network_interfaces {
                if !candidates.contains(interface) {
                    candidates.push(interface.clone());
                }
            }

            for host in candidates {
                let key = (host.clone(), entry.port);
                if self.bad_managers.contains_key(&key) {
                    continue;
                }
                let use_ssl = self.options.ssl || entry.ssl;
                if self
                    .serve_manager(&host, entry.port, Some(&entry.project), use_ssl)
                    .await
                {
                    return true;
                }
                self.bad_managers.insert(key, std::time::Instant::now());
            }
        }
        false
    }

    ///
    /// One complete session: connect, handshake, serve, disconnect, clean up. Returns true
    /// if we got as far as working for the manager.
    ///
    async fn serve_manager(
        &mut self,
        host: &str,
        port: u16,
        verify_project: Option<&str>,
        use_ssl: bool,
    ) -> bool {
        // Until we have been assigned work, the idle timeout bounds everything: if the
        // manager is unresponsive we should leave. Do not be tempted to use a short timeout
        // here; the early messages are asynchronous and a busy manager answers late.
        let idle_stop = Instant::now() + Duration::from_secs(self.options.idle_timeout);

        let stream = match wire::tcp_connect(host, port, idle_stop).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("couldn't connect to {host}:{port}: {e}");
                return false;
            }
        };

        let mut link = if use_ssl {
            let config = wire::tls::permissive_client_config();
            match wire::tls::wrap_connect(config, host, stream, idle_stop).await {
                Ok(tls) => Link::from_stream(tls),
                Err(e) => {
                    eprintln!("vine_worker: could not set up ssl to {host}:{port}: {e}");
                    return false;
                }
            }
        } else {
            Link::from_tcp(stream)
        };
        info!("connected to manager {host}:{port}");

        if let Some(password) = self.options.password.clone() {
            debug!("authenticating to manager");
            if let Err(e) = wire::auth::authenticate_connect(&mut link, &password, idle_stop).await
            {
                eprintln!("vine_worker: wrong password for manager {host}:{port}: {e}");
                return false;
            }
        }

        if let Some(expected) = verify_project {
            debug!("verifying manager's project name");
            if self.send(&mut link, "name").await.is_err() {
                return false;
            }
            match link.read_line(idle_stop).await {
                Ok(project) if project == expected => {}
                Ok(project) => {
                    eprintln!("vine_worker: manager has project {project} instead of {expected}");
                    return false;
                }
                Err(e) => {
                    debug!("no response from manager while verifying name: {e}");
                    return false;
                }
            }
        }

        let (store, trash) = match self
            .workspace
            .prepare(&self.executor, self.options.password.clone())
        {
            Ok(prepared) => prepared,
            Err(e) => {
                eprintln!("vine_worker: {e}");
                return false;
            }
        };
        store.set_mini_task_runner(Arc::new(SupervisorMiniTasks::new(
            self.workspace.root().to_owned(),
            store.clone(),
            trash.clone(),
            self.options.symlink_fallback,
        )));

        let transfer_server = match TransferServer::start(
            store.clone(),
            self.options.password.clone(),
            self.options.transfer_port,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                eprintln!("vine_worker: {e}");
                return false;
            }
        };

        self.resources.force_next();
        self.measure_resources(&store);
        self.gpus.resize(self.resources.local.gpus.total.max(0) as usize);

        let end = match self.report_ready(&mut link, &store, &transfer_server).await {
            Ok(()) => self.work_for_manager(&mut link, &store, &trash).await,
            Err(e) => {
                debug!("failed to greet manager: {e}");
                SessionEnd::ManagerLeft
            }
        };

        if self.abort.is_set() && self.abort.signal() != 0 {
            let signal = self.abort.signal();
            let _ = self.send(&mut link, &format!("info vacating {signal}")).await;
        }

        info!("disconnecting from manager {host}:{port}");
        debug!(
            "{} tasks executed so far, {} usec of execution",
            self.total_tasks_executed, self.total_task_execution_usec
        );
        self.kill_all_tasks(&trash);
        self.last_task_received = 0;
        self.results_msg_sent = false;
        self.last_sent_resources = None;
        self.foreman_results.clear();
        store.reset();
        transfer_server.stop();
        self.workspace.cleanup(&trash);

        if end == SessionEnd::Released {
            self.released = false;
        } else if !self.abort.is_set() {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        true
    }

    async fn send(&self, link: &mut Link, message: &str) -> Result<(), LinkError> {
        debug!("tx: {message}");
        link.write_line(message, Instant::now() + ACTIVE_TIMEOUT)
            .await
    }

    /// The initial "ready" exchange; the manager sends no tasks until it completes.
    async fn report_ready(
        &mut self,
        link: &mut Link,
        store: &Store,
        transfer_server: &TransferServer,
    ) -> Result<(), LinkError> {
        let hostname = hostname();
        let version = env!("CARGO_PKG_VERSION");
        self.send(
            link,
            &format!(
                "taskvine {} {hostname} {} {} {version}",
                protocol::PROTOCOL_VERSION,
                self.options.os_name,
                self.options.arch_name,
            ),
        )
        .await?;
        self.send(link, &format!("info worker-id {}", self.worker_id))
            .await?;

        for event in store.scan() {
            self.send_cache_event(link, event).await?;
        }

        for feature in self.features.clone() {
            self.send(link, &format!("feature {}", url_encode(&feature)))
                .await?;
        }

        self.send(
            link,
            &format!("transfer-address {hostname} {}", transfer_server.port()),
        )
        .await?;

        self.send(
            link,
            &format!(
                "info worker-end-time {}",
                self.end_time_usec.div_ceil(1_000_000)
            ),
        )
        .await?;

        if let Some(factory) = self.options.from_factory.clone() {
            self.send(link, &format!("info from-factory {factory}")).await?;
        }

        self.send_keepalive(link).await
    }

    ///
    /// The work-for-manager loop. Each pass handles at most one external event (manager
    /// command, child exit, cache completion, tick), then runs the housekeeping ladder:
    /// expirations, enforcement, scheduling, result announcements, idle accounting.
    ///
    async fn work_for_manager(
        &mut self,
        link: &mut Link,
        store: &Store,
        trash: &Trash,
    ) -> SessionEnd {
        // The receivers leave `self` for the duration of the session so the `select!` arms
        // hold no borrows of the worker while the event handlers mutate it.
        let mut reap_rx =
            std::mem::replace(&mut self.reap_rx, mpsc::unbounded_channel().1);
        let mut foreman_rx = self.foreman.as_mut().and_then(|f| f.take_results());

        let end = self
            .work_for_manager_inner(link, store, trash, &mut reap_rx, &mut foreman_rx)
            .await;

        self.reap_rx = reap_rx;
        if let (Some(foreman), Some(rx)) = (self.foreman.as_mut(), foreman_rx) {
            foreman.put_back_results(rx);
        }
        end
    }

    async fn work_for_manager_inner(
        &mut self,
        link: &mut Link,
        store: &Store,
        trash: &Trash,
        reap_rx: &mut mpsc::UnboundedReceiver<Reaped>,
        foreman_rx: &mut Option<mpsc::UnboundedReceiver<ForemanResult>>,
    ) -> SessionEnd {
        enum LoopEvent {
            Line(Result<String, LinkError>),
            Reaped(Reaped),
            ForemanResult(ForemanResult),
            Tick,
        }

        debug!("working for manager");
        let mut idle_stop = Instant::now() + Duration::from_secs(self.options.idle_timeout);
        let mut last_rx = Instant::now();
        let mut last_keepalive = Instant::now();
        let abort = self.abort.clone();
        let mut tick = tokio::time::interval(EVENT_LOOP_SLICE);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.abort.is_set() {
                return SessionEnd::Abort;
            }
            if self.parent_died() {
                debug!("parent process exited, shutting down");
                self.abort.set(0);
                return SessionEnd::Abort;
            }
            if Instant::now() > idle_stop {
                debug!(
                    "disconnecting because no task was received for {}s",
                    self.options.idle_timeout
                );
                let _ = self
                    .send(
                        link,
                        &format!("info idle-disconnecting {}", self.options.idle_timeout),
                    )
                    .await;
                return SessionEnd::Idle;
            }

            let event = tokio::select! {
                line = link.read_line(idle_stop) => LoopEvent::Line(line),
                Some(reaped) = reap_rx.recv() => LoopEvent::Reaped(reaped),
                Some(result) = async {
                    match foreman_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => LoopEvent::ForemanResult(result),
                _ = tick.tick() => LoopEvent::Tick,
                _ = abort.notify.notified() => LoopEvent::Tick,
            };

            match event {
                LoopEvent::Line(Ok(line)) => {
                    debug!("rx: {line}");
                    last_rx = Instant::now();
                    match self.handle_command(&line, link, store, trash).await {
                        Ok(Dispatch::Handled) => {}
                        Ok(Dispatch::End(end)) => return end,
                        Err(e) => {
                            debug!("failed to handle manager message: {e}");
                            return SessionEnd::ManagerLeft;
                        }
                    }
                }
                LoopEvent::Line(Err(LinkError::Timeout)) => {}
                LoopEvent::Line(Err(e)) => {
                    debug!("failed to read from manager: {e}");
                    return SessionEnd::ManagerLeft;
                }
                LoopEvent::Reaped(reaped) => {
                    if let Err(e) = self.handle_reaped(reaped, link, store).await {
                        debug!("failed to report to manager: {e}");
                        return SessionEnd::ManagerLeft;
                    }
                }
                LoopEvent::ForemanResult(result) => {
                    self.foreman_results.push_back(result);
                }
                LoopEvent::Tick => {}
            }

            if let Err(e) = self
                .housekeeping(link, store, reap_rx, &mut last_keepalive, last_rx)
                .await
            {
                debug!("failed to talk to manager: {e}");
                return SessionEnd::ManagerLeft;
            }
            if self.released {
                return SessionEnd::Released;
            }
            if let Some(end) = self.enforcement(link, trash).await {
                return end;
            }

            // Anything live resets the idle clock.
            if !self.procs.is_empty()
                || !self.waiting.is_empty()
                || !self.complete.is_empty()
                || !self.foreman_results.is_empty()
            {
                idle_stop = Instant::now() + Duration::from_secs(self.options.idle_timeout);
            }
        }
    }

    async fn housekeeping(
        &mut self,
        link: &mut Link,
        store: &Store,
        reap_rx: &mut mpsc::UnboundedReceiver<Reaped>,
        last_keepalive: &mut Instant,
        last_rx: Instant,
    ) -> Result<(), LinkError> {
        // Catch any completions that arrived while we were busy elsewhere.
        while let Ok(reaped) = reap_rx.try_recv() {
            self.handle_reaped(reaped, link, store).await?;
        }

        // Advance the cache by at most one completed materialization per pass.
        if let Some(event) = store.wait() {
            self.send_cache_event(link, event).await?;
        }

        if self.measure_resources(store) {
            let snapshot = self.resources.total;
            if self.last_sent_resources != Some(snapshot) {
                self.send_resource_update(link).await?;
            }
        }

        self.start_waiting_tasks(link, store).await?;

        if !self.results_msg_sent
            && (!self.complete.is_empty() || !self.foreman_results.is_empty())
        {
            self.send(link, "available_results").await?;
            self.results_msg_sent = true;
        }

        if last_rx.elapsed() > KEEPALIVE_INTERVAL && last_keepalive.elapsed() > KEEPALIVE_INTERVAL
        {
            self.send_keepalive(link).await?;
            *last_keepalive = Instant::now();
        }

        Ok(())
    }

    /// Per-task and per-worker limit enforcement; a `Some` return ends the session.
    async fn enforcement(&mut self, link: &mut Link, trash: &Trash) -> Option<SessionEnd> {
        self.expire_end_times();
        self.enforce_wall_times();
        self.enforce_process_limits(trash);

        if self.past_own_end_time() {
            let _ = self
                .send(
                    link,
                    &format!(
                        "info wall_time_exhausted {}",
                        self.options.manual.wall_time_secs.unwrap_or(0)
                    ),
                )
                .await;
            self.finish_running_tasks(TaskResult::Forsaken);
            self.abort.set(0);
            return Some(SessionEnd::Abort);
        }

        if let Some(limit) = self.resources.manual_disk() {
            if self.resources.local.disk.inuse > limit {
                eprintln!(
                    "vine_worker: used more than declared disk space ({} > {limit} MB)",
                    self.resources.local.disk.inuse
                );
                let _ = self
                    .send(
                        link,
                        &format!("info disk_exhausted {}", self.resources.local.disk.inuse),
                    )
                    .await;
                self.finish_running_tasks(TaskResult::Forsaken);
                return Some(SessionEnd::PromiseBroken);
            }
        }

        if let Some(limit) = self.resources.manual_memory() {
            if self.resources.local.memory.inuse > limit {
                eprintln!(
                    "vine_worker: used more than declared memory ({} > {limit} MB)",
                    self.resources.local.memory.inuse
                );
                let _ = self
                    .send(
                        link,
                        &format!(
                            "info memory_exhausted {}",
                            self.resources.local.memory.inuse
                        ),
                    )
                    .await;
                self.finish_running_tasks(TaskResult::Forsaken);
                return Some(SessionEnd::PromiseBroken);
            }
        }

        None
    }

    // ---- command dispatch ----

    async fn handle_command(
        &mut self,
        line: &str,
        link: &mut Link,
        store: &Store,
        trash: &Trash,
    ) -> Result<Dispatch, LinkError> {
        let command = match ManagerCommand::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("{e}");
                return Ok(Dispatch::End(SessionEnd::ManagerLeft));
            }
        };
        let stop = Instant::now() + ACTIVE_TIMEOUT;

        match command {
            ManagerCommand::Task { task_id } => {
                let mut task = protocol::read_task_block(link, task_id, stop).await?;
                task.resources.normalize(&self.resources.local.totals());
                self.last_task_received = task_id;
                if let Some(foreman) = &self.foreman {
                    let cache = store.cache_dir().display().to_string();
                    task.env
                        .push(("WORK_QUEUE_INPUT".to_owned(), Some(cache.clone())));
                    task.env.push(("WORK_QUEUE_OUTPUT".to_owned(), Some(cache)));
                    foreman.submit(task);
                } else {
                    let mut process =
                        TaskProcess::new(task, self.workspace.root(), /* mini= */ false);
                    process.compute_disk_budget(store);
                    self.procs.insert(task_id, process);
                    self.waiting.push_back(task_id);
                }
            }
            ManagerCommand::File { name, size, mode } => {
                if is_safe_relative(&name) {
                    wire::transfer::get_file_payload(
                        link,
                        &store.full_path(&name),
                        size,
                        mode,
                        stop,
                    )
                    .await?;
                    store.add_file(&name, size, mode, CacheLevel::Task);
                } else {
                    warn!("refusing to store unsafe name {name:?}");
                    discard_payload(link, size, stop).await?;
                }
            }
            ManagerCommand::Dir { name } => {
                if is_safe_relative(&name) {
                    let size =
                        wire::transfer::get_dir(link, &store.full_path(&name), stop).await?;
                    store.add_file(&name, size, 0o755, CacheLevel::Task);
                } else {
                    warn!("refusing to store unsafe name {name:?}");
                    return Ok(Dispatch::End(SessionEnd::ManagerLeft));
                }
            }
            ManagerCommand::PutUrl {
                source,
                name,
                size,
                mode,
                transfer_id,
            } => {
                if is_safe_relative(&name) {
                    store.queue_transfer(&name, &source, size, mode, Some(transfer_id));
                } else {
                    warn!("refusing to queue unsafe name {name:?}");
                }
            }
            ManagerCommand::MiniTask {
                mini_task_id,
                name,
                size,
                mode,
            } => {
                let mut task = protocol::read_task_block(link, mini_task_id, stop).await?;
                if !is_safe_relative(&name) {
                    warn!("refusing to queue unsafe name {name:?}");
                    return Ok(Dispatch::Handled);
                }
                // The single output of the producing task lands under the queued name.
                match task.output_mounts.first_mut() {
                    Some(mount) => mount.cached_name = name.clone(),
                    None => {
                        warn!("mini task for {name} declares no output");
                        return Ok(Dispatch::Handled);
                    }
                }
                task.resources.normalize(&self.resources.local.totals());
                store.queue_mini_task(&name, task, size, mode);
            }
            ManagerCommand::Unlink { name } => {
                if is_safe_relative(&name) {
                    store.remove(&name);
                } else {
                    warn!("{name:?} is not within the workspace; refusing to unlink");
                }
            }
            ManagerCommand::GetFile { name } => {
                self.put_cached(link, store, &name, wire::transfer::TransferMode::FileOnly)
                    .await?;
            }
            ManagerCommand::Get { name } => {
                self.put_cached(link, store, &name, wire::transfer::TransferMode::Any)
                    .await?;
            }
            ManagerCommand::Kill { task_id } => {
                if task_id < 0 {
                    self.kill_all_tasks(trash);
                    if let Some(foreman) = &self.foreman {
                        foreman.kill_all();
                        self.foreman_results.clear();
                    }
                } else if let Some(foreman) = &self.foreman {
                    foreman.kill(task_id);
                    self.foreman_results.retain(|r| r.task_id != task_id);
                } else {
                    self.kill_one_task(task_id, trash);
                }
            }
            ManagerCommand::Release => {
                debug!("released by manager");
                self.released = true;
            }
            ManagerCommand::Exit => {
                self.abort.set(0);
                return Ok(Dispatch::End(SessionEnd::Abort));
            }
            ManagerCommand::Check => {
                self.send_keepalive(link).await?;
            }
            ManagerCommand::SendResults { count } => {
                debug!("manager ready for {count} results");
                self.report_tasks_complete(link).await?;
            }
            ManagerCommand::AuthRequired => {
                eprintln!("vine_worker: this manager requires a password (use the -P option)");
                return Ok(Dispatch::End(SessionEnd::ManagerLeft));
            }
        }
        Ok(Dispatch::Handled)
    }

    async fn put_cached(
        &mut self,
        link: &mut Link,
        store: &Store,
        name: &str,
        mode: wire::transfer::TransferMode,
    ) -> Result<(), LinkError> {
        let stop = Instant::now() + ACTIVE_TIMEOUT;
        if !is_safe_relative(name) {
            // Refuse with an in-stream error item; the session continues.
            self.send(link, &format!("error {} 1", url_encode(name)))
                .await?;
            return Ok(());
        }
        let full = store.full_path(name);
        let basename = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_owned());
        wire::transfer::put_item(link, &full, &basename, mode, stop).await
    }

    // ---- scheduling ----

    fn resources_fit_now(&self, task: &Task) -> bool {
        // Disk is deliberately left out: tasks default to claiming the whole reported disk,
        // which makes overlapping claims on one node useless to check here.
        self.cores_allocated + task.resources.cores <= self.resources.local.cores.total
            && self.memory_allocated + task.resources.memory <= self.resources.local.memory.total
            && self.gpus_allocated + task.resources.gpus <= self.resources.local.gpus.total
    }

    fn resources_fit_eventually(&self, task: &Task) -> bool {
        let local = &self.resources.local;
        task.resources.cores <= local.cores.largest
            && task.resources.memory <= local.memory.largest
            && task.resources.disk <= local.disk.largest
            && task.resources.gpus <= local.gpus.largest
    }

    fn find_library_for(&self, library_name: &str) -> Option<(i64, Arc<LibraryState>)> {
        for task_id in &self.running {
            if let Some(process) = self.procs.get(task_id) {
                if let Some(library) = &process.library {
                    if library.name == library_name && library.has_capacity() {
                        return Some((*task_id, library.clone()));
                    }
                }
            }
        }
        None
    }

    fn ready_to_run_now(&mut self, task_id: i64, store: &Store) -> ReadyCheck {
        let process = match self.procs.get(&task_id) {
            Some(process) => process,
            None => return ReadyCheck::InputFailed("task vanished".to_owned()),
        };
        if !self.resources_fit_now(&process.task) {
            return ReadyCheck::Wait;
        }
        if let Some(library_name) = process.task.needs_library.clone() {
            if self.find_library_for(&library_name).is_none() {
                return ReadyCheck::Wait;
            }
        }
        match sandbox::inputs_status(process, store) {
            Stagein::Ready => ReadyCheck::Yes,
            Stagein::NeedsWait => ReadyCheck::Wait,
            Stagein::Failed(message) => ReadyCheck::InputFailed(message),
        }
    }

    async fn start_waiting_tasks(
        &mut self,
        link: &mut Link,
        store: &Store,
    ) -> Result<(), LinkError> {
        let mut task_events = 0;
        let rounds = self.waiting.len();
        for _ in 0..rounds {
            let task_id = match self.waiting.pop_front() {
                Some(task_id) => task_id,
                None => break,
            };
            match self.ready_to_run_now(task_id, store) {
                ReadyCheck::Yes => {
                    self.start_process(task_id, link, store).await?;
                    task_events += 1;
                }
                ReadyCheck::Wait => {
                    let eventually = self
                        .procs
                        .get(&task_id)
                        .map(|p| self.resources_fit_eventually(&p.task))
                        .unwrap_or(false);
                    if eventually {
                        self.waiting.push_back(task_id);
                    } else {
                        debug!("waiting task {task_id} has been forsaken");
                        self.finish_unstarted(task_id, TaskResult::Forsaken, 1);
                        self.send_keepalive(link).await?;
                        task_events += 1;
                    }
                }
                ReadyCheck::InputFailed(message) => {
                    debug!("task {task_id} cannot start: {message}");
                    self.finish_unstarted(task_id, TaskResult::InputMissing, 1);
                    task_events += 1;
                }
            }
        }
        if task_events > 0 {
            self.send_stats_update(link).await?;
        }
        Ok(())
    }

    /// Complete a task that never ran.
    fn finish_unstarted(&mut self, task_id: i64, result: TaskResult, exit_code: i32) {
        if let Some(process) = self.procs.get_mut(&task_id) {
            let now = store::now_usec();
            process.execution_start = now;
            process.execution_end = now;
            process.result = result;
            process.exit_code = exit_code;
            self.complete.push_back(task_id);
        }
    }

    ///
    /// Start one process whose inputs are READY and whose resources fit, accounting for the
    /// claim. Maintains parallel structure with the reap path.
    ///
    async fn start_process(
        &mut self,
        task_id: i64,
        link: &mut Link,
        store: &Store,
    ) -> Result<(), LinkError> {
        let serving_library = {
            let process = match self.procs.get(&task_id) {
                Some(process) => process,
                None => return Ok(()),
            };
            match process.task.needs_library.clone() {
                Some(name) => self.find_library_for(&name),
                None => None,
            }
        };

        let process = match self.procs.get_mut(&task_id) {
            Some(process) => process,
            None => return Ok(()),
        };

        if let Err(message) = sandbox::stagein(process, store, self.options.symlink_fallback) {
            debug!("task {task_id} failed stage-in: {message}");
            self.finish_unstarted(task_id, TaskResult::InputMissing, 1);
            return Ok(());
        }

        // Claim resources before the runner exists; the reap path returns exactly this.
        let resources = process.task.resources;
        self.cores_allocated += resources.cores;
        self.memory_allocated += resources.memory;
        self.disk_allocated += resources.disk;
        self.gpus_allocated += resources.gpus;
        let cuda_devices = if resources.gpus > 0 {
            self.gpus.allocate(resources.gpus as usize, task_id);
            Some(self.gpus.visible_devices(task_id))
        } else {
            None
        };

        let process = self.procs.get_mut(&task_id).unwrap();
        process.execution_start = store::now_usec();

        if let Some((library_id, library)) = serving_library {
            // A function task has no child process: the invocation runs in-worker against
            // the resident library.
            process.serving_library = Some(library_id);
            library.functions_running.fetch_add(1, Ordering::SeqCst);
            let reap_tx = self.reap_tx.clone();
            let function_name = process.task.command.clone();
            let sandbox = process.sandbox.clone();
            let output_file = process.stdout_file();
            let invocation = self.executor.native_spawn(async move {
                let result =
                    crate::library::run_function(library, function_name, sandbox, output_file)
                        .await;
                let _ = reap_tx.send(Reaped::Function { task_id, result });
            });
            process.runner = Some(Runner::Function { invocation });
            self.running.insert(task_id);
            return Ok(());
        }

        let provides_library = process.task.provides_library.clone();
        let stdout = match std::fs::File::create(process.stdout_file()) {
            Ok(stdout) => stdout,
            Err(e) => {
                debug!("could not open task stdout: {e}");
                self.release_allocation(task_id);
                self.finish_unstarted(task_id, TaskResult::InputMissing, 1);
                return Ok(());
            }
        };

        let mut command = task_command(process, cuda_devices);
        if provides_library.is_some() {
            // Library stdio is the function-call channel; stderr alone goes to the output
            // file for return to the manager.
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::from(stdout));
        } else {
            let stderr = stdout.try_clone().ok();
            command.stdout(Stdio::from(stdout));
            if let Some(stderr) = stderr {
                command.stderr(Stdio::from(stderr));
            }
        }

        let mut child = match ManagedChild::spawn(&mut command) {
            Ok(child) => child,
            Err(e) => {
                warn!("unable to start task {task_id}: {e}");
                self.release_allocation(task_id);
                self.finish_unstarted(task_id, TaskResult::InputMissing, 1);
                return Ok(());
            }
        };
        let pid = child.pid();
        debug!("started process {pid}: {}", process.task.command);

        if let Some(library_name) = provides_library {
            let stdin = child.take_stdin();
            let stdout_pipe = child.take_stdout();
            match (stdin, stdout_pipe) {
                (Some(stdin), Some(stdout_pipe)) => {
                    let max_functions = process.task.resources.cores.max(1) as usize;
                    let library = Arc::new(LibraryState::new(
                        library_name.clone(),
                        task_id,
                        max_functions,
                        stdin,
                        stdout_pipe,
                    ));
                    process.library = Some(library.clone());
                    let reap_tx = self.reap_tx.clone();
                    self.executor.native_spawn(async move {
                        let result = library.wait_for_startup().await;
                        let _ = reap_tx.send(Reaped::LibraryReady { task_id, result });
                    });

                    self.features.insert(library_name.clone());
                    self.send(link, &format!("feature {}", url_encode(&library_name)))
                        .await?;
                    self.send(
                        link,
                        &format!("info library-update {task_id} {LIBRARY_UPDATE_STARTED}"),
                    )
                    .await?;
                    self.send_resource_update(link).await?;
                }
                _ => warn!("library task {task_id} was spawned without pipes"),
            }
        }

        let process = self.procs.get_mut(&task_id).unwrap();
        process.runner = Some(Runner::Child {
            pid,
            spawned: Instant::now(),
        });
        self.running.insert(task_id);

        let reap_tx = self.reap_tx.clone();
        self.executor.native_spawn(async move {
            if let Ok(status) = child.wait().await {
                let _ = reap_tx.send(Reaped::Exit { task_id, status });
            }
        });

        Ok(())
    }

    fn release_allocation(&mut self, task_id: i64) {
        if let Some(process) = self.procs.get(&task_id) {
            let resources = process.task.resources;
            self.cores_allocated -= resources.cores;
            self.memory_allocated -= resources.memory;
            self.disk_allocated -= resources.disk;
            self.gpus_allocated -= resources.gpus;
        }
        self.gpus.free_for_task(task_id);
    }

    // ---- completion ----

    async fn handle_reaped(
        &mut self,
        reaped: Reaped,
        link: &mut Link,
        store: &Store,
    ) -> Result<(), LinkError> {
        match reaped {
            Reaped::Exit { task_id, status } => {
                if !self.running.remove(&task_id) {
                    // Already killed and removed; nothing to account.
                    return Ok(());
                }
                self.release_allocation(task_id);
                let process = match self.procs.get_mut(&task_id) {
                    Some(process) => process,
                    None => return Ok(()),
                };
                process.execution_end = store::now_usec();
                process.set_exit_status(status);
                process.runner = None;
                if let Some(library) = process.library.take() {
                    self.features.remove(&library.name);
                }

                let process = self.procs.get(&task_id).unwrap();
                let all_outputs = sandbox::stageout(process, store);
                let process = self.procs.get_mut(&task_id).unwrap();
                if !all_outputs && process.result == TaskResult::Success {
                    process.result = TaskResult::OutputMissing;
                    process.exit_code = 1;
                }

                self.total_tasks_executed += 1;
                self.total_task_execution_usec +=
                    process.execution_end.saturating_sub(process.execution_start);
                self.complete.push_back(task_id);
                self.send_stats_update(link).await?;
            }
            Reaped::Function { task_id, result } => {
                if !self.running.remove(&task_id) {
                    return Ok(());
                }
                self.release_allocation(task_id);
                let serving = self
                    .procs
                    .get_mut(&task_id)
                    .and_then(|process| {
                        process.execution_end = store::now_usec();
                        process.runner = None;
                        if let Err(message) = &result {
                            process.exit_code = 1;
                            let _ = std::fs::write(process.stdout_file(), message);
                        }
                        process.serving_library.take()
                    });
                if let Some(library_id) = serving {
                    if let Some(library) =
                        self.procs.get(&library_id).and_then(|p| p.library.clone())
                    {
                        library.functions_running.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                self.complete.push_back(task_id);
                self.send_stats_update(link).await?;
            }
            Reaped::LibraryReady { task_id, result } => match result {
                Ok(()) => {
                    debug!("library task {task_id} completed its handshake");
                }
                Err(message) => {
                    warn!("library task {task_id} failed to start: {message}");
                    if self.running.remove(&task_id) {
                        self.release_allocation(task_id);
                        if let Some(process) = self.procs.get_mut(&task_id) {
                            process.kill();
                            process.execution_end = store::now_usec();
                            process.result = TaskResult::Killed;
                            process.exit_code = 1;
                            let _ = std::fs::write(process.stdout_file(), &message);
                            if let Some(library) = process.library.take() {
                                self.features.remove(&library.name);
                            }
                        }
                        self.complete.push_back(task_id);
                    }
                    self.send(
                        link,
                        &format!("info library-update {task_id} {LIBRARY_UPDATE_FAILURE}"),
                    )
                    .await?;
                }
            },
        }
        Ok(())
    }

    /// Transmit one finished task: the result record, then the captured stdout bytes.
    async fn report_task_complete(
        &mut self,
        link: &mut Link,
        task_id: i64,
    ) -> Result<(), LinkError> {
        let (line, stdout_path, stdout_len) = {
            let process = match self.procs.get(&task_id) {
                Some(process) => process,
                None => return Ok(()),
            };
            let stdout_path = process.stdout_file();
            let stdout_len = std::fs::metadata(&stdout_path).map(|m| m.len()).unwrap_or(0);
            (
                format!(
                    "result {} {} {stdout_len} {} {} {task_id}",
                    process.result.code(),
                    process.exit_code,
                    process.execution_start,
                    process.execution_end,
                ),
                stdout_path,
                stdout_len,
            )
        };

        self.send(link, &line).await?;
        if stdout_len > 0 {
            let mut stdout = tokio::fs::File::open(&stdout_path).await?;
            link.stream_from_file(&mut stdout, stdout_len, Instant::now() + ACTIVE_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    ///
    /// Send every queued result followed by the batch terminator. Reported processes remain
    /// known until the manager acknowledges them with a kill.
    ///
    async fn report_tasks_complete(&mut self, link: &mut Link) -> Result<(), LinkError> {
        while let Some(task_id) = self.complete.pop_front() {
            self.report_task_complete(link, task_id).await?;
        }
        while let Some(result) = self.foreman_results.pop_front() {
            let line = format!(
                "result {} {} {} {} {} {}",
                result.result_code,
                result.exit_code,
                result.stdout.len(),
                result.execution_start,
                result.execution_end,
                result.task_id,
            );
            self.send(link, &line).await?;
            link.write_all(&result.stdout, Instant::now() + ACTIVE_TIMEOUT)
                .await?;
        }
        self.send(link, "end").await?;
        self.results_msg_sent = false;
        self.send_stats_update(link).await
    }

    // ---- kills and enforcement ----

    fn kill_one_task(&mut self, task_id: i64, trash: &Trash) {
        let mut process = match self.procs.remove(&task_id) {
            Some(process) => process,
            None => {
                debug!("manager requested kill of unknown task {task_id}");
                return;
            }
        };
        if self.running.remove(&task_id) {
            process.kill();
            self.release_allocation(task_id);
            if let Some(library) = process.library.take() {
                self.features.remove(&library.name);
            }
            if let Some(library_id) = process.serving_library.take() {
                if let Some(library) = self.procs.get(&library_id).and_then(|p| p.library.clone())
                {
                    library.functions_running.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        self.waiting.retain(|id| *id != task_id);
        self.complete.retain(|id| *id != task_id);
        trash.trash(&process.sandbox);
    }

    ///
    /// Remove every known task. Afterwards all accounting must be back to zero; anything
    /// else is a bookkeeping bug.
    ///
    pub fn kill_all_tasks(&mut self, trash: &Trash) {
        let task_ids: Vec<i64> = self.procs.keys().copied().collect();
        for task_id in task_ids {
            self.kill_one_task(task_id, trash);
        }

        debug_assert!(self.procs.is_empty());
        debug_assert!(self.waiting.is_empty());
        debug_assert!(self.complete.is_empty());
        debug_assert!(self.running.is_empty());
        debug_assert_eq!(self.cores_allocated, 0);
        debug_assert_eq!(self.memory_allocated, 0);
        debug_assert_eq!(self.disk_allocated, 0);
        debug_assert_eq!(self.gpus_allocated, 0);
        debug_assert!(self.gpus.all_free());
        debug!("all data structures are clean");
    }

    fn finish_running_task(&mut self, task_id: i64, result: TaskResult) {
        let was_function = self
            .procs
            .get(&task_id)
            .map(|p| matches!(p.runner, Some(Runner::Function { .. })))
            .unwrap_or(false);
        if let Some(process) = self.procs.get_mut(&task_id) {
            process.result = result;
            process.kill();
        }
        if was_function {
            // An aborted invocation never reports its own exit; synthesize one.
            let _ = self.reap_tx.send(Reaped::Function {
                task_id,
                result: Err("invocation killed".to_owned()),
            });
        }
    }

    fn finish_running_tasks(&mut self, result: TaskResult) {
        let running: Vec<i64> = self.running.iter().copied().collect();
        for task_id in running {
            self.finish_running_task(task_id, result);
        }
    }

    /// Kill anything past its declared absolute end time; the exit is observed later.
    fn expire_end_times(&mut self) {
        let now = store::now_usec();
        let expired: Vec<i64> = self
            .running
            .iter()
            .filter(|id| {
                self.procs
                    .get(*id)
                    .map(|p| p.task.resources.end > 0 && now > p.task.resources.end)
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        for task_id in expired {
            debug!("task {task_id} ran past its end time");
            self.finish_running_task(task_id, TaskResult::MaxEndTime);
        }
    }

    /// Wall-time is enforced per task on its own; other running tasks are unaffected.
    fn enforce_wall_times(&mut self) {
        let now = store::now_usec();
        let over: Vec<i64> = self
            .running
            .iter()
            .filter(|id| {
                self.procs
                    .get(*id)
                    .map(|p| {
                        p.task.resources.wall_time > 0
                            && now > p.execution_start + p.task.resources.wall_time * 1_000_000
                    })
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        for task_id in over {
            debug!("task {task_id} went over its running time limit");
            self.finish_running_task(task_id, TaskResult::MaxWallTime);
        }
    }

    /// Sandbox disk enforcement, at most once per check interval since measuring is costly.
    fn enforce_process_limits(&mut self, trash: &Trash) {
        if let Some(last) = self.last_limit_check {
            if last.elapsed() < crate::resources::CHECK_RESOURCES_INTERVAL {
                return;
            }
        }
        self.last_limit_check = Some(Instant::now());

        let running: Vec<i64> = self.running.iter().copied().collect();
        for task_id in running {
            let over = {
                let process = match self.procs.get_mut(&task_id) {
                    Some(process) => process,
                    None => continue,
                };
                if process.disk_budget_mb < 0 {
                    continue;
                }
                process.measure_sandbox();
                process.sandbox_size_mb > process.task.resources.disk
            };
            if over {
                debug!("task {task_id} went over its disk size limit");
                self.finish_running_task(task_id, TaskResult::ResourceExhaustion);
                if let Some(process) = self.procs.get(&task_id) {
                    trash.trash(&process.sandbox);
                }
            }
        }
    }

    // ---- messages to the manager ----

    fn measure_resources(&mut self, store: &Store) -> bool {
        let sandbox_mb: i64 = self
            .procs
            .values()
            .filter(|p| p.is_running())
            .map(|p| p.sandbox_size_mb.max(0))
            .sum();
        self.resources.measure(
            self.workspace.root(),
            store.cache_dir(),
            sandbox_mb,
            self.last_task_received,
        )
    }

    async fn send_resource_update(&mut self, link: &mut Link) -> Result<(), LinkError> {
        let mut snapshot = self.resources.total;
        if let Some(foreman) = &self.foreman {
            let downstream = foreman.aggregate_totals();
            snapshot.cores.total += downstream.cores;
            snapshot.memory.total += downstream.memory;
            snapshot.disk.total += downstream.disk;
            snapshot.gpus.total += downstream.gpus;
        }
        snapshot.cores.inuse = self.cores_allocated;
        snapshot.memory.inuse = self.memory_allocated;
        snapshot.gpus.inuse = self.gpus_allocated;
        for line in snapshot.update_lines() {
            self.send(link, &line).await?;
        }
        self.send(link, "info end_of_resource_update 0").await?;
        self.last_sent_resources = Some(self.resources.total);
        Ok(())
    }

    async fn send_stats_update(&mut self, link: &mut Link) -> Result<(), LinkError> {
        let running = self.running.len()
            + self
                .foreman
                .as_ref()
                .map(|f| f.tasks_outstanding())
                .unwrap_or(0);
        self.send(link, &format!("info tasks_running {running}")).await
    }

    /// Keepalive: `alive`, a resource update, and the stats line. Without these the manager
    /// assumes the worker has crashed and gone away.
    async fn send_keepalive(&mut self, link: &mut Link) -> Result<(), LinkError> {
        self.send(link, "alive").await?;
        self.send_resource_update(link).await?;
        self.send_stats_update(link).await
    }

    async fn send_cache_event(
        &mut self,
        link: &mut Link,
        event: StoreEvent,
    ) -> Result<(), LinkError> {
        match event {
            StoreEvent::Update {
                name,
                size,
                transfer_time_usec,
                start_usec,
                transfer_id,
            } => {
                let transfer_id = transfer_id.unwrap_or_else(|| "X".to_owned());
                self.send(
                    link,
                    &format!(
                        "cache-update {} {size} {transfer_time_usec} {start_usec} {transfer_id}",
                        url_encode(&name)
                    ),
                )
                .await
            }
            StoreEvent::Invalid {
                name,
                message,
                transfer_id,
            } => {
                let header = match transfer_id {
                    Some(transfer_id) => format!(
                        "cache-invalid {} {} {transfer_id}",
                        url_encode(&name),
                        message.len()
                    ),
                    None => format!("cache-invalid {} {}", url_encode(&name), message.len()),
                };
                self.send(link, &header).await?;
                link.write_all(message.as_bytes(), Instant::now() + ACTIVE_TIMEOUT)
                    .await
            }
        }
    }
}

/// The local hostname, for troubleshooting announcements; naming problems are not fatal.
pub(crate) fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => "unknown".to_owned(),
    }
}

/// Drain and discard a payload that followed a refused command, keeping the stream in sync.
async fn discard_payload(link: &mut Link, size: u64, stop: Instant) -> Result<(), LinkError> {
    let mut remaining = size;
    let mut chunk = vec![0_u8; 65536];
    while remaining > 0 {
        let want = std::cmp::min(remaining, chunk.len() as u64) as usize;
        link.read_exact(&mut chunk[..want], stop).await?;
        remaining -= want as u64;
    }
    Ok(())
}

#[cfg(test)]
#[path = "serve_tests.rs"]
mod serve_tests;
