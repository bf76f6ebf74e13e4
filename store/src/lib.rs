// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod disk;
mod meta;
#[cfg(test)]
mod tests;
mod trash;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use protocol::{MountFlags, Task};
use task_executor::Executor;
use tokio::sync::mpsc;
use tokio::time::Instant;
use wire::transfer::{get_item, Received};
use wire::{tcp_connect, url_encode, Link};

pub use crate::meta::Meta;
pub use crate::trash::Trash;

pub const TRANSFER_SUFFIX: &str = ".transfer";
pub const META_SUFFIX: &str = ".meta";

const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);

/// How long a cache entry outlives the task that required it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLevel {
    Task,
    Workflow,
    Worker,
    Forever,
}

impl CacheLevel {
    pub fn from_wire(value: u32) -> CacheLevel {
        match value {
            1 => CacheLevel::Workflow,
            2 => CacheLevel::Worker,
            3 => CacheLevel::Forever,
            _ => CacheLevel::Task,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            CacheLevel::Task => 0,
            CacheLevel::Workflow => 1,
            CacheLevel::Worker => 2,
            CacheLevel::Forever => 3,
        }
    }
}

/// Where an entry's bytes come from.
#[derive(Clone, Debug)]
pub enum EntrySource {
    /// Streamed down the manager link; already in its final place.
    Manager,
    /// Fetched from an `http(s)://` or `worker://` URL.
    Url(String),
    /// Produced by running the given task, whose single output is this entry.
    MiniTask(Box<Task>),
}

impl EntrySource {
    fn kind(&self) -> u32 {
        match self {
            EntrySource::Manager => 0,
            EntrySource::Url(_) => 1,
            EntrySource::MiniTask(_) => 2,
        }
    }

    fn describe(&self) -> String {
        match self {
            EntrySource::Manager => "manager".to_owned(),
            EntrySource::Url(url) => url.clone(),
            EntrySource::MiniTask(task) => format!("mini task {}", task.task_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// What `ensure` tells the scheduler about an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureStatus {
    Ready,
    /// A materialization is running; ask again later.
    Processing,
    Failed,
    /// Never registered, or failed and since removed.
    Unknown,
}

struct Entry {
    source: EntrySource,
    status: EntryStatus,
    /// Size as declared by the manager; replaced by the measured size once materialized.
    size: u64,
    mode: u32,
    level: CacheLevel,
    transfer_time_usec: u64,
    transfer_id: Option<String>,
}

///
/// Asynchronous completions, drained by the serve loop and relayed to the manager as
/// `cache-update` / `cache-invalid` messages. Events for a given name are emitted in order
/// and only after the underlying operation is decided.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Update {
        name: String,
        size: u64,
        transfer_time_usec: u64,
        start_usec: u64,
        transfer_id: Option<String>,
    },
    Invalid {
        name: String,
        message: String,
        transfer_id: Option<String>,
    },
}

///
/// Runs a mini-task to completion such that its declared output lands at `dest`. Implemented
/// by the worker's supervisor; the store owns queueing and commit, not execution.
///
#[async_trait]
pub trait MiniTaskRunner: Send + Sync {
    async fn run(&self, task: Task, dest: &Path) -> Result<(), String>;
}

struct Inner {
    cache_dir: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
    events_tx: mpsc::UnboundedSender<StoreEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<StoreEvent>>,
    trash: Trash,
    executor: Executor,
    password: Option<String>,
    mini_task_runner: Mutex<Option<Arc<dyn MiniTaskRunner>>>,
}

///
/// The content-addressed local store. Entries are identified by manager-chosen names; a READY
/// entry is immutable and lives at `$cache/$name` with a `$name.meta` sidecar beside it.
///
/// All materialization writes go to `$cache/$name.transfer` and commit with a single rename,
/// so a crash can leave stray `.transfer` files but never a half-written entry.
///
#[derive(Clone)]
pub struct Store(Arc<Inner>);

impl Store {
    pub fn new(
        cache_dir: PathBuf,
        trash: Trash,
        executor: Executor,
        password: Option<String>,
    ) -> Result<Store, String> {
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| format!("failed to create cache dir {}: {e}", cache_dir.display()))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Store(Arc::new(Inner {
            cache_dir,
            entries: Mutex::default(),
            events_tx,
            events_rx: Mutex::new(events_rx),
            trash,
            executor,
            password,
            mini_task_runner: Mutex::new(None),
        })))
    }

    /// Install the supervisor hook that executes mini-tasks. Must be called before any
    /// `mini_task` command is accepted.
    pub fn set_mini_task_runner(&self, runner: Arc<dyn MiniTaskRunner>) {
        *self.0.mini_task_runner.lock() = Some(runner);
    }

    pub fn cache_dir(&self) -> &Path {
        &self.0.cache_dir
    }

    /// The path an entry materializes at. The caller is responsible for having validated the
    /// name against traversal when it arrived off the wire.
    pub fn full_path(&self, name: &str) -> PathBuf {
        self.0.cache_dir.join(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.entries.lock().contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<EntryStatus> {
        self.0.entries.lock().get(name).map(|e| e.status)
    }

    /// Register a name whose bytes are already at their final path, marking it READY.
    pub fn add_file(&self, name: &str, size: u64, mode: u32, level: CacheLevel) {
        let entry = Entry {
            source: EntrySource::Manager,
            status: EntryStatus::Ready,
            size,
            mode,
            level,
            transfer_time_usec: 0,
            transfer_id: None,
        };
        self.write_sidecar(name, &entry);
        self.0.entries.lock().insert(name.to_owned(), entry);
    }

    /// Emit a `cache-update` event for an already-READY entry (used when task outputs are
    /// harvested into the cache).
    pub fn announce(&self, name: &str) {
        let entries = self.0.entries.lock();
        if let Some(entry) = entries.get(name) {
            if entry.status == EntryStatus::Ready {
                let _ = self.0.events_tx.send(StoreEvent::Update {
                    name: name.to_owned(),
                    size: entry.size,
                    transfer_time_usec: entry.transfer_time_usec,
                    start_usec: now_usec(),
                    transfer_id: entry.transfer_id.clone(),
                });
            }
        }
    }

    /// Register a PENDING entry to be fetched from a URL.
    pub fn queue_transfer(
        &self,
        name: &str,
        source: &str,
        size: u64,
        mode: u32,
        transfer_id: Option<String>,
    ) {
        self.0.entries.lock().insert(
            name.to_owned(),
            Entry {
                source: EntrySource::Url(source.to_owned()),
                status: EntryStatus::Pending,
                size,
                mode,
                level: CacheLevel::Task,
                transfer_time_usec: 0,
                transfer_id,
            },
        );
    }

    /// Register a PENDING entry to be produced by a mini-task.
    pub fn queue_mini_task(&self, name: &str, task: Task, size: u64, mode: u32) {
        self.0.entries.lock().insert(
            name.to_owned(),
            Entry {
                source: EntrySource::MiniTask(Box::new(task)),
                status: EntryStatus::Pending,
                size,
                mode,
                level: CacheLevel::Task,
                transfer_time_usec: 0,
                transfer_id: None,
            },
        );
    }

    ///
    /// Drive an entry toward READY. A PENDING entry flips to PROCESSING under the table lock
    /// before its materializer is spawned, so concurrent calls can never start a second
    /// producer for the same name.
    ///
    pub fn ensure(&self, name: &str, flags: MountFlags) -> EnsureStatus {
        let job = {
            let mut entries = self.0.entries.lock();
            let entry = match entries.get_mut(name) {
                Some(entry) => entry,
                None => return EnsureStatus::Unknown,
            };
            match entry.status {
                EntryStatus::Ready => return EnsureStatus::Ready,
                EntryStatus::Processing => return EnsureStatus::Processing,
                EntryStatus::Failed => return EnsureStatus::Failed,
                EntryStatus::Pending => {
                    entry.status = EntryStatus::Processing;
                    MaterializeJob {
                        name: name.to_owned(),
                        source: entry.source.clone(),
                        mode: entry.mode,
                        level: entry.level,
                        flags,
                        transfer_id: entry.transfer_id.clone(),
                    }
                }
            }
        };

        let store = self.clone();
        self.0
            .executor
            .native_spawn(async move { store.run_materialization(job).await });
        EnsureStatus::Processing
    }

    /// Non-blocking reap of at most one finished materialization.
    pub fn wait(&self) -> Option<StoreEvent> {
        self.0.events_rx.lock().try_recv().ok()
    }

    /// Move the entry's data and sidecar to the trash and forget it.
    pub fn remove(&self, name: &str) {
        self.0.entries.lock().remove(name);
        let path = self.full_path(name);
        self.0.trash.trash(&path);
        self.0.trash.trash(&sidecar_path(&path));
        self.0
            .trash
            .trash(&PathBuf::from(format!("{}{TRANSFER_SUFFIX}", path.display())));
    }

    ///
    /// Walk the cache directory on startup: re-register entries whose sidecars parse, trash
    /// interrupted `.transfer` remnants, and return the announcements for everything READY.
    ///
    pub fn scan(&self) -> Vec<StoreEvent> {
        let mut announcements = Vec::new();
        let listing = match std::fs::read_dir(&self.0.cache_dir) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("could not scan cache dir: {e}");
                return announcements;
            }
        };

        for dir_entry in listing.flatten() {
            let path = dir_entry.path();
            let file_name = dir_entry.file_name().to_string_lossy().into_owned();

            if file_name.ends_with(TRANSFER_SUFFIX) || file_name.starts_with(".peer.") {
                debug!("trashing interrupted transfer {file_name}");
                self.0.trash.trash(&path);
            } else if let Some(name) = file_name.strip_suffix(META_SUFFIX) {
                let data_path = self.full_path(name);
                if !data_path.exists() {
                    self.0.trash.trash(&path);
                    continue;
                }
                let meta = match Meta::load(&path) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!("{e}");
                        self.0.trash.trash(&path);
                        continue;
                    }
                };
                self.0.entries.lock().insert(
                    name.to_owned(),
                    Entry {
                        source: meta
                            .source
                            .clone()
                            .map(EntrySource::Url)
                            .unwrap_or(EntrySource::Manager),
                        status: EntryStatus::Ready,
                        size: meta.size,
                        mode: meta.mode,
                        level: meta.cache_level,
                        transfer_time_usec: meta.transfer_time,
                        transfer_id: None,
                    },
                );
                announcements.push(StoreEvent::Update {
                    name: name.to_owned(),
                    size: meta.size,
                    transfer_time_usec: meta.transfer_time,
                    start_usec: now_usec(),
                    transfer_id: None,
                });
            }
        }

        announcements
    }

    /// Forget the in-memory table, leaving on-disk entries and their sidecars in place. On
    /// the next connect, `scan` re-registers and re-announces them. Pending events from the
    /// old session are dropped with the table, and the runner hook is released (it holds a
    /// handle back to this store, which would otherwise keep the pair alive forever).
    pub fn reset(&self) {
        self.0.entries.lock().clear();
        *self.0.mini_task_runner.lock() = None;
        while self.0.events_rx.lock().try_recv().is_ok() {}
    }

    fn write_sidecar(&self, name: &str, entry: &Entry) {
        let data_path = self.full_path(name);
        let mtime = std::fs::metadata(&data_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let meta = Meta {
            entry_type: entry.source.kind(),
            cache_level: entry.level,
            mode: entry.mode,
            size: entry.size,
            mtime,
            transfer_time: entry.transfer_time_usec,
            source: match &entry.source {
                EntrySource::Url(url) => Some(url.clone()),
                _ => None,
            },
        };
        if let Err(e) = meta.save(&sidecar_path(&data_path)) {
            warn!("{e}");
        }
    }

    async fn run_materialization(self, job: MaterializeJob) {
        let start_usec = now_usec();
        let final_path = self.full_path(&job.name);
        let transfer_path = PathBuf::from(format!("{}{TRANSFER_SUFFIX}", final_path.display()));

        let produced = self.produce(&job, &final_path, &transfer_path).await;
        let transfer_time_usec = now_usec().saturating_sub(start_usec);

        let outcome = match produced {
            Ok(()) => {
                // The producing command may claim success; trust only the filesystem.
                if final_path.exists() || final_path.symlink_metadata().is_ok() {
                    let _ = std::fs::set_permissions(
                        &final_path,
                        std::os::unix::fs::PermissionsExt::from_mode(job.mode & 0o7777),
                    );
                    let (bytes, _files) = disk::measure(&final_path);
                    Ok(bytes)
                } else {
                    Err("produced nothing at the cache path".to_owned())
                }
            }
            Err(message) => Err(message),
        };

        match outcome {
            Ok(actual_size) => {
                debug!(
                    "cache: created {} with size {actual_size} in {transfer_time_usec} usec",
                    job.name
                );
                {
                    let mut entries = self.0.entries.lock();
                    if let Some(entry) = entries.get_mut(&job.name) {
                        entry.status = EntryStatus::Ready;
                        entry.size = actual_size;
                        entry.transfer_time_usec = transfer_time_usec;
                    }
                }
                self.write_sidecar(
                    &job.name,
                    &Entry {
                        source: job.source.clone(),
                        status: EntryStatus::Ready,
                        size: actual_size,
                        mode: job.mode,
                        level: job.level,
                        transfer_time_usec,
                        transfer_id: None,
                    },
                );
                let _ = self.0.events_tx.send(StoreEvent::Update {
                    name: job.name,
                    size: actual_size,
                    transfer_time_usec,
                    start_usec,
                    transfer_id: job.transfer_id,
                });
            }
            Err(message) => {
                debug!("cache: unable to create {}: {message}", job.name);
                self.0.trash.trash(&transfer_path);
                if let Some(entry) = self.0.entries.lock().get_mut(&job.name) {
                    entry.status = EntryStatus::Failed;
                }
                let _ = self.0.events_tx.send(StoreEvent::Invalid {
                    name: job.name,
                    message,
                    transfer_id: job.transfer_id,
                });
            }
        }
    }

    async fn produce(
        &self,
        job: &MaterializeJob,
        final_path: &Path,
        transfer_path: &Path,
    ) -> Result<(), String> {
        match &job.source {
            EntrySource::Manager => Ok(()),
            EntrySource::Url(url) if url.starts_with("worker://") => {
                self.peer_fetch(url, transfer_path).await?;
                unpack_or_rename(url, transfer_path, final_path, job.flags).await
            }
            EntrySource::Url(url) => {
                curl_fetch(url, transfer_path).await?;
                unpack_or_rename(url, transfer_path, final_path, job.flags).await
            }
            EntrySource::MiniTask(task) => {
                let runner = self
                    .0
                    .mini_task_runner
                    .lock()
                    .clone()
                    .ok_or_else(|| "no mini task runner installed".to_owned())?;
                runner.run((**task).clone(), transfer_path).await?;
                unpack_or_rename(&job.source.describe(), transfer_path, final_path, job.flags)
                    .await
            }
        }
    }

    /// Pull a cached object from another worker's transfer server.
    async fn peer_fetch(&self, url: &str, transfer_path: &Path) -> Result<(), String> {
        let (host, port, path) = parse_worker_url(url)?;
        let stop = Instant::now() + PEER_CONNECT_TIMEOUT;
        let stream = tcp_connect(&host, port, stop)
            .await
            .map_err(|e| format!("could not reach worker at {host}:{port}: {e}"))?;
        let mut link = Link::from_tcp(stream);

        if let Some(password) = &self.0.password {
            wire::auth::authenticate_connect(&mut link, password, stop)
                .await
                .map_err(|e| format!("peer authentication failed: {e}"))?;
        }

        let stop = Instant::now() + TRANSFER_TIMEOUT;
        link.write_line(&format!("get {}", url_encode(&path)), stop)
            .await
            .map_err(|e| format!("peer request failed: {e}"))?;

        // The item arrives under its sender-chosen basename; receive it into a private
        // staging dir and rename into the transfer path.
        use rand::Rng;
        let staging = self
            .0
            .cache_dir
            .join(format!(".peer.{:016x}", rand::rng().random::<u64>()));
        tokio::fs::create_dir(&staging)
            .await
            .map_err(|e| format!("could not create staging dir: {e}"))?;

        let received = get_item(&mut link, &staging, stop).await;
        let result = match received {
            Ok(Received::Item { name, .. }) => {
                tokio::fs::rename(staging.join(&name), transfer_path)
                    .await
                    .map_err(|e| format!("could not move received {name}: {e}"))
            }
            Ok(other) => Err(format!("peer sent no data for {path}: {other:?}")),
            Err(e) => Err(format!("could not transfer {path} from {host}:{port}: {e}")),
        };

        self.0.trash.trash(&staging);
        result
    }
}

struct MaterializeJob {
    name: String,
    source: EntrySource,
    mode: u32,
    level: CacheLevel,
    flags: MountFlags,
    transfer_id: Option<String>,
}

fn sidecar_path(data_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{META_SUFFIX}", data_path.display()))
}

pub fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn parse_worker_url(url: &str) -> Result<(String, u16, String), String> {
    let rest = url
        .strip_prefix("worker://")
        .ok_or_else(|| format!("not a worker url: {url}"))?;
    let (addr, path) = rest
        .split_once('/')
        .ok_or_else(|| format!("worker url has no path: {url}"))?;
    let (host, port) = addr
        .split_once(':')
        .ok_or_else(|| format!("worker url has no port: {url}"))?;
    let port = port
        .parse()
        .map_err(|_| format!("worker url has a bad port: {url}"))?;
    Ok((host.to_owned(), port, path.to_owned()))
}

/// Fetch a URL with curl. `-sS` keeps the progress bar out but errors in; stderr is folded
/// into stdout so a failure carries a human-readable message.
async fn curl_fetch(url: &str, transfer_path: &Path) -> Result<(), String> {
    let output = tokio::time::timeout(
        TRANSFER_TIMEOUT,
        tokio::process::Command::new("curl")
            .arg("-sSL")
            .arg("--stderr")
            .arg("-")
            .arg("-o")
            .arg(transfer_path)
            .arg(url)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| format!("transfer of {url} timed out"))?
    .map_err(|e| format!("could not execute curl: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

async fn run_command_capture(mut command: tokio::process::Command) -> Result<(), String> {
    let output = command
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("could not execute unpack command: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_owned())
    }
}

///
/// For a file that arrived at `transfer_path`, either unpack it into `final_path` or just
/// rename it into place, depending on the mount flags. The archive kind is chosen by the
/// source's suffix.
///
async fn unpack_or_rename(
    source: &str,
    transfer_path: &Path,
    final_path: &Path,
    flags: MountFlags,
) -> Result<(), String> {
    if flags.unpack() {
        if source.ends_with(".tar") || source.ends_with(".tar.gz") || source.ends_with(".tgz") {
            tokio::fs::create_dir(final_path)
                .await
                .map_err(|e| format!("could not create {}: {e}", final_path.display()))?;
            let mut command = tokio::process::Command::new("tar");
            if source.ends_with(".tar") {
                command.arg("xf");
            } else {
                command.arg("xzf");
            }
            command.arg(transfer_path).arg("-C").arg(final_path);
            run_command_capture(command).await?;
            tokio::fs::remove_file(transfer_path).await.ok();
            Ok(())
        } else if source.ends_with(".gz") {
            let out = std::fs::File::create(final_path)
                .map_err(|e| format!("could not create {}: {e}", final_path.display()))?;
            let mut command = tokio::process::Command::new("gunzip");
            command.arg("-c").arg(transfer_path).stdout(Stdio::from(out));
            run_command_capture(command).await?;
            tokio::fs::remove_file(transfer_path).await.ok();
            Ok(())
        } else if source.ends_with(".zip") {
            tokio::fs::create_dir(final_path)
                .await
                .map_err(|e| format!("could not create {}: {e}", final_path.display()))?;
            let mut command = tokio::process::Command::new("unzip");
            command.arg("-q").arg(transfer_path).arg("-d").arg(final_path);
            run_command_capture(command).await?;
            tokio::fs::remove_file(transfer_path).await.ok();
            Ok(())
        } else {
            Err(format!("do not know how to unpack {source}"))
        }
    } else if flags.poncho_unpack() {
        let mut command = tokio::process::Command::new("poncho_package_run");
        command
            .arg("-u")
            .arg(final_path)
            .arg("-e")
            .arg(transfer_path);
        run_command_capture(command).await
    } else {
        tokio::fs::rename(transfer_path, final_path)
            .await
            .map_err(|e| format!("could not commit {}: {e}", final_path.display()))
    }
}
