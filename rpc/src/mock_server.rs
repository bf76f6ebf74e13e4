// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A small in-process server speaking the remote filesystem protocol against a temp
//! directory, with failure-injection knobs for exercising the retry discipline.

use std::collections::HashMap;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::time::Instant;
use wire::{url_decode, Link};

use crate::file::{O_CREAT, O_TRUNC, O_WRONLY};

pub struct MockServer {
    pub host: String,
    pub root: tempfile::TempDir,
    /// Every request line handled, in order.
    pub ops: Arc<Mutex<Vec<String>>>,
    /// Connections to drop at accept time, before any request is served.
    pub drop_connections: Arc<AtomicUsize>,
    /// Requests to answer by severing the connection instead of replying.
    pub drop_before_reply: Arc<AtomicUsize>,
    /// `stat` calls to answer with EAGAIN.
    pub eagain_stats: Arc<AtomicUsize>,
    /// Job-control calls to answer with EAGAIN.
    pub eagain_jobs: Arc<AtomicUsize>,
}

pub async fn start() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let root = tempfile::tempdir().unwrap();
    let server = MockServer {
        host,
        ops: Arc::default(),
        drop_connections: Arc::default(),
        drop_before_reply: Arc::default(),
        eagain_stats: Arc::default(),
        eagain_jobs: Arc::default(),
        root,
    };

    let root_path = server.root.path().to_owned();
    let ops = server.ops.clone();
    let drop_connections = server.drop_connections.clone();
    let drop_before_reply = server.drop_before_reply.clone();
    let eagain_stats = server.eagain_stats.clone();
    let eagain_jobs = server.eagain_jobs.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            if decrement(&drop_connections) {
                drop(stream);
                continue;
            }
            let session = Session {
                root: root_path.clone(),
                ops: ops.clone(),
                drop_before_reply: drop_before_reply.clone(),
                eagain_stats: eagain_stats.clone(),
                eagain_jobs: eagain_jobs.clone(),
            };
            tokio::spawn(async move {
                let _ = session.serve(Link::from_tcp(stream)).await;
            });
        }
    });

    server
}

fn decrement(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct Session {
    root: PathBuf,
    ops: Arc<Mutex<Vec<String>>>,
    drop_before_reply: Arc<AtomicUsize>,
    eagain_stats: Arc<AtomicUsize>,
    eagain_jobs: Arc<AtomicUsize>,
}

fn stat_line(meta: &std::fs::Metadata) -> String {
    format!(
        "{} {} {} {:o} {} {}",
        meta.dev(),
        meta.ino(),
        meta.rdev(),
        meta.mode() & 0o7777,
        meta.len(),
        meta.mtime()
    )
}

fn errno_of(e: &std::io::Error) -> i64 {
    -(e.raw_os_error().unwrap_or(5) as i64)
}

impl Session {
    async fn serve(&self, mut link: Link) -> Result<(), wire::LinkError> {
        let mut files: HashMap<i64, std::fs::File> = HashMap::new();
        let mut next_fd = 3_i64;

        loop {
            let stop = Instant::now() + Duration::from_secs(30);
            let line = link.read_line(stop).await?;
            self.ops.lock().push(line.clone());

            let mut words = line.split_ascii_whitespace();
            let verb = words.next().unwrap_or("");
            let args: Vec<String> = words.map(str::to_owned).collect();
            let path = |i: usize| self.root.join(url_decode(&args[i]).unwrap());

            // Payload-carrying requests must drain their payload before any failure
            // injection, or the stream would desynchronize.
            let payload = match verb {
                "pwrite" | "swrite" => {
                    let length: usize = args[1].parse().unwrap();
                    let mut buf = vec![0_u8; length];
                    link.read_exact(&mut buf, stop).await?;
                    Some(buf)
                }
                "putfile" => {
                    let length: usize = args[2].parse().unwrap();
                    let mut buf = vec![0_u8; length];
                    link.read_exact(&mut buf, stop).await?;
                    Some(buf)
                }
                "job_create" => {
                    let length: usize = args[0].parse().unwrap();
                    let mut buf = vec![0_u8; length];
                    link.read_exact(&mut buf, stop).await?;
                    Some(buf)
                }
                _ => None,
            };

            if decrement(&self.drop_before_reply) {
                return Ok(());
            }

            match verb {
                "stat" => {
                    if decrement(&self.eagain_stats) {
                        link.write_line("-11", stop).await?;
                    } else {
                        match std::fs::metadata(path(0)) {
                            Ok(meta) => {
                                link.write_line("0", stop).await?;
                                link.write_line(&stat_line(&meta), stop).await?;
                            }
                            Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                        }
                    }
                }
                "open" => {
                    let flags: i32 = args[1].parse().unwrap();
                    let mode: u32 = u32::from_str_radix(&args[2], 8).unwrap();
                    let mut options = std::fs::OpenOptions::new();
                    options.read(true).mode(mode);
                    if flags & O_WRONLY != 0 || flags & 0o2 != 0 {
                        options.write(true).read(flags & O_WRONLY == 0);
                    }
                    options.create(flags & O_CREAT != 0);
                    options.truncate(flags & O_TRUNC != 0);
                    match options.open(path(0)) {
                        Ok(file) => {
                            let meta = file.metadata().unwrap();
                            let fd = next_fd;
                            next_fd += 1;
                            files.insert(fd, file);
                            link.write_line(&fd.to_string(), stop).await?;
                            link.write_line(&stat_line(&meta), stop).await?;
                        }
                        Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                    }
                }
                "fstat" => {
                    let fd: i64 = args[0].parse().unwrap();
                    match files.get(&fd) {
                        Some(file) => {
                            let meta = file.metadata().unwrap();
                            link.write_line("0", stop).await?;
                            link.write_line(&stat_line(&meta), stop).await?;
                        }
                        None => link.write_line("-9", stop).await?,
                    }
                }
                "pread" | "sread" => {
                    let fd: i64 = args[0].parse().unwrap();
                    let length: usize = args[1].parse().unwrap();
                    let offset: u64 = args[2].parse().unwrap();
                    match files.get(&fd) {
                        Some(file) => {
                            let mut buf = vec![0_u8; length];
                            let mut total = 0;
                            loop {
                                match file.read_at(&mut buf[total..], offset + total as u64) {
                                    Ok(0) => break,
                                    Ok(n) => total += n,
                                    Err(_) => break,
                                }
                                if total == length {
                                    break;
                                }
                            }
                            link.write_line(&total.to_string(), stop).await?;
                            link.write_all(&buf[..total], stop).await?;
                        }
                        None => link.write_line("-9", stop).await?,
                    }
                }
                "pwrite" | "swrite" => {
                    let fd: i64 = args[0].parse().unwrap();
                    let offset: u64 = args[2].parse().unwrap();
                    let data = payload.unwrap();
                    match files.get(&fd) {
                        Some(file) => match file.write_all_at(&data, offset) {
                            Ok(()) => {
                                link.write_line(&data.len().to_string(), stop).await?;
                            }
                            Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                        },
                        None => link.write_line("-9", stop).await?,
                    }
                }
                "fsync" => {
                    let fd: i64 = args[0].parse().unwrap();
                    match files.get(&fd).map(|f| f.sync_all()) {
                        Some(Ok(())) => link.write_line("0", stop).await?,
                        Some(Err(e)) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                        None => link.write_line("-9", stop).await?,
                    }
                }
                "close" => {
                    let fd: i64 = args[0].parse().unwrap();
                    files.remove(&fd);
                    link.write_line("0", stop).await?;
                }
                "mkdir" => match std::fs::create_dir(path(0)) {
                    Ok(()) => link.write_line("0", stop).await?,
                    Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                },
                "unlink" => match std::fs::remove_file(path(0)) {
                    Ok(()) => link.write_line("0", stop).await?,
                    Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                },
                "rename" => match std::fs::rename(path(0), path(1)) {
                    Ok(()) => link.write_line("0", stop).await?,
                    Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                },
                "getfile" => match std::fs::read(path(0)) {
                    Ok(data) => {
                        link.write_line(&data.len().to_string(), stop).await?;
                        link.write_all(&data, stop).await?;
                    }
                    Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                },
                "putfile" => {
                    let data = payload.unwrap();
                    match std::fs::write(path(0), &data) {
                        Ok(()) => link.write_line("0", stop).await?,
                        Err(e) => link.write_line(&errno_of(&e).to_string(), stop).await?,
                    }
                }
                "whoami" => {
                    link.write_line("8", stop).await?;
                    link.write_all(b"mockuser", stop).await?;
                }
                "job_create" | "job_commit" | "job_kill" => {
                    let _spec = payload;
                    if decrement(&self.eagain_jobs) {
                        link.write_line("-11", stop).await?;
                    } else {
                        link.write_line("1", stop).await?;
                    }
                }
                "job_status" | "job_wait" => {
                    if decrement(&self.eagain_jobs) {
                        link.write_line("-11", stop).await?;
                    } else {
                        link.write_line("7", stop).await?;
                        link.write_all(b"running", stop).await?;
                    }
                }
                _ => link.write_line("-38", stop).await?,
            }
        }
    }
}
