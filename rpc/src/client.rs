// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;
use wire::{tcp_connect, url_encode, Link, LinkError};

use crate::EAGAIN;

const MIN_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum RpcError {
    /// The transport failed and the deadline ran out before a replay could succeed.
    Disconnected,
    /// The caller's deadline expired mid-call.
    Timeout,
    /// A file handle's remote inode changed across a reconnect; the handle is dead.
    Stale,
    /// The server answered with an errno.
    Remote(i32),
    /// The server broke the protocol.
    Protocol(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Disconnected => write!(f, "connection reset"),
            RpcError::Timeout => write!(f, "deadline expired"),
            RpcError::Stale => write!(f, "stale file handle"),
            RpcError::Remote(errno) => write!(f, "remote errno {errno}"),
            RpcError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// The identity fields used to detect that a reconnected server is serving a different file
/// under the same path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub dev: i64,
    pub ino: i64,
    pub rdev: i64,
    pub mode: u32,
    pub size: i64,
    pub mtime: i64,
}

impl RemoteStat {
    pub fn same_identity(&self, other: &RemoteStat) -> bool {
        self.dev == other.dev && self.ino == other.ino && self.rdev == other.rdev
    }

    fn parse(line: &str) -> Result<RemoteStat, RpcError> {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.len() != 6 {
            return Err(RpcError::Protocol(format!("bad stat reply: {line}")));
        }
        let int = |i: usize| -> Result<i64, RpcError> {
            fields[i]
                .parse()
                .map_err(|_| RpcError::Protocol(format!("bad stat reply: {line}")))
        };
        Ok(RemoteStat {
            dev: int(0)?,
            ino: int(1)?,
            rdev: int(2)?,
            mode: u32::from_str_radix(fields[3], 8)
                .map_err(|_| RpcError::Protocol(format!("bad stat reply: {line}")))?,
            size: int(4)?,
            mtime: int(5)?,
        })
    }
}

/// What the caller expects after the response code line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Want {
    Code,
    /// A stat line follows a non-negative code.
    Stat,
    /// `code` bytes of payload follow a non-negative code.
    Payload,
}

pub(crate) struct Request {
    pub line: String,
    pub payload: Option<Vec<u8>>,
    pub want: Want,
}

impl Request {
    pub fn plain(line: String) -> Request {
        Request {
            line,
            payload: None,
            want: Want::Code,
        }
    }
}

pub(crate) struct Response {
    pub code: i64,
    pub stat: Option<RemoteStat>,
    pub payload: Vec<u8>,
}

struct Connection {
    link: Link,
    serial: u64,
}

type Slot = Arc<tokio::sync::Mutex<Option<Connection>>>;

struct Inner {
    slots: parking_lot::Mutex<HashMap<String, Slot>>,
    password: Option<String>,
    next_serial: AtomicU64,
}

///
/// A table of open connections keyed by `host:port`. First use connects (performing the
/// password exchange when one is configured); subsequent calls reuse. A transport failure
/// evicts the cached connection so the next attempt reconnects.
///
#[derive(Clone)]
pub struct Pool(Arc<Inner>);

impl Pool {
    pub fn new(password: Option<String>) -> Pool {
        Pool(Arc::new(Inner {
            slots: parking_lot::Mutex::default(),
            password,
            next_serial: AtomicU64::new(1),
        }))
    }

    fn slot(&self, host: &str) -> Slot {
        self.0
            .slots
            .lock()
            .entry(host.to_owned())
            .or_default()
            .clone()
    }

    pub fn disconnect(&self, host: &str) {
        if let Some(slot) = self.0.slots.lock().get(host) {
            if let Ok(mut guard) = slot.try_lock() {
                *guard = None;
            }
        }
    }

    async fn connect(&self, host: &str, stop: Instant) -> Result<Connection, RpcError> {
        let (name, port) = host
            .rsplit_once(':')
            .ok_or_else(|| RpcError::Protocol(format!("bad host spec: {host}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| RpcError::Protocol(format!("bad host spec: {host}")))?;

        let stream = tcp_connect(name, port, stop).await.map_err(map_link_error)?;
        let mut link = Link::from_tcp(stream);
        if let Some(password) = &self.0.password {
            wire::auth::authenticate_connect(&mut link, password, stop)
                .await
                .map_err(map_link_error)?;
        }
        let serial = self.0.next_serial.fetch_add(1, Ordering::Relaxed);
        debug!("connected to {host} (serial {serial})");
        Ok(Connection { link, serial })
    }

    /// The serial of the live connection to `host`, connecting if necessary. File handles use
    /// this to notice reconnects.
    pub(crate) async fn current_serial(&self, host: &str, stop: Instant) -> Result<u64, RpcError> {
        let slot = self.slot(host);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(host, stop).await?);
        }
        Ok(guard.as_ref().map(|c| c.serial).unwrap())
    }

    /// One attempt: no replay. A transport failure evicts the connection and surfaces as
    /// `Disconnected`; the caller decides whether to retry.
    pub(crate) async fn attempt(
        &self,
        host: &str,
        request: &Request,
        stop: Instant,
    ) -> Result<Response, RpcError> {
        let slot = self.slot(host);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(host, stop).await?);
        }
        let connection = guard.as_mut().unwrap();

        let result = Self::exchange(&mut connection.link, request, stop).await;
        if matches!(result, Err(RpcError::Disconnected)) {
            *guard = None;
        }
        result
    }

    ///
    /// Pipelined execution: write every request before reading any response, so a vector of
    /// independent operations costs one round trip instead of one per operation. One attempt;
    /// the caller owns replay.
    ///
    pub(crate) async fn pipeline(
        &self,
        host: &str,
        requests: &[Request],
        stop: Instant,
    ) -> Result<Vec<Response>, RpcError> {
        let slot = self.slot(host);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(host, stop).await?);
        }
        let connection = guard.as_mut().unwrap();

        let result: Result<Vec<Response>, RpcError> = async {
            for request in requests {
                connection
                    .link
                    .write_line(&request.line, stop)
                    .await
                    .map_err(map_link_error)?;
                if let Some(payload) = &request.payload {
                    connection
                        .link
                        .write_all(payload, stop)
                        .await
                        .map_err(map_link_error)?;
                }
            }
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                responses.push(Self::read_response(&mut connection.link, request, stop).await?);
            }
            Ok(responses)
        }
        .await;

        if matches!(result, Err(RpcError::Disconnected)) {
            *guard = None;
        }
        result
    }

    async fn exchange(
        link: &mut Link,
        request: &Request,
        stop: Instant,
    ) -> Result<Response, RpcError> {
        link.write_line(&request.line, stop)
            .await
            .map_err(map_link_error)?;
        if let Some(payload) = &request.payload {
            link.write_all(payload, stop).await.map_err(map_link_error)?;
        }
        Self::read_response(link, request, stop).await
    }

    async fn read_response(
        link: &mut Link,
        request: &Request,
        stop: Instant,
    ) -> Result<Response, RpcError> {
        let code_line = link.read_line(stop).await.map_err(map_link_error)?;
        let code: i64 = code_line
            .trim()
            .parse()
            .map_err(|_| RpcError::Protocol(format!("bad response code: {code_line}")))?;

        let mut response = Response {
            code,
            stat: None,
            payload: Vec::new(),
        };
        if code >= 0 {
            match request.want {
                Want::Code => {}
                Want::Stat => {
                    let stat_line = link.read_line(stop).await.map_err(map_link_error)?;
                    response.stat = Some(RemoteStat::parse(&stat_line)?);
                }
                Want::Payload => {
                    let mut payload = vec![0_u8; code as usize];
                    link.read_exact(&mut payload, stop)
                        .await
                        .map_err(map_link_error)?;
                    response.payload = payload;
                }
            }
        }
        Ok(response)
    }

    ///
    /// The retrying call. Transport failures sleep and replay, with the delay starting at one
    /// second and doubling to sixty, until the caller deadline wins. Remote errnos return
    /// immediately, except `EAGAIN` which is treated as transient — unless `retry_eagain` is
    /// false, the contract for job-control calls.
    ///
    pub(crate) async fn call(
        &self,
        host: &str,
        request: Request,
        stop: Instant,
        retry_eagain: bool,
    ) -> Result<Response, RpcError> {
        let mut delay = Duration::ZERO;
        loop {
            match self.attempt(host, &request, stop).await {
                Ok(response) => {
                    if response.code < 0 {
                        let errno = (-response.code) as i32;
                        if !(errno == EAGAIN && retry_eagain) {
                            return Err(RpcError::Remote(errno));
                        }
                    } else {
                        return Ok(response);
                    }
                }
                Err(RpcError::Disconnected) => {}
                Err(other) => return Err(other),
            }

            let now = Instant::now();
            if now >= stop {
                return Err(RpcError::Disconnected);
            }
            debug!("could not talk to {host}; trying again in {delay:?}");
            tokio::time::sleep_until(std::cmp::min(stop, now + delay)).await;
            delay = if delay.is_zero() {
                MIN_DELAY
            } else {
                std::cmp::min(delay * 2, MAX_DELAY)
            };
        }
    }

    // Remote filesystem operations.

    pub async fn stat(&self, host: &str, path: &str, stop: Instant) -> Result<RemoteStat, RpcError> {
        let request = Request {
            line: format!("stat {}", url_encode(path)),
            payload: None,
            want: Want::Stat,
        };
        let response = self.call(host, request, stop, true).await?;
        response
            .stat
            .ok_or_else(|| RpcError::Protocol("stat reply missing".to_owned()))
    }

    pub async fn mkdir(
        &self,
        host: &str,
        path: &str,
        mode: u32,
        stop: Instant,
    ) -> Result<(), RpcError> {
        self.call(
            host,
            Request::plain(format!("mkdir {} {mode:o}", url_encode(path))),
            stop,
            true,
        )
        .await
        .map(|_| ())
    }

    pub async fn rmdir(&self, host: &str, path: &str, stop: Instant) -> Result<(), RpcError> {
        self.call(
            host,
            Request::plain(format!("rmdir {}", url_encode(path))),
            stop,
            true,
        )
        .await
        .map(|_| ())
    }

    pub async fn unlink(&self, host: &str, path: &str, stop: Instant) -> Result<(), RpcError> {
        self.call(
            host,
            Request::plain(format!("unlink {}", url_encode(path))),
            stop,
            true,
        )
        .await
        .map(|_| ())
    }

    pub async fn rename(
        &self,
        host: &str,
        old_path: &str,
        new_path: &str,
        stop: Instant,
    ) -> Result<(), RpcError> {
        self.call(
            host,
            Request::plain(format!(
                "rename {} {}",
                url_encode(old_path),
                url_encode(new_path)
            )),
            stop,
            true,
        )
        .await
        .map(|_| ())
    }

    pub async fn setacl(
        &self,
        host: &str,
        path: &str,
        subject: &str,
        rights: &str,
        stop: Instant,
    ) -> Result<(), RpcError> {
        self.call(
            host,
            Request::plain(format!(
                "setacl {} {} {rights}",
                url_encode(path),
                url_encode(subject)
            )),
            stop,
            true,
        )
        .await
        .map(|_| ())
    }

    pub async fn whoami(&self, host: &str, stop: Instant) -> Result<String, RpcError> {
        let request = Request {
            line: "whoami".to_owned(),
            payload: None,
            want: Want::Payload,
        };
        let response = self.call(host, request, stop, true).await?;
        String::from_utf8(response.payload)
            .map_err(|_| RpcError::Protocol("non-utf8 whoami reply".to_owned()))
    }

    pub async fn getfile(&self, host: &str, path: &str, stop: Instant) -> Result<Vec<u8>, RpcError> {
        let request = Request {
            line: format!("getfile {}", url_encode(path)),
            payload: None,
            want: Want::Payload,
        };
        Ok(self.call(host, request, stop, true).await?.payload)
    }

    pub async fn putfile(
        &self,
        host: &str,
        path: &str,
        mode: u32,
        data: &[u8],
        stop: Instant,
    ) -> Result<(), RpcError> {
        let request = Request {
            line: format!("putfile {} {mode:o} {}", url_encode(path), data.len()),
            payload: Some(data.to_vec()),
            want: Want::Code,
        };
        self.call(host, request, stop, true).await.map(|_| ())
    }

    // Job control. `EAGAIN` here is non-transient by contract and is never retried.

    pub async fn job_create(&self, host: &str, spec: &str, stop: Instant) -> Result<i64, RpcError> {
        let request = Request {
            line: format!("job_create {}", spec.len()),
            payload: Some(spec.as_bytes().to_vec()),
            want: Want::Code,
        };
        Ok(self.call(host, request, stop, false).await?.code)
    }

    pub async fn job_commit(&self, host: &str, job_id: i64, stop: Instant) -> Result<(), RpcError> {
        self.call(
            host,
            Request::plain(format!("job_commit {job_id}")),
            stop,
            false,
        )
        .await
        .map(|_| ())
    }

    pub async fn job_kill(&self, host: &str, job_id: i64, stop: Instant) -> Result<(), RpcError> {
        self.call(
            host,
            Request::plain(format!("job_kill {job_id}")),
            stop,
            false,
        )
        .await
        .map(|_| ())
    }

    pub async fn job_status(&self, host: &str, job_id: i64, stop: Instant) -> Result<String, RpcError> {
        let request = Request {
            line: format!("job_status {job_id}"),
            payload: None,
            want: Want::Payload,
        };
        let response = self.call(host, request, stop, false).await?;
        String::from_utf8(response.payload)
            .map_err(|_| RpcError::Protocol("non-utf8 job status".to_owned()))
    }

    pub async fn job_wait(
        &self,
        host: &str,
        job_id: i64,
        timeout_secs: u64,
        stop: Instant,
    ) -> Result<String, RpcError> {
        let request = Request {
            line: format!("job_wait {job_id} {timeout_secs}"),
            payload: None,
            want: Want::Payload,
        };
        let response = self.call(host, request, stop, false).await?;
        String::from_utf8(response.payload)
            .map_err(|_| RpcError::Protocol("non-utf8 job status".to_owned()))
    }
}

pub(crate) fn map_link_error(e: LinkError) -> RpcError {
    match e {
        LinkError::Timeout => RpcError::Timeout,
        LinkError::Closed | LinkError::Io(_) => RpcError::Disconnected,
        LinkError::LineTooLong | LinkError::Protocol(_) => RpcError::Protocol(e.to_string()),
    }
}
