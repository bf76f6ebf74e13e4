// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::Duration;

use log::debug;
use tokio::time::Instant;
use wire::url_encode;

use crate::client::{Request, Want};
use crate::{Pool, RemoteStat, RpcError};

/// Open flags, encoded on the wire as a decimal int with the Linux values.
pub const O_RDONLY: i32 = 0;
pub const O_WRONLY: i32 = 0o1;
pub const O_RDWR: i32 = 0o2;
pub const O_CREAT: i32 = 0o100;
pub const O_TRUNC: i32 = 0o1000;
pub const O_APPEND: i32 = 0o2000;

/// The single read-ahead / write-behind buffer each open file carries.
const BLOCKSIZE: usize = 65536;

const MIN_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

///
/// An open remote file descriptor that survives reconnects.
///
/// On every reconnect the path is re-opened and its `(dev, ino, rdev)` compared to what the
/// original open observed; a mismatch poisons the handle with `RpcError::Stale` rather than
/// silently reading a different file.
///
/// Small reads and writes coalesce in a single block-sized buffer; the buffer flushes on
/// close, fsync, stat, or whenever an access falls outside it.
///
pub struct RemoteFile {
    pool: Pool,
    host: String,
    path: String,
    reopen_flags: i32,
    mode: u32,
    fd: i64,
    identity: RemoteStat,
    serial: u64,
    stale: bool,
    buffer: Vec<u8>,
    buffer_offset: i64,
    buffer_valid: usize,
    buffer_dirty: bool,
}

impl RemoteFile {
    ///
    /// Open a remote file, retrying transport failures until the deadline like any other
    /// reliable call.
    ///
    pub async fn open(
        pool: &Pool,
        host: &str,
        path: &str,
        flags: i32,
        mode: u32,
        stop: Instant,
    ) -> Result<RemoteFile, RpcError> {
        let request = Request {
            line: format!("open {} {flags} {mode:o}", url_encode(path)),
            payload: None,
            want: Want::Stat,
        };
        let response = pool.call(host, request, stop, true).await?;
        let identity = response
            .stat
            .ok_or_else(|| RpcError::Protocol("open reply missing stat".to_owned()))?;
        let serial = pool.current_serial(host, stop).await?;

        Ok(RemoteFile {
            pool: pool.clone(),
            host: host.to_owned(),
            path: path.to_owned(),
            // O_CREAT and O_TRUNC must not be replayed on reconnect: re-opening is a check,
            // not a second create.
            reopen_flags: flags & !(O_CREAT | O_TRUNC),
            mode,
            fd: response.code,
            identity,
            serial,
            stale: false,
            buffer: vec![0_u8; BLOCKSIZE],
            buffer_offset: 0,
            buffer_valid: 0,
            buffer_dirty: false,
        })
    }

    pub fn fd(&self) -> i64 {
        self.fd
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Re-open after a reconnect and verify the remote inode is the one we first opened.
    async fn reverify(&mut self, new_serial: u64, stop: Instant) -> Result<(), RpcError> {
        debug!("verifying: {}", self.path);
        let request = Request {
            line: format!(
                "open {} {} {:o}",
                url_encode(&self.path),
                self.reopen_flags,
                self.mode
            ),
            payload: None,
            want: Want::Stat,
        };
        match self.pool.attempt(&self.host, &request, stop).await {
            Ok(response) if response.code >= 0 => {
                let stat = response
                    .stat
                    .ok_or_else(|| RpcError::Protocol("open reply missing stat".to_owned()))?;
                if stat.same_identity(&self.identity) {
                    self.fd = response.code;
                    self.serial = new_serial;
                    Ok(())
                } else {
                    debug!("stale: identity changed: {}", self.path);
                    self.stale = true;
                    Err(RpcError::Stale)
                }
            }
            Ok(_) => {
                // The path no longer opens at all: the handle cannot be trusted.
                self.stale = true;
                Err(RpcError::Stale)
            }
            Err(e) => Err(e),
        }
    }

    ///
    /// The retry loop for file-scoped calls: reconnects re-verify the handle first, staleness
    /// is fatal and never retried, and the caller deadline always wins.
    ///
    async fn file_call(
        &mut self,
        build: impl Fn(i64) -> Request,
        stop: Instant,
    ) -> Result<Vec<u8>, RpcError> {
        if self.stale {
            return Err(RpcError::Stale);
        }
        let mut delay = Duration::ZERO;
        loop {
            let attempt: Result<Vec<u8>, RpcError> = async {
                let serial = self.pool.current_serial(&self.host, stop).await?;
                if serial != self.serial {
                    self.reverify(serial, stop).await?;
                }
                let response = self.pool.attempt(&self.host, &build(self.fd), stop).await?;
                if response.code < 0 {
                    Err(RpcError::Remote((-response.code) as i32))
                } else {
                    Ok(response.payload)
                }
            }
            .await;

            match attempt {
                Ok(payload) => return Ok(payload),
                Err(RpcError::Disconnected) => {}
                Err(other) => return Err(other),
            }

            let now = Instant::now();
            if now >= stop {
                return Err(RpcError::Disconnected);
            }
            tokio::time::sleep_until(std::cmp::min(stop, now + delay)).await;
            delay = if delay.is_zero() {
                MIN_DELAY
            } else {
                std::cmp::min(delay * 2, MAX_DELAY)
            };
        }
    }

    async fn pread_unbuffered(
        &mut self,
        buf: &mut [u8],
        offset: i64,
        stop: Instant,
    ) -> Result<usize, RpcError> {
        let length = buf.len();
        let payload = self
            .file_call(
                |fd| Request {
                    line: format!("pread {fd} {length} {offset}"),
                    payload: None,
                    want: Want::Payload,
                },
                stop,
            )
            .await?;
        buf[..payload.len()].copy_from_slice(&payload);
        Ok(payload.len())
    }

    async fn pwrite_unbuffered(
        &mut self,
        data: &[u8],
        offset: i64,
        stop: Instant,
    ) -> Result<usize, RpcError> {
        let payload = data.to_vec();
        let length = data.len();
        let written = self
            .file_call(
                |fd| Request {
                    line: format!("pwrite {fd} {length} {offset}"),
                    payload: Some(payload.clone()),
                    want: Want::Code,
                },
                stop,
            )
            .await
            .map(|_| length)?;
        Ok(written)
    }

    async fn pread_buffered(
        &mut self,
        buf: &mut [u8],
        offset: i64,
        stop: Instant,
    ) -> Result<usize, RpcError> {
        // A hit anywhere in the buffered window is served locally, whether the window came
        // from read-ahead or from pending writes.
        if self.buffer_valid > 0 {
            let window_end = self.buffer_offset + self.buffer_valid as i64;
            if offset >= self.buffer_offset && offset < window_end {
                let start = (offset - self.buffer_offset) as usize;
                let available = std::cmp::min(buf.len(), (window_end - offset) as usize);
                buf[..available].copy_from_slice(&self.buffer[start..start + available]);
                return Ok(available);
            }
        }

        self.flush(stop).await?;

        if buf.len() <= BLOCKSIZE {
            let mut block = std::mem::take(&mut self.buffer);
            let result = self.pread_unbuffered(&mut block, offset, stop).await;
            self.buffer = block;
            match result {
                Ok(valid) => {
                    self.buffer_offset = offset;
                    self.buffer_valid = valid;
                    self.buffer_dirty = false;
                    let n = std::cmp::min(valid, buf.len());
                    buf[..n].copy_from_slice(&self.buffer[..n]);
                    Ok(n)
                }
                Err(e) => {
                    self.buffer_offset = 0;
                    self.buffer_valid = 0;
                    self.buffer_dirty = false;
                    Err(e)
                }
            }
        } else {
            self.pread_unbuffered(buf, offset, stop).await
        }
    }

    /// Read up to `buf.len()` bytes at `offset`. Short only at end of file.
    pub async fn pread(
        &mut self,
        buf: &mut [u8],
        mut offset: i64,
        stop: Instant,
    ) -> Result<usize, RpcError> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.pread_buffered(&mut buf[total..], offset, stop).await?;
            if n == 0 {
                break;
            }
            total += n;
            offset += n as i64;
        }
        Ok(total)
    }

    /// Write `data` at `offset`, coalescing into the write-behind buffer when it fits.
    pub async fn pwrite(
        &mut self,
        data: &[u8],
        offset: i64,
        stop: Instant,
    ) -> Result<usize, RpcError> {
        if data.len() >= BLOCKSIZE {
            self.flush(stop).await?;
            return self.pwrite_unbuffered(data, offset, stop).await;
        }

        if self.buffer_valid > 0 {
            let contiguous = self.buffer_dirty
                && self.buffer_offset + self.buffer_valid as i64 == offset
                && self.buffer_valid + data.len() <= BLOCKSIZE;
            if !contiguous {
                self.flush(stop).await?;
            }
        }

        if self.buffer_valid == 0 || !self.buffer_dirty {
            self.buffer_offset = offset;
            self.buffer_valid = 0;
        }
        let start = self.buffer_valid;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.buffer_valid += data.len();
        self.buffer_dirty = true;
        Ok(data.len())
    }

    /// Push any write-behind bytes to the server.
    pub async fn flush(&mut self, stop: Instant) -> Result<(), RpcError> {
        if self.buffer_dirty && self.buffer_valid > 0 {
            let data = self.buffer[..self.buffer_valid].to_vec();
            let offset = self.buffer_offset;
            self.pwrite_unbuffered(&data, offset, stop).await?;
        }
        self.buffer_valid = 0;
        self.buffer_dirty = false;
        Ok(())
    }

    pub async fn fsync(&mut self, stop: Instant) -> Result<(), RpcError> {
        self.flush(stop).await?;
        self.file_call(|fd| Request::plain(format!("fsync {fd}")), stop)
            .await
            .map(|_| ())
    }

    pub async fn fstat(&mut self, stop: Instant) -> Result<RemoteStat, RpcError> {
        self.flush(stop).await?;
        let serial = self.pool.current_serial(&self.host, stop).await?;
        if serial != self.serial {
            self.reverify(serial, stop).await?;
        }
        let request = Request {
            line: format!("fstat {}", self.fd),
            payload: None,
            want: Want::Stat,
        };
        let response = self.pool.attempt(&self.host, &request, stop).await?;
        if response.code < 0 {
            return Err(RpcError::Remote((-response.code) as i32));
        }
        response
            .stat
            .ok_or_else(|| RpcError::Protocol("fstat reply missing stat".to_owned()))
    }

    ///
    /// Flush and release the descriptor. Closing the server-side fd is best-effort: if the
    /// connection died, the server has already dropped it.
    ///
    pub async fn close(mut self, stop: Instant) -> Result<(), RpcError> {
        self.flush(stop).await?;
        let serial = self.pool.current_serial(&self.host, stop).await;
        if let Ok(serial) = serial {
            if serial == self.serial {
                let _ = self
                    .pool
                    .attempt(
                        &self.host,
                        &Request::plain(format!("close {}", self.fd)),
                        stop,
                    )
                    .await;
            }
        }
        Ok(())
    }
}
