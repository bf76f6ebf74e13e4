// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Vectored file I/O. All "begin" phases (request lines and write payloads) go out before any
//! "finish" phase (responses) is read, pipelining the whole vector over the wire. Operations
//! are idempotent positioned reads and writes, so the vector as a whole is replayed on a
//! transport failure with the usual backoff.
//!
//! Bulk operations bypass the per-file buffers; callers flush any write-behind state first.

use std::time::Duration;

use tokio::time::Instant;

use crate::client::{Request, Want};
use crate::{Pool, RemoteFile, RpcError};

const MIN_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

pub enum BulkOp<'a> {
    Read {
        file: &'a RemoteFile,
        buf: &'a mut [u8],
        offset: i64,
        /// Bytes per stride; 0 for a plain contiguous read.
        stride_length: i64,
        /// Bytes to skip between strides.
        stride_skip: i64,
    },
    Write {
        file: &'a RemoteFile,
        data: &'a [u8],
        offset: i64,
        stride_length: i64,
        stride_skip: i64,
    },
}

impl BulkOp<'_> {
    fn host(&self) -> &str {
        match self {
            BulkOp::Read { file, .. } => file.host(),
            BulkOp::Write { file, .. } => file.host(),
        }
    }

    fn request(&self) -> Request {
        match self {
            BulkOp::Read {
                file,
                buf,
                offset,
                stride_length,
                stride_skip,
            } => Request {
                line: format!(
                    "sread {} {} {offset} {stride_length} {stride_skip}",
                    file.fd(),
                    buf.len()
                ),
                payload: None,
                want: Want::Payload,
            },
            BulkOp::Write {
                file,
                data,
                offset,
                stride_length,
                stride_skip,
            } => Request {
                line: format!(
                    "swrite {} {} {offset} {stride_length} {stride_skip}",
                    file.fd(),
                    data.len()
                ),
                payload: Some(data.to_vec()),
                want: Want::Code,
            },
        }
    }
}

///
/// Issue the whole vector, returning per-operation byte counts in order. Every file in the
/// vector must be served by the same host.
///
pub async fn bulk(pool: &Pool, ops: &mut [BulkOp<'_>], stop: Instant) -> Result<Vec<i64>, RpcError> {
    let host = match ops.first() {
        Some(op) => op.host().to_owned(),
        None => return Ok(Vec::new()),
    };
    if ops.iter().any(|op| op.host() != host) {
        return Err(RpcError::Protocol(
            "bulk vector spans multiple hosts".to_owned(),
        ));
    }

    let requests: Vec<Request> = ops.iter().map(BulkOp::request).collect();

    let mut delay = Duration::ZERO;
    loop {
        match pool.pipeline(&host, &requests, stop).await {
            Ok(responses) => {
                let mut results = Vec::with_capacity(responses.len());
                for (op, response) in ops.iter_mut().zip(responses) {
                    if response.code < 0 {
                        results.push(response.code);
                        continue;
                    }
                    if let BulkOp::Read { buf, .. } = op {
                        let n = std::cmp::min(buf.len(), response.payload.len());
                        buf[..n].copy_from_slice(&response.payload[..n]);
                    }
                    results.push(response.code);
                }
                return Ok(results);
            }
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
