// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Synchronous-feeling remote filesystem and job RPCs over a per-host pooled connection, with
//! the retry discipline that makes them survive transient disconnects: idempotent calls are
//! replayed with bounded exponential backoff until the caller's absolute deadline, and
//! file-scoped calls verify across reconnects that the remote inode is unchanged.

pub mod bulk;
mod client;
#[cfg(test)]
mod client_tests;
mod file;
#[cfg(test)]
mod mock_server;

pub use crate::client::{Pool, RemoteStat, RpcError};
pub use crate::file::RemoteFile;

/// Remote errno values the client gives meaning to.
pub(crate) const EAGAIN: i32 = 11;
