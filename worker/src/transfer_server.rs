// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The peer-to-peer transfer endpoint: other workers pull cached objects from here instead
//! of all hammering the manager. One accept loop, a semaphore capping concurrent transfers,
//! and one short-lived task per connection.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use store::Store;
use tokio::net::TcpListener;
use tokio::time::Instant;
use wire::transfer::{put_item, TransferMode};
use wire::{url_decode, Link};

use crate::sandbox::is_safe_relative;

/// The initial wait for a command is short, to shed dead connections quickly.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A transfer in progress gets much longer, to avoid false failures on large trees.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);

const MAX_CONCURRENT_TRANSFERS: usize = 128;

pub struct TransferServer {
    port: u16,
    accept_loop: tokio::task::JoinHandle<()>,
}

impl TransferServer {
    ///
    /// Bind and start serving. `port` 0 picks any available port; the chosen one is
    /// advertised to the manager so peers can be directed here.
    ///
    pub async fn start(
        store: Store,
        password: Option<String>,
        port: u16,
    ) -> Result<TransferServer, String> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| format!("unable to start a transfer server on port {port}: {e}"))?;
        let port = listener
            .local_addr()
            .map_err(|e| format!("transfer server has no local address: {e}"))?
            .port();
        debug!("transfer server listening on port {port}");

        let limit = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_TRANSFERS));
        let accept_loop = tokio::spawn(async move {
            loop {
                let permit = match limit.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("transfer server accept failed: {e}");
                        continue;
                    }
                };
                debug!("transfer connection from {peer}");
                let store = store.clone();
                let password = password.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let _ = handle_peer(Link::from_tcp(stream), store, password).await;
                });
            }
        });

        Ok(TransferServer { port, accept_loop })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(self) {
        self.accept_loop.abort();
    }
}

async fn handle_peer(
    mut link: Link,
    store: Store,
    password: Option<String>,
) -> Result<(), wire::LinkError> {
    let command_stop = Instant::now() + COMMAND_TIMEOUT;

    if let Some(password) = &password {
        if let Err(e) = wire::auth::authenticate_accept(&mut link, password, command_stop).await {
            debug!("transfer server could not authenticate peer: {e}");
            return Ok(());
        }
    }

    let line = link.read_line(command_stop).await?;
    let name = match line.strip_prefix("get ") {
        Some(encoded) => match url_decode(encoded) {
            Ok(name) => name,
            Err(e) => {
                debug!("invalid peer transfer name: {e}");
                return Ok(());
            }
        },
        None => {
            debug!("invalid peer transfer message: {line}");
            return Ok(());
        }
    };
    if !is_safe_relative(&name) {
        debug!("refusing unsafe peer transfer name: {name}");
        return Ok(());
    }

    let transfer_stop = Instant::now() + TRANSFER_TIMEOUT;
    let full_path = store.full_path(&name);
    let basename = full_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(name);
    put_item(&mut link, &full_path, &basename, TransferMode::Any, transfer_stop).await
}
