// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use crate::bulk::{bulk, BulkOp};
use crate::file::{O_CREAT, O_RDONLY, O_RDWR};
use crate::mock_server;
use crate::{Pool, RemoteFile, RpcError};

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(20)
}

#[tokio::test]
async fn filesystem_round_trip() {
    let server = mock_server::start().await;
    let pool = Pool::new(None);

    pool.mkdir(&server.host, "outputs", 0o755, soon())
        .await
        .unwrap();
    pool.putfile(&server.host, "outputs/data", 0o644, b"payload bytes", soon())
        .await
        .unwrap();

    let stat = pool.stat(&server.host, "outputs/data", soon()).await.unwrap();
    assert_eq!(stat.size, 13);

    let fetched = pool
        .getfile(&server.host, "outputs/data", soon())
        .await
        .unwrap();
    assert_eq!(fetched, b"payload bytes");

    pool.rename(&server.host, "outputs/data", "outputs/moved", soon())
        .await
        .unwrap();
    match pool.stat(&server.host, "outputs/data", soon()).await {
        Err(RpcError::Remote(2)) => {} // ENOENT
        other => panic!("expected ENOENT, got {other:?}"),
    }

    assert_eq!(pool.whoami(&server.host, soon()).await.unwrap(), "mockuser");
}

#[tokio::test]
async fn dropped_connections_are_replayed() {
    let server = mock_server::start().await;
    std::fs::write(server.root.path().join("present"), b"x").unwrap();
    // The first two connect attempts are severed before any request is served.
    server.drop_connections.store(2, Ordering::SeqCst);

    let pool = Pool::new(None);
    let stat = pool.stat(&server.host, "present", soon()).await.unwrap();
    assert_eq!(stat.size, 1);
}

#[tokio::test]
async fn calls_fail_with_disconnected_once_the_deadline_wins() {
    let server = mock_server::start().await;
    server.drop_connections.store(usize::MAX, Ordering::SeqCst);

    let pool = Pool::new(None);
    let started = std::time::Instant::now();
    let stop = Instant::now() + Duration::from_secs(2);
    match pool.stat(&server.host, "anything", stop).await {
        Err(RpcError::Disconnected) => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }
    // The overall deadline wins: well within deadline plus one network timeout.
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn eagain_is_transient_for_plain_calls() {
    let server = mock_server::start().await;
    std::fs::write(server.root.path().join("present"), b"x").unwrap();
    server.eagain_stats.store(1, Ordering::SeqCst);

    let pool = Pool::new(None);
    let stat = pool.stat(&server.host, "present", soon()).await.unwrap();
    assert_eq!(stat.size, 1);
}

#[tokio::test]
async fn eagain_is_final_for_job_control() {
    let server = mock_server::start().await;
    server.eagain_jobs.store(usize::MAX, Ordering::SeqCst);

    let pool = Pool::new(None);
    let started = std::time::Instant::now();
    match pool.job_commit(&server.host, 7, soon()).await {
        Err(RpcError::Remote(11)) => {}
        other => panic!("expected EAGAIN, got {other:?}"),
    }
    // No sleeping, no replay.
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn small_writes_coalesce_into_one_wire_write() {
    let server = mock_server::start().await;
    let pool = Pool::new(None);

    let mut file = RemoteFile::open(
        &pool,
        &server.host,
        "log.txt",
        O_RDWR | O_CREAT,
        0o644,
        soon(),
    )
    .await
    .unwrap();

    file.pwrite(b"first ", 0, soon()).await.unwrap();
    file.pwrite(b"second ", 6, soon()).await.unwrap();
    file.pwrite(b"third", 13, soon()).await.unwrap();
    file.flush(soon()).await.unwrap();
    file.close(soon()).await.unwrap();

    let written = std::fs::read(server.root.path().join("log.txt")).unwrap();
    assert_eq!(written, b"first second third");

    let wire_writes = server
        .ops
        .lock()
        .iter()
        .filter(|op| op.starts_with("pwrite"))
        .count();
    assert_eq!(wire_writes, 1);
}

#[tokio::test]
async fn buffered_reads_serve_adjacent_offsets_locally() {
    let server = mock_server::start().await;
    std::fs::write(server.root.path().join("data"), b"abcdefghij").unwrap();
    let pool = Pool::new(None);

    let mut file = RemoteFile::open(&pool, &server.host, "data", O_RDONLY, 0, soon())
        .await
        .unwrap();

    let mut buf = [0_u8; 2];
    assert_eq!(file.pread(&mut buf, 0, soon()).await.unwrap(), 2);
    assert_eq!(&buf, b"ab");
    assert_eq!(file.pread(&mut buf, 4, soon()).await.unwrap(), 2);
    assert_eq!(&buf, b"ef");
    file.close(soon()).await.unwrap();

    let wire_reads = server
        .ops
        .lock()
        .iter()
        .filter(|op| op.starts_with("pread"))
        .count();
    assert_eq!(wire_reads, 1);
}

#[tokio::test]
async fn reconnect_reverifies_and_survives_when_the_inode_matches() {
    let server = mock_server::start().await;
    std::fs::write(server.root.path().join("stable"), b"stable contents").unwrap();
    let pool = Pool::new(None);

    let mut file = RemoteFile::open(&pool, &server.host, "stable", O_RDONLY, 0, soon())
        .await
        .unwrap();

    // Sever the connection on the next request; the file itself is unchanged.
    server.drop_before_reply.store(1, Ordering::SeqCst);

    let mut buf = [0_u8; 15];
    assert_eq!(file.pread(&mut buf, 0, soon()).await.unwrap(), 15);
    assert_eq!(&buf, b"stable contents");
}

#[tokio::test]
async fn reconnect_detects_a_replaced_file_as_stale() {
    let server = mock_server::start().await;
    let path = server.root.path().join("volatile");
    std::fs::write(&path, b"original").unwrap();
    let pool = Pool::new(None);

    let mut file = RemoteFile::open(&pool, &server.host, "volatile", O_RDONLY, 0, soon())
        .await
        .unwrap();

    // Replace the file (new inode) and sever the connection on the next request.
    std::fs::remove_file(&path).unwrap();
    std::fs::write(&path, b"impostor").unwrap();
    server.drop_before_reply.store(1, Ordering::SeqCst);

    let mut buf = [0_u8; 8];
    match file.pread(&mut buf, 0, soon()).await {
        Err(RpcError::Stale) => {}
        other => panic!("expected Stale, got {other:?}"),
    }
    // The handle stays poisoned.
    match file.pread(&mut buf, 0, soon()).await {
        Err(RpcError::Stale) => {}
        other => panic!("expected Stale, got {other:?}"),
    }
}

#[tokio::test]
async fn bulk_pipelines_reads_and_writes() {
    let server = mock_server::start().await;
    std::fs::write(server.root.path().join("source"), b"0123456789").unwrap();
    let pool = Pool::new(None);

    let source = RemoteFile::open(&pool, &server.host, "source", O_RDONLY, 0, soon())
        .await
        .unwrap();
    let sink = RemoteFile::open(
        &pool,
        &server.host,
        "sink",
        O_RDWR | O_CREAT,
        0o644,
        soon(),
    )
    .await
    .unwrap();

    let mut head = [0_u8; 4];
    let mut tail = [0_u8; 4];
    let mut ops = [
        BulkOp::Read {
            file: &source,
            buf: &mut head,
            offset: 0,
            stride_length: 0,
            stride_skip: 0,
        },
        BulkOp::Read {
            file: &source,
            buf: &mut tail,
            offset: 6,
            stride_length: 0,
            stride_skip: 0,
        },
        BulkOp::Write {
            file: &sink,
            data: b"written",
            offset: 0,
            stride_length: 0,
            stride_skip: 0,
        },
    ];
    let results = bulk(&pool, &mut ops, soon()).await.unwrap();

    assert_eq!(results, vec![4, 4, 7]);
    assert_eq!(&head, b"0123");
    assert_eq!(&tail, b"6789");
    assert_eq!(
        std::fs::read(server.root.path().join("sink")).unwrap(),
        b"written"
    );
}
