// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::{MountFlags, Task};
use task_executor::Executor;
use tokio::net::TcpListener;
use tokio::time::Instant;
use wire::transfer::{put_item, TransferMode};
use wire::Link;

use crate::{
    CacheLevel, EnsureStatus, EntryStatus, MiniTaskRunner, Store, StoreEvent, Trash,
};

struct Fixture {
    _workspace: tempfile::TempDir,
    store: Store,
}

fn fixture() -> Fixture {
    let workspace = tempfile::tempdir().unwrap();
    let executor = Executor::new();
    let trash = Trash::setup(workspace.path().join("trash"), executor.clone()).unwrap();
    let store = Store::new(workspace.path().join("cache"), trash, executor, None).unwrap();
    Fixture {
        _workspace: workspace,
        store,
    }
}

async fn next_event(store: &Store) -> StoreEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(event) = store.wait() {
            return event;
        }
        assert!(Instant::now() < deadline, "no store event arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A transfer server that serves one file per connection and counts connections.
async fn peer_server(source: &Path) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let source = source.to_owned();
    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            let source = source.clone();
            tokio::spawn(async move {
                let mut link = Link::from_tcp(stream);
                let stop = Instant::now() + Duration::from_secs(10);
                let line = link.read_line(stop).await.unwrap();
                assert!(line.starts_with("get "));
                put_item(&mut link, &source, "payload", TransferMode::Any, stop)
                    .await
                    .unwrap();
            });
        }
    });
    (format!("127.0.0.1:{port}"), connections)
}

#[tokio::test]
async fn added_files_are_ready_immediately() {
    let f = fixture();
    std::fs::write(f.store.full_path("in.dat"), b"hello").unwrap();
    f.store.add_file("in.dat", 5, 0o644, CacheLevel::Task);

    assert_eq!(
        f.store.ensure("in.dat", MountFlags::default()),
        EnsureStatus::Ready
    );
    assert_eq!(f.store.status("in.dat"), Some(EntryStatus::Ready));
}

#[tokio::test]
async fn unknown_names_are_unknown() {
    let f = fixture();
    assert_eq!(
        f.store.ensure("never-heard-of-it", MountFlags::default()),
        EnsureStatus::Unknown
    );
}

#[tokio::test]
async fn peer_transfer_materializes_and_commits() {
    let f = fixture();
    let payload_dir = tempfile::tempdir().unwrap();
    let payload = payload_dir.path().join("payload");
    std::fs::write(&payload, b"transferred bytes").unwrap();
    let (addr, _connections) = peer_server(&payload).await;

    f.store.queue_transfer(
        "big",
        &format!("worker://{addr}/payload"),
        17,
        0o644,
        Some("t-1".to_owned()),
    );

    assert_eq!(
        f.store.ensure("big", MountFlags::default()),
        EnsureStatus::Processing
    );
    // No task may observe the name until the commit rename.
    assert!(!f.store.full_path("big").exists());

    match next_event(&f.store).await {
        StoreEvent::Update {
            name,
            size,
            transfer_id,
            ..
        } => {
            assert_eq!(name, "big");
            assert_eq!(size, 17);
            assert_eq!(transfer_id.as_deref(), Some("t-1"));
        }
        other => panic!("expected update, got {other:?}"),
    }

    assert_eq!(
        f.store.ensure("big", MountFlags::default()),
        EnsureStatus::Ready
    );
    assert_eq!(
        std::fs::read(f.store.full_path("big")).unwrap(),
        b"transferred bytes"
    );
    // The sidecar allows a restarted worker to resume without refetching.
    assert!(f.store.full_path("big.meta").exists());
}

#[tokio::test]
async fn overlapping_ensure_starts_one_producer() {
    let f = fixture();
    let payload_dir = tempfile::tempdir().unwrap();
    let payload = payload_dir.path().join("payload");
    std::fs::write(&payload, b"x").unwrap();
    let (addr, connections) = peer_server(&payload).await;

    f.store
        .queue_transfer("shared", &format!("worker://{addr}/payload"), 1, 0o644, None);

    let first = f.store.ensure("shared", MountFlags::default());
    let second = f.store.ensure("shared", MountFlags::default());
    assert_eq!(first, EnsureStatus::Processing);
    assert_eq!(second, EnsureStatus::Processing);

    let _ = next_event(&f.store).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_transfer_reports_invalid_and_trashes_partials() {
    let f = fixture();
    // Nothing listens here; the connect fails quickly.
    f.store.queue_transfer(
        "doomed",
        "worker://127.0.0.1:9/payload",
        1,
        0o644,
        Some("t-9".to_owned()),
    );

    assert_eq!(
        f.store.ensure("doomed", MountFlags::default()),
        EnsureStatus::Processing
    );
    match next_event(&f.store).await {
        StoreEvent::Invalid {
            name, transfer_id, ..
        } => {
            assert_eq!(name, "doomed");
            assert_eq!(transfer_id.as_deref(), Some("t-9"));
        }
        other => panic!("expected invalid, got {other:?}"),
    }

    assert_eq!(
        f.store.ensure("doomed", MountFlags::default()),
        EnsureStatus::Failed
    );
    assert!(!f.store.full_path("doomed").exists());
    assert!(!f.store.full_path("doomed.transfer").exists());
}

struct WritingRunner;

#[async_trait]
impl MiniTaskRunner for WritingRunner {
    async fn run(&self, _task: Task, dest: &Path) -> Result<(), String> {
        tokio::fs::write(dest, b"produced")
            .await
            .map_err(|e| e.to_string())
    }
}

#[tokio::test]
async fn mini_task_produces_through_the_runner() {
    let f = fixture();
    f.store.set_mini_task_runner(Arc::new(WritingRunner));
    f.store.queue_mini_task("made", Task::new(1), 8, 0o600);

    assert_eq!(
        f.store.ensure("made", MountFlags::default()),
        EnsureStatus::Processing
    );
    match next_event(&f.store).await {
        StoreEvent::Update { name, size, .. } => {
            assert_eq!(name, "made");
            assert_eq!(size, 8);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(std::fs::read(f.store.full_path("made")).unwrap(), b"produced");
}

#[tokio::test]
async fn scan_resumes_from_sidecars_and_trashes_remnants() {
    let workspace = tempfile::tempdir().unwrap();
    let executor = Executor::new();

    {
        let trash = Trash::setup(workspace.path().join("trash"), executor.clone()).unwrap();
        let store = Store::new(
            workspace.path().join("cache"),
            trash,
            executor.clone(),
            None,
        )
        .unwrap();
        std::fs::write(store.full_path("kept"), b"kept bytes").unwrap();
        store.add_file("kept", 10, 0o644, CacheLevel::Worker);
        // Simulate a crash mid-transfer.
        std::fs::write(store.full_path("dead.transfer"), b"partial").unwrap();
    }

    // A fresh store over the same workspace.
    let trash = Trash::setup(workspace.path().join("trash"), executor.clone()).unwrap();
    let store = Store::new(workspace.path().join("cache"), trash, executor, None).unwrap();
    let announcements = store.scan();

    assert_eq!(announcements.len(), 1);
    match &announcements[0] {
        StoreEvent::Update { name, size, .. } => {
            assert_eq!(name, "kept");
            assert_eq!(*size, 10);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(
        store.ensure("kept", MountFlags::default()),
        EnsureStatus::Ready
    );
    assert!(!store.full_path("dead.transfer").exists());
}

#[tokio::test]
async fn remove_trashes_data_and_sidecar() {
    let f = fixture();
    std::fs::write(f.store.full_path("gone"), b"bytes").unwrap();
    f.store.add_file("gone", 5, 0o644, CacheLevel::Task);
    assert!(f.store.full_path("gone.meta").exists());

    f.store.remove("gone");
    assert!(!f.store.contains("gone"));
    assert!(!f.store.full_path("gone").exists());
    assert!(!f.store.full_path("gone.meta").exists());
}
