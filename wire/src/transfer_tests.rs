// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use tokio::time::Instant;

use crate::transfer::{get_item, put_item, Received, TransferMode};
use crate::{Link, LinkError};

fn pair() -> (Link, Link) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (Link::from_stream(a), Link::from_stream(b))
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(10)
}

#[tokio::test]
async fn tree_round_trip_preserves_bytes_modes_and_links() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    let root = src.path().join("bundle");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("input.dat"), b"hello").unwrap();
    std::fs::set_permissions(root.join("input.dat"), std::fs::Permissions::from_mode(0o640))
        .unwrap();
    std::fs::create_dir(root.join("sub")).unwrap();
    std::fs::write(root.join("sub/nested.txt"), b"nested contents").unwrap();
    std::os::unix::fs::symlink("input.dat", root.join("alias")).unwrap();

    let (mut tx, mut rx) = pair();
    let send = async {
        put_item(&mut tx, &root, "bundle", TransferMode::Any, soon())
            .await
            .unwrap();
    };
    let recv = async {
        match get_item(&mut rx, dst.path(), soon()).await.unwrap() {
            Received::Item { name, total_size } => {
                assert_eq!(name, "bundle");
                // input.dat (5) + nested.txt (15) + symlink target "input.dat" (9).
                assert_eq!(total_size, 29);
            }
            other => panic!("expected item, got {other:?}"),
        }
    };
    tokio::join!(send, recv);

    let got_root = dst.path().join("bundle");
    assert_eq!(std::fs::read(got_root.join("input.dat")).unwrap(), b"hello");
    assert_eq!(
        std::fs::metadata(got_root.join("input.dat"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777,
        0o640
    );
    assert_eq!(
        std::fs::read(got_root.join("sub/nested.txt")).unwrap(),
        b"nested contents"
    );
    assert_eq!(
        std::fs::read_link(got_root.join("alias")).unwrap(),
        std::path::PathBuf::from("input.dat")
    );
}

#[tokio::test]
async fn file_only_mode_refuses_directories() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let root = src.path().join("somedir");
    std::fs::create_dir(&root).unwrap();

    let (mut tx, mut rx) = pair();
    let send = async {
        put_item(&mut tx, &root, "somedir", TransferMode::FileOnly, soon())
            .await
            .unwrap();
    };
    let recv = async {
        match get_item(&mut rx, dst.path(), soon()).await.unwrap() {
            Received::Error { name, errno } => {
                assert_eq!(name, "somedir");
                assert_eq!(errno, 21); // EISDIR
            }
            other => panic!("expected error item, got {other:?}"),
        }
    };
    tokio::join!(send, recv);
}

#[tokio::test]
async fn missing_source_reports_error_in_stream() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    let (mut tx, mut rx) = pair();
    let missing = src.path().join("nope");
    let send = async {
        put_item(&mut tx, &missing, "nope", TransferMode::Any, soon())
            .await
            .unwrap();
    };
    let recv = async {
        match get_item(&mut rx, dst.path(), soon()).await.unwrap() {
            Received::Error { name, .. } => assert_eq!(name, "nope"),
            other => panic!("expected error item, got {other:?}"),
        }
    };
    tokio::join!(send, recv);
}

#[tokio::test]
async fn traversal_names_are_rejected() {
    let dst = tempfile::tempdir().unwrap();

    for header in [
        "file ../evil 5 0644",
        "file /etc/passwd 5 0644",
        "dir .. 0",
        "symlink ../up 3",
    ] {
        let (mut tx, mut rx) = pair();
        tx.write_line(header, soon()).await.unwrap();
        match get_item(&mut rx, dst.path(), soon()).await {
            Err(LinkError::Protocol(_)) => {}
            other => panic!("expected protocol violation for {header:?}, got {other:?}"),
        }
    }
}
