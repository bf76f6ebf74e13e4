// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::Duration;

use tokio::time::Instant;
use wire::{Link, LinkError};

use crate::{read_task_block, ManagerCommand, Resources, WorkerTotals};

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[test]
fn simple_commands_parse() {
    assert_eq!(
        ManagerCommand::parse("task 17").unwrap(),
        ManagerCommand::Task { task_id: 17 }
    );
    assert_eq!(
        ManagerCommand::parse("file in.dat 5 0644").unwrap(),
        ManagerCommand::File {
            name: "in.dat".to_owned(),
            size: 5,
            mode: 0o644,
        }
    );
    assert_eq!(
        ManagerCommand::parse("kill -1").unwrap(),
        ManagerCommand::Kill { task_id: -1 }
    );
    assert_eq!(ManagerCommand::parse("release").unwrap(), ManagerCommand::Release);
    assert_eq!(
        ManagerCommand::parse("send_results 3").unwrap(),
        ManagerCommand::SendResults { count: 3 }
    );
}

#[test]
fn puturl_fields_are_decoded() {
    let cmd = ManagerCommand::parse(
        "puturl https%3A//example.com/big.tar.gz big%20file 1024 0600 t-42",
    )
    .unwrap();
    assert_eq!(
        cmd,
        ManagerCommand::PutUrl {
            source: "https://example.com/big.tar.gz".to_owned(),
            name: "big file".to_owned(),
            size: 1024,
            mode: 0o600,
            transfer_id: "t-42".to_owned(),
        }
    );
}

#[test]
fn unknown_tags_are_violations() {
    assert!(ManagerCommand::parse("master hello").is_err());
    assert!(ManagerCommand::parse("wq_master x").is_err());
    assert!(ManagerCommand::parse("task notanumber").is_err());
    assert!(ManagerCommand::parse("file missing_args").is_err());
}

async fn feed(lines: &str) -> Link {
    let (mut tx, rx) = tokio::io::duplex(1 << 16);
    use tokio::io::AsyncWriteExt;
    tx.write_all(lines.as_bytes()).await.unwrap();
    // Keep the write half alive past the reads by leaking it into a task.
    tokio::spawn(async move {
        let mut tx = tx;
        let _ = tx.flush().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    Link::from_stream(rx)
}

#[tokio::test]
async fn task_block_round_trip() {
    let mut link = feed(
        "category simulate\n\
         cmd 10\necho hello\n\
         infile in.dat in.dat 0\n\
         outfile out.dat out.dat 0\n\
         dir scratch\n\
         cores 1\n\
         memory 10\n\
         disk 10\n\
         gpus 0\n\
         wall_time 30\n\
         env 7\nFOO=bar\n\
         env 4\nGONE\n\
         end\n",
    )
    .await;

    let task = read_task_block(&mut link, 7, soon()).await.unwrap();
    assert_eq!(task.task_id, 7);
    assert_eq!(task.command, "echo hello");
    assert_eq!(task.category.as_deref(), Some("simulate"));
    assert_eq!(task.input_mounts.len(), 1);
    assert_eq!(task.input_mounts[0].cached_name, "in.dat");
    assert_eq!(task.output_mounts[0].remote_name, "out.dat");
    assert_eq!(task.empty_dirs, vec!["scratch".to_owned()]);
    assert_eq!(task.resources.cores, 1);
    assert_eq!(task.resources.memory, 10);
    assert_eq!(task.resources.wall_time, 30);
    assert_eq!(
        task.env,
        vec![
            ("FOO".to_owned(), Some("bar".to_owned())),
            ("GONE".to_owned(), None),
        ]
    );
}

#[tokio::test]
async fn unknown_task_attribute_is_violation() {
    let mut link = feed("cmd 4\ntrue\nbogus_attribute 1\nend\n").await;
    match read_task_block(&mut link, 1, soon()).await {
        Err(LinkError::Protocol(_)) => {}
        other => panic!("expected protocol violation, got {other:?}"),
    }
}

#[tokio::test]
async fn library_exclusivity_is_enforced() {
    let mut link = feed(
        "cmd 4\ntrue\nneeds_library libA\nprovides_library libA\nend\n",
    )
    .await;
    assert!(read_task_block(&mut link, 1, soon()).await.is_err());
}

#[test]
fn fully_unspecified_resources_claim_the_worker() {
    let whole = WorkerTotals {
        cores: 8,
        memory: 16_000,
        disk: 100_000,
        gpus: 2,
    };
    let mut resources = Resources::default();
    resources.normalize(&whole);
    assert_eq!(resources.cores, 8);
    assert_eq!(resources.memory, 16_000);
    assert_eq!(resources.disk, 100_000);
    assert_eq!(resources.gpus, 2);
}

#[test]
fn partially_specified_resources_zero_the_rest() {
    let whole = WorkerTotals {
        cores: 8,
        memory: 16_000,
        disk: 100_000,
        gpus: 2,
    };
    let mut resources = Resources {
        cores: 2,
        ..Resources::default()
    };
    resources.normalize(&whole);
    assert_eq!(resources.cores, 2);
    assert_eq!(resources.memory, 0);
    assert_eq!(resources.disk, 0);
    assert_eq!(resources.gpus, 0);
}
