// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;
use std::time::Duration;

use store::{Store, Trash};
use task_executor::Executor;
use tokio::time::Instant;
use wire::Link;

use super::{AbortState, SessionEnd, Worker};
use crate::options;
use crate::resources::ManualResources;
use crate::workspace::Workspace;

struct Harness {
    worker: Worker,
    store: Store,
    trash: Trash,
    manager: Link,
    worker_link: Link,
    scratch: tempfile::TempDir,
}

fn harness() -> Harness {
    let scratch = tempfile::tempdir().unwrap();
    let mut opts = options::parse(["vine_worker", "localhost", "1"]).unwrap();
    opts.manual = ManualResources {
        cores: Some(4),
        memory: Some(1000),
        disk: Some(10_000),
        gpus: Some(2),
        wall_time_secs: None,
    };
    opts.workdir = Some(scratch.path().to_owned());

    let executor = Executor::new();
    let workspace = Workspace::create(opts.workdir.as_deref()).unwrap();
    let (store, trash) = workspace.prepare(&executor, None).unwrap();
    let abort = Arc::new(AbortState::new());
    let mut worker = Worker::new(opts, executor, workspace, abort);
    worker.resources.force_next();

    let (manager_side, worker_side) = tokio::io::duplex(1 << 20);
    Harness {
        worker,
        store,
        trash,
        manager: Link::from_stream(manager_side),
        worker_link: Link::from_stream(worker_side),
        scratch,
    }
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

async fn send(link: &mut Link, text: &str) {
    link.write_all(text.as_bytes(), soon()).await.unwrap();
}

/// Read protocol lines, skipping the asynchronous chatter, until one starts with `prefix`.
async fn expect_line(link: &mut Link, prefix: &str) -> String {
    loop {
        let line = link.read_line(soon()).await.unwrap();
        if line.starts_with(prefix) {
            return line;
        }
        // A cache-invalid header is followed by a payload that must be drained to stay in
        // sync; anything else is a plain line.
        if let Some(rest) = line.strip_prefix("cache-invalid ") {
            let length: usize = rest.split_ascii_whitespace().nth(1).unwrap().parse().unwrap();
            let mut payload = vec![0_u8; length];
            link.read_exact(&mut payload, soon()).await.unwrap();
        }
    }
}

struct ResultRecord {
    code: u32,
    exit: i32,
    stdout: Vec<u8>,
    task_id: i64,
}

async fn read_result(link: &mut Link) -> ResultRecord {
    let line = expect_line(link, "result ").await;
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    assert_eq!(fields.len(), 7, "bad result line: {line}");
    let stdout_len: usize = fields[3].parse().unwrap();
    let mut stdout = vec![0_u8; stdout_len];
    link.read_exact(&mut stdout, soon()).await.unwrap();
    ResultRecord {
        code: fields[1].parse().unwrap(),
        exit: fields[2].parse().unwrap(),
        stdout,
        task_id: fields[6].parse().unwrap(),
    }
}

#[tokio::test]
async fn trivial_task_round_trip() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let manager = async {
        let link = &mut h.manager;
        send(
            link,
            "task 1\ncmd 10\necho hello\ncores 1\nmemory 10\ndisk 10\ngpus 0\nend\n",
        )
        .await;
        expect_line(link, "available_results").await;
        send(link, "send_results 1\n").await;

        let result = read_result(link).await;
        assert_eq!(result.task_id, 1);
        assert_eq!(result.code, 0);
        assert_eq!(result.exit, 0);
        assert_eq!(result.stdout, b"hello\n");
        expect_line(link, "end").await;

        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
}

#[tokio::test]
async fn input_file_staging_and_output_harvest() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let fetched_dir = tempfile::tempdir().unwrap();
    let fetched_path = fetched_dir.path().to_owned();
    let manager = async {
        let link = &mut h.manager;
        send(link, "file in.dat 5 0644\nhello").await;
        send(
            link,
            "task 2\ncmd 20\ncat in.dat > out.dat\ninfile in.dat in.dat 0\noutfile out.dat out.dat 0\nend\n",
        )
        .await;

        expect_line(link, "available_results").await;
        send(link, "send_results 1\n").await;
        let result = read_result(link).await;
        assert_eq!(result.task_id, 2);
        assert_eq!(result.code, 0);
        expect_line(link, "end").await;

        // The harvested output is now served out of the cache.
        send(link, "get out.dat\n").await;
        match wire::transfer::get_item(link, &fetched_path, soon()).await.unwrap() {
            wire::transfer::Received::Item { name, total_size } => {
                assert_eq!(name, "out.dat");
                assert_eq!(total_size, 5);
            }
            other => panic!("expected the output file, got {other:?}"),
        }

        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
    assert_eq!(
        std::fs::read(fetched_dir.path().join("out.dat")).unwrap(),
        b"hello"
    );
}

#[tokio::test]
async fn missing_input_fails_without_execution() {
    let mut h = harness();
    let canary = h.scratch.path().join("ran");
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let command = format!("touch {}", canary.display());
    let manager = async {
        let link = &mut h.manager;
        send(
            link,
            &format!(
                "task 3\ncmd {}\n{command}\ninfile never.dat never.dat 0\nend\n",
                command.len()
            ),
        )
        .await;

        expect_line(link, "available_results").await;
        send(link, "send_results 1\n").await;
        let result = read_result(link).await;
        assert_eq!(result.task_id, 3);
        assert_eq!(result.code, 1); // INPUT_MISSING
        assert_eq!(result.exit, 1);
        expect_line(link, "end").await;
        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
    assert!(!canary.exists(), "the command must not have executed");
}

#[tokio::test]
async fn wall_time_overrun_is_killed() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let manager = async {
        let link = &mut h.manager;
        send(
            link,
            "task 4\ncmd 8\nsleep 30\ncores 1\nwall_time 2\nend\n",
        )
        .await;
        expect_line(link, "available_results").await;
        send(link, "send_results 1\n").await;
        let result = read_result(link).await;
        assert_eq!(result.task_id, 4);
        assert_eq!(result.code, 4); // MAX_WALL_TIME
        assert_eq!(result.exit, libc::SIGKILL);
        expect_line(link, "end").await;
        send(link, "release\n").await;
    };

    let started = std::time::Instant::now();
    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
    // Killed promptly, not after the 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn unfittable_task_is_forsaken() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let manager = async {
        let link = &mut h.manager;
        send(link, "task 5\ncmd 4\ntrue\ncores 100\nend\n").await;
        expect_line(link, "available_results").await;
        send(link, "send_results 1\n").await;
        let result = read_result(link).await;
        assert_eq!(result.task_id, 5);
        assert_eq!(result.code, 6); // FORSAKEN
        expect_line(link, "end").await;
        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
}

#[tokio::test]
async fn cache_entries_are_reused_across_tasks() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let manager = async {
        let link = &mut h.manager;
        // One file message serves both tasks.
        send(link, "file big 4 0644\nbulk").await;
        send(link, "task 6\ncmd 7\ncat big\ninfile big big 0\nend\n").await;
        send(link, "task 7\ncmd 7\ncat big\ninfile big big 0\nend\n").await;

        expect_line(link, "available_results").await;
        send(link, "send_results 2\n").await;
        let first = read_result(link).await;
        assert_eq!(first.code, 0);
        assert_eq!(first.stdout, b"bulk");
        // The second may complete within the same batch or the next.
        let second = loop {
            let line = link.read_line(soon()).await.unwrap();
            if line == "end" {
                expect_line(link, "available_results").await;
                send(link, "send_results 1\n").await;
            }
            if line.starts_with("result ") {
                let fields: Vec<&str> = line.split_ascii_whitespace().collect();
                let stdout_len: usize = fields[3].parse().unwrap();
                let mut stdout = vec![0_u8; stdout_len];
                link.read_exact(&mut stdout, soon()).await.unwrap();
                break (fields[1].parse::<u32>().unwrap(), stdout);
            }
        };
        assert_eq!(second.0, 0);
        assert_eq!(second.1, b"bulk");

        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
}

#[tokio::test]
async fn kill_all_zeroes_the_accounting() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let manager = async {
        let link = &mut h.manager;
        send(
            link,
            "task 8\ncmd 8\nsleep 30\ncores 2\nmemory 100\ngpus 1\nend\n",
        )
        .await;
        send(
            link,
            "task 9\ncmd 8\nsleep 30\ncores 1\nmemory 100\ngpus 1\nend\n",
        )
        .await;
        // Give both a moment to start, then reclaim everything.
        tokio::time::sleep(Duration::from_secs(1)).await;
        send(link, "kill -1\n").await;
        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);

    assert_eq!(h.worker.cores_allocated, 0);
    assert_eq!(h.worker.memory_allocated, 0);
    assert_eq!(h.worker.disk_allocated, 0);
    assert_eq!(h.worker.gpus_allocated, 0);
    assert!(h.worker.gpus.all_free());
    assert!(h.worker.procs.is_empty());
}

#[tokio::test]
async fn function_tasks_run_against_a_resident_library() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    // A shell stand-in for a library: announce the handshake, serve one invocation, linger.
    let library_cmd = "printf '16\\n{\"name\": \"libx\"}'; read header; read payload; printf 'processed\\n'; sleep 30";
    let function_cmd = "fn";

    let manager = async {
        let link = &mut h.manager;
        send(
            link,
            &format!(
                "task 10\ncmd {}\n{library_cmd}\ncores 1\nprovides_library libx\nend\n",
                library_cmd.len()
            ),
        )
        .await;
        expect_line(link, "info library-update 10 1").await;

        send(link, "file fnin 3 0644\nabc").await;
        send(
            link,
            &format!(
                "task 11\ncmd {}\n{function_cmd}\ncores 1\ninfile fnin infile 0\nneeds_library libx\nend\n",
                function_cmd.len()
            ),
        )
        .await;

        expect_line(link, "available_results").await;
        send(link, "send_results 1\n").await;
        let result = read_result(link).await;
        assert_eq!(result.task_id, 11);
        assert_eq!(result.code, 0);
        assert_eq!(result.stdout, b"processed");
        expect_line(link, "end").await;

        send(link, "kill -1\n").await;
        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
}

#[tokio::test]
async fn library_with_a_wrong_handshake_is_killed() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    // Announces a different name than the task claims to provide.
    let library_cmd = "printf '20\\n{\"name\": \"impostor\"}'; sleep 30";
    let manager = async {
        let link = &mut h.manager;
        send(
            link,
            &format!(
                "task 12\ncmd {}\n{library_cmd}\ncores 1\nprovides_library libx\nend\n",
                library_cmd.len()
            ),
        )
        .await;

        expect_line(link, "info library-update 12 2").await;
        expect_line(link, "available_results").await;
        send(link, "send_results 1\n").await;
        let result = read_result(link).await;
        assert_eq!(result.task_id, 12);
        assert_eq!(result.code, 7); // KILLED
        assert!(!result.stdout.is_empty(), "expected a descriptive error");
        expect_line(link, "end").await;
        send(link, "release\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::Released);
}

#[tokio::test]
async fn unknown_commands_close_the_session() {
    let mut h = harness();
    let serve = h
        .worker
        .work_for_manager(&mut h.worker_link, &h.store, &h.trash);

    let manager = async {
        let link = &mut h.manager;
        send(link, "wq_master legacy gibberish\n").await;
    };

    let (end, ()) = tokio::join!(serve, manager);
    assert_eq!(end, SessionEnd::ManagerLeft);
}
