// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;
use std::time::Duration;

use task_executor::Executor;
use worker::options;
use worker::workspace::Workspace;
use worker::{AbortState, Worker};

fn main() {
    env_logger::init();

    let options = match options::parse(std::env::args()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("vine_worker: {e}");
            std::process::exit(1);
        }
    };

    // A severed manager link must surface as an error return, not a process kill.
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    };

    let cores = num_cpus::get();
    let executor = match Executor::new_owned(cores, cores * 4) {
        Ok(executor) => executor,
        Err(e) => {
            eprintln!("vine_worker: {e}");
            std::process::exit(1);
        }
    };

    let abort = Arc::new(AbortState::new());
    let exit_code = executor.block_on(run(options, executor.clone(), abort));
    executor.shutdown(Duration::from_secs(3));
    std::process::exit(exit_code);
}

async fn run(
    options: options::Options,
    executor: Executor,
    abort: Arc<AbortState>,
) -> i32 {
    // Abort signals drain the worker to a clean disconnect; the last one received is
    // reported to the manager as `info vacating SIG`. SIGUSR1/SIGUSR2 are included so batch
    // systems that signal before a hard kill still get a clean vacate.
    for signal in [
        tokio::signal::unix::SignalKind::interrupt(),
        tokio::signal::unix::SignalKind::terminate(),
        tokio::signal::unix::SignalKind::quit(),
        tokio::signal::unix::SignalKind::user_defined1(),
        tokio::signal::unix::SignalKind::user_defined2(),
    ] {
        let abort = abort.clone();
        match tokio::signal::unix::signal(signal) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        abort.set(signal.as_raw_value());
                    }
                });
            }
            Err(e) => {
                eprintln!("vine_worker: could not install signal handler: {e}");
                return 1;
            }
        }
    }

    let workspace = match Workspace::create(options.workdir.as_deref()) {
        Ok(workspace) => workspace,
        Err(e) => {
            eprintln!("vine_worker: {e}");
            return 1;
        }
    };
    if let Err(e) = workspace.check().await {
        eprintln!("vine_worker: {e}");
        eprintln!("vine_worker: use the --workdir switch to change where the workspace is created");
        return 1;
    }

    let mut worker = Worker::new(options.clone(), executor, workspace, abort);
    worker.add_features(&options.features);
    worker.run().await
}
