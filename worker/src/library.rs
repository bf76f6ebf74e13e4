// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Library tasks are long-lived child processes that serve repeated function invocations
//! over their stdin/stdout pipes. A function task does not exec at all: the worker frames its
//! input down the library's pipe and writes the one-line response to the function's output
//! file.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};

/// A library that has not produced its startup message within this budget is broken.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-invocation budget.
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(300);

pub struct LibraryState {
    pub name: String,
    pub task_id: i64,
    /// Set once the startup handshake has been verified; no function is dispatched before.
    ready: AtomicBool,
    pub functions_running: AtomicUsize,
    pub max_functions_running: usize,
    handles: tokio::sync::Mutex<Handles>,
}

struct Handles {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl LibraryState {
    pub fn new(
        name: String,
        task_id: i64,
        max_functions_running: usize,
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> LibraryState {
        LibraryState {
            name,
            task_id,
            ready: AtomicBool::new(false),
            functions_running: AtomicUsize::new(0),
            max_functions_running,
            handles: tokio::sync::Mutex::new(Handles {
                stdin,
                stdout: BufReader::new(stdout),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.is_ready() && self.functions_running.load(Ordering::SeqCst) < self.max_functions_running
    }

    ///
    /// Read the startup message: one decimal length line, then that many bytes of JSON whose
    /// `name` must match the label the task claimed to provide. Only then may functions be
    /// dispatched here.
    ///
    pub async fn wait_for_startup(&self) -> Result<(), String> {
        let handshake = async {
            let mut handles = self.handles.lock().await;

            let mut length_line = String::new();
            handles
                .stdout
                .read_line(&mut length_line)
                .await
                .map_err(|e| format!("could not read library startup message: {e}"))?;
            let length: usize = length_line
                .trim()
                .parse()
                .map_err(|_| format!("bad library startup length: {length_line:?}"))?;

            let mut message = vec![0_u8; length];
            handles
                .stdout
                .read_exact(&mut message)
                .await
                .map_err(|e| format!("could not read library startup message: {e}"))?;

            let parsed: serde_json::Value = serde_json::from_slice(&message)
                .map_err(|e| format!("library startup message is not json: {e}"))?;
            let name = parsed
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "library startup message has no name".to_owned())?;
            if name != self.name {
                return Err(format!(
                    "library announced name {name:?} instead of {:?}",
                    self.name
                ));
            }
            Ok(())
        };

        match tokio::time::timeout(STARTUP_TIMEOUT, handshake).await {
            Ok(Ok(())) => {
                debug!("library {} is ready", self.name);
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!(
                "library {} sent no startup message within {}s",
                self.name,
                STARTUP_TIMEOUT.as_secs()
            )),
        }
    }

    ///
    /// One function call: frame `FUNCTION LENGTH SANDBOX` plus the input bytes down the
    /// library's stdin, and return the single response line from its stdout. The pipe pair
    /// is locked for the duration, so concurrent invocations serialize at the pipe.
    ///
    pub async fn invoke(
        &self,
        function_name: &str,
        input: &[u8],
        sandbox: &std::path::Path,
    ) -> Result<String, String> {
        let exchange = async {
            let mut handles = self.handles.lock().await;

            let header = format!(
                "{function_name} {} {}\n",
                input.len(),
                sandbox.display()
            );
            handles
                .stdin
                .write_all(header.as_bytes())
                .await
                .map_err(|e| format!("could not write to library {}: {e}", self.name))?;
            handles
                .stdin
                .write_all(input)
                .await
                .map_err(|e| format!("could not write to library {}: {e}", self.name))?;
            handles
                .stdin
                .write_all(b"\n")
                .await
                .map_err(|e| format!("could not write to library {}: {e}", self.name))?;
            handles
                .stdin
                .flush()
                .await
                .map_err(|e| format!("could not write to library {}: {e}", self.name))?;

            let mut response = String::new();
            let read = handles
                .stdout
                .read_line(&mut response)
                .await
                .map_err(|e| format!("could not read from library {}: {e}", self.name))?;
            if read == 0 {
                return Err(format!("library {} closed its pipe", self.name));
            }
            if response.ends_with('\n') {
                response.pop();
            }
            Ok(response)
        };

        tokio::time::timeout(INVOCATION_TIMEOUT, exchange)
            .await
            .map_err(|_| format!("function call against library {} timed out", self.name))?
    }
}

///
/// Run one function task to completion: read its staged `infile`, invoke the library, and
/// leave the response in the function's output file.
///
pub async fn run_function(
    library: std::sync::Arc<LibraryState>,
    function_name: String,
    sandbox: std::path::PathBuf,
    output_file: std::path::PathBuf,
) -> Result<(), String> {
    let input = tokio::fs::read(sandbox.join("infile"))
        .await
        .map_err(|e| format!("function task has no infile: {e}"))?;
    let output = library.invoke(&function_name, &input, &sandbox).await?;
    tokio::fs::write(&output_file, output.as_bytes())
        .await
        .map_err(|e| format!("could not write function output: {e}"))?;
    Ok(())
}
