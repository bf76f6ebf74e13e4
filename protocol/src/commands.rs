// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use log::debug;
use tokio::time::Instant;
use wire::{url_decode, Link, LinkError};

use crate::{Mount, MountFlags, Task};

///
/// Every line a manager may send, parsed once at the boundary. An unrecognized tag is a
/// protocol violation and closes the link; there is no scanf-style fallthrough.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagerCommand {
    /// Followed by a block of task-attribute lines through `end`.
    Task { task_id: i64 },
    /// Followed by `size` bytes of file content to ingest into the cache.
    File { name: String, size: u64, mode: u32 },
    /// Followed by a recursive transfer stream to ingest into the cache.
    Dir { name: String },
    PutUrl {
        source: String,
        name: String,
        size: u64,
        mode: u32,
        transfer_id: String,
    },
    /// Followed by a task block describing the producer of `name`.
    MiniTask {
        mini_task_id: i64,
        name: String,
        size: u64,
        mode: u32,
    },
    Unlink { name: String },
    GetFile { name: String },
    Get { name: String },
    /// task_id of -1 kills everything.
    Kill { task_id: i64 },
    Release,
    Exit,
    Check,
    SendResults { count: u32 },
    /// The manager demands a password this worker was not given.
    AuthRequired,
}

fn decoded(word: &str) -> Result<String, String> {
    url_decode(word)
}

impl ManagerCommand {
    pub fn parse(line: &str) -> Result<ManagerCommand, String> {
        let mut words = line.split_ascii_whitespace();
        let tag = words.next().unwrap_or("");
        let args: Vec<&str> = words.collect();

        let arity = |n: usize| -> Result<(), String> {
            if args.len() == n {
                Ok(())
            } else {
                Err(format!("malformed command: {line}"))
            }
        };

        match tag {
            "task" => {
                arity(1)?;
                Ok(ManagerCommand::Task {
                    task_id: parse_i64(args[0], line)?,
                })
            }
            "file" => {
                arity(3)?;
                Ok(ManagerCommand::File {
                    name: decoded(args[0])?,
                    size: parse_u64(args[1], line)?,
                    mode: parse_octal(args[2], line)?,
                })
            }
            "dir" => {
                arity(1)?;
                Ok(ManagerCommand::Dir {
                    name: decoded(args[0])?,
                })
            }
            "puturl" => {
                arity(5)?;
                Ok(ManagerCommand::PutUrl {
                    source: decoded(args[0])?,
                    name: decoded(args[1])?,
                    size: parse_u64(args[2], line)?,
                    mode: parse_octal(args[3], line)?,
                    transfer_id: args[4].to_owned(),
                })
            }
            "mini_task" => {
                arity(4)?;
                Ok(ManagerCommand::MiniTask {
                    mini_task_id: parse_i64(args[0], line)?,
                    name: decoded(args[1])?,
                    size: parse_u64(args[2], line)?,
                    mode: parse_octal(args[3], line)?,
                })
            }
            "unlink" => {
                arity(1)?;
                Ok(ManagerCommand::Unlink {
                    name: decoded(args[0])?,
                })
            }
            "getfile" => {
                arity(1)?;
                Ok(ManagerCommand::GetFile {
                    name: decoded(args[0])?,
                })
            }
            "get" => {
                arity(1)?;
                Ok(ManagerCommand::Get {
                    name: decoded(args[0])?,
                })
            }
            "kill" => {
                arity(1)?;
                Ok(ManagerCommand::Kill {
                    task_id: parse_i64(args[0], line)?,
                })
            }
            "release" => Ok(ManagerCommand::Release),
            "exit" => Ok(ManagerCommand::Exit),
            "check" => Ok(ManagerCommand::Check),
            "send_results" => {
                arity(1)?;
                Ok(ManagerCommand::SendResults {
                    count: args[0]
                        .parse()
                        .map_err(|_| format!("malformed command: {line}"))?,
                })
            }
            "auth" => Ok(ManagerCommand::AuthRequired),
            _ => Err(format!("unknown command: {line}")),
        }
    }
}

fn parse_i64(word: &str, line: &str) -> Result<i64, String> {
    word.parse()
        .map_err(|_| format!("malformed command: {line}"))
}

fn parse_u64(word: &str, line: &str) -> Result<u64, String> {
    word.parse()
        .map_err(|_| format!("malformed command: {line}"))
}

fn parse_octal(word: &str, line: &str) -> Result<u32, String> {
    u32::from_str_radix(word, 8).map_err(|_| format!("malformed command: {line}"))
}

/// Read exactly `length` bytes of counted payload. A newline the sender appends after the
/// payload shows up as a blank attribute line, which the block reader tolerates.
async fn read_payload(link: &mut Link, length: usize, stop: Instant) -> Result<Vec<u8>, LinkError> {
    let mut payload = vec![0_u8; length];
    link.read_exact(&mut payload, stop).await?;
    Ok(payload)
}

///
/// Consume the attribute lines of a `task`/`mini_task` block through `end`, yielding the
/// described task. Unknown attribute lines are a protocol violation.
///
pub async fn read_task_block(
    link: &mut Link,
    task_id: i64,
    stop: Instant,
) -> Result<Task, LinkError> {
    let mut task = Task::new(task_id);

    loop {
        let line = link.read_line(stop).await?;
        if line == "end" {
            break;
        }

        let mut words = line.split_ascii_whitespace();
        let tag = words.next().unwrap_or("");
        let args: Vec<&str> = words.collect();

        match (tag, args.as_slice()) {
            ("category", [name]) => {
                task.category = Some((*name).to_owned());
            }
            ("cmd", [length]) => {
                let length: usize = length
                    .parse()
                    .map_err(|_| LinkError::Protocol(format!("bad task attribute: {line}")))?;
                let payload = read_payload(link, length, stop).await?;
                task.command = String::from_utf8(payload)
                    .map_err(|_| LinkError::Protocol("non-utf8 command".to_owned()))?;
                debug!("rx: {}", task.command);
            }
            ("needs_library", [name]) => {
                task.needs_library = Some((*name).to_owned());
            }
            ("provides_library", [name]) => {
                task.provides_library = Some((*name).to_owned());
            }
            ("infile", [cached, remote, flags]) => {
                task.input_mounts
                    .push(parse_mount(cached, remote, flags, &line)?);
            }
            ("outfile", [cached, remote, flags]) => {
                task.output_mounts
                    .push(parse_mount(cached, remote, flags, &line)?);
            }
            ("dir", [path]) => {
                task.empty_dirs
                    .push(url_decode(path).map_err(LinkError::Protocol)?);
            }
            ("cores", [n]) => task.resources.cores = parse_attr_i64(n, &line)?,
            ("memory", [n]) => task.resources.memory = parse_attr_i64(n, &line)?,
            ("disk", [n]) => task.resources.disk = parse_attr_i64(n, &line)?,
            ("gpus", [n]) => task.resources.gpus = parse_attr_i64(n, &line)?,
            ("wall_time", [n]) => {
                task.resources.wall_time = n
                    .parse()
                    .map_err(|_| LinkError::Protocol(format!("bad task attribute: {line}")))?;
            }
            ("end_time", [n]) => {
                task.resources.end = n
                    .parse()
                    .map_err(|_| LinkError::Protocol(format!("bad task attribute: {line}")))?;
            }
            ("env", [length]) => {
                let length: usize = length
                    .parse()
                    .map_err(|_| LinkError::Protocol(format!("bad task attribute: {line}")))?;
                let payload = read_payload(link, length, stop).await?;
                let payload = String::from_utf8(payload)
                    .map_err(|_| LinkError::Protocol("non-utf8 env entry".to_owned()))?;
                match payload.split_once('=') {
                    Some((name, value)) => {
                        task.env.push((name.to_owned(), Some(value.to_owned())));
                    }
                    None => task.env.push((payload, None)),
                }
            }
            // Tolerate a blank separator after a counted payload.
            ("", []) => {}
            _ => {
                return Err(LinkError::Protocol(format!("bad task attribute: {line}")));
            }
        }
    }

    task.validate().map_err(LinkError::Protocol)?;
    Ok(task)
}

fn parse_mount(cached: &str, remote: &str, flags: &str, line: &str) -> Result<Mount, LinkError> {
    let bits: u32 = flags
        .parse()
        .map_err(|_| LinkError::Protocol(format!("bad task attribute: {line}")))?;
    Ok(Mount {
        cached_name: url_decode(cached).map_err(LinkError::Protocol)?,
        remote_name: url_decode(remote).map_err(LinkError::Protocol)?,
        flags: MountFlags::from_wire(bits),
    })
}

fn parse_attr_i64(word: &str, line: &str) -> Result<i64, LinkError> {
    word.parse()
        .map_err(|_| LinkError::Protocol(format!("bad task attribute: {line}")))
}
