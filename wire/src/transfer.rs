// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The streaming directory transfer: a file tree is sent as a self-describing stream of
//! `file`/`symlink`/`dir`/`error` items, so that large trees move without per-entry round
//! trips.
//!
//! ```text
//! stream    := item*
//! item      := file | symlink | dir | error
//! file      := "file "  NAME " " SIZE " 0" OCTAL_MODE "\n" <SIZE bytes>
//! symlink   := "symlink " NAME " " LEN "\n" <LEN bytes of target path>
//! dir       := "dir " NAME " 0\n" stream "end\n"
//! error     := "error " NAME " " ERRNO "\n"
//! ```
//!
//! Names are URL-encoded and must not contain `..` segments or absolute prefixes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use tokio::time::Instant;

use crate::{url_decode, url_encode, Link, LinkError};

/// What the sender is willing to ship for a `getfile`-style request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    Any,
    FileOnly,
}

/// One received item, as seen by the caller pulling from the stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// A file, directory, or symlink landed under the destination; `total_size` sums file and
    /// symlink bytes recursively.
    Item { name: String, total_size: u64 },
    /// The `end` marker of the enclosing directory stream.
    End,
    /// The sender could not access the named entry; the stream continues.
    Error { name: String, errno: i32 },
}

/// Reject any name that would escape the destination directory.
fn checked_component(name: &str) -> Result<String, LinkError> {
    let decoded = url_decode(name).map_err(LinkError::Protocol)?;
    let path = Path::new(&decoded);
    if decoded.is_empty()
        || path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(LinkError::Protocol(format!(
            "unsafe name in transfer: {decoded:?}"
        )));
    }
    Ok(decoded)
}

fn errno_of(e: &std::io::Error) -> i32 {
    // EIO when the source error carries no errno.
    e.raw_os_error().unwrap_or(5)
}

///
/// Send one filesystem entry (recursively, for directories). Inability to access an entry is
/// reported in-stream as an `error` item and is not a failure of the transfer; only a dead
/// link is.
///
pub fn put_item<'a>(
    link: &'a mut Link,
    full_path: &'a Path,
    relative_name: &'a str,
    mode: TransferMode,
    stop: Instant,
) -> BoxFuture<'a, Result<(), LinkError>> {
    async move {
        let name_encoded = url_encode(relative_name);

        let info = match tokio::fs::symlink_metadata(full_path).await {
            Ok(info) => info,
            Err(e) => {
                link.write_line(&format!("error {name_encoded} {}", errno_of(&e)), stop)
                    .await?;
                return Ok(());
            }
        };
        let unix_mode = info.permissions().mode() & 0o777;

        if info.is_file() {
            let mut file = match tokio::fs::File::open(full_path).await {
                Ok(file) => file,
                Err(e) => {
                    link.write_line(&format!("error {name_encoded} {}", errno_of(&e)), stop)
                        .await?;
                    return Ok(());
                }
            };
            let length = info.len();
            link.write_line(
                &format!("file {name_encoded} {length} 0{unix_mode:o}"),
                stop,
            )
            .await?;
            link.stream_from_file(&mut file, length, stop).await?;
        } else if mode == TransferMode::FileOnly {
            // The caller only wants a file, but the path is something else.
            let errno = if info.is_dir() { 21 } else { 22 };
            link.write_line(&format!("error {name_encoded} {errno}"), stop)
                .await?;
        } else if info.is_dir() {
            link.write_line(&format!("dir {name_encoded} 0"), stop)
                .await?;
            let mut entries = match tokio::fs::read_dir(full_path).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("could not list {}: {e}", full_path.display());
                    link.write_line("end", stop).await?;
                    return Ok(());
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(LinkError::Io)? {
                let sub_name = entry.file_name().to_string_lossy().into_owned();
                put_item(link, &entry.path(), &sub_name, mode, stop).await?;
            }
            link.write_line("end", stop).await?;
        } else if info.file_type().is_symlink() {
            match tokio::fs::read_link(full_path).await {
                Ok(target) => {
                    let target = target.as_os_str().to_string_lossy().into_owned();
                    link.write_line(
                        &format!("symlink {name_encoded} {}", target.len()),
                        stop,
                    )
                    .await?;
                    link.write_all(target.as_bytes(), stop).await?;
                }
                Err(e) => {
                    link.write_line(&format!("error {name_encoded} {}", errno_of(&e)), stop)
                        .await?;
                }
            }
        } else {
            // Sockets, fifos, devices: not transferable.
            link.write_line(&format!("error {name_encoded} 22"), stop)
                .await?;
        }

        Ok(())
    }
    .boxed()
}

/// Receive exactly `length` bytes into `dest`, then apply the transmitted mode.
pub async fn get_file_payload(
    link: &mut Link,
    dest: &Path,
    length: u64,
    unix_mode: u32,
    stop: Instant,
) -> Result<(), LinkError> {
    let mut file = tokio::fs::File::create(dest).await?;
    link.stream_to_file(&mut file, length, stop).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(unix_mode & 0o777)).await?;
    Ok(())
}

async fn get_symlink_payload(
    link: &mut Link,
    dest: &Path,
    length: usize,
    stop: Instant,
) -> Result<(), LinkError> {
    let mut target = vec![0_u8; length];
    link.read_exact(&mut target, stop).await?;
    let target = String::from_utf8(target)
        .map_err(|_| LinkError::Protocol("non-utf8 symlink target".to_owned()))?;
    tokio::fs::symlink(&target, dest).await?;
    Ok(())
}

fn get_dir_stream<'a>(
    link: &'a mut Link,
    dest: &'a Path,
    stop: Instant,
) -> BoxFuture<'a, Result<u64, LinkError>> {
    async move {
        tokio::fs::create_dir(dest).await?;
        let mut total = 0_u64;
        loop {
            match get_item(link, dest, stop).await? {
                Received::Item { total_size, .. } => total += total_size,
                Received::End => return Ok(total),
                Received::Error { name, errno } => {
                    return Err(LinkError::Protocol(format!(
                        "sender failed on {name}: errno {errno}"
                    )));
                }
            }
        }
    }
    .boxed()
}

/// Receive the contents of a directory whose `dir NAME` header the caller already consumed:
/// items stream into a freshly created `dest` until the matching `end`. Returns the summed
/// file and symlink bytes.
pub async fn get_dir(link: &mut Link, dest: &Path, stop: Instant) -> Result<u64, LinkError> {
    get_dir_stream(link, dest, stop).await
}

///
/// Receive one item of unknown type into `dest_dir`. `Received::End` is only meaningful inside
/// a directory stream; at top level it is the caller's protocol error to handle.
///
pub async fn get_item(
    link: &mut Link,
    dest_dir: &Path,
    stop: Instant,
) -> Result<Received, LinkError> {
    let line = link.read_line(stop).await?;
    let mut words = line.split_ascii_whitespace();
    let tag = words.next().unwrap_or("");

    match tag {
        "file" => {
            let (name, size, unix_mode) = match (words.next(), words.next(), words.next()) {
                (Some(name), Some(size), Some(mode)) => {
                    let size = size
                        .parse::<u64>()
                        .map_err(|_| LinkError::Protocol(format!("bad file size: {line}")))?;
                    let mode = u32::from_str_radix(mode, 8)
                        .map_err(|_| LinkError::Protocol(format!("bad file mode: {line}")))?;
                    (checked_component(name)?, size, mode)
                }
                _ => return Err(LinkError::Protocol(format!("bad file item: {line}"))),
            };
            get_file_payload(link, &dest_dir.join(&name), size, unix_mode, stop).await?;
            Ok(Received::Item {
                name,
                total_size: size,
            })
        }
        "symlink" => {
            let (name, length) = match (words.next(), words.next()) {
                (Some(name), Some(length)) => {
                    let length = length
                        .parse::<usize>()
                        .map_err(|_| LinkError::Protocol(format!("bad symlink item: {line}")))?;
                    (checked_component(name)?, length)
                }
                _ => return Err(LinkError::Protocol(format!("bad symlink item: {line}"))),
            };
            get_symlink_payload(link, &dest_dir.join(&name), length, stop).await?;
            Ok(Received::Item {
                name,
                total_size: length as u64,
            })
        }
        "dir" => {
            let name = match words.next() {
                Some(name) => checked_component(name)?,
                None => return Err(LinkError::Protocol(format!("bad dir item: {line}"))),
            };
            let total_size = get_dir_stream(link, &dest_dir.join(&name), stop).await?;
            Ok(Received::Item { name, total_size })
        }
        "error" => {
            let (name, errno) = match (words.next(), words.next()) {
                (Some(name), Some(errno)) => (
                    url_decode(name).map_err(LinkError::Protocol)?,
                    errno.parse::<i32>().unwrap_or(0),
                ),
                _ => return Err(LinkError::Protocol(format!("bad error item: {line}"))),
            };
            debug!("peer could not send {name}: errno {errno}");
            Ok(Received::Error { name, errno })
        }
        "end" => Ok(Received::End),
        _ => Err(LinkError::Protocol(format!("unknown transfer item: {line}"))),
    }
}
