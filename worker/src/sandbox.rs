// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Staging between the cache and per-task sandboxes. Inputs hard-link in (cheap, and safe
//! because READY cache entries are immutable); outputs rename out, falling back to a copy
//! when the rename crosses filesystems.

use std::path::{Component, Path, PathBuf};

use log::debug;
use protocol::Mount;
use store::{CacheLevel, EnsureStatus, Store};

use crate::process::TaskProcess;

/// Whether a process can start now, must wait for materializations, or is doomed.
#[derive(Debug, PartialEq, Eq)]
pub enum Stagein {
    Ready,
    NeedsWait,
    Failed(String),
}

///
/// A protocol-supplied name is only usable if it stays inside the directory it is resolved
/// against: no absolute paths, no `..`, nothing but normal components.
///
pub fn is_safe_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && !path.is_absolute()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

///
/// Drive every input of the process toward READY. All inputs are prodded, not just the
/// first unready one, so their materializations overlap.
///
pub fn inputs_status(process: &TaskProcess, store: &Store) -> Stagein {
    let mut status = Stagein::Ready;
    for mount in &process.task.input_mounts {
        if !is_safe_relative(&mount.remote_name) || !is_safe_relative(&mount.cached_name) {
            return Stagein::Failed(format!("unsafe mount name: {}", mount.remote_name));
        }
        match store.ensure(&mount.cached_name, mount.flags) {
            EnsureStatus::Ready => {}
            EnsureStatus::Processing => {
                if status == Stagein::Ready {
                    status = Stagein::NeedsWait;
                }
            }
            EnsureStatus::Failed | EnsureStatus::Unknown => {
                return Stagein::Failed(format!("input {} is not available", mount.cached_name));
            }
        }
    }
    status
}

///
/// Build the sandbox for a process whose inputs are all READY: scratch dir, empty dirs, and
/// one link per input mount.
///
pub fn stagein(process: &TaskProcess, store: &Store, symlink_fallback: bool) -> Result<(), String> {
    std::fs::create_dir_all(process.tmp_dir())
        .map_err(|e| format!("could not create sandbox scratch dir: {e}"))?;

    for dir in &process.task.empty_dirs {
        if !is_safe_relative(dir) {
            return Err(format!("unsafe empty-dir path: {dir}"));
        }
        std::fs::create_dir_all(process.sandbox.join(dir))
            .map_err(|e| format!("could not create empty dir {dir}: {e}"))?;
    }

    for mount in &process.task.input_mounts {
        let cache_path = store.full_path(&mount.cached_name);
        let sandbox_path = process.sandbox.join(&mount.remote_name);
        if let Some(parent) = sandbox_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("could not create mount parent: {e}"))?;
        }
        debug!(
            "input: link {} -> {}",
            cache_path.display(),
            sandbox_path.display()
        );
        if mount.flags.symlink() {
            std::os::unix::fs::symlink(&cache_path, &sandbox_path).map_err(|e| {
                format!("could not symlink {} into sandbox: {e}", mount.cached_name)
            })?;
        } else {
            link_recursive(&cache_path, &sandbox_path, symlink_fallback).map_err(|e| {
                format!("could not link {} into sandbox: {e}", mount.cached_name)
            })?;
        }
    }

    Ok(())
}

///
/// Harvest outputs into the cache. Deliberately does not abort on a missing output: the task
/// still completes and reports, and the manager deals with what is missing. Returns false if
/// any declared output did not appear.
///
pub fn stageout(process: &TaskProcess, store: &Store) -> bool {
    let mut all_present = true;
    for mount in &process.task.output_mounts {
        if !transfer_output(process, mount, store) {
            all_present = false;
        }
    }
    all_present
}

fn transfer_output(process: &TaskProcess, mount: &Mount, store: &Store) -> bool {
    if !is_safe_relative(&mount.cached_name) || !is_safe_relative(&mount.remote_name) {
        return false;
    }
    let sandbox_path = process.sandbox.join(&mount.remote_name);
    let cache_path = store.full_path(&mount.cached_name);

    let meta = match std::fs::symlink_metadata(&sandbox_path) {
        Ok(meta) => meta,
        Err(_) => {
            debug!(
                "output: task {} did not create {}",
                process.task_id(),
                mount.remote_name
            );
            return false;
        }
    };

    debug!(
        "output: moving {} to {}",
        sandbox_path.display(),
        cache_path.display()
    );
    if std::fs::rename(&sandbox_path, &cache_path).is_err() {
        // Rename fails across filesystems; fall back to a full copy.
        if let Err(e) = copy_recursive(&sandbox_path, &cache_path) {
            debug!(
                "could not move or copy output {}: {e}",
                mount.remote_name
            );
            return false;
        }
    }

    let size = match std::fs::metadata(&cache_path) {
        Ok(meta) if meta.is_dir() => store::disk::measure(&cache_path).0,
        Ok(meta) => meta.len(),
        Err(_) => return false,
    };
    let mode = std::os::unix::fs::PermissionsExt::mode(&meta.permissions()) & 0o7777;
    store.add_file(&mount.cached_name, size, mode, CacheLevel::Workflow);
    store.announce(&mount.cached_name);
    true
}

///
/// Link a cache entry into a sandbox: hard links for files (with an optional symlink
/// fallback for filesystems that refuse), recreated directories in between.
///
pub fn link_recursive(src: &Path, dst: &Path, symlink_fallback: bool) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            link_recursive(&entry.path(), &dst.join(entry.file_name()), symlink_fallback)?;
        }
        Ok(())
    } else if meta.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)
    } else {
        match std::fs::hard_link(src, dst) {
            Ok(()) => Ok(()),
            Err(e) if symlink_fallback => {
                debug!("hard link failed ({e}); falling back to symlink");
                std::os::unix::fs::symlink(absolute(src)?, dst)
            }
            Err(e) => Err(e),
        }
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else if meta.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)
    } else {
        std::fs::copy(src, dst).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::is_safe_relative;

    #[test]
    fn traversal_names_are_unsafe() {
        assert!(is_safe_relative("data/input.txt"));
        assert!(is_safe_relative("plain"));
        assert!(!is_safe_relative("../escape"));
        assert!(!is_safe_relative("a/../../escape"));
        assert!(!is_safe_relative("/etc/passwd"));
        assert!(!is_safe_relative(""));
    }
}
