// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rand::Rng;
use task_executor::Executor;

///
/// Deletion staging. A file that is still open (a running executable, a half-served transfer)
/// cannot always be unlinked outright, but a rename of the whole tree is quick and atomic; the
/// actual unlink happens in the background afterwards.
///
#[derive(Clone)]
pub struct Trash {
    dir: PathBuf,
    executor: Executor,
}

impl Trash {
    pub fn setup(dir: PathBuf, executor: Executor) -> Result<Trash, String> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("failed to create trash dir {}: {e}", dir.display()))?;
        let trash = Trash { dir, executor };
        trash.empty();
        Ok(trash)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move the given path into the trash and delete it in the background. Missing paths are
    /// not an error.
    pub fn trash(&self, path: &Path) {
        if !path.exists() && path.symlink_metadata().is_err() {
            return;
        }
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".to_owned());
        let staged = self
            .dir
            .join(format!("{base}.{:016x}", rand::rng().random::<u64>()));
        match std::fs::rename(path, &staged) {
            Ok(()) => {
                let _background_cleanup = self.executor.native_spawn_blocking(move || {
                    remove_any(&staged);
                });
            }
            Err(e) => {
                // Rename can fail across filesystems; fall back to deleting in place.
                debug!("could not stage {} into trash: {e}", path.display());
                let path = path.to_owned();
                let _background_cleanup = self.executor.native_spawn_blocking(move || {
                    remove_any(&path);
                });
            }
        }
    }

    /// Delete everything currently staged.
    pub fn empty(&self) {
        let dir = self.dir.clone();
        let _background_cleanup = self.executor.native_spawn_blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("could not list trash dir {}: {e}", dir.display());
                    return;
                }
            };
            for entry in entries.flatten() {
                remove_any(&entry.path());
            }
        });
    }
}

fn remove_any(path: &Path) {
    let result = match path.symlink_metadata() {
        Ok(info) if info.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!("could not delete {}: {e}", path.display());
    }
}
