// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The worker's on-disk world:
//!
//! ```text
//! $workspace/
//!   cache/      manager-delivered and downloaded objects, immutable once created
//!   temp/       scratch of last resort for auxiliary tools
//!   trash/      deletion staging
//!   t.<id>/     one sandbox per executing task (m.<id> for mini-tasks)
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, warn};
use store::{Store, Trash};
use task_executor::Executor;

pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    ///
    /// Create (or adopt) the workspace directory. The default location is
    /// `$TMPDIR/worker-<uid>-<pid>`.
    ///
    pub fn create(user_specified: Option<&Path>) -> Result<Workspace, String> {
        let root = match user_specified {
            Some(dir) => dir.join(format!(
                "worker-{}-{}",
                nix::unistd::getuid().as_raw(),
                std::process::id()
            )),
            None => std::env::temp_dir().join(format!(
                "worker-{}-{}",
                nix::unistd::getuid().as_raw(),
                std::process::id()
            )),
        };
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("failed to create workspace {}: {e}", root.display()))?;
        let root = root
            .canonicalize()
            .map_err(|e| format!("failed to resolve workspace path: {e}"))?;
        println!("vine_worker: creating workspace {}", root.display());
        Ok(Workspace { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join("trash")
    }

    ///
    /// Check that the workspace permits executing what we write there, by running a trivial
    /// script out of it. A noexec mount is only a warning (task commands may live elsewhere);
    /// anything else failing is fatal.
    ///
    pub async fn check(&self) -> Result<(), String> {
        let probe = self.root.join("test.sh");
        std::fs::write(&probe, "#!/bin/sh\nexit 0\n")
            .map_err(|e| format!("could not write to {}: {e}", self.root.display()))?;
        std::fs::set_permissions(&probe, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| format!("could not chmod {}: {e}", probe.display()))?;

        let status = tokio::process::Command::new(&probe)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let _ = std::fs::remove_file(&probe);

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) if status.code() == Some(126) => {
                warn!(
                    "could not execute a test script in the workspace {}; is the filesystem mounted noexec?",
                    self.root.display()
                );
                warn!("unless task commands are absolute paths, tasks will fail with exit status 126");
                Ok(())
            }
            Ok(status) => Err(format!(
                "the workspace {} could not be used (test script exited {status})",
                self.root.display()
            )),
            Err(e) => Err(format!(
                "the workspace {} could not be used: {e}",
                self.root.display()
            )),
        }
    }

    ///
    /// Called on every connection to a manager: set up the cache, temp and trash directories
    /// and hand back the store that owns the cache.
    ///
    pub fn prepare(
        &self,
        executor: &Executor,
        password: Option<String>,
    ) -> Result<(Store, Trash), String> {
        debug!("preparing workspace {}", self.root.display());
        std::fs::create_dir_all(self.temp_dir())
            .map_err(|e| format!("failed to create temp dir: {e}"))?;
        std::env::set_var("WORKER_TMPDIR", self.temp_dir());

        let trash = Trash::setup(self.trash_dir(), executor.clone())?;
        let store = Store::new(self.cache_dir(), trash.clone(), executor.clone(), password)?;
        Ok((store, trash))
    }

    ///
    /// Called on every disconnect: everything except the cache and the trash itself moves to
    /// the trash, which is then emptied.
    ///
    pub fn cleanup(&self, trash: &Trash) {
        debug!("cleaning workspace {}", self.root.display());
        let listing = match std::fs::read_dir(&self.root) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("could not list workspace: {e}");
                return;
            }
        };
        for entry in listing.flatten() {
            let name = entry.file_name();
            if name == "cache" || name == "trash" {
                continue;
            }
            trash.trash(&entry.path());
        }
        trash.empty();
    }

    /// Called once at final shutdown: remove everything, cache included.
    pub fn delete(self) {
        println!("vine_worker: deleting workspace {}", self.root.display());
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            warn!("could not delete workspace {}: {e}", self.root.display());
        }
    }
}
