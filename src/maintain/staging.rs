// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Staging workspace and swap guard.
//!
//! The staging workspace is an ephemeral directory created right next to the
//! live application directory. Keeping it on the same file system makes every
//! rename between the two atomic. It holds:
//!
//! - `new/`: the freshly fetched release,
//! - `preserved/`: copies of configuration and data taken from the live
//!   directory,
//! - `old/`: the previous live directory once it has been swapped out,
//! - `extract/`: the contents of a backup archive during a restore.
//!
//! The [`SwapGuard`] tracks how far an update got, so it can put the previous
//! live directory back when anything fails.

use crate::service::{ServiceError, ServiceManager};

use std::{
    fs::{remove_dir_all, remove_file, rename, symlink_metadata},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tempfile::{Builder, TempDir};
use tracing::{debug, error, info, warn};

/// Ephemeral directory holding one update or restore attempt.
#[derive(Debug)]
pub struct StagingWorkspace {
    dir: TempDir,
}

impl StagingWorkspace {
    /// Create staging workspace next to the application directory.
    pub fn create(app_dir: &Path) -> std::io::Result<Self> {
        let parent = app_dir
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = app_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        std::fs::create_dir_all(parent)?;
        let dir = Builder::new()
            .prefix(&format!(".{name}.appkeep-"))
            .tempdir_in(parent)?;
        debug!("staging workspace at {}", dir.path().display());

        Ok(Self { dir })
    }

    /// Root of staging workspace.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Destination of the newly fetched release.
    pub fn new_dir(&self) -> PathBuf {
        self.path().join("new")
    }

    /// Copies of preserved configuration and data.
    pub fn preserved_dir(&self) -> PathBuf {
        self.path().join("preserved")
    }

    /// Previous live directory after the swap.
    pub fn old_dir(&self) -> PathBuf {
        self.path().join("old")
    }

    /// Destination of an unpacked backup archive.
    pub fn extract_dir(&self) -> PathBuf {
        self.path().join("extract")
    }

    /// Remove staging workspace, reporting failure as a warning only.
    pub fn discard(self) {
        let path = self.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!("failed to remove staging workspace {}: {err}", path.display());
        }
    }
}

/// Undo record of an in-flight update.
///
/// Armed on construction. Either [`SwapGuard::commit`] or
/// [`SwapGuard::rollback`] disarms it. A guard dropped while still armed,
/// e.g., during unwinding, rolls back on its own.
pub struct SwapGuard<'a, S>
where
    S: ServiceManager,
{
    live: &'a Path,
    old: PathBuf,
    services: &'a S,
    units: &'a [String],
    services_stopped: bool,
    armed: bool,
}

impl<'a, S> SwapGuard<'a, S>
where
    S: ServiceManager,
{
    /// Arm new swap guard for live directory.
    pub fn arm(
        live: &'a Path,
        workspace: &StagingWorkspace,
        services: &'a S,
        units: &'a [String],
    ) -> Self {
        Self {
            live,
            old: workspace.old_dir(),
            services,
            units,
            services_stopped: false,
            armed: true,
        }
    }

    /// Stop services, remembering to start them again on rollback.
    pub fn stop_services(&mut self) -> Result<(), ServiceError> {
        // INVARIANT: A failed stop may still have stopped some units.
        self.services_stopped = true;
        self.services.stop(self.units)
    }

    /// Start services.
    pub fn start_services(&self) -> Result<(), ServiceError> {
        self.services.start(self.units)
    }

    /// Move live directory aside and move `new` into its place.
    pub fn swap_in(&mut self, new: &Path) -> std::io::Result<()> {
        info!("swap {} into {}", new.display(), self.live.display());
        rename(self.live, &self.old)?;
        rename(new, self.live)?;
        Ok(())
    }

    /// Previous live directory, if it has been swapped out already.
    fn old_dir(&self) -> Option<&Path> {
        self.old.exists().then_some(self.old.as_path())
    }

    /// Keep the new live directory.
    pub fn commit(mut self) {
        self.armed = false;
    }

    /// Put the previous live directory back.
    ///
    /// Returns `true` if the live path holds the previous directory
    /// afterwards, which includes the case where it never moved. Failures
    /// are logged and suppressed so they never mask the original error.
    pub fn rollback(mut self) -> bool {
        self.armed = false;
        self.compensate()
    }

    fn compensate(&self) -> bool {
        let restored = match self.old_dir() {
            Some(old) => {
                warn!("roll back {}", self.live.display());
                match restore_old(self.live, old) {
                    Ok(()) => true,
                    Err(err) => {
                        error!(
                            "failed to restore {} from {}: {err}",
                            self.live.display(),
                            old.display()
                        );
                        false
                    }
                }
            }
            None => self.live.exists(),
        };

        if self.services_stopped {
            if let Err(err) = self.services.start(self.units) {
                warn!("failed to start services after rollback: {err}");
            }
        }

        restored
    }
}

impl<S> Drop for SwapGuard<'_, S>
where
    S: ServiceManager,
{
    fn drop(&mut self) {
        if self.armed {
            warn!("update of {} interrupted", self.live.display());
            self.compensate();
        }
    }
}

fn restore_old(live: &Path, old: &Path) -> std::io::Result<()> {
    remove_path(live)?;
    rename(old, live)
}

/// Remove file or directory tree, ignoring paths that do not exist.
pub(crate) fn remove_path(path: &Path) -> std::io::Result<()> {
    match symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => remove_dir_all(path),
        Ok(_) => remove_file(path),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
