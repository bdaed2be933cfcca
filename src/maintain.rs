// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Application maintenance.
//!
//! A [`Maintainer`] upgrades, backs up, and restores one deployed application
//! as described by its [`AppDefinition`].
//!
//! # Update and Rollback
//!
//! An update never edits the live application directory in place. Instead:
//!
//! 1. The live directory is archived into the backup store.
//! 2. The newest release is fetched into a staging workspace next to the live
//!    directory, and must contain the marker file.
//! 3. Preserved configuration files and data directories are copied out of
//!    the live directory.
//! 4. Services are stopped.
//! 5. The live directory is renamed aside, and the new release is renamed
//!    into its place. Both renames stay on one file system, so the live path
//!    is never missing.
//! 6. Preserved state moves into the new live directory, and ownership is
//!    fixed.
//! 7. Build commands run inside the new live directory.
//! 8. Services start, and the application must turn healthy within the retry
//!    budget.
//! 9. The staging workspace, along with the previous live directory, is
//!    discarded.
//!
//! Any failure from step 2 onward rolls back: the previous live directory is
//! renamed back into place, and services stopped along the way are started
//! again. Either way no partial state is left behind.
//!
//! # Concurrency
//!
//! There is no locking. Running two maintenance operations against one
//! application at the same time is the caller's problem.

pub mod staging;

use crate::{
    config::{AppDefinition, ConfigError},
    fetch::{FetchError, Fetcher},
    maintain::staging::{remove_path, StagingWorkspace, SwapGuard},
    retry::RetryPolicy,
    service::{wait_healthy, HealthProbe, ServiceError, ServiceManager},
    store::{base_name, BackupArchive, BackupStore, StoreError, TIMESTAMP_FORMAT},
    syscall::{CommandRunner, SyscallError},
};

use chrono::Local;
use std::{
    ffi::OsString,
    fs::{copy, create_dir_all, read_link, rename},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Maintain one deployed application.
#[derive(Debug)]
pub struct Maintainer<F, S, R>
where
    F: Fetcher,
    S: ServiceManager,
    R: CommandRunner,
{
    definition: AppDefinition,
    store: BackupStore,
    fetcher: F,
    services: S,
    runner: R,
    probe: HealthProbe,
    health: RetryPolicy,
}

impl<F, S, R> Maintainer<F, S, R>
where
    F: Fetcher,
    S: ServiceManager,
    R: CommandRunner,
{
    /// Construct new maintainer.
    ///
    /// # Errors
    ///
    /// - Return [`MaintainError::Config`] if the definition is invalid, e.g.,
    ///   a preserved path escapes the application directory.
    pub fn new(definition: AppDefinition, fetcher: F, services: S, runner: R) -> Result<Self> {
        definition.validate()?;
        let store = BackupStore::new(
            &definition.settings.backup_dir,
            &definition.settings.name,
        );
        let probe = HealthProbe::try_from(&definition.health)?;
        let health = RetryPolicy::from(&definition.health);

        Ok(Self {
            definition,
            store,
            fetcher,
            services,
            runner,
            probe,
            health,
        })
    }

    /// Replace retry budget of health checks.
    pub fn with_health_policy(mut self, policy: RetryPolicy) -> Self {
        self.health = policy;
        self
    }

    /// Application definition being maintained.
    pub fn definition(&self) -> &AppDefinition {
        &self.definition
    }

    /// Backup store of application.
    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    fn app_dir(&self) -> &Path {
        self.definition.settings.app_dir.as_path()
    }

    fn units(&self) -> &[String] {
        self.definition.service.units.as_slice()
    }

    /// Upgrade application to its newest release.
    ///
    /// # Errors
    ///
    /// - Return [`MaintainError::NotInstalled`] if application directory or
    ///   marker file is missing. Nothing is touched.
    /// - Return [`MaintainError::Store`] if pre-update backup fails. Nothing
    ///   is touched.
    /// - Return [`MaintainError::Staging`] if staging workspace cannot be
    ///   created. Nothing is touched besides the new backup.
    /// - Return [`MaintainError::RolledBack`] if any later step fails. The
    ///   previous version is live again.
    #[instrument(skip(self), level = "debug")]
    pub fn update(&self) -> Result<UpdateReport> {
        self.ensure_installed()?;
        let app_dir = self.app_dir();
        info!("update {}", self.definition.settings.name);

        let backup = self.store.backup(app_dir)?;
        let workspace = StagingWorkspace::create(app_dir).map_err(|err| {
            MaintainError::Staging {
                source: err,
                path: app_dir.to_path_buf(),
            }
        })?;

        let mut guard = SwapGuard::arm(app_dir, &workspace, &self.services, self.units());
        match self.try_update(&workspace, &mut guard) {
            Ok(()) => {
                guard.commit();
                workspace.discard();
                info!("{} updated", self.definition.settings.name);
                Ok(UpdateReport { backup })
            }
            Err(error) => {
                warn!("update failed: {error}");
                let restored = guard.rollback();
                workspace.discard();
                Err(MaintainError::RolledBack {
                    source: Box::new(error),
                    restored,
                })
            }
        }
    }

    fn try_update(&self, workspace: &StagingWorkspace, guard: &mut SwapGuard<'_, S>) -> Result<()> {
        let app_dir = self.app_dir();
        let marker = &self.definition.settings.marker;

        let new_dir = workspace.new_dir();
        self.fetcher.fetch(&new_dir)?;
        if !new_dir.join(marker).exists() {
            return Err(MaintainError::MissingMarker {
                path: new_dir.join(marker),
            });
        }

        let preserved_dir = workspace.preserved_dir();
        self.preserve(app_dir, &preserved_dir)?;

        guard.stop_services()?;
        guard
            .swap_in(&new_dir)
            .map_err(|err| MaintainError::Swap {
                source: err,
                path: app_dir.to_path_buf(),
            })?;

        self.carry_over(&preserved_dir, app_dir)?;
        self.fix_ownership(app_dir);
        self.build(app_dir)?;

        guard.start_services()?;
        self.ensure_healthy()
    }

    /// Snapshot application directory into backup store.
    ///
    /// # Errors
    ///
    /// - Return [`MaintainError::Store`] if archive cannot be written.
    pub fn backup(&self) -> Result<BackupArchive> {
        Ok(self.store.backup(self.app_dir())?)
    }

    /// List backup archives, oldest first.
    ///
    /// # Errors
    ///
    /// - Return [`MaintainError::Store`] if backup directory cannot be listed.
    pub fn list_backups(&self) -> Result<Vec<BackupArchive>> {
        Ok(self.store.list()?)
    }

    /// Delete all but the newest `keep` backup archives.
    ///
    /// # Errors
    ///
    /// - Return [`MaintainError::Store`] if an archive cannot be deleted.
    pub fn prune(&self, keep: usize) -> Result<Vec<BackupArchive>> {
        Ok(self.store.prune(keep)?)
    }

    /// Replace live application directory with contents of a backup archive.
    ///
    /// The current live directory is kept next to it, suffixed with
    /// ".pre-restore-<timestamp>".
    ///
    /// # Errors
    ///
    /// - Return [`MaintainError::Store`] if archive cannot be found or read.
    /// - Return [`MaintainError::ArchiveMismatch`] if archive belongs to a
    ///   different application directory. Nothing is touched.
    /// - Return [`MaintainError::Staging`] if archive cannot be staged.
    /// - Return [`MaintainError::Swap`] if restored directory cannot be moved
    ///   into place. The previous live directory is moved back.
    /// - Return [`MaintainError::Service`] if services fail to stop or start.
    ///   Services are started again after a failed stop.
    #[instrument(skip(self, archive), level = "debug")]
    pub fn restore(&self, archive: impl AsRef<Path>) -> Result<RestoreReport> {
        let app_dir = self.app_dir();
        let archive = self.store.resolve(archive)?;

        let expected = base_name(app_dir)?;
        let found = self.store.top_level_name(&archive)?;
        if found != expected {
            return Err(MaintainError::ArchiveMismatch {
                archive,
                expected,
                found,
            });
        }

        info!("restore {} from {}", app_dir.display(), archive.display());
        let workspace = StagingWorkspace::create(app_dir).map_err(|err| {
            MaintainError::Staging {
                source: err,
                path: app_dir.to_path_buf(),
            }
        })?;
        self.store.extract(&archive, workspace.extract_dir())?;
        let restored = workspace.extract_dir().join(&expected);

        if let Err(err) = self.services.stop(self.units()) {
            // INVARIANT: A failed stop may still have stopped some units.
            self.restart_best_effort();
            return Err(err.into());
        }

        let previous = if app_dir.exists() {
            let aside = pre_restore_path(app_dir);
            info!("keep current {} as {}", app_dir.display(), aside.display());
            if let Err(err) = rename(app_dir, &aside) {
                self.restart_best_effort();
                return Err(MaintainError::Swap {
                    source: err,
                    path: app_dir.to_path_buf(),
                });
            }
            Some(aside)
        } else {
            None
        };

        if let Err(err) = rename(&restored, app_dir) {
            // INVARIANT: Live path must never stay empty.
            if let Some(aside) = &previous {
                if let Err(undo) = rename(aside, app_dir) {
                    warn!("failed to move {} back: {undo}", aside.display());
                }
            }
            self.restart_best_effort();
            return Err(MaintainError::Swap {
                source: err,
                path: app_dir.to_path_buf(),
            });
        }

        workspace.discard();
        self.fix_ownership(app_dir);
        self.services.start(self.units())?;
        info!("{} restored", self.definition.settings.name);

        Ok(RestoreReport { archive, previous })
    }

    /// Restore from the most recent backup archive.
    ///
    /// # Errors
    ///
    /// - Return [`MaintainError::NoBackups`] if there is nothing to restore.
    ///   Nothing is touched.
    /// - Return any error of [`Maintainer::restore`].
    pub fn restore_latest(&self) -> Result<RestoreReport> {
        let latest = self.store.latest()?.ok_or_else(|| MaintainError::NoBackups {
            path: self.store.backup_dir().to_path_buf(),
        })?;

        self.restore(latest.path())
    }

    fn ensure_installed(&self) -> Result<()> {
        let app_dir = self.app_dir();
        let marker = app_dir.join(&self.definition.settings.marker);
        if !app_dir.is_dir() || !marker.exists() {
            return Err(MaintainError::NotInstalled { marker });
        }

        Ok(())
    }

    fn ensure_healthy(&self) -> Result<()> {
        if wait_healthy(&self.services, self.units(), &self.probe, &self.health) {
            Ok(())
        } else {
            Err(MaintainError::Unhealthy {
                attempts: self.health.attempts.max(1),
            })
        }
    }

    fn preserve(&self, app_dir: &Path, preserved_dir: &Path) -> Result<()> {
        create_dir_all(preserved_dir).map_err(|err| MaintainError::Preserve {
            source: err,
            path: preserved_dir.to_path_buf(),
        })?;

        for relative in self.definition.preserve.paths() {
            let source = app_dir.join(relative);
            if !source.exists() {
                warn!("nothing to preserve at {}", source.display());
                continue;
            }

            debug!("preserve {}", source.display());
            copy_tree(&source, &preserved_dir.join(relative)).map_err(|err| {
                MaintainError::Preserve {
                    source: err,
                    path: source.clone(),
                }
            })?;
        }

        Ok(())
    }

    fn carry_over(&self, preserved_dir: &Path, app_dir: &Path) -> Result<()> {
        for relative in self.definition.preserve.paths() {
            let source = preserved_dir.join(relative);
            if !source.exists() {
                continue;
            }

            let target = app_dir.join(relative);
            debug!("carry over {}", target.display());
            let moved = remove_path(&target)
                .and_then(|()| match target.parent() {
                    Some(parent) => create_dir_all(parent),
                    None => Ok(()),
                })
                .and_then(|()| rename(&source, &target));
            moved.map_err(|err| MaintainError::Preserve {
                source: err,
                path: target.clone(),
            })?;
        }

        Ok(())
    }

    fn fix_ownership(&self, app_dir: &Path) {
        let Some(owner) = &self.definition.settings.owner else {
            return;
        };

        let args = [
            "-R".to_string(),
            owner.clone(),
            app_dir.to_string_lossy().into_owned(),
        ];
        if let Err(err) = self.runner.run("chown", &args, None) {
            warn!("failed to give {} to {owner}: {err}", app_dir.display());
        }
    }

    fn build(&self, app_dir: &Path) -> Result<()> {
        for step in &self.definition.build {
            info!("run {} {}", step.program, step.args.join(" "));
            self.runner
                .run(&step.program, &step.args, Some(app_dir))
                .map_err(|err| MaintainError::Build {
                    source: err,
                    program: step.program.clone(),
                })?;
        }

        Ok(())
    }

    fn restart_best_effort(&self) {
        if let Err(err) = self.services.start(self.units()) {
            warn!("failed to start services: {err}");
        }
    }
}

/// Outcome of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Archive made right before the update.
    pub backup: BackupArchive,
}

/// Outcome of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Archive that was restored.
    pub archive: PathBuf,

    /// Where the replaced live directory was kept, if there was one.
    pub previous: Option<PathBuf>,
}

fn pre_restore_path(app_dir: &Path) -> PathBuf {
    let stamp = Local::now().format(TIMESTAMP_FORMAT);
    let mut name = app_dir.as_os_str().to_owned();
    name.push(format!(".pre-restore-{stamp}"));

    let mut path = PathBuf::from(&name);
    let mut sequence = 1;
    while path.exists() {
        let mut candidate = name.clone();
        candidate.push(format!("-{sequence}"));
        path = PathBuf::from(candidate);
        sequence += 1;
    }

    path
}

/// Copy file or directory tree, keeping symlinks as symlinks.
fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            create_dir_all(parent)?;
        }

        if file_type.is_symlink() {
            let link = read_link(entry.path())?;
            symlink(&link, &target)?;
        } else {
            copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}

/// Maintenance error types.
#[derive(Debug, thiserror::Error)]
pub enum MaintainError {
    /// Application directory or marker file is missing.
    #[error("application not installed: marker {:?} not found", marker.display())]
    NotInstalled { marker: PathBuf },

    /// Fetched release lacks marker file.
    #[error("fetched release is missing marker {:?}", path.display())]
    MissingMarker { path: PathBuf },

    /// Staging workspace cannot be created or filled.
    #[error("failed to stage next to {:?}", path.display())]
    Staging {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Preserved state cannot be copied or carried over.
    #[error("failed to preserve {:?}", path.display())]
    Preserve {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Live directory cannot be swapped.
    #[error("failed to swap application directory {:?}", path.display())]
    Swap {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Build command fails.
    #[error("build step {program:?} failed")]
    Build {
        #[source]
        source: SyscallError,
        program: String,
    },

    /// Application does not turn healthy in time.
    #[error("application not healthy after {attempts} attempts")]
    Unhealthy { attempts: u32 },

    /// Archive belongs to another application directory.
    #[error(
        "archive {:?} holds {found:?}, expected {expected:?}",
        archive.display()
    )]
    ArchiveMismatch {
        archive: PathBuf,
        expected: OsString,
        found: OsString,
    },

    /// Nothing to restore from.
    #[error("no backups found in {:?}", path.display())]
    NoBackups { path: PathBuf },

    /// Update failed and was rolled back.
    #[error("update failed, {}", rollback_summary(.restored))]
    RolledBack {
        #[source]
        source: Box<MaintainError>,
        restored: bool,
    },

    /// Application definition is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Backup store operation fails.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Release cannot be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Service manager fails.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl MaintainError {
    /// Error that caused a rollback, or the error itself otherwise.
    pub fn root(&self) -> &MaintainError {
        match self {
            Self::RolledBack { source, .. } => source.root(),
            other => other,
        }
    }
}

fn rollback_summary(restored: &bool) -> &'static str {
    if *restored {
        "previous version restored"
    } else {
        "previous version could NOT be restored"
    }
}

/// Friendly result alias :3
pub type Result<T, E = MaintainError> = std::result::Result<T, E>;
