// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup archive management.
//!
//! Appkeep snapshots an application directory into a __backup archive__ before
//! every update, and whenever the user asks for one. All archives of one
//! application live together in a __backup directory__.
//!
//! # Backup Directory Layout
//!
//! Each archive is a gzip compressed tarball named
//! `<app>-<YYYYMMDD-HHMMSS>.tgz`, where the timestamp records the local time
//! the archive was made at second granularity. An archive made in the same
//! second as an existing one gets a numeric suffix instead of replacing it,
//! e.g., `privatebin-20250102-030405-1.tgz`. There is no index besides the
//! directory listing itself. Archives are ordered by the timestamp embedded
//! in their file name, then by suffix.
//!
//! Every archive holds exactly one top-level directory named after the base
//! name of the application directory it was made from. Restoring checks this
//! name to refuse archives of unrelated applications.
//!
//! Archives are never modified after creation. They stay around until pruned.

use chrono::{Local, NaiveDateTime};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use glob::Pattern;
use std::{
    cmp::Ordering,
    ffi::OsString,
    fs::{create_dir_all, remove_file, File, OpenOptions},
    io::{BufWriter, ErrorKind, Read, Write},
    path::{Component, Path, PathBuf},
};
use tar::{Archive, Builder};
use tracing::{debug, info, instrument, warn};

/// Timestamp layout embedded in archive file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// File extension of backup archives.
pub const ARCHIVE_EXTENSION: &str = "tgz";

// Length of a formatted `TIMESTAMP_FORMAT`.
const TIMESTAMP_LEN: usize = 15;

/// Store of backup archives for one application.
#[derive(Debug, Clone)]
pub struct BackupStore {
    backup_dir: PathBuf,
    prefix: String,
}

impl BackupStore {
    /// Construct new backup store.
    ///
    /// Does not touch the file system. The backup directory is created on
    /// first backup.
    pub fn new(backup_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Path to backup directory.
    pub fn backup_dir(&self) -> &Path {
        self.backup_dir.as_path()
    }

    /// Snapshot application directory at the current moment.
    ///
    /// # Errors
    ///
    /// See [`BackupStore::backup_at`].
    pub fn backup(&self, app_dir: impl AsRef<Path>) -> Result<BackupArchive> {
        self.backup_at(app_dir, Local::now().naive_local())
    }

    /// Snapshot application directory, naming the archive after `timestamp`.
    ///
    /// If an archive for the same second already exists, the next free
    /// numeric suffix is used, so repeated backups never overwrite one
    /// another.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::MissingAppDir`] if application directory does
    ///   not exist.
    /// - Return [`StoreError::NoBaseName`] if application directory has no
    ///   base name to use as top-level entry.
    /// - Return [`StoreError::CreateBackupDir`] if backup directory cannot be
    ///   created.
    /// - Return [`StoreError::WriteArchive`] if archive cannot be written.
    #[instrument(skip(self, app_dir), level = "debug")]
    pub fn backup_at(
        &self,
        app_dir: impl AsRef<Path>,
        timestamp: NaiveDateTime,
    ) -> Result<BackupArchive> {
        let app_dir = app_dir.as_ref();
        if !app_dir.is_dir() {
            return Err(StoreError::MissingAppDir {
                path: app_dir.to_path_buf(),
            });
        }
        let base_name = base_name(app_dir)?;

        create_dir_all(&self.backup_dir).map_err(|err| StoreError::CreateBackupDir {
            source: err,
            path: self.backup_dir.clone(),
        })?;

        let (archive, file) = self.reserve(timestamp)?;
        info!(
            "back up {} into {}",
            app_dir.display(),
            archive.path().display()
        );

        if let Err(err) = write_archive(file, &base_name, app_dir) {
            // INVARIANT: Never leave a truncated archive behind.
            if let Err(cleanup) = remove_file(archive.path()) {
                warn!(
                    "failed to remove partial archive {}: {cleanup}",
                    archive.path().display()
                );
            }
            return Err(StoreError::WriteArchive {
                source: err,
                path: archive.path,
            });
        }

        Ok(archive)
    }

    /// List all backup archives, oldest first.
    ///
    /// Files that do not follow the archive naming scheme of this store are
    /// ignored. A missing backup directory simply means there are no backups.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Glob`] if backup directory cannot be expressed
    ///   as a glob pattern.
    pub fn list(&self) -> Result<Vec<BackupArchive>> {
        if !self.backup_dir.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!(
            "{}/{}-*.{ARCHIVE_EXTENSION}",
            Pattern::escape(self.backup_dir.to_string_lossy().as_ref()),
            Pattern::escape(&self.prefix),
        );

        let mut archives = glob::glob(&pattern)?
            .filter_map(|entry| match entry {
                Ok(path) => BackupArchive::parse(&self.prefix, path),
                Err(err) => {
                    warn!("skip unreadable backup entry: {err}");
                    None
                }
            })
            .collect::<Vec<_>>();
        archives.sort();

        Ok(archives)
    }

    /// Most recent backup archive, if any.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Glob`] if listing fails.
    pub fn latest(&self) -> Result<Option<BackupArchive>> {
        Ok(self.list()?.pop())
    }

    /// Resolve archive given by file name or by path.
    ///
    /// Bare file names are looked up inside the backup directory.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotFound`] if no such archive exists.
    pub fn resolve(&self, name: impl AsRef<Path>) -> Result<PathBuf> {
        let name = name.as_ref();
        let path = if name.components().count() == 1 && !name.is_absolute() {
            // INVARIANT: Prefer backup directory over working directory for bare names.
            let candidate = self.backup_dir.join(name);
            if candidate.is_file() || !name.is_file() {
                candidate
            } else {
                name.to_path_buf()
            }
        } else {
            name.to_path_buf()
        };

        if !path.is_file() {
            return Err(StoreError::NotFound { path });
        }

        Ok(path)
    }

    /// Determine the single top-level directory name inside an archive.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::ReadArchive`] if archive cannot be read.
    /// - Return [`StoreError::EmptyArchive`] if archive has no entries.
    /// - Return [`StoreError::MixedTopLevel`] if entries do not share one
    ///   top-level directory.
    pub fn top_level_name(&self, archive: impl AsRef<Path>) -> Result<OsString> {
        let archive = archive.as_ref();
        let read_err = |err| StoreError::ReadArchive {
            source: err,
            path: archive.to_path_buf(),
        };

        let file = File::open(archive).map_err(read_err)?;
        let mut tarball = Archive::new(GzDecoder::new(file));
        let mut top_level: Option<OsString> = None;

        for entry in tarball.entries().map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let path = entry.path().map_err(read_err)?;
            let first = path
                .components()
                .find(|component| !matches!(component, Component::CurDir))
                .map(|component| component.as_os_str().to_owned());

            let Some(name) = first else {
                continue;
            };

            match top_level.as_ref() {
                Some(current) if *current != name => {
                    return Err(StoreError::MixedTopLevel {
                        path: archive.to_path_buf(),
                    })
                }
                Some(_) => continue,
                None => top_level = Some(name),
            }
        }

        top_level.ok_or_else(|| StoreError::EmptyArchive {
            path: archive.to_path_buf(),
        })
    }

    /// Unpack archive into destination directory.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::ReadArchive`] if archive cannot be read,
    ///   contains path traversal, or cannot be unpacked.
    pub fn extract(&self, archive: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
        let archive = archive.as_ref();
        debug!(
            "extract {} into {}",
            archive.display(),
            dest.as_ref().display()
        );
        let read_err = |err| StoreError::ReadArchive {
            source: err,
            path: archive.to_path_buf(),
        };

        let file = File::open(archive).map_err(read_err)?;
        unpack_tar_gz(file, dest.as_ref()).map_err(read_err)
    }

    /// Delete every archive except the newest `keep` ones.
    ///
    /// Returns the archives that were deleted, oldest first.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::RemoveArchive`] if an archive cannot be deleted.
    #[instrument(skip(self), level = "debug")]
    pub fn prune(&self, keep: usize) -> Result<Vec<BackupArchive>> {
        let mut archives = self.list()?;
        let excess = archives.len().saturating_sub(keep);
        let removed = archives.drain(..excess).collect::<Vec<_>>();

        for archive in &removed {
            info!("prune {}", archive.path().display());
            remove_file(archive.path()).map_err(|err| StoreError::RemoveArchive {
                source: err,
                path: archive.path().to_path_buf(),
            })?;
        }

        Ok(removed)
    }

    fn reserve(&self, timestamp: NaiveDateTime) -> Result<(BackupArchive, File)> {
        let stamp = timestamp.format(TIMESTAMP_FORMAT);
        let mut sequence = 0;

        loop {
            let name = match sequence {
                0 => format!("{}-{stamp}.{ARCHIVE_EXTENSION}", self.prefix),
                n => format!("{}-{stamp}-{n}.{ARCHIVE_EXTENSION}", self.prefix),
            };
            let path = self.backup_dir.join(name);

            // INVARIANT: Claim the name atomically so concurrent backups cannot share it.
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let archive = BackupArchive {
                        path,
                        timestamp,
                        sequence,
                    };
                    return Ok((archive, file));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => sequence += 1,
                Err(err) => return Err(StoreError::WriteArchive { source: err, path }),
            }
        }
    }
}

/// Backup archive inside a backup store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    path: PathBuf,
    timestamp: NaiveDateTime,
    sequence: u32,
}

impl BackupArchive {
    /// Parse archive from its path, given the archive name prefix.
    ///
    /// Returns `None` if the file name does not follow the naming scheme
    /// `<prefix>-<YYYYMMDD-HHMMSS>[-<n>].tgz`.
    pub fn parse(prefix: &str, path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?;
        let rest = name
            .strip_suffix(ARCHIVE_EXTENSION)?
            .strip_suffix('.')?
            .strip_prefix(prefix)?
            .strip_prefix('-')?;

        let stamp = rest.get(..TIMESTAMP_LEN)?;
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        let sequence = match rest.get(TIMESTAMP_LEN..)? {
            "" => 0,
            suffix => suffix.strip_prefix('-')?.parse().ok()?,
        };

        Some(Self {
            path,
            timestamp,
            sequence,
        })
    }

    /// Path to archive file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// File name of archive.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Moment the archive was made at.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    #[cfg(test)]
    fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl Ord for BackupArchive {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.sequence.cmp(&other.sequence))
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for BackupArchive {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Base name of an application directory.
///
/// # Errors
///
/// - Return [`StoreError::NoBaseName`] if path ends in `..` or is a root.
pub fn base_name(app_dir: impl AsRef<Path>) -> Result<OsString> {
    app_dir
        .as_ref()
        .file_name()
        .map(ToOwned::to_owned)
        .ok_or_else(|| StoreError::NoBaseName {
            path: app_dir.as_ref().to_path_buf(),
        })
}

/// Unpack gzip compressed tarball into destination directory.
///
/// Refuses entries that would escape the destination through `..`.
pub(crate) fn unpack_tar_gz(reader: impl Read, dest: &Path) -> std::io::Result<()> {
    create_dir_all(dest)?;

    let mut tarball = Archive::new(GzDecoder::new(reader));
    tarball.set_preserve_permissions(true);
    tarball.set_preserve_mtime(true);
    tarball.set_unpack_xattrs(false);

    for entry in tarball.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|component| component == Component::ParentDir)
        {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("archive entry {:?} escapes destination", path.display()),
            ));
        }

        entry.unpack_in(dest)?;
    }

    Ok(())
}

fn write_archive(file: File, base_name: &OsString, app_dir: &Path) -> std::io::Result<()> {
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(base_name, app_dir)?;

    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    Ok(())
}

/// Backup store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Application directory to back up does not exist.
    #[error("application directory {:?} does not exist", path.display())]
    MissingAppDir { path: PathBuf },

    /// Application directory path has no base name.
    #[error("application directory {:?} has no base name", path.display())]
    NoBaseName { path: PathBuf },

    /// Backup directory cannot be created.
    #[error("failed to create backup directory {:?}", path.display())]
    CreateBackupDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive cannot be written.
    #[error("failed to write backup archive {:?}", path.display())]
    WriteArchive {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive cannot be read or unpacked.
    #[error("failed to read backup archive {:?}", path.display())]
    ReadArchive {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive cannot be deleted.
    #[error("failed to remove backup archive {:?}", path.display())]
    RemoveArchive {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive holds no entries.
    #[error("backup archive {:?} is empty", path.display())]
    EmptyArchive { path: PathBuf },

    /// Archive holds more than one top-level entry.
    #[error("backup archive {:?} has more than one top-level entry", path.display())]
    MixedTopLevel { path: PathBuf },

    /// Archive does not exist.
    #[error("backup archive {:?} not found", path.display())]
    NotFound { path: PathBuf },

    /// Backup directory cannot be turned into a glob pattern.
    #[error(transparent)]
    Glob(#[from] glob::PatternError),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
