// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release fetching.
//!
//! A __fetcher__ places the newest release of an application into an empty
//! destination directory inside the staging workspace. What counts as the
//! newest release depends on the upstream:
//!
//! - Git repositories are cloned, and the highest semantic version tag is
//!   checked out unless the definition pins a reference. Repositories
//!   without version tags stay on their default branch. The `.git` directory
//!   is removed afterwards, because deployed applications never carry it.
//! - Tarballs are downloaded and unpacked. Tarballs wrapping everything in a
//!   single top-level directory are unwrapped.
//!
//! Fetchers never touch the live application directory.

use crate::{config::Upstream, store::unpack_tar_gz};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config, FetchOptions, RemoteCallbacks, Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use reqwest::blocking::Client;
use semver::Version;
use std::{
    fs::{read_dir, remove_dir, remove_dir_all, rename},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument};

/// Place newest release of an application into a directory.
pub trait Fetcher {
    /// Fetch release into `dest`, which must not exist yet.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError`] if the release cannot be obtained.
    fn fetch(&self, dest: &Path) -> Result<()>;
}

impl<T> Fetcher for Box<T>
where
    T: Fetcher + ?Sized,
{
    fn fetch(&self, dest: &Path) -> Result<()> {
        (**self).fetch(dest)
    }
}

/// Select fetcher matching upstream of application definition.
pub fn fetcher_for(upstream: &Upstream) -> Box<dyn Fetcher> {
    match upstream {
        Upstream::Git { url, reference } => Box::new(GitFetcher::new(url, reference.clone())),
        Upstream::Tarball { url } => Box::new(TarballFetcher::new(url)),
    }
}

/// Fetch releases from a Git repository through libgit2.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    url: String,
    reference: Option<String>,
}

impl GitFetcher {
    /// Construct new Git fetcher.
    ///
    /// Without a reference the highest semantic version tag is used.
    pub fn new(url: impl Into<String>, reference: Option<String>) -> Self {
        Self {
            url: url.into(),
            reference,
        }
    }

    /// Clone repository into target path.
    ///
    /// The progress of the clone is displayed through a progress bar. If
    /// credentials are required, then the user will be prompted for them
    /// accordingly. The progress bar will be blocked for user input.
    fn clone_into(&self, dest: &Path) -> Result<Repository> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(self.url.clone());
        bar.enable_steady_tick(Duration::from_millis(100));

        let prompter = IndicatifPrompter::new(bar);
        let authenticator = GitAuthenticator::default().set_prompter(prompter.clone());
        let config = Config::open_default()?;

        let mut throttle = Instant::now();
        let mut rc = RemoteCallbacks::new();
        rc.credentials(authenticator.credentials(&config));
        rc.transfer_progress(|progress| {
            let stats = progress.to_owned();
            if throttle.elapsed() > Duration::from_millis(10) {
                throttle = Instant::now();
                prompter.bar.set_length(stats.total_objects() as u64);
                prompter.bar.set_position(stats.received_objects() as u64);
            }
            true
        });

        let mut fo = FetchOptions::new();
        fo.remote_callbacks(rc);
        let repository = RepoBuilder::new()
            .fetch_options(fo)
            .clone(&self.url, dest);
        prompter.bar.finish_and_clear();

        Ok(repository?)
    }
}

impl Fetcher for GitFetcher {
    #[instrument(skip(self, dest), level = "debug")]
    fn fetch(&self, dest: &Path) -> Result<()> {
        info!("clone {} into {}", self.url, dest.display());
        let repository = self.clone_into(dest)?;

        let reference = match &self.reference {
            Some(reference) => Some(reference.clone()),
            None => latest_release_tag(&repository)?,
        };

        match reference {
            Some(reference) => checkout(&repository, &reference)?,
            None => info!("no release tags found, stay on default branch"),
        }

        // INVARIANT: Deployed applications never carry repository metadata.
        let gitdir = repository.path().to_path_buf();
        drop(repository);
        remove_dir_all(&gitdir).map_err(|err| FetchError::Io {
            source: err,
            path: gitdir,
        })?;

        Ok(())
    }
}

/// Find the tag naming the highest stable semantic version.
///
/// Tags may carry a leading "v". Pre-releases are ignored.
pub fn latest_release_tag(repository: &Repository) -> Result<Option<String>> {
    let tags = repository.tag_names(None)?;
    let latest = tags
        .iter()
        .flatten()
        .filter_map(|name| {
            Version::parse(name.trim_start_matches('v'))
                .ok()
                .filter(|version| version.pre.is_empty())
                .map(|version| (version, name.to_string()))
        })
        .max_by(|(left, _), (right, _)| left.cmp(right))
        .map(|(_, name)| name);

    Ok(latest)
}

fn checkout(repository: &Repository, reference: &str) -> Result<()> {
    info!("check out {reference}");

    // INVARIANT: Fresh clones only know remote branches.
    let object = repository
        .revparse_single(reference)
        .or_else(|_| repository.revparse_single(&format!("origin/{reference}")))?;
    let commit = object.peel_to_commit()?;

    let mut opts = CheckoutBuilder::new();
    opts.force();
    repository.checkout_tree(commit.as_object(), Some(&mut opts))?;
    repository.set_head_detached(commit.id())?;

    Ok(())
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Fetch releases as gzip compressed tarballs over HTTP.
#[derive(Debug, Clone)]
pub struct TarballFetcher {
    url: String,
}

impl TarballFetcher {
    /// Construct new tarball fetcher.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Fetcher for TarballFetcher {
    #[instrument(skip(self, dest), level = "debug")]
    fn fetch(&self, dest: &Path) -> Result<()> {
        info!("download {} into {}", self.url, dest.display());
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        let response = client.get(&self.url).send()?.error_for_status()?;

        let unpack = dest.with_extension("unpack");
        unpack_tar_gz(response, &unpack).map_err(|err| FetchError::Io {
            source: err,
            path: unpack.clone(),
        })?;
        unwrap_single_dir(&unpack, dest)
    }
}

/// Move unpacked release into destination.
///
/// If `unpacked` holds nothing but a single directory, that directory becomes
/// `dest`. Otherwise `unpacked` itself does.
pub fn unwrap_single_dir(unpacked: &Path, dest: &Path) -> Result<()> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |err| FetchError::Io { source: err, path }
    };

    let entries = read_dir(unpacked)
        .map_err(io_err(unpacked))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(io_err(unpacked))?;

    let single_dir: Option<PathBuf> = match entries.as_slice() {
        [only] if only.file_type().map_err(io_err(unpacked))?.is_dir() => Some(only.path()),
        _ => None,
    };

    match single_dir {
        Some(root) => {
            debug!("unwrap single top-level directory {}", root.display());
            rename(&root, dest).map_err(io_err(&root))?;
            remove_dir(unpacked).map_err(io_err(unpacked))?;
        }
        None => rename(unpacked, dest).map_err(io_err(unpacked))?,
    }

    Ok(())
}

/// Release fetching error types.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// HTTP download fails.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// File system operation on fetched release fails.
    #[error("failed to prepare release at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = FetchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, read_to_string, write};

    fn tagged_repo(path: &Path, tags: &[&str]) -> anyhow::Result<Repository> {
        let repository = Repository::init(path)?;
        let signature = git2::Signature::now("John Doe", "john@doe.com")?;
        let tree_oid = repository.index()?.write_tree()?;
        let tree = repository.find_tree(tree_oid)?;
        let commit_oid =
            repository.commit(Some("HEAD"), &signature, &signature, "init", &tree, &[])?;
        let commit = repository.find_object(commit_oid, None)?;
        for tag in tags {
            repository.tag_lightweight(tag, &commit, false)?;
        }
        drop(tree);
        drop(commit);
        Ok(repository)
    }

    #[test]
    fn latest_release_tag_picks_highest_stable_version() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let repository = tagged_repo(
            dir.path(),
            &["1.2.0", "v1.10.0", "2.0.0-rc.1", "nightly", "v1.9.9"],
        )?;

        assert_eq!(latest_release_tag(&repository)?, Some("v1.10.0".into()));
        Ok(())
    }

    #[test]
    fn latest_release_tag_without_versions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let repository = tagged_repo(dir.path(), &["nightly"])?;

        assert_eq!(latest_release_tag(&repository)?, None);
        Ok(())
    }

    #[test]
    fn unwrap_single_top_level_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let unpacked = dir.path().join("new.unpack");
        create_dir_all(unpacked.join("PrivateBin-1.7.4/lib"))?;
        write(unpacked.join("PrivateBin-1.7.4/lib/Controller.php"), "v2")?;

        let dest = dir.path().join("new");
        unwrap_single_dir(&unpacked, &dest)?;

        assert_eq!(read_to_string(dest.join("lib/Controller.php"))?, "v2");
        assert!(!unpacked.exists());
        Ok(())
    }

    #[test]
    fn flat_release_moves_as_is() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let unpacked = dir.path().join("new.unpack");
        create_dir_all(unpacked.join("lib"))?;
        write(unpacked.join("index.php"), "v2")?;

        let dest = dir.path().join("new");
        unwrap_single_dir(&unpacked, &dest)?;

        assert_eq!(read_to_string(dest.join("index.php"))?, "v2");
        assert!(dest.join("lib").is_dir());
        Ok(())
    }

    #[test]
    fn unreachable_tarball_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = TarballFetcher::new("http://127.0.0.1:1/release.tar.gz");
        let result = fetcher.fetch(&dir.path().join("new"));
        assert!(matches!(result, Err(FetchError::Http(_))));
        assert!(!dir.path().join("new").exists());
    }
}
