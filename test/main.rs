// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use appkeep::{
    config::{
        AppDefinition, AppSettings, BuildStep, HealthKind, HealthSettings, Preserve,
        ServiceSettings, Upstream,
    },
    fetch::{FetchError, Fetcher},
    service::{Result as ServiceResult, ServiceError, ServiceManager},
    syscall::{CommandRunner, Result as SyscallResult, SyscallError},
    Maintainer, RetryPolicy,
};

use anyhow::Result;
use std::{
    cell::{Cell, RefCell},
    fs::{create_dir_all, read_dir, read_to_string, remove_dir_all, write},
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;

/// Deployed application inside a throwaway root directory.
pub(crate) struct AppFixture {
    _root: TempDir,
    pub(crate) app_dir: PathBuf,
    pub(crate) backup_dir: PathBuf,
}

impl AppFixture {
    pub(crate) fn new() -> Result<Self> {
        let root = tempfile::tempdir()?;
        let app_dir = root.path().join("srv").join("paste");
        let backup_dir = root.path().join("backups");

        create_dir_all(app_dir.join("config"))?;
        create_dir_all(app_dir.join("data/pastes"))?;
        write(app_dir.join("VERSION"), "1.0.0")?;
        write(app_dir.join("index.php"), "<?php // v1")?;
        write(app_dir.join("config/settings.php"), "secret = hunter2\n")?;
        write(app_dir.join("data/pastes/abc"), "hello world")?;

        Ok(Self {
            _root: root,
            app_dir,
            backup_dir,
        })
    }

    pub(crate) fn definition(&self) -> AppDefinition {
        AppDefinition {
            settings: AppSettings {
                name: "paste".into(),
                app_dir: self.app_dir.clone(),
                backup_dir: self.backup_dir.clone(),
                marker: "VERSION".into(),
                owner: Some("www-data:www-data".into()),
            },
            preserve: Preserve {
                files: vec!["config/settings.php".into()],
                dirs: vec!["data".into()],
            },
            upstream: Upstream::Tarball {
                url: "http://127.0.0.1:1/paste.tar.gz".into(),
            },
            service: ServiceSettings {
                units: vec!["php-fpm".into(), "nginx".into()],
            },
            health: HealthSettings {
                kind: HealthKind::Active,
                url: None,
                attempts: 3,
                interval_ms: 0,
                timeout_ms: None,
            },
            build: vec![BuildStep {
                program: "composer".into(),
                args: vec!["install".into(), "--no-dev".into()],
            }],
        }
    }

    pub(crate) fn maintainer<'a>(
        &self,
        fetcher: FakeFetcher,
        services: &'a FakeServices,
        runner: &'a FakeRunner,
    ) -> Result<Maintainer<FakeFetcher, &'a FakeServices, &'a FakeRunner>> {
        Ok(
            Maintainer::new(self.definition(), fetcher, services, runner)?
                .with_health_policy(RetryPolicy::new(3, Duration::ZERO)),
        )
    }

    pub(crate) fn read(&self, relative: impl AsRef<Path>) -> Result<String> {
        Ok(read_to_string(self.app_dir.join(relative))?)
    }

    /// Names of everything next to the application directory.
    pub(crate) fn siblings(&self) -> Result<Vec<String>> {
        let parent = self.app_dir.parent().unwrap();
        let mut names = read_dir(parent)?
            .map(|entry| -> Result<String> {
                Ok(entry?.file_name().to_string_lossy().into_owned())
            })
            .collect::<Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }
}

/// Fetcher handing out a fixed release, or failing like an unreachable network.
pub(crate) struct FakeFetcher {
    release: Option<Vec<(PathBuf, String)>>,
}

impl FakeFetcher {
    pub(crate) fn release(files: &[(&str, &str)]) -> Self {
        Self {
            release: Some(
                files
                    .iter()
                    .map(|(path, contents)| (PathBuf::from(path), contents.to_string()))
                    .collect(),
            ),
        }
    }

    pub(crate) fn default_release() -> Self {
        Self::release(&[
            ("VERSION", "2.0.0"),
            ("index.php", "<?php // v2"),
            ("config/settings.php", "secret = changeme\n"),
        ])
    }

    pub(crate) fn unreachable() -> Self {
        Self { release: None }
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, dest: &Path) -> appkeep::fetch::Result<()> {
        let io_err = |err| FetchError::Io {
            source: err,
            path: dest.to_path_buf(),
        };

        let Some(files) = &self.release else {
            return Err(io_err(IoError::new(
                ErrorKind::ConnectionRefused,
                "network unreachable",
            )));
        };

        create_dir_all(dest).map_err(io_err)?;
        for (path, contents) in files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                create_dir_all(parent).map_err(io_err)?;
            }
            write(target, contents).map_err(io_err)?;
        }

        Ok(())
    }
}

/// Service manager whose units are healthy unless serving a rejected version.
pub(crate) struct FakeServices {
    app_dir: PathBuf,
    running: Cell<bool>,
    reject_version: Option<String>,
    fail_stop: bool,
    clobber_staging: bool,
    pub(crate) log: RefCell<Vec<String>>,
}

impl FakeServices {
    pub(crate) fn running(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
            running: Cell::new(true),
            reject_version: None,
            fail_stop: false,
            clobber_staging: false,
            log: RefCell::new(Vec::new()),
        }
    }

    /// Stop takes some units down, then fails.
    pub(crate) fn failing_stop(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            fail_stop: true,
            ..Self::running(app_dir)
        }
    }

    /// Stop wipes whatever is staged to replace the live directory, so the
    /// rename that follows fails.
    pub(crate) fn clobbering_staging(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            clobber_staging: true,
            ..Self::running(app_dir)
        }
    }

    fn clobber(&self) {
        let name = self.app_dir.file_name().unwrap().to_string_lossy();
        let prefix = format!(".{name}.appkeep-");
        for entry in read_dir(self.app_dir.parent().unwrap()).unwrap() {
            let entry = entry.unwrap();
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                for staged in ["new", "extract"] {
                    let _ = remove_dir_all(entry.path().join(staged));
                }
            }
        }
    }

    pub(crate) fn rejecting(app_dir: impl Into<PathBuf>, version: &str) -> Self {
        Self {
            reject_version: Some(version.into()),
            ..Self::running(app_dir)
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.get()
    }

    pub(crate) fn stops(&self) -> usize {
        self.log.borrow().iter().filter(|entry| *entry == "stop").count()
    }
}

impl ServiceManager for FakeServices {
    fn stop(&self, _units: &[String]) -> ServiceResult<()> {
        self.log.borrow_mut().push("stop".into());
        self.running.set(false);
        if self.clobber_staging {
            self.clobber();
        }

        if self.fail_stop {
            return Err(ServiceError::Syscall(SyscallError::Failed {
                program: "systemctl".into(),
                status: Some(1),
                message: "stderr: Failed to stop nginx.service".into(),
            }));
        }

        Ok(())
    }

    fn start(&self, _units: &[String]) -> ServiceResult<()> {
        self.log.borrow_mut().push("start".into());
        self.running.set(true);
        Ok(())
    }

    fn is_active(&self, _unit: &str) -> bool {
        let version = read_to_string(self.app_dir.join("VERSION")).unwrap_or_default();
        self.running.get() && self.reject_version.as_deref() != Some(version.as_str())
    }
}

/// Command runner recording invocations, failing one program on demand.
#[derive(Default)]
pub(crate) struct FakeRunner {
    fail: Option<String>,
    pub(crate) calls: RefCell<Vec<String>>,
}

impl FakeRunner {
    pub(crate) fn failing(program: &str) -> Self {
        Self {
            fail: Some(program.into()),
            ..Self::default()
        }
    }

    pub(crate) fn programs(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, _args: &[String], _cwd: Option<&Path>) -> SyscallResult<String> {
        self.calls.borrow_mut().push(program.into());
        if self.fail.as_deref() == Some(program) {
            return Err(SyscallError::Failed {
                program: program.into(),
                status: Some(1),
                message: "stderr: build exploded".into(),
            });
        }

        Ok(String::new())
    }
}
