// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Service management and health checks.
//!
//! Applications are served by one or more service units that must be stopped
//! while their files are swapped, and started again afterwards. Once started,
//! appkeep waits for the application to become healthy before it calls an
//! update done.

use crate::{
    config::{ConfigError, HealthKind, HealthSettings},
    retry::RetryPolicy,
    syscall::{CommandRunner, SyscallError, SystemRunner},
};

use reqwest::{blocking::Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Control service units.
pub trait ServiceManager {
    /// Stop service units.
    fn stop(&self, units: &[String]) -> Result<()>;

    /// Start service units, restarting any that already run.
    fn start(&self, units: &[String]) -> Result<()>;

    /// Check if service unit is active.
    fn is_active(&self, unit: &str) -> bool;
}

impl<T> ServiceManager for &T
where
    T: ServiceManager + ?Sized,
{
    fn stop(&self, units: &[String]) -> Result<()> {
        (**self).stop(units)
    }

    fn start(&self, units: &[String]) -> Result<()> {
        (**self).start(units)
    }

    fn is_active(&self, unit: &str) -> bool {
        (**self).is_active(unit)
    }
}

/// Control systemd units through systemctl.
#[derive(Debug, Default, Clone)]
pub struct Systemctl<R = SystemRunner>
where
    R: CommandRunner,
{
    runner: R,
}

impl<R> Systemctl<R>
where
    R: CommandRunner,
{
    /// Construct new systemctl service manager.
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    fn systemctl(&self, verb: &str, units: &[String]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }

        let mut args = vec![verb.to_string()];
        args.extend(units.iter().cloned());
        self.runner.run("systemctl", &args, None)?;

        Ok(())
    }
}

impl<R> ServiceManager for Systemctl<R>
where
    R: CommandRunner,
{
    #[instrument(skip(self), level = "debug")]
    fn stop(&self, units: &[String]) -> Result<()> {
        info!("stop {}", units.join(", "));
        self.systemctl("stop", units)
    }

    #[instrument(skip(self), level = "debug")]
    fn start(&self, units: &[String]) -> Result<()> {
        info!("start {}", units.join(", "));
        self.systemctl("restart", units)
    }

    fn is_active(&self, unit: &str) -> bool {
        let args = ["is-active".to_string(), "--quiet".to_string(), unit.to_string()];
        self.runner.run("systemctl", &args, None).is_ok()
    }
}

/// Check that tells a restarted application is healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// Every service unit reports active.
    Active,

    /// URL answers with HTTP 200.
    Http { url: String },
}

impl HealthProbe {
    /// Probe once.
    pub fn check(&self, manager: &impl ServiceManager, units: &[String]) -> bool {
        match self {
            Self::Active => units.iter().all(|unit| manager.is_active(unit)),
            Self::Http { url } => http_ok(url),
        }
    }
}

impl TryFrom<&HealthSettings> for HealthProbe {
    type Error = ConfigError;

    fn try_from(settings: &HealthSettings) -> Result<Self, Self::Error> {
        match (settings.kind, &settings.url) {
            (HealthKind::Active, _) => Ok(Self::Active),
            (HealthKind::Http, Some(url)) => Ok(Self::Http { url: url.clone() }),
            (HealthKind::Http, None) => Err(ConfigError::MissingHealthUrl),
        }
    }
}

/// Poll health probe until it passes or the retry budget runs out.
#[instrument(skip(manager, units), level = "debug")]
pub fn wait_healthy(
    manager: &impl ServiceManager,
    units: &[String],
    probe: &HealthProbe,
    policy: &RetryPolicy,
) -> bool {
    policy.poll(|attempt| {
        let healthy = probe.check(manager, units);
        debug!("health probe attempt {attempt}: healthy = {healthy}");
        healthy
    })
}

fn http_ok(url: &str) -> bool {
    let client = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(err) => {
            warn!("cannot build http client: {err}");
            return false;
        }
    };

    match client.get(url).send() {
        Ok(response) => response.status() == StatusCode::OK,
        Err(err) => {
            debug!("probe {url} failed: {err}");
            false
        }
    }
}

/// Service management error types.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service manager command fails.
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

/// Friendly result alias :3
pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
