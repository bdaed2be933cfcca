// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Child process plumbing.
//!
//! Appkeep leaves package managers, build tools, and the service manager to
//! the host. Each one is invoked as a child process through a
//! [`CommandRunner`], which lets tests swap the host out entirely.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, instrument};

/// Run external programs to completion.
pub trait CommandRunner {
    /// Run program with arguments, optionally inside a working directory.
    ///
    /// Returns combined stdout and stderr of a successful run.
    ///
    /// # Errors
    ///
    /// - Return [`SyscallError::Spawn`] if program cannot be started.
    /// - Return [`SyscallError::Failed`] if program exits unsuccessfully.
    fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String>;
}

impl<T> CommandRunner for &T
where
    T: CommandRunner + ?Sized,
{
    fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String> {
        (**self).run(program, args, cwd)
    }
}

/// Run programs on the host through [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    /// Construct new host command runner.
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    #[instrument(skip(self), level = "debug")]
    fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().map_err(|err| SyscallError::Spawn {
            source: err,
            program: program.into(),
            cwd: cwd.map(Path::to_path_buf),
        })?;
        let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
        let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
        let mut message = String::new();

        if !stdout.is_empty() {
            message.push_str(format!("stdout: {stdout}").as_str());
        }

        if !stderr.is_empty() {
            message.push_str(format!("stderr: {stderr}").as_str());
        }

        // INVARIANT: Chomp trailing newlines.
        let message = message
            .strip_suffix("\r\n")
            .or(message.strip_suffix('\n'))
            .map(ToString::to_string)
            .unwrap_or(message);

        if !output.status.success() {
            return Err(SyscallError::Failed {
                program: program.into(),
                status: output.status.code(),
                message,
            });
        }

        debug!("{program} finished");
        Ok(message)
    }
}

/// Child process error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Program could not be started.
    #[error("failed to run {program:?} in {cwd:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
        cwd: Option<PathBuf>,
    },

    /// Program ran but exited unsuccessfully.
    #[error("command {program:?} failed with status {}:\n{message}", display_status(.status))]
    Failed {
        program: String,
        status: Option<i32>,
        message: String,
    },
}

fn display_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "<signal>".into(),
    }
}

/// Friendly result alias :3
pub type Result<T, E = SyscallError> = std::result::Result<T, E>;
