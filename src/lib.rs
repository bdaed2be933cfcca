// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Maintenance of self-hosted applications deployed into a fixed directory.
//!
//! Appkeep upgrades an application in place with automatic rollback, takes
//! backup archives of it, and restores it from those archives. Everything it
//! needs to know about an application comes from an [`AppDefinition`].
//!
//! # See Also
//!
//! 1. [`Maintainer`]
//! 2. [`BackupStore`]

pub mod config;
pub mod fetch;
pub mod maintain;
pub mod path;
pub mod retry;
pub mod service;
pub mod store;
pub mod syscall;

pub use config::{AppDefinition, Preset};
pub use fetch::{fetcher_for, Fetcher};
pub use maintain::{MaintainError, Maintainer, RestoreReport, UpdateReport};
pub use retry::RetryPolicy;
pub use service::{ServiceManager, Systemctl};
pub use store::{BackupArchive, BackupStore};
pub use syscall::{CommandRunner, SystemRunner};
