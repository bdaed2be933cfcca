// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where application definitions live when the caller only gives
//! a name instead of a path to a definition file.

use std::path::{Path, PathBuf};

/// Determine default absolute path to application definition directory.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/appkeep` as the default
/// absolute path for application definitions. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_definition_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("appkeep"))
        .ok_or(NoWayHome)
}

/// Resolve application definition argument to a file path.
///
/// An argument naming an existing file is taken as is. Anything else is
/// treated as the name of a definition inside
/// [`default_definition_dir`], i.e., "privatebin" becomes
/// `$XDG_CONFIG_HOME/appkeep/privatebin.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
pub fn resolve_definition_path(arg: impl AsRef<Path>) -> Result<PathBuf> {
    let arg = arg.as_ref();
    if arg.is_file() {
        return Ok(arg.to_path_buf());
    }

    let mut name = arg.as_os_str().to_owned();
    if arg.extension().is_none() {
        name.push(".toml");
    }

    Ok(default_definition_dir()?.join(name))
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
