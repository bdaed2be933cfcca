// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of application definition files that appkeep uses to
//! maintain a deployed application. A definition is always passed explicitly
//! into the maintenance procedure, so nothing in the library reads ambient
//! environment state besides the shell expansion performed at parse time.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

/// Application definition layout.
///
/// Every application that appkeep maintains is described by a __definition__.
/// The definition names the live application directory, the backup
/// directory, the marker file that identifies a genuine installation, the
/// state that must survive an update, where new releases come from, and
/// which services depend on the application.
///
/// # General Layout
///
/// ```toml
/// [settings]
/// name = "privatebin"
/// app_dir = "/var/www/privatebin"
/// backup_dir = "/var/backups/privatebin"
/// marker = "lib/Controller.php"
/// owner = "www-data:www-data"
///
/// [preserve]
/// files = ["cfg/conf.php"]
/// dirs = ["data"]
///
/// [upstream]
/// kind = "git"
/// url = "https://github.com/PrivateBin/PrivateBin.git"
///
/// [service]
/// units = ["php${PHP_VERSION:-8.2}-fpm", "nginx"]
///
/// [health]
/// kind = "http"
/// url = "http://127.0.0.1/"
///
/// [[build]]
/// program = "composer"
/// args = ["install", "--no-dev"]
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct AppDefinition {
    /// Core settings of the application.
    pub settings: AppSettings,

    /// State carried over from one release to the next.
    #[serde(default)]
    pub preserve: Preserve,

    /// Source of new releases.
    pub upstream: Upstream,

    /// Services that serve the application.
    #[serde(default)]
    pub service: ServiceSettings,

    /// Health check performed after services restart.
    #[serde(default)]
    pub health: HealthSettings,

    /// Commands that rebuild dependencies inside a fresh release.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<BuildStep>,
}

impl AppDefinition {
    /// Load application definition from file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ReadFile`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if contents are not valid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_to_string(path.as_ref()).map_err(|err| ConfigError::ReadFile {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Replace application directory, e.g., from `APP_DIR`.
    pub fn with_app_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.app_dir = path.into();
        self
    }

    /// Replace backup directory, e.g., from `BACKUP_DIR`.
    pub fn with_backup_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.backup_dir = path.into();
        self
    }

    /// Check constraints that deserialization alone cannot express.
    ///
    /// Parsing already validates, but definitions built in code must call
    /// this before use.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingHealthUrl`] if HTTP health check lacks
    ///   a URL.
    /// - Return [`ConfigError::OutsideAppDir`] if the marker or a preserved
    ///   path does not name something inside the application directory.
    pub fn validate(&self) -> Result<()> {
        if self.health.kind == HealthKind::Http && self.health.url.is_none() {
            return Err(ConfigError::MissingHealthUrl);
        }

        let relative = std::iter::once(self.settings.marker.as_path()).chain(self.preserve.paths());
        for path in relative {
            if !names_inside(path) {
                return Err(ConfigError::OutsideAppDir {
                    path: path.to_path_buf(),
                });
            }
        }

        Ok(())
    }
}

// INVARIANT: Only plain names, so joining onto the application directory never
// leaves it or resolves to the directory itself.
fn names_inside(path: &Path) -> bool {
    let mut named = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }

    named
}

impl FromStr for AppDefinition {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut definition: AppDefinition =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every field that names a host resource.
        let settings = &mut definition.settings;
        settings.app_dir = expand(settings.app_dir.to_string_lossy().as_ref())?.into();
        settings.backup_dir = expand(settings.backup_dir.to_string_lossy().as_ref())?.into();
        for unit in definition.service.units.iter_mut() {
            *unit = expand(unit)?;
        }
        if let Some(url) = definition.health.url.as_mut() {
            *url = expand(url)?;
        }
        match &mut definition.upstream {
            Upstream::Git { url, .. } | Upstream::Tarball { url } => *url = expand(url)?,
        }

        definition.validate()?;

        Ok(definition)
    }
}

impl Display for AppDefinition {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Core application settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct AppSettings {
    /// Name of application, used as prefix of backup archives.
    pub name: String,

    /// Live application directory.
    pub app_dir: PathBuf,

    /// Directory holding backup archives.
    pub backup_dir: PathBuf,

    /// Path relative to application directory proving a real installation.
    pub marker: PathBuf,

    /// Owner to apply recursively after files move around, e.g., "www-data:www-data".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Mutable application state kept across updates.
///
/// Paths are relative to the application directory.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Preserve {
    /// Configuration files to carry over.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Data directories to carry over.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
}

impl Preserve {
    /// Iterate over every preserved path, files first.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files
            .iter()
            .chain(self.dirs.iter())
            .map(PathBuf::as_path)
    }
}

/// Where new releases are fetched from.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Upstream {
    /// Git repository. Without a reference the newest release tag is used.
    Git {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },

    /// Gzip compressed tarball of the newest release.
    Tarball { url: String },
}

/// Services depending on the application.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ServiceSettings {
    /// Systemd units to stop before the swap and start afterwards.
    #[serde(default)]
    pub units: Vec<String>,
}

/// Way to tell that a restarted application is healthy.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthKind {
    /// Every service unit reports active.
    #[default]
    Active,

    /// URL answers with HTTP 200.
    Http,
}

/// Health check settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct HealthSettings {
    /// Kind of check to perform.
    #[serde(default)]
    pub kind: HealthKind,

    /// URL to probe for [`HealthKind::Http`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Maximum number of probes.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Pause between failed probes in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Overall budget in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            kind: HealthKind::default(),
            url: None,
            attempts: default_attempts(),
            interval_ms: default_interval_ms(),
            timeout_ms: None,
        }
    }
}

fn default_attempts() -> u32 {
    30
}

fn default_interval_ms() -> u64 {
    1000
}

/// Command executed inside the application directory after the swap.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct BuildStep {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Built-in definitions for applications provisioned by the container scripts.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Preset {
    PrivateBin,
    Docmost,
    CryptPad,
}

impl Preset {
    /// Construct definition of preset.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if an application variable
    ///   cannot be expanded.
    pub fn definition(self) -> Result<AppDefinition> {
        match self {
            Self::PrivateBin => PRIVATEBIN,
            Self::Docmost => DOCMOST,
            Self::CryptPad => CRYPTPAD,
        }
        .parse()
    }
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "privatebin" => Ok(Self::PrivateBin),
            "docmost" => Ok(Self::Docmost),
            "cryptpad" => Ok(Self::CryptPad),
            _ => Err(ConfigError::UnknownPreset(name.into())),
        }
    }
}

const PRIVATEBIN: &str = r#"
[settings]
name = "privatebin"
app_dir = "/var/www/privatebin"
backup_dir = "/var/backups/privatebin"
marker = "lib/Controller.php"
owner = "www-data:www-data"

[preserve]
files = ["cfg/conf.php"]
dirs = ["data"]

[upstream]
kind = "git"
url = "https://github.com/PrivateBin/PrivateBin.git"

[service]
units = ["php${PHP_VERSION:-8.2}-fpm", "nginx"]

[health]
kind = "http"
url = "http://127.0.0.1/"
"#;

const DOCMOST: &str = r#"
[settings]
name = "docmost"
app_dir = "/opt/docmost"
backup_dir = "/var/backups/docmost"
marker = "apps/server/package.json"

[preserve]
files = [".env"]
dirs = ["data"]

[upstream]
kind = "git"
url = "https://github.com/docmost/docmost.git"

[service]
units = ["docmost"]

[health]
kind = "http"
url = "http://127.0.0.1:3000/"
attempts = 60

[[build]]
program = "pnpm"
args = ["install", "--frozen-lockfile"]

[[build]]
program = "pnpm"
args = ["build"]
"#;

const CRYPTPAD: &str = r#"
[settings]
name = "cryptpad"
app_dir = "/opt/cryptpad"
backup_dir = "/var/backups/cryptpad"
marker = "server.js"
owner = "cryptpad:cryptpad"

[preserve]
files = ["config/config.js"]
dirs = ["datastore", "blob", "block", "data"]

[upstream]
kind = "git"
url = "https://github.com/cryptpad/cryptpad.git"

[service]
units = ["cryptpad"]

[health]
kind = "http"
url = "http://127.0.0.1:3000/"
attempts = 60

[[build]]
program = "npm"
args = ["ci"]

[[build]]
program = "npm"
args = ["run", "install:components"]
"#;

fn expand(value: &str) -> Result<String> {
    Ok(shellexpand::full(value)
        .map_err(ConfigError::ShellExpansion)?
        .into_owned())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read definition file.
    #[error("failed to read application definition at {:?}", path.display())]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// HTTP health check lacks a URL.
    #[error("health check of kind \"http\" requires a url")]
    MissingHealthUrl,

    /// Marker or preserved path is absolute, climbs out through `..`, or is
    /// empty.
    #[error("path {:?} must name something inside the application directory", path.display())]
    OutsideAppDir { path: PathBuf },

    /// No built-in definition goes by this name.
    #[error("unknown preset {0:?}, expected one of privatebin, docmost, cryptpad")]
    UnknownPreset(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[sealed_test(env = [("SRV", "/srv/apps"), ("PHP_VERSION", "8.3")])]
    fn deserialize_app_definition() -> anyhow::Result<()> {
        let result: AppDefinition = r#"
            [settings]
            name = "privatebin"
            app_dir = "$SRV/privatebin"
            backup_dir = "${SRV}/backups"
            marker = "lib/Controller.php"
            owner = "www-data:www-data"

            [preserve]
            files = ["cfg/conf.php"]
            dirs = ["data"]

            [upstream]
            kind = "git"
            url = "https://github.com/PrivateBin/PrivateBin.git"
            reference = "1.7.4"

            [service]
            units = ["php${PHP_VERSION:-8.2}-fpm", "nginx"]

            [health]
            kind = "http"
            url = "http://127.0.0.1/"
            attempts = 5
            interval_ms = 200

            [[build]]
            program = "composer"
            args = ["install", "--no-dev"]
        "#
        .parse()?;

        let expect = AppDefinition {
            settings: AppSettings {
                name: "privatebin".into(),
                app_dir: "/srv/apps/privatebin".into(),
                backup_dir: "/srv/apps/backups".into(),
                marker: "lib/Controller.php".into(),
                owner: Some("www-data:www-data".into()),
            },
            preserve: Preserve {
                files: vec!["cfg/conf.php".into()],
                dirs: vec!["data".into()],
            },
            upstream: Upstream::Git {
                url: "https://github.com/PrivateBin/PrivateBin.git".into(),
                reference: Some("1.7.4".into()),
            },
            service: ServiceSettings {
                units: vec!["php8.3-fpm".into(), "nginx".into()],
            },
            health: HealthSettings {
                kind: HealthKind::Http,
                url: Some("http://127.0.0.1/".into()),
                attempts: 5,
                interval_ms: 200,
                timeout_ms: None,
            },
            build: vec![BuildStep {
                program: "composer".into(),
                args: vec!["install".into(), "--no-dev".into()],
            }],
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn minimal_definition_fills_defaults() -> anyhow::Result<()> {
        let result: AppDefinition = indoc! {r#"
            [settings]
            name = "paste"
            app_dir = "/opt/paste"
            backup_dir = "/var/backups/paste"
            marker = "VERSION"

            [upstream]
            kind = "tarball"
            url = "https://example.org/paste-latest.tar.gz"
        "#}
        .parse()?;

        assert_eq!(result.preserve, Preserve::default());
        assert_eq!(result.health, HealthSettings::default());
        assert_eq!(result.service.units, Vec::<String>::new());
        assert!(result.build.is_empty());

        Ok(())
    }

    #[test]
    fn http_health_without_url_is_rejected() {
        let result = r#"
            [settings]
            name = "paste"
            app_dir = "/opt/paste"
            backup_dir = "/var/backups/paste"
            marker = "VERSION"

            [upstream]
            kind = "tarball"
            url = "https://example.org/paste-latest.tar.gz"

            [health]
            kind = "http"
        "#
        .parse::<AppDefinition>();

        assert!(matches!(result, Err(ConfigError::MissingHealthUrl)));
    }

    #[test_case("marker", "/etc/passwd"; "absolute marker")]
    #[test_case("files", "/srv/outside.conf"; "absolute file")]
    #[test_case("files", "cfg/../../outside.conf"; "file climbing out")]
    #[test_case("dirs", "../shared"; "sibling dir")]
    #[test_case("dirs", "."; "whole app dir")]
    #[test_case("dirs", ""; "empty dir")]
    #[test]
    fn paths_leaving_app_dir_are_rejected(field: &str, path: &str) {
        let (marker, preserve) = match field {
            "marker" => (path.to_string(), String::new()),
            _ => ("VERSION".to_string(), format!("{field} = [{path:?}]")),
        };
        let result = format!(
            r#"
            [settings]
            name = "paste"
            app_dir = "/opt/paste"
            backup_dir = "/var/backups/paste"
            marker = {marker:?}

            [preserve]
            {preserve}

            [upstream]
            kind = "tarball"
            url = "https://example.org/paste-latest.tar.gz"
            "#
        )
        .parse::<AppDefinition>();

        assert!(
            matches!(&result, Err(ConfigError::OutsideAppDir { path: found }) if found == Path::new(path)),
            "unexpected result {result:?}"
        );
    }

    #[test]
    fn nested_relative_paths_are_accepted() {
        let mut definition = Preset::CryptPad.definition().unwrap();
        definition.preserve.files = vec!["./config/config.js".into()];
        definition.preserve.dirs = vec!["data/blobs".into()];
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn serialized_definition_parses_back() -> anyhow::Result<()> {
        let definition = Preset::Docmost.definition()?;
        let result: AppDefinition = definition.to_string().parse()?;
        assert_eq!(result, definition);

        Ok(())
    }

    #[test_case("privatebin", Preset::PrivateBin; "privatebin")]
    #[test_case("Docmost", Preset::Docmost; "docmost mixed case")]
    #[test_case("CRYPTPAD", Preset::CryptPad; "cryptpad upper case")]
    #[test]
    fn preset_from_name(name: &str, expect: Preset) {
        let result: Preset = name.parse().unwrap();
        assert_eq!(result, expect);
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let result = "wordpress".parse::<Preset>();
        assert!(matches!(result, Err(ConfigError::UnknownPreset(name)) if name == "wordpress"));
    }

    #[sealed_test(env = [("PHP_VERSION", "8.1")])]
    fn privatebin_preset_honours_php_version() -> anyhow::Result<()> {
        let definition = Preset::PrivateBin.definition()?;
        assert_eq!(definition.service.units, vec!["php8.1-fpm", "nginx"]);
        assert_eq!(definition.settings.marker, PathBuf::from("lib/Controller.php"));
        Ok(())
    }

    #[test]
    fn overrides_replace_paths() -> anyhow::Result<()> {
        let definition = Preset::CryptPad
            .definition()?
            .with_app_dir("/srv/cryptpad")
            .with_backup_dir("/srv/backups");

        assert_eq!(definition.settings.app_dir, PathBuf::from("/srv/cryptpad"));
        assert_eq!(definition.settings.backup_dir, PathBuf::from("/srv/backups"));
        Ok(())
    }
}
