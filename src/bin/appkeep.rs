// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use appkeep::{
    fetcher_for,
    path::resolve_definition_path,
    AppDefinition, Fetcher, Maintainer, Preset, Systemctl, SystemRunner,
};

use anyhow::{anyhow, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  appkeep [options] <appkeep-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Application definition file, or name of one in the definition directory.
    #[arg(short, long, group = "source", value_name = "file")]
    pub definition: Option<PathBuf>,

    /// Built-in application definition: privatebin, docmost, or cryptpad.
    #[arg(short, long, group = "source", value_name = "name")]
    pub preset: Option<String>,

    /// Override live application directory.
    #[arg(long, env = "APP_DIR", value_name = "path")]
    pub app_dir: Option<PathBuf>,

    /// Override backup directory.
    #[arg(long, env = "BACKUP_DIR", value_name = "path")]
    pub backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    fn run(self) -> Result<()> {
        let Some(command) = self.command.clone() else {
            Cli::command().print_help()?;
            return Ok(());
        };

        let maintainer = self.maintainer()?;
        match command {
            Command::Update => run_update(&maintainer),
            Command::Backup => run_backup(&maintainer),
            Command::ListBackups => run_list_backups(&maintainer),
            Command::Restore(opts) => run_restore(&maintainer, opts),
            Command::RestoreLatest => run_restore_latest(&maintainer),
            Command::Prune(opts) => run_prune(&maintainer, opts),
        }
    }

    fn definition(&self) -> Result<AppDefinition> {
        let mut definition = match (&self.definition, &self.preset) {
            (Some(path), _) => AppDefinition::load(resolve_definition_path(path)?)?,
            (None, Some(name)) => name.parse::<Preset>()?.definition()?,
            (None, None) => {
                return Err(anyhow!(
                    "no application given, use --definition <file> or --preset <name>"
                ))
            }
        };

        if let Some(app_dir) = &self.app_dir {
            definition = definition.with_app_dir(app_dir);
        }

        if let Some(backup_dir) = &self.backup_dir {
            definition = definition.with_backup_dir(backup_dir);
        }

        Ok(definition)
    }

    fn maintainer(&self) -> Result<HostMaintainer> {
        let definition = self.definition()?;
        let fetcher = fetcher_for(&definition.upstream);
        let services = Systemctl::new(SystemRunner::new());

        Ok(Maintainer::new(definition, fetcher, services, SystemRunner::new())?)
    }
}

type HostMaintainer = Maintainer<Box<dyn Fetcher>, Systemctl, SystemRunner>;

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Upgrade application to its newest release, rolling back on failure.
    Update,

    /// Snapshot application directory into backup directory.
    Backup,

    /// List backup archives, oldest first.
    ListBackups,

    /// Restore application directory from backup archive.
    #[command(override_usage = "appkeep restore [options] <file>")]
    Restore(RestoreOptions),

    /// Restore application directory from most recent backup archive.
    RestoreLatest,

    /// Delete old backup archives.
    #[command(override_usage = "appkeep prune [options] --keep <count>")]
    Prune(PruneOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RestoreOptions {
    /// Archive file name inside backup directory, or path to archive.
    #[arg(required = true, value_name = "file")]
    pub archive: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PruneOptions {
    /// Number of newest archives to keep.
    #[arg(short, long, value_name = "count")]
    pub keep: usize,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_update(maintainer: &HostMaintainer) -> Result<()> {
    let report = maintainer.update()?;
    info!("previous version kept in {}", report.backup.path().display());

    Ok(())
}

fn run_backup(maintainer: &HostMaintainer) -> Result<()> {
    let archive = maintainer.backup()?;
    println!("{}", archive.path().display());

    Ok(())
}

fn run_list_backups(maintainer: &HostMaintainer) -> Result<()> {
    let archives = maintainer.list_backups()?;
    if archives.is_empty() {
        info!(
            "no backups in {}",
            maintainer.store().backup_dir().display()
        );
        return Ok(());
    }

    for archive in archives {
        let size = archive
            .path()
            .metadata()
            .map(|meta| meta.len())
            .unwrap_or_default();
        println!(
            "{}  {}  {size:>12}",
            archive.timestamp().format("%Y-%m-%d %H:%M:%S"),
            archive.file_name(),
        );
    }

    Ok(())
}

fn run_restore(maintainer: &HostMaintainer, opts: RestoreOptions) -> Result<()> {
    let report = maintainer.restore(opts.archive)?;
    if let Some(previous) = report.previous {
        info!("replaced directory kept at {}", previous.display());
    }

    Ok(())
}

fn run_restore_latest(maintainer: &HostMaintainer) -> Result<()> {
    let report = maintainer.restore_latest()?;
    info!("restored {}", report.archive.display());
    if let Some(previous) = report.previous {
        info!("replaced directory kept at {}", previous.display());
    }

    Ok(())
}

fn run_prune(maintainer: &HostMaintainer, opts: PruneOptions) -> Result<()> {
    for archive in maintainer.prune(opts.keep)? {
        println!("removed {}", archive.file_name());
    }

    Ok(())
}
