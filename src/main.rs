use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use dex::model::config::AppConfig;
use dex::model::project::PluginSpec;
use dex::plugin::{Installer, InstallerOptions, PluginOutcome, SyncAction};

#[derive(Debug, Parser)]
#[command(name = "dex", version, about = "Plugin manager for AI coding agents")]
struct Cli {
    /// Project directory holding dex.toml.
    #[arg(short = 'C', long = "project", global = true, default_value = ".", env = "DEX_PROJECT")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install plugins; every declared plugin when none are named.
    Install {
        /// `name` or `name@constraint`.
        specs: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Converge installed plugins onto dex.toml.
    Sync {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
    },
    /// Remove installed plugins.
    Uninstall {
        #[arg(required = true)]
        names: Vec<String>,
        /// Also drop the plugins from dex.toml.
        #[arg(long)]
        remove_from_config: bool,
        /// Uninstall plugins that depend on the named ones too.
        #[arg(long)]
        cascade: bool,
    },
    /// List installed plugins depending on NAME, directly or transitively.
    Dependents { name: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("dex: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load()?;
    let _guard = init_logging(&config)?;
    tracing::info!("dex {} in {}", env!("CARGO_PKG_VERSION"), cli.project.display());

    match cli.command {
        Command::Install { specs, force } => {
            let specs = specs
                .iter()
                .map(|raw| PluginSpec::parse(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let mut installer = open_installer(&cli.project, force || config.install.force, &config)?;
            for outcome in installer.install(&specs)? {
                print_outcome("installed", &outcome);
            }
        }
        Command::Sync { dry_run, force } => {
            let mut installer = open_installer(&cli.project, force || config.install.force, &config)?;
            let results = installer.sync(dry_run)?;
            if results.is_empty() {
                println!("nothing declared");
            }
            for result in results {
                let versions = match (result.old_version.as_deref(), result.new_version.as_deref()) {
                    (Some(old), Some(new)) if old != new => format!("{old} -> {new}"),
                    (_, Some(version)) | (Some(version), None) => version.to_string(),
                    (None, None) => String::new(),
                };
                let prefix = if dry_run && result.action != SyncAction::UpToDate {
                    "would be "
                } else {
                    ""
                };
                println!(
                    "{prefix}{:<10} {} {versions} ({})",
                    result.action, result.plugin, result.reason
                );
            }
        }
        Command::Uninstall {
            names,
            remove_from_config,
            cascade,
        } => {
            let mut installer = open_installer(&cli.project, config.install.force, &config)?;
            let dependents = dependents_closure(&installer, &names);
            if !dependents.is_empty() && !cascade {
                bail!(
                    "{} depend on {}; re-run with --cascade to remove them too",
                    dependents.join(", "),
                    names.join(", ")
                );
            }

            let targets: Vec<String> = dependents.into_iter().chain(names).collect();
            for outcome in installer.uninstall(&targets, remove_from_config)? {
                print_outcome("removed", &outcome);
            }
        }
        Command::Dependents { name } => {
            let installer = open_installer(&cli.project, false, &config)?;
            for dependent in dependents_closure(&installer, std::slice::from_ref(&name)) {
                println!("{dependent}");
            }
        }
    }

    Ok(())
}

fn open_installer(project_dir: &Path, force: bool, config: &AppConfig) -> Result<Installer> {
    let installer = Installer::new(InstallerOptions {
        project_dir: project_dir.to_path_buf(),
        force,
    })?;
    Ok(installer.with_default_registry(config.default_registry()))
}

/// Everything that depends on `names`, followed through repeated direct
/// lookups until no new name turns up. Sorted; excludes `names` themselves.
fn dependents_closure(installer: &Installer, names: &[String]) -> Vec<String> {
    let roots: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    let mut found = BTreeSet::new();
    let mut queue: Vec<String> = names.to_vec();

    while let Some(name) = queue.pop() {
        for dependent in installer.find_dependents(&name) {
            if roots.contains(dependent.as_str()) || !found.insert(dependent.clone()) {
                continue;
            }
            queue.push(dependent);
        }
    }

    found.into_iter().collect()
}

fn print_outcome(verb: &str, outcome: &PluginOutcome) {
    let report = &outcome.report;
    println!(
        "{verb} {} {} ({} written, {} unchanged, {} removed)",
        outcome.plugin,
        outcome.version.as_deref().unwrap_or("-"),
        report.written,
        report.unchanged,
        report.removed
    );
}

/// Daily-rolling file log plus warnings on stderr. Logs never go to stdout.
fn init_logging(config: &AppConfig) -> Result<WorkerGuard> {
    let log_dir = AppConfig::log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "dex.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_env("DEX_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_filter(LevelFilter::WARN),
        )
        .init();

    Ok(guard)
}
