use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use blackbox_plugins::model::config::AppConfig;
use blackbox_plugins::plugin::{Host, PluginManager};

#[derive(Debug, Parser)]
#[command(name = "blackbox-plugins", version, about = "Sync blackbox plugins from git")]
struct Cli {
    /// Config file to use instead of the one in the blackbox config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Clone plugins that are declared but not on disk.
    Install,
    /// Fetch installed plugins and check out their configured revision.
    Update,
    /// Install missing plugins and update the rest.
    Sync,
    /// Delete installed plugins that are no longer declared.
    Clean,
    /// Show declared plugins and their install state.
    List,
}

/// Outside the editor there is nothing to load into.
struct DetachedHost;

impl Host for DetachedHost {
    fn load(&self, name: &str, path: &Path) {
        tracing::debug!(plugin = name, path = %path.display(), "load ignored outside the editor");
    }
}

fn main() -> Result<ExitCode> {
    // Initialize logging to file (never stdout)
    let log_dir = directories::ProjectDirs::from("", "", "blackbox")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp"));
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "blackbox-plugins.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("blackbox_plugins=info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(command = ?cli.command, "blackbox-plugins starting");

    let config = AppConfig::load(cli.config.as_deref())?;
    let manager = PluginManager::from_config(&config, Arc::new(DetachedHost));

    for notice in manager.startup_notifications() {
        eprintln!("{notice}");
    }

    let report = match cli.command {
        Command::Install => manager.install(),
        Command::Update => manager.update(),
        Command::Sync => manager.sync(),
        Command::Clean => manager.clean(),
        Command::List => {
            for row in manager.list_notifications() {
                println!("{row}");
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    print!("{report}");

    if report.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
