//! Warden - a compose-style service supervisor
//!
//! This is the main CLI entry point for Warden.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use warden::compose::duration::parse_duration;
use warden::compose::{
    DependencyGraph, Orchestrator, OrchestratorOptions, ProjectConfig, ProjectParser,
};
use warden::runtime::ShellRuntime;
use warden::settings::{self, Settings};
use warden::storage::VolumeManager;

/// Warden - compose-style service supervisor
#[derive(Parser)]
#[command(name = "warden")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Start local services in dependency order and keep them running", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Data directory for volumes
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the project and supervise it until interrupted
    Up {
        /// Project file; repeat to merge overlays
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Project name
        #[arg(short, long)]
        project_name: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Give up on a layer that is not healthy within this time
        #[arg(long, value_parser = parse_timeout)]
        startup_timeout: Option<Duration>,
    },

    /// Remove project resources
    Down {
        /// Project file; repeat to merge overlays
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Project name
        #[arg(short, long)]
        project_name: Option<String>,
        /// Remove named volumes
        #[arg(short, long)]
        volumes: bool,
    },

    /// Validate the project file and print start layers
    Config {
        /// Project file; repeat to merge overlays
        #[arg(short, long)]
        file: Vec<PathBuf>,
    },

    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// List volumes
    #[command(name = "ls")]
    List,
    /// Display volume information
    Inspect {
        /// Volume name
        name: String,
    },
    /// Remove a volume
    #[command(name = "rm")]
    Remove {
        /// Volume name
        name: String,
        /// Remove even when attached
        #[arg(short, long)]
        force: bool,
    },
}

fn parse_timeout(value: &str) -> std::result::Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::resolve(cli.data_dir);
    tracing::debug!("Using data directory {}", settings.data_dir.display());

    match cli.command {
        Commands::Up {
            file,
            project_name,
            json,
            startup_timeout,
        } => {
            let (name, config) = load_project(&file, project_name)?;
            let options = OrchestratorOptions {
                startup_timeout,
                ..Default::default()
            };
            let orchestrator = Orchestrator::with_options(
                &name,
                config,
                open_volumes(&settings)?,
                Arc::new(ShellRuntime::new()),
                options,
            )?;

            let cancel = orchestrator.cancel_handle();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted, shutting down");
                    cancel.cancel();
                }
            });

            let report = orchestrator.up().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }

            if report.is_healthy() {
                println!("Project {} is up. Press Ctrl-C to stop.", name);
                orchestrator.cancel_handle().token().cancelled().await;
            }

            let order = orchestrator.down(false).await?;
            interrupt.abort();
            if !order.is_empty() {
                println!("Stopped: {}", order.join(", "));
            }

            if !report.is_healthy() {
                bail!("Project {} {}", name, report.outcome);
            }
        }

        Commands::Down {
            file,
            project_name,
            volumes,
        } => {
            let (name, config) = load_project(&file, project_name)?;
            let orchestrator = Orchestrator::new(
                &name,
                config,
                open_volumes(&settings)?,
                Arc::new(ShellRuntime::new()),
            )?;

            orchestrator.down(volumes).await?;
            if volumes {
                println!("Removed volumes of project {}", name);
            } else {
                println!("Project {} is down", name);
            }
        }

        Commands::Config { file } => {
            let (name, config) = load_project(&file, None)?;
            for warning in ProjectParser::validate(&config)? {
                println!("warning: {}", warning);
            }

            let graph = DependencyGraph::new(config.services.values())?;
            println!("Project {} is valid", name);
            for (index, layer) in graph.layers().iter().enumerate() {
                println!("  layer {}: {}", index + 1, layer.join(", "));
            }
        }

        Commands::Volume { command } => {
            let volumes = open_volumes(&settings)?;

            match command {
                VolumeCommands::List => {
                    println!("{:<24} {:<12} {:<22} PATH", "NAME", "SIZE", "CREATED");
                    for record in volumes.list()? {
                        println!(
                            "{:<24} {:<12} {:<22} {}",
                            record.name,
                            record.size(),
                            record.created_at.format("%Y-%m-%d %H:%M:%S"),
                            record.backing_path.display()
                        );
                    }
                }
                VolumeCommands::Inspect { name } => {
                    let record = volumes.get(&name)?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                VolumeCommands::Remove { name, force } => {
                    volumes.remove(&name, force)?;
                    println!("{}", name);
                }
            }
        }
    }

    Ok(())
}

fn open_volumes(settings: &Settings) -> anyhow::Result<Arc<VolumeManager>> {
    let dir = settings.volumes_dir();
    let volumes = VolumeManager::new(dir.clone())
        .with_context(|| format!("Failed to open volume store at {}", dir.display()))?;
    Ok(Arc::new(volumes))
}

/// Parse, merge, and interpolate the project files
fn load_project(
    files: &[PathBuf],
    project_name: Option<String>,
) -> anyhow::Result<(String, ProjectConfig)> {
    let working_dir = std::env::current_dir()?;

    let files = if files.is_empty() {
        let found = ProjectParser::find_project_file(&working_dir).with_context(|| {
            format!("No project file found in {}", working_dir.display())
        })?;
        vec![found]
    } else {
        files.to_vec()
    };

    let mut config = ProjectParser::parse_files(&files)
        .with_context(|| format!("Failed to load {}", display_files(&files)))?;
    let env: HashMap<String, String> = std::env::vars().collect();
    ProjectParser::interpolate(&mut config, &env)?;

    let project_dir = files
        .first()
        .and_then(|f| f.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or(working_dir);
    let project_dir = project_dir.canonicalize().unwrap_or(project_dir);

    let name = project_name
        .unwrap_or_else(|| settings::project_name(config.name.as_deref(), &project_dir));
    Ok((name, config))
}

fn display_files(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| f.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
