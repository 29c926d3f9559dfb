//! Hostkit CLI.
//!
//! `serve` runs the host with its HTTP control plane; `load` performs a
//! one-shot load pass (exit code reflects critical failures only);
//! `validate` checks a manifest; the `registry` subcommands talk to the
//! remote archive store.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use hostkit::config::HostConfig;
use hostkit::host::PluginHost;
use hostkit::manifest;

/// Plugin host runtime CLI
#[derive(Parser)]
#[command(name = "hostkit")]
#[command(about = "Plugin host runtime with dependency-ordered loading")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Plugins directory (overrides PLUGINS_DIR)
    #[arg(short, long)]
    plugins_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load all plugins and serve the HTTP control plane
    Serve {
        /// Bind address for the control plane
        #[arg(long)]
        addr: Option<String>,
    },

    /// One-shot load pass; exits non-zero only if a critical plugin failed
    Load,

    /// Validate a plugin manifest file
    Validate {
        /// Path to plugin.manifest.json
        path: PathBuf,
    },

    /// Remote registry operations
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// List plugins available in the registry
    List,
    /// Download and load a plugin from the registry
    Install { name: String },
    /// Check loaded plugins for available updates
    Updates,
    /// Check registry reachability
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = HostConfig::from_env()?;
    if let Some(dir) = cli.plugins_dir {
        config.plugins_dir = dir;
    }

    match cli.command {
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.http_addr.clone());
            let host = PluginHost::new(config)?;
            let report = host.start().await?;
            info!(
                loaded = report.loaded.len(),
                failed = report.failed.len(),
                "plugins loaded, starting control plane"
            );

            let serve_host = host.clone();
            tokio::select! {
                result = hostkit::web::serve(serve_host, &addr) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                }
            }
            host.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Load => {
            let host = PluginHost::new(config)?;
            match host.start().await {
                Ok(report) => {
                    for name in &report.loaded {
                        println!("loaded   {name}");
                    }
                    for (name, reason) in &report.failed {
                        println!("failed   {name} ({reason})");
                    }
                    host.shutdown().await;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    error!(error = %e, "critical plugin failed");
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Validate { path } => {
            let content = tokio::fs::read_to_string(&path).await?;
            match manifest::parse_manifest(&content, &path.display().to_string()) {
                Ok(parsed) => {
                    let report = manifest::validate(&parsed);
                    println!("valid: {} v{}", parsed.name, parsed.version);
                    for warning in report.warnings {
                        println!("warning: {warning}");
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("invalid: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Registry { command } => {
            let host = PluginHost::new(config)?;
            match command {
                RegistryCommands::List => {
                    for record in host.registry().list().await? {
                        println!(
                            "{:<30} {:<12} {} bytes",
                            record.manifest.name, record.manifest.version, record.file_size
                        );
                    }
                }
                RegistryCommands::Install { name } => {
                    host.install_from_registry(&name).await?;
                    println!("installed {name}");
                }
                RegistryCommands::Updates => {
                    host.start().await?;
                    for update in host.check_updates().await? {
                        if update.update_available {
                            println!(
                                "{}: {} -> {}",
                                update.plugin, update.installed_version, update.registry_version
                            );
                        }
                    }
                    host.shutdown().await;
                }
                RegistryCommands::Status => {
                    let available = host.registry().health().await;
                    println!(
                        "registry {} is {}",
                        host.config().registry_url,
                        if available { "available" } else { "unreachable" }
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
