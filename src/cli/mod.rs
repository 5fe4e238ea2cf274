// CLI module - user-facing command-line interface

mod output;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::supervisor::Supervisor;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

/// Vigil - a small process supervisor
#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor in the foreground with the given configuration
    Run {
        /// Path to the configuration file (.toml or .json)
        config: PathBuf,

        /// Apply env_production overrides
        #[arg(long)]
        production: bool,
    },

    /// Parse and validate a configuration file
    Check {
        /// Path to the configuration file (.toml or .json)
        config: PathBuf,
    },
}

impl Cli {
    /// Run the CLI application
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute().await
    }

    async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Run { config, production } => run_supervisor(config, *production).await,
            Commands::Check { config } => check_config(config),
        }
    }
}

/// Load the configuration, start the supervisor, and run it until a
/// termination signal arrives, then shut down gracefully.
async fn run_supervisor(config_path: &Path, production: bool) -> Result<()> {
    let config = SupervisorConfig::from_file(config_path)?;
    let name = config.name.clone();

    let mut supervisor = Supervisor::start(config, production).await?;
    output::print_success(&format!(
        "Supervising '{}' with {} instance(s)",
        name,
        supervisor.instance_count()
    ));

    let handle = supervisor.shutdown_handle();
    tokio::spawn(async move {
        wait_for_termination_signal().await;
        info!("Termination signal received, requesting shutdown");
        handle.request();
    });

    supervisor.run().await
}

/// Suspend until SIGINT or SIGTERM is delivered
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Validate a configuration file and print the resolved settings
fn check_config(config_path: &Path) -> Result<()> {
    let config = SupervisorConfig::from_file(config_path)?;
    let policy = crate::supervisor::RestartPolicy::from_config(&config)?;

    output::print_success(&format!("Configuration '{}' is valid", config.name));
    output::print_field("instances", &config.resolved_instances().to_string());
    output::print_field("exec_mode", &format!("{:?}", config.exec_mode).to_lowercase());
    output::print_field("max_restarts", &policy.max_restarts.to_string());
    output::print_field("restart_delay", &format!("{:?}", policy.restart_delay));
    output::print_field("min_uptime", &format!("{:?}", policy.min_uptime));
    match policy.max_memory {
        Some(bytes) => output::print_field("max_memory_restart", &format!("{} bytes", bytes)),
        None => output::print_field("max_memory_restart", "disabled"),
    }
    output::print_field("shutdown_grace", &format!("{:?}", config.shutdown_grace()));

    Ok(())
}
