//! gangrun CLI
//!
//! Launches a program as a gang of ranked workers on a local cluster.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gangrun_core::LoggingConfig;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// gangrun - gang launcher for distributed training workers
#[derive(Parser, Debug)]
#[command(name = "gangrun")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program on every worker of a new group
    Launch(commands::LaunchArgs),

    /// Print the rank assignment for a host string
    Plan {
        /// Hosts with slot counts, e.g. a:3,b:2
        #[arg(long)]
        hosts: String,

        /// Number of processes (defaults to all slots)
        #[arg(long)]
        num_proc: Option<u32>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match &config.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            let subscriber = builder.with_ansi(false).with_writer(Mutex::new(file)).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: cli.log_level,
        file: cli.log_file,
    })?;

    match cli.command {
        Commands::Launch(args) => {
            let code = commands::launch(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Plan {
            hosts,
            num_proc,
            json,
        } => {
            commands::plan(&hosts, num_proc, json)?;
        }
    }

    Ok(())
}
