//! trackhook CLI — publish training checkpoints to an experiment tracker.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// trackhook: publish training checkpoints to experiment trackers
#[derive(Parser, Debug)]
#[command(name = "trackhook", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Upload an experiment's last checkpoint, as the end-of-training hook would
    Publish {
        /// Experiment id (sub-directory of the checkpoint dir)
        #[arg(short, long)]
        experiment: String,
        /// Tracking backend, overriding the config file
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        /// Checkpoint base directory, overriding the config file
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Session init option as key=value (value parsed as JSON when possible); repeatable
        #[arg(long = "init", value_name = "KEY=VALUE")]
        init: Vec<String>,
        /// Leave the tracking session open instead of finishing it
        #[arg(long)]
        keep_open: bool,
    },
    /// List recorded checkpoints for an experiment
    Checkpoints {
        /// Experiment id
        #[arg(short, long)]
        experiment: String,
        /// Show only the checkpoint with the lowest loss
        #[arg(long, conflicts_with = "compare")]
        best: bool,
        /// Compare two checkpoints by id
        #[arg(long, num_args = 2, value_names = ["ID_A", "ID_B"])]
        compare: Option<Vec<String>>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub(crate) enum BackendArg {
    Local,
    Http,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create a default .trackhook/config.toml
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "trackhook", "trackhook")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "trackhook.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());

    commands::handle_command(cli.command, &workspace).await
}
