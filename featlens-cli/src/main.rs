//! featlens CLI: run explanation requests from JSON files.
//!
//! Each subcommand reads a request file describing a model, its background
//! data and the rows to explain, then prints the result as JSON.

mod commands;
mod request;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// featlens: model-agnostic feature attribution
#[derive(Parser, Debug)]
#[command(name = "featlens", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (for .featlens/config.toml)
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
enum Commands {
    /// Explain one row of the request
    Explain {
        /// Request file (JSON)
        request: PathBuf,
        /// Row to explain
        #[arg(short, long, default_value = "0")]
        index: usize,
        /// Model evaluation budget for the sampling kernel
        #[arg(long)]
        max_evals: Option<usize>,
    },
    /// Explain every row of the request
    Batch {
        request: PathBuf,
        /// Rows attributed at once
        #[arg(short, long)]
        concurrency: Option<usize>,
        #[arg(long)]
        max_evals: Option<usize>,
    },
    /// Mean absolute attribution across the request rows
    Global {
        request: PathBuf,
        /// Rows to attribute (seeded subsample when fewer than available)
        #[arg(short, long)]
        sample_size: Option<usize>,
        /// Features to list (5 to 100)
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
    },
    /// Pairwise feature interactions across the request rows
    Interactions {
        request: PathBuf,
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
    },
    /// Suggest feature changes for one row
    Counterfactual {
        request: PathBuf,
        #[arg(short, long, default_value = "0")]
        index: usize,
        /// Desired change in prediction
        #[arg(short, long, allow_hyphen_values = true)]
        target_delta: f64,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to .featlens/config.toml
    Init,
    /// Show the effective configuration
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
    let log_dir = directories::ProjectDirs::from("dev", "featlens", "featlens")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "featlens.log");
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
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counterfactual_negative_delta() {
        let cli = Cli::try_parse_from([
            "featlens",
            "counterfactual",
            "req.json",
            "--target-delta",
            "-0.5",
            "-i",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Counterfactual {
                index,
                target_delta,
                ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(target_delta, -0.5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_verbosity_flags() {
        let cli = Cli::try_parse_from(["featlens", "-vv", "config", "show"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }
}
