//! Lectern CLI - command-line host for the Lectern tutoring pipeline.
//!
//! Runs single questions through the full pipeline, inspects routing offline,
//! and reads back the learner store.

mod callback;
mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Lectern: a course-scoped tutor with a policy gate and mastery tracking
#[derive(Parser, Debug)]
#[command(name = "lectern", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds .lectern/config.toml)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Ask a question through the full pipeline
    Ask {
        /// The learner's question
        query: String,
        /// Learner identifier
        #[arg(short, long, default_value = "local")]
        user: String,
        /// Optional role forwarded to templates (e.g. student, ta)
        #[arg(long)]
        role: Option<String>,
        /// JSON file with prior turns: [{"role": "user", "text": "..."}]
        #[arg(long)]
        history: Option<PathBuf>,
        /// Wait for the whole answer instead of streaming tokens
        #[arg(long)]
        no_stream: bool,
        /// Print the response payload as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show how a query would be gated, routed and scaffolded (no network)
    Route {
        /// The query to inspect
        query: String,
        /// Prior mastery as concept=score (repeatable)
        #[arg(short, long = "mastery", value_name = "CONCEPT=SCORE")]
        mastery: Vec<String>,
    },
    /// List stored mastery records for a learner
    Mastery {
        /// Learner identifier
        #[arg(short, long)]
        user: String,
    },
    /// List recent interactions for a learner, newest first
    History {
        /// Learner identifier
        #[arg(short, long)]
        user: String,
        /// Number of records to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // RUST_LOG wins over the verbosity flag for stderr.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "lectern", "lectern")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "lectern.log");
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
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_route_with_mastery() {
        let cli = Cli::try_parse_from([
            "lectern",
            "route",
            "I'm lost on backprop",
            "--mastery",
            "backpropagation=0.4",
            "-m",
            "overfitting=0.9",
        ])
        .unwrap();
        match cli.command {
            Commands::Route { query, mastery } => {
                assert_eq!(query, "I'm lost on backprop");
                assert_eq!(mastery, vec!["backpropagation=0.4", "overfitting=0.9"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["lectern", "history", "-u", "alice", "-vv", "-w", "/tmp"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.workspace, PathBuf::from("/tmp"));
    }
}
