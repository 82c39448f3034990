use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

mod cli;
mod config;
mod error;
mod indexing;
mod normalize;
mod service;
mod session;
mod storage;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(version)]
#[command(about = "Persistent, incrementally updated declaration index for PHP codebases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a project directory
    Index {
        /// Project directory to index
        #[arg(default_value = ".")]
        project: String,

        /// Drop and recreate the index before indexing
        #[arg(short, long)]
        rebuild: bool,
    },

    /// Watch a project and reindex on change
    Watch {
        /// Project directory to watch
        #[arg(default_value = ".")]
        project: String,
    },

    /// Remove index entries for files no longer on disk
    Prune {
        /// Project directory
        #[arg(default_value = ".")]
        project: String,
    },

    /// Show index statistics
    Stats {
        /// Project directory
        #[arg(default_value = ".")]
        project: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .init();

    match cli.command {
        Commands::Index { project, rebuild } => cli::index::index_project(project, rebuild).await,
        Commands::Watch { project } => cli::watch::watch_project(project).await,
        Commands::Prune { project } => cli::prune::prune_project(project).await,
        Commands::Stats { project } => cli::stats::show_stats(project).await,
    }
}
