mod commands;
mod render;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sleuth_client::ClientConfig;

#[derive(Parser)]
#[command(name = "sleuth", about = "Run research tasks against a sleuth backend")]
struct Cli {
    /// Backend base URL (overrides config and SLEUTH_BACKEND_URL)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Path to a config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a research task and follow it to completion
    Run {
        /// Research query
        query: String,

        /// Export the finished report as a PDF into this directory
        #[arg(long)]
        export: Option<PathBuf>,

        /// Fail as soon as the event channel drops
        #[arg(long)]
        no_reconnect: bool,
    },

    /// Show the server-side status of a task
    Status {
        /// Task ID
        task_id: String,
    },

    /// Fetch the report of a finished task
    Download {
        /// Task ID
        task_id: String,

        /// Write a PDF into this directory instead of printing
        #[arg(long)]
        pdf: Option<PathBuf>,
    },

    /// Render a local markdown report to PDF
    Export {
        /// Markdown file
        file: PathBuf,

        /// Task ID used in the output file name
        #[arg(long)]
        task_id: Option<String>,

        /// Output directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sleuth=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(backend) = cli.backend {
        config = config.with_backend_url(backend);
    }

    match cli.command {
        Commands::Run {
            query,
            export,
            no_reconnect,
        } => commands::run(config, query, export, no_reconnect).await,
        Commands::Status { task_id } => commands::status(config, task_id).await,
        Commands::Download { task_id, pdf } => commands::download(config, task_id, pdf).await,
        Commands::Export { file, task_id, out } => commands::export(&config, &file, task_id, out),
    }
}
