//! docloader: run deterministic load and validation plans against a database
//! backend, and inspect or reconcile their persisted results.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod plan;
mod summary;

/// Deterministic data loading and verification
#[derive(Parser)]
#[command(name = "docloader")]
#[command(about = "Load, mutate and validate synthetic datasets", long_about = None)]
#[command(version)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task of a plan inside one request
    ///
    /// Tasks run in plan order, so validations see the mutations of earlier
    /// updates. Ctrl-C cancels the request at the next sub-batch boundary.
    Run {
        /// Path to the TOML plan
        #[arg(long)]
        plan: PathBuf,

        /// Directory for task state, results and request snapshots
        #[arg(long, env = "DOCLOADER_STORE", default_value = ".docloader")]
        store: PathBuf,

        /// Sub-batches per task (overrides plan and environment)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Rerun a task of a saved request against its unresolved offsets
    Rerun {
        #[arg(long, env = "DOCLOADER_STORE", default_value = ".docloader")]
        store: PathBuf,

        /// Request identifier printed by `run`
        #[arg(long)]
        request_id: String,

        #[arg(long)]
        result_seed: String,
    },

    /// Ignore or retry the recorded exceptions of a task
    Retry {
        #[arg(long, env = "DOCLOADER_STORE", default_value = ".docloader")]
        store: PathBuf,

        #[arg(long)]
        request_id: String,

        #[arg(long)]
        result_seed: String,

        /// Exception category to treat as success (repeatable)
        #[arg(long = "ignore")]
        ignore: Vec<String>,

        /// Exception category to retry (repeatable; default: all)
        #[arg(long = "retry")]
        retry: Vec<String>,

        /// Attempts per failed offset
        #[arg(long, default_value = "1")]
        attempts: u32,
    },

    /// Show the persisted result of a task
    Show {
        #[arg(long, env = "DOCLOADER_STORE", default_value = ".docloader")]
        store: PathBuf,

        #[arg(long)]
        result_seed: String,

        /// Failed offsets listed per category
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if cli.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Run {
            plan,
            store,
            threads,
        } => runtime.block_on(commands::run(plan, store, threads)),
        Commands::Rerun {
            store,
            request_id,
            result_seed,
        } => runtime.block_on(commands::rerun(store, request_id, result_seed)),
        Commands::Retry {
            store,
            request_id,
            result_seed,
            ignore,
            retry,
            attempts,
        } => runtime.block_on(commands::retry(
            store,
            request_id,
            result_seed,
            docloader::Exceptions {
                ignore_exceptions: ignore,
                retry_exceptions: retry,
                retry_attempts: attempts,
            },
        )),
        Commands::Show {
            store,
            result_seed,
            limit,
        } => commands::show(store, result_seed, limit),
    }
}
