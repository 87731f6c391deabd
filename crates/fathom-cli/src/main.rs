//! Fathom CLI: thin commands over the memory graph.
//!
//! Every command opens the configured SQLite database in-process, runs, and
//! drains background link work before exiting.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;
use fathom_memory::MemoryGraph;
use fathom_types::config::FathomConfig;
use tracing_subscriber::EnvFilter;

/// Log to stderr so JSON on stdout stays clean. `RUST_LOG` wins over the
/// configured level.
fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Config warnings are emitted before the real subscriber exists, so load
/// under a temporary warn-level one.
fn load_config(cli: &Cli) -> FathomConfig {
    let bootstrap = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || config::load_config(cli.config.as_deref()))
}

async fn run(cli: Cli, config: FathomConfig) -> anyhow::Result<()> {
    if let Commands::Init = cli.command {
        return cmd::init::cmd_init(config, cli.config.as_deref()).await;
    }

    let graph = MemoryGraph::open(config)?;
    let result = match cli.command {
        Commands::Init => Ok(()),
        Commands::Retain { bank, file, batch } => {
            cmd::retain::cmd_retain(&graph, &bank, &file, batch).await
        }
        Commands::Search {
            bank,
            query,
            embedding_file,
            budget,
            top_k,
            types,
            mmr,
            max_tokens,
            trace,
            entities,
        } => {
            cmd::search::cmd_search(
                &graph,
                cmd::search::SearchArgs {
                    bank,
                    query,
                    embedding_file,
                    budget,
                    top_k,
                    types,
                    mmr,
                    max_tokens,
                    trace,
                    entities,
                },
            )
            .await
        }
        Commands::Relink { bank } => cmd::graph::cmd_relink(&graph, &bank).await,
        Commands::Stats { bank, json } => cmd::graph::cmd_stats(&graph, &bank, json).await,
    };
    graph.shutdown().await;
    result
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(&cli);
    init_tracing(&config.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cli, config)) {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
