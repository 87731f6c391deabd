//! Clap CLI definitions for Fathom.

use clap::{Parser, Subcommand};
use fathom_types::memory::FactType;
use fathom_types::search::ThinkingBudget;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  fathom init                                      Create the database and default config
  fathom retain --bank alice --file facts.jsonl    Store pre-extracted facts
  fathom search --bank alice --query \"What does Alice do?\" --embedding-file q.json
  fathom relink --bank alice                       Rebuild links (reports new edges)
  fathom stats --bank alice                        Fact, entity and link counts";

/// Fathom: long-term memory graph for AI agents.
#[derive(Parser)]
#[command(name = "fathom", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the data directory, the database, and a default config file.
    Init,
    /// Store facts from a JSONL file, one candidate fact per line.
    Retain {
        /// Target bank.
        #[arg(long)]
        bank: String,
        /// JSONL file of facts (embedding and entity mentions inline).
        #[arg(long)]
        file: PathBuf,
        /// Facts per retain call.
        #[arg(long, default_value_t = 64)]
        batch: usize,
    },
    /// Spreading-activation search; prints JSON.
    Search {
        /// Bank to search.
        #[arg(long)]
        bank: String,
        /// Query text.
        #[arg(long)]
        query: String,
        /// JSON file holding the query embedding as an array of numbers.
        #[arg(long)]
        embedding_file: PathBuf,
        /// Thinking budget: low, mid, high, or a number of facts.
        #[arg(long)]
        budget: Option<ThinkingBudget>,
        /// Number of results.
        #[arg(long)]
        top_k: Option<usize>,
        /// Restrict to fact types (comma-separated).
        #[arg(long, value_delimiter = ',')]
        types: Vec<FactType>,
        /// Diversify results with MMR (lambda in [0, 1]).
        #[arg(long)]
        mmr: Option<f32>,
        /// Cap results by estimated token count.
        #[arg(long)]
        max_tokens: Option<usize>,
        /// Include the exploration trace.
        #[arg(long)]
        trace: bool,
        /// Include entities mentioned by the results.
        #[arg(long)]
        entities: bool,
    },
    /// Re-run link construction for every fact of a bank.
    Relink {
        /// Bank to relink.
        #[arg(long)]
        bank: String,
    },
    /// Show fact, entity, and link counts for a bank.
    Stats {
        /// Bank to inspect.
        #[arg(long)]
        bank: String,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}
