//! `fathom search`: print a ranked search response as JSON.

use anyhow::Context;
use fathom_memory::MemoryGraph;
use fathom_types::memory::FactType;
use fathom_types::search::{SearchRequest, ThinkingBudget};
use std::path::Path;

/// Flags of the search subcommand.
pub struct SearchArgs {
    pub bank: String,
    pub query: String,
    pub embedding_file: std::path::PathBuf,
    pub budget: Option<ThinkingBudget>,
    pub top_k: Option<usize>,
    pub types: Vec<FactType>,
    pub mmr: Option<f32>,
    pub max_tokens: Option<usize>,
    pub trace: bool,
    pub entities: bool,
}

pub fn read_embedding(path: &Path) -> anyhow::Result<Vec<f32>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))
}

pub async fn cmd_search(graph: &MemoryGraph, args: SearchArgs) -> anyhow::Result<()> {
    let defaults = &graph.config().search;
    let mut request = SearchRequest::new(args.bank, args.query, read_embedding(&args.embedding_file)?)
        .budget(
            args.budget
                .unwrap_or(ThinkingBudget::Custom(defaults.default_budget)),
        )
        .top_k(args.top_k.unwrap_or(defaults.default_top_k));
    if !args.types.is_empty() {
        request = request.fact_types(args.types);
    }
    if let Some(lambda) = args.mmr {
        request = request.mmr(lambda);
    }
    if args.trace {
        request = request.with_trace();
    }
    if args.entities {
        request = request.with_entities();
    }
    request.max_tokens = args.max_tokens;

    let response = graph.search(&request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
