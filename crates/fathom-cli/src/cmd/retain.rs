//! `fathom retain`: load candidate facts from JSONL.

use crate::ui;
use anyhow::Context;
use fathom_memory::MemoryGraph;
use fathom_types::memory::{CandidateFact, RetainReport, RetainRequest};
use std::io::BufRead;
use std::path::Path;
use tracing::info;

/// Parse a JSONL stream of candidate facts. Blank lines are skipped.
pub fn read_facts(reader: impl BufRead) -> anyhow::Result<Vec<CandidateFact>> {
    let mut facts = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fact: CandidateFact = serde_json::from_str(&line)
            .with_context(|| format!("line {}: not a valid fact", n + 1))?;
        facts.push(fact);
    }
    Ok(facts)
}

pub async fn cmd_retain(
    graph: &MemoryGraph,
    bank: &str,
    file: &Path,
    batch: usize,
) -> anyhow::Result<()> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("cannot open {}", file.display()))?,
    );
    let facts = read_facts(reader)?;
    if facts.is_empty() {
        ui::warn("No facts in file");
        return Ok(());
    }

    let requests: Vec<RetainRequest> = facts
        .chunks(batch.max(1))
        .map(|chunk| RetainRequest {
            bank_id: bank.to_string(),
            facts: chunk.to_vec(),
            causal: Vec::new(),
        })
        .collect();
    let reports = graph.retain_batch(&requests).await?;
    info!(bank, batches = reports.len(), "Waiting for link construction");
    graph.wait_idle().await;

    let total = reports.iter().fold(RetainReport::default(), |mut acc, r| {
        acc.unit_ids.extend(&r.unit_ids);
        acc.entities_resolved += r.entities_resolved;
        acc.jobs_enqueued += r.jobs_enqueued;
        acc
    });
    let stats = graph.job_stats();
    ui::success(&format!("Retained {} facts into '{bank}'", total.unit_ids.len()));
    ui::kv("Entities", &total.entities_resolved.to_string());
    ui::kv("Jobs", &format!("{} run, {} failed", stats.completed, stats.failed));
    for failed in graph.failed_jobs() {
        ui::warn(&format!("{} failed after {} attempts: {}", failed.job.kind(), failed.attempts, failed.error));
    }
    Ok(())
}
