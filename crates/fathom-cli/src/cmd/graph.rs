//! `fathom relink` and `fathom stats`.

use crate::ui;
use fathom_memory::MemoryGraph;
use fathom_types::memory::LinkType;

pub async fn cmd_relink(graph: &MemoryGraph, bank: &str) -> anyhow::Result<()> {
    let report = graph.relink(bank).await?;
    ui::section(&format!("Relinked '{bank}'"));
    ui::kv("Temporal", &report.temporal.to_string());
    ui::kv("Semantic", &report.semantic.to_string());
    ui::kv("Entity", &report.entity.to_string());
    if report.total() == 0 {
        ui::success("Graph was already fully linked");
    } else {
        ui::warn(&format!("{} missing edges were added", report.total()));
    }
    Ok(())
}

pub async fn cmd_stats(graph: &MemoryGraph, bank: &str, json: bool) -> anyhow::Result<()> {
    let stats = graph.bank_stats(bank).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    ui::section(&format!("Bank '{bank}'"));
    ui::kv("Facts", &stats.units.to_string());
    ui::kv("Entities", &stats.entities.to_string());
    ui::kv("Links", &stats.total_links().to_string());
    for link_type in LinkType::ALL {
        let n = stats.links_by_type.get(link_type.as_str()).copied().unwrap_or(0);
        if n > 0 {
            ui::kv(&format!("  {link_type}"), &n.to_string());
        }
    }
    Ok(())
}
