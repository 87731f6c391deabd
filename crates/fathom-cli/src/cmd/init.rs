//! `fathom init`: data directory, database, and default config file.

use crate::config::default_config_path;
use crate::ui;
use anyhow::Context;
use fathom_memory::MemoryGraph;
use fathom_types::config::FathomConfig;
use std::path::Path;

pub async fn cmd_init(config: FathomConfig, config_path: Option<&Path>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    if config_path.exists() {
        ui::warn(&format!("Keeping existing config at {}", config_path.display()));
    } else {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = toml::to_string_pretty(&config).context("failed to render default config")?;
        std::fs::write(&config_path, body)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        ui::success(&format!("Wrote {}", config_path.display()));
    }

    let db_path = config.db_path();
    let dim = config.storage.embedding_dim;
    let graph = MemoryGraph::open(config)?;
    graph.shutdown().await;

    ui::success("Fathom initialized");
    ui::kv("Database", &db_path.display().to_string());
    ui::kv("Embedding", &format!("{dim} dimensions"));
    ui::blank();
    ui::hint("store facts with `fathom retain --bank <id> --file facts.jsonl`");
    Ok(())
}
