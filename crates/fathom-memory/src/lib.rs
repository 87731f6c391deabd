//! Long-term memory graph for AI agents.
//!
//! Facts are stored as memory units in per-agent banks, mentions are
//! resolved to canonical entities, and units are connected by temporal,
//! semantic, entity, and causal links. Retrieval spreads activation from
//! the closest facts across those links under a fixed expansion budget.
//!
//! Callers interact with [`MemoryGraph`], which sits over a [`store::GraphStore`]
//! implementation (SQLite or in-memory).

pub mod admission;
pub mod jobs;
pub mod linker;
pub mod metrics;
pub mod migration;
pub mod names;
pub mod resolver;
pub mod retry;
pub mod search;
pub mod similarity;
pub mod store;

mod ingest;
mod substrate;
pub use substrate::{MemoryGraph, MemoryGraphBuilder};
