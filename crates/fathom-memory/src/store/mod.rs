//! The graph store interface and its two implementations.
//!
//! The resolver, link builder, and search engine only ever see
//! [`GraphStore`]; persistence details stay behind it.
//! - [`SqliteGraphStore`]: durable store on rusqlite.
//! - [`InMemoryGraphStore`]: lock-protected maps, for tests and ephemeral banks.

mod memory;
mod sqlite;

pub use memory::InMemoryGraphStore;
pub use sqlite::SqliteGraphStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_types::error::FathomResult;
use fathom_types::memory::{
    BankStats, Entity, EntityId, EntityType, FactType, MemoryLink, MemoryUnit, UnitId,
};
use std::collections::HashMap;

/// Persisted facts, entities, and links.
///
/// Every operation is scoped to a bank; nothing ever crosses banks.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // -- Facts --

    /// Insert a new fact. Fails if the id already exists.
    async fn insert_unit(&self, unit: &MemoryUnit) -> FathomResult<()>;

    /// Fetch one fact.
    async fn get_unit(&self, bank_id: &str, id: UnitId) -> FathomResult<Option<MemoryUnit>>;

    /// Fetch several facts; missing ids are skipped.
    async fn get_units(&self, bank_id: &str, ids: &[UnitId]) -> FathomResult<Vec<MemoryUnit>>;

    /// All fact ids in the bank, oldest anchor first.
    async fn list_unit_ids(&self, bank_id: &str) -> FathomResult<Vec<UnitId>>;

    /// Nearest facts to `embedding` with similarity >= `min_similarity`,
    /// best first (ties by unit id), optionally restricted to `fact_types`.
    async fn vector_search(
        &self,
        bank_id: &str,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        fact_types: Option<&[FactType]>,
    ) -> FathomResult<Vec<(MemoryUnit, f32)>>;

    /// Facts whose anchor time lies in `[from, to]`.
    async fn units_in_time_range(
        &self,
        bank_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FathomResult<Vec<MemoryUnit>>;

    /// Record that a fact was returned by a search. A single atomic write.
    async fn record_access(&self, bank_id: &str, ids: &[UnitId], at: DateTime<Utc>)
        -> FathomResult<()>;

    /// Highest access count in the bank.
    async fn max_access_count(&self, bank_id: &str) -> FathomResult<u64>;

    // -- Entities --

    /// Existing entities of one type, candidates for resolution.
    async fn entity_candidates(
        &self,
        bank_id: &str,
        entity_type: EntityType,
    ) -> FathomResult<Vec<Entity>>;

    /// Insert a new entity.
    async fn insert_entity(&self, entity: &Entity) -> FathomResult<()>;

    /// Fetch entities by id; missing ids are skipped.
    async fn get_entities(&self, bank_id: &str, ids: &[EntityId]) -> FathomResult<Vec<Entity>>;

    /// Count one more mention: `mention_count + 1`, `last_seen = max(last_seen, seen_at)`.
    async fn touch_entity(
        &self,
        bank_id: &str,
        id: EntityId,
        seen_at: DateTime<Utc>,
    ) -> FathomResult<()>;

    /// Associate a fact with the entities it mentions.
    async fn attach_entities(
        &self,
        bank_id: &str,
        unit_id: UnitId,
        entity_ids: &[EntityId],
    ) -> FathomResult<()>;

    /// Entities mentioned by a fact, sorted by id.
    async fn entities_for_unit(&self, bank_id: &str, unit_id: UnitId)
        -> FathomResult<Vec<EntityId>>;

    /// Facts mentioning an entity, most recent anchor first, optionally capped.
    async fn units_for_entity(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        limit: Option<usize>,
    ) -> FathomResult<Vec<UnitId>>;

    /// Co-occurrence counts between `entity_id` and each of `others`.
    /// Pairs that never co-occurred are absent.
    async fn cooccurrence_counts(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        others: &[EntityId],
    ) -> FathomResult<HashMap<EntityId, u64>>;

    /// Increment the counter of every unordered pair in `entity_ids`.
    async fn record_cooccurrences(&self, bank_id: &str, entity_ids: &[EntityId])
        -> FathomResult<()>;

    // -- Links --

    /// Insert links. An existing `(from, to, link_type)` triple keeps its row
    /// and takes the new weight. Returns the number of edges actually created.
    async fn insert_links(&self, bank_id: &str, links: &[MemoryLink]) -> FathomResult<usize>;

    /// Links leaving a fact.
    async fn outgoing_links(&self, bank_id: &str, unit_id: UnitId) -> FathomResult<Vec<MemoryLink>>;

    // -- Admin --

    /// Record counts for the bank.
    async fn bank_stats(&self, bank_id: &str) -> FathomResult<BankStats>;
}

/// Order two entity ids so a symmetric pair has one key.
pub(crate) fn ordered_pair(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Sort vector hits best-first, ties by unit id.
pub(crate) fn sort_hits(hits: &mut [(MemoryUnit, f32)]) {
    hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
}
