//! Shared fixtures for the memory graph integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_memory::store::{GraphStore, InMemoryGraphStore, SqliteGraphStore};
use fathom_memory::MemoryGraph;
use fathom_types::config::FathomConfig;
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{
    BankStats, CandidateFact, Entity, EntityId, EntityMention, EntityType, FactType, MemoryLink,
    MemoryUnit, UnitId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const DIM: usize = 4;
pub const BANK: &str = "agent-1";

pub fn config() -> FathomConfig {
    let mut config = FathomConfig::default();
    config.storage.embedding_dim = DIM;
    config.retry.min_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

/// A graph plus whatever keeps its backing store alive.
pub struct Harness {
    pub name: &'static str,
    pub graph: MemoryGraph,
    _dir: Option<TempDir>,
}

/// One in-memory and one SQLite-backed graph with the same config.
pub fn harnesses(config: FathomConfig) -> Vec<Harness> {
    let memory = MemoryGraph::builder(config.clone())
        .in_memory()
        .build()
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = SqliteGraphStore::open(&dir.path().join("graph.db")).unwrap();
    let sqlite = MemoryGraph::builder(config)
        .store(Arc::new(store))
        .build()
        .unwrap();

    vec![
        Harness {
            name: "memory",
            graph: memory,
            _dir: None,
        },
        Harness {
            name: "sqlite",
            graph: sqlite,
            _dir: Some(dir),
        },
    ]
}

pub fn fact(text: &str, embedding: [f32; DIM], event_date: DateTime<Utc>) -> CandidateFact {
    CandidateFact {
        event_date: Some(event_date),
        embedding: Some(embedding.to_vec()),
        entities: Some(Vec::new()),
        ..CandidateFact::world(text)
    }
}

pub fn mentioning(mut fact: CandidateFact, names: &[(&str, EntityType)]) -> CandidateFact {
    fact.entities = Some(
        names
            .iter()
            .map(|(n, t)| EntityMention::new(*n, *t))
            .collect(),
    );
    fact
}

pub async fn units_of_type(graph: &MemoryGraph, fact_type: FactType) -> Vec<MemoryUnit> {
    let ids = graph.store().list_unit_ids(BANK).await.unwrap();
    graph
        .store()
        .get_units(BANK, &ids)
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.fact_type == fact_type)
        .collect()
}

// ---------------------------------------------------------------------------
// Gated store: vector search waits on a semaphore before answering, and link
// writes touching an opinion can be made to fail
// ---------------------------------------------------------------------------

pub struct GatedStore {
    pub inner: InMemoryGraphStore,
    pub gate: Semaphore,
    reject_opinion_links: AtomicBool,
}

impl GatedStore {
    /// A store whose vector search blocks until [`GatedStore::open`].
    pub fn closed() -> Self {
        Self {
            inner: InMemoryGraphStore::new(),
            gate: Semaphore::new(0),
            reject_opinion_links: AtomicBool::new(false),
        }
    }

    /// An open store that fails every link write with an opinion endpoint
    /// until [`GatedStore::heal`].
    pub fn rejecting_opinion_links() -> Self {
        let store = Self::closed();
        store.open();
        store.reject_opinion_links.store(true, Ordering::SeqCst);
        store
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn heal(&self) {
        self.reject_opinion_links.store(false, Ordering::SeqCst);
    }

    async fn touches_opinion(&self, bank_id: &str, links: &[MemoryLink]) -> FathomResult<bool> {
        for link in links {
            for id in [link.from_unit_id, link.to_unit_id] {
                if let Some(unit) = self.inner.get_unit(bank_id, id).await? {
                    if unit.fact_type == FactType::Opinion {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl GraphStore for GatedStore {
    async fn insert_unit(&self, unit: &MemoryUnit) -> FathomResult<()> {
        self.inner.insert_unit(unit).await
    }

    async fn get_unit(&self, bank_id: &str, id: UnitId) -> FathomResult<Option<MemoryUnit>> {
        self.inner.get_unit(bank_id, id).await
    }

    async fn get_units(&self, bank_id: &str, ids: &[UnitId]) -> FathomResult<Vec<MemoryUnit>> {
        self.inner.get_units(bank_id, ids).await
    }

    async fn list_unit_ids(&self, bank_id: &str) -> FathomResult<Vec<UnitId>> {
        self.inner.list_unit_ids(bank_id).await
    }

    async fn vector_search(
        &self,
        bank_id: &str,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        fact_types: Option<&[FactType]>,
    ) -> FathomResult<Vec<(MemoryUnit, f32)>> {
        let _pass = self
            .gate
            .acquire()
            .await
            .map_err(|e| FathomError::Store(e.to_string()))?;
        self.inner
            .vector_search(bank_id, embedding, limit, min_similarity, fact_types)
            .await
    }

    async fn units_in_time_range(
        &self,
        bank_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FathomResult<Vec<MemoryUnit>> {
        self.inner.units_in_time_range(bank_id, from, to).await
    }

    async fn record_access(
        &self,
        bank_id: &str,
        ids: &[UnitId],
        at: DateTime<Utc>,
    ) -> FathomResult<()> {
        self.inner.record_access(bank_id, ids, at).await
    }

    async fn max_access_count(&self, bank_id: &str) -> FathomResult<u64> {
        self.inner.max_access_count(bank_id).await
    }

    async fn entity_candidates(
        &self,
        bank_id: &str,
        entity_type: EntityType,
    ) -> FathomResult<Vec<Entity>> {
        self.inner.entity_candidates(bank_id, entity_type).await
    }

    async fn insert_entity(&self, entity: &Entity) -> FathomResult<()> {
        self.inner.insert_entity(entity).await
    }

    async fn get_entities(&self, bank_id: &str, ids: &[EntityId]) -> FathomResult<Vec<Entity>> {
        self.inner.get_entities(bank_id, ids).await
    }

    async fn touch_entity(
        &self,
        bank_id: &str,
        id: EntityId,
        seen_at: DateTime<Utc>,
    ) -> FathomResult<()> {
        self.inner.touch_entity(bank_id, id, seen_at).await
    }

    async fn attach_entities(
        &self,
        bank_id: &str,
        unit_id: UnitId,
        entity_ids: &[EntityId],
    ) -> FathomResult<()> {
        self.inner.attach_entities(bank_id, unit_id, entity_ids).await
    }

    async fn entities_for_unit(&self, bank_id: &str, unit_id: UnitId) -> FathomResult<Vec<EntityId>> {
        self.inner.entities_for_unit(bank_id, unit_id).await
    }

    async fn units_for_entity(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        limit: Option<usize>,
    ) -> FathomResult<Vec<UnitId>> {
        self.inner.units_for_entity(bank_id, entity_id, limit).await
    }

    async fn cooccurrence_counts(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        others: &[EntityId],
    ) -> FathomResult<HashMap<EntityId, u64>> {
        self.inner.cooccurrence_counts(bank_id, entity_id, others).await
    }

    async fn record_cooccurrences(&self, bank_id: &str, entity_ids: &[EntityId]) -> FathomResult<()> {
        self.inner.record_cooccurrences(bank_id, entity_ids).await
    }

    async fn insert_links(&self, bank_id: &str, links: &[MemoryLink]) -> FathomResult<usize> {
        if self.reject_opinion_links.load(Ordering::SeqCst)
            && self.touches_opinion(bank_id, links).await?
        {
            return Err(FathomError::Store("database is locked".into()));
        }
        self.inner.insert_links(bank_id, links).await
    }

    async fn outgoing_links(&self, bank_id: &str, unit_id: UnitId) -> FathomResult<Vec<MemoryLink>> {
        self.inner.outgoing_links(bank_id, unit_id).await
    }

    async fn bank_stats(&self, bank_id: &str) -> FathomResult<BankStats> {
        self.inner.bank_stats(bank_id).await
    }
}
