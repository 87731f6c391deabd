//! Entity resolution: map a surface mention to a canonical entity.
//!
//! Each candidate of the same bank and type is scored as
//! `name_weight * name_similarity + cooccurrence_weight * cooccurrence
//! + temporal_weight * temporal_proximity`. The best candidate above the
//! acceptance threshold wins; otherwise a new entity is created.
//!
//! Resolution is serialized per (bank, normalized name), so two concurrent
//! mentions of "Alice" in one bank never create two entities. Different
//! surface forms of one referent ("Alice", "Alice Smith") resolved at the
//! same instant can still race and produce a duplicate.

use crate::names::{name_similarity, normalize_name};
use crate::retry::retry_transient;
use crate::store::GraphStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fathom_types::config::{ResolverConfig, RetrySettings};
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{Entity, EntityId, EntityMention, UnitId};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Score of one candidate entity against a mention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    /// Name similarity in [0, 1].
    pub name: f32,
    /// Co-occurrence score in [0, 1].
    pub cooccurrence: f32,
    /// Temporal proximity in [0, 1].
    pub temporal: f32,
    /// Weighted total.
    pub total: f32,
}

/// Finds or creates canonical entities.
pub struct EntityResolver {
    store: Arc<dyn GraphStore>,
    config: ResolverConfig,
    retry: RetrySettings,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl EntityResolver {
    /// Create a resolver over `store`.
    pub fn new(store: Arc<dyn GraphStore>, config: ResolverConfig, retry: RetrySettings) -> Self {
        Self {
            store,
            config,
            retry,
            locks: DashMap::new(),
        }
    }

    /// Score `candidate` against a mention whose normalized name is `name`.
    ///
    /// `cooccurrence` holds the candidate's co-occurrence counts with the
    /// `context_len` entities already resolved for the same fact.
    pub fn score(
        &self,
        name: &str,
        candidate: &Entity,
        cooccurrence: &HashMap<EntityId, u64>,
        context_len: usize,
        seen_at: DateTime<Utc>,
    ) -> CandidateScore {
        let name_sim = name_similarity(name, &normalize_name(&candidate.canonical_name));
        let cooc = if context_len == 0 {
            0.0
        } else {
            cooccurrence.values().filter(|c| **c > 0).count() as f32 / context_len as f32
        };
        let gap_days =
            (seen_at - candidate.last_seen).num_milliseconds().abs() as f64 / 86_400_000.0;
        let temporal = (1.0 - gap_days / self.config.temporal_window_days).max(0.0) as f32;
        let total = self.config.name_weight * name_sim
            + self.config.cooccurrence_weight * cooc
            + self.config.temporal_weight * temporal;
        CandidateScore {
            name: name_sim,
            cooccurrence: cooc,
            temporal,
            total,
        }
    }

    /// Resolve one mention to an entity id.
    ///
    /// `context` lists entities already resolved for the same fact; they
    /// feed the co-occurrence score. The chosen entity's mention count and
    /// last-seen time are updated; a new entity starts at one mention.
    pub async fn resolve(
        &self,
        bank_id: &str,
        mention: &EntityMention,
        seen_at: DateTime<Utc>,
        context: &[EntityId],
    ) -> FathomResult<EntityId> {
        let name = normalize_name(&mention.name);
        if bank_id.trim().is_empty() {
            return Err(FathomError::Validation("bank id is empty".into()));
        }
        if name.is_empty() {
            return Err(FathomError::Validation(format!(
                "entity mention '{}' has no usable characters",
                mention.name
            )));
        }

        let key = (bank_id.to_string(), name.clone());
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(bank_id, mention, &name, seen_at, context)
                .await
        };
        drop(lock);
        self.locks
            .remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn resolve_locked(
        &self,
        bank_id: &str,
        mention: &EntityMention,
        name: &str,
        seen_at: DateTime<Utc>,
        context: &[EntityId],
    ) -> FathomResult<EntityId> {
        let candidates = retry_transient(&self.retry, "entity_candidates", || {
            self.store.entity_candidates(bank_id, mention.entity_type)
        })
        .await?;

        let mut best: Option<(&Entity, CandidateScore)> = None;
        for candidate in &candidates {
            let cooccurrence = if context.is_empty() {
                HashMap::new()
            } else {
                self.store
                    .cooccurrence_counts(bank_id, candidate.id, context)
                    .await?
            };
            let score = self.score(name, candidate, &cooccurrence, context.len(), seen_at);
            if score.total < self.config.acceptance_threshold {
                continue;
            }
            best = match best {
                Some((current, current_score))
                    if prefer(current, current_score.total, candidate, score.total)
                        != Ordering::Greater =>
                {
                    Some((current, current_score))
                }
                _ => Some((candidate, score)),
            };
        }

        if let Some((entity, score)) = best {
            debug!(
                bank = bank_id,
                mention = %mention.name,
                entity = %entity.id,
                score = score.total,
                "Resolved mention to existing entity"
            );
            retry_transient(&self.retry, "touch_entity", || {
                self.store.touch_entity(bank_id, entity.id, seen_at)
            })
            .await?;
            return Ok(entity.id);
        }

        let entity = Entity {
            id: EntityId::new(),
            bank_id: bank_id.to_string(),
            canonical_name: mention.name.trim().to_string(),
            entity_type: mention.entity_type,
            first_seen: seen_at,
            last_seen: seen_at,
            mention_count: 1,
        };
        retry_transient(&self.retry, "insert_entity", || {
            self.store.insert_entity(&entity)
        })
        .await?;
        info!(
            bank = bank_id,
            entity = %entity.id,
            name = %entity.canonical_name,
            entity_type = %entity.entity_type,
            "New entity"
        );
        Ok(entity.id)
    }

    /// Resolve every mention of a fact, attach the entities to it and bump
    /// their pairwise co-occurrence counters.
    ///
    /// Mentions are resolved in order, each one seeing the previously
    /// resolved ids as context. Returns the distinct entity ids.
    pub async fn resolve_mentions(
        &self,
        bank_id: &str,
        unit_id: UnitId,
        mentions: &[EntityMention],
        seen_at: DateTime<Utc>,
    ) -> FathomResult<Vec<EntityId>> {
        let mut resolved: Vec<EntityId> = Vec::with_capacity(mentions.len());
        for mention in mentions {
            let id = self.resolve(bank_id, mention, seen_at, &resolved).await?;
            if !resolved.contains(&id) {
                resolved.push(id);
            }
        }
        if resolved.is_empty() {
            return Ok(resolved);
        }
        retry_transient(&self.retry, "attach_entities", || {
            self.store.attach_entities(bank_id, unit_id, &resolved)
        })
        .await?;
        if resolved.len() > 1 {
            retry_transient(&self.retry, "record_cooccurrences", || {
                self.store.record_cooccurrences(bank_id, &resolved)
            })
            .await?;
        }
        Ok(resolved)
    }
}

/// Compare two accepted candidates: `Greater` means `b` beats `a`.
///
/// Higher score wins, then more mentions, then older first_seen, then
/// lower id.
fn prefer(a: &Entity, a_score: f32, b: &Entity, b_score: f32) -> Ordering {
    b_score
        .total_cmp(&a_score)
        .then(b.mention_count.cmp(&a.mention_count))
        .then(a.first_seen.cmp(&b.first_seen))
        .then(a.id.cmp(&b.id))
}
