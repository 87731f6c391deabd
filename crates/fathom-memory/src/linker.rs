//! Link construction between committed facts.
//!
//! Temporal, semantic, and entity links are symmetric and written in both
//! directions with the same weight. Causal links are directed and come
//! from an external classifier. Every write goes through
//! [`GraphStore::insert_links`], which refreshes the weight of an existing
//! `(from, to, link_type)` triple instead of adding a row, so rebuilding a
//! fact's links never duplicates an edge.

use crate::retry::retry_transient;
use crate::store::GraphStore;
use chrono::Duration;
use fathom_types::config::{LinkConfig, RetrySettings};
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{
    CausalRelation, EntityId, LinkReport, LinkType, MemoryLink, MemoryUnit, UnitId,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Computes and persists links for newly committed facts.
pub struct LinkBuilder {
    store: Arc<dyn GraphStore>,
    config: LinkConfig,
    retry: RetrySettings,
}

impl LinkBuilder {
    /// Create a builder over `store`.
    pub fn new(store: Arc<dyn GraphStore>, config: LinkConfig, retry: RetrySettings) -> Self {
        Self {
            store,
            config,
            retry,
        }
    }

    /// Temporal link weight for two anchors `diff` apart.
    ///
    /// `max(min_weight, 1 - diff / window)`: 1.0 at zero distance, never
    /// below the floor inside the window.
    pub fn temporal_weight(&self, diff: Duration) -> f32 {
        let window_ms = (self.config.temporal_window_hours as f64) * 3_600_000.0;
        let diff_ms = diff.num_milliseconds().unsigned_abs() as f64;
        let raw = (1.0 - diff_ms / window_ms) as f32;
        raw.max(self.config.temporal_min_weight).min(1.0)
    }

    /// Compute and persist every temporal, semantic, and entity link between
    /// `unit_id` and the other facts of the bank.
    pub async fn build_links(&self, bank_id: &str, unit_id: UnitId) -> FathomResult<LinkReport> {
        let unit = self
            .store
            .get_unit(bank_id, unit_id)
            .await?
            .ok_or_else(|| FathomError::unit_not_found(unit_id))?;

        let temporal = self.temporal_links(&unit).await?;
        let semantic = self.semantic_links(&unit).await?;
        let entity = self.entity_links(bank_id, unit_id).await?;

        let report = LinkReport {
            temporal: self.persist(bank_id, &temporal).await?,
            semantic: self.persist(bank_id, &semantic).await?,
            entity: self.persist(bank_id, &entity).await?,
            causal: 0,
            rejected: 0,
        };
        debug!(
            bank = bank_id,
            unit = %unit_id,
            temporal = report.temporal,
            semantic = report.semantic,
            entity = report.entity,
            "Built links"
        );
        Ok(report)
    }

    async fn temporal_links(&self, unit: &MemoryUnit) -> FathomResult<Vec<MemoryLink>> {
        let anchor = unit.anchor_time();
        let window = Duration::hours(self.config.temporal_window_hours as i64);
        let neighbours = self
            .store
            .units_in_time_range(&unit.bank_id, anchor - window, anchor + window)
            .await?;
        let mut links = Vec::new();
        for other in neighbours.iter().filter(|o| o.id != unit.id) {
            let weight = self.temporal_weight(other.anchor_time() - anchor);
            push_both(&mut links, unit.id, other.id, LinkType::Temporal, weight, None);
        }
        Ok(links)
    }

    async fn semantic_links(&self, unit: &MemoryUnit) -> FathomResult<Vec<MemoryLink>> {
        let hits = self
            .store
            .vector_search(
                &unit.bank_id,
                &unit.embedding,
                self.config.semantic_candidates + 1,
                self.config.semantic_threshold,
                None,
            )
            .await?;
        let mut links = Vec::new();
        for (other, similarity) in hits
            .iter()
            .filter(|(o, _)| o.id != unit.id)
            .take(self.config.semantic_candidates)
        {
            let weight = similarity.clamp(0.0, 1.0);
            push_both(&mut links, unit.id, other.id, LinkType::Semantic, weight, None);
        }
        Ok(links)
    }

    /// Persist only the entity links of a committed fact.
    ///
    /// Runs on the retain path so a new fact is reachable through its
    /// entities before the queued temporal and semantic work finishes.
    pub async fn build_entity_links(&self, bank_id: &str, unit_id: UnitId) -> FathomResult<usize> {
        let links = self.entity_links(bank_id, unit_id).await?;
        let created = self.persist(bank_id, &links).await?;
        debug!(bank = bank_id, unit = %unit_id, entity = created, "Built entity links");
        Ok(created)
    }

    async fn entity_links(&self, bank_id: &str, unit_id: UnitId) -> FathomResult<Vec<MemoryLink>> {
        let entities = self.store.entities_for_unit(bank_id, unit_id).await?;
        // Lowest shared entity id wins for each neighbour.
        let mut shared: BTreeMap<UnitId, EntityId> = BTreeMap::new();
        for entity_id in entities {
            let limit = self.config.entity_fanout_cap.map(|cap| cap + 1);
            let others = self
                .store
                .units_for_entity(bank_id, entity_id, limit)
                .await?;
            let others = others.into_iter().filter(|id| *id != unit_id);
            let others: Vec<UnitId> = match self.config.entity_fanout_cap {
                Some(cap) => others.take(cap).collect(),
                None => others.collect(),
            };
            for other in others {
                shared
                    .entry(other)
                    .and_modify(|e| *e = (*e).min(entity_id))
                    .or_insert(entity_id);
            }
        }
        let mut links = Vec::with_capacity(shared.len() * 2);
        for (other, entity_id) in shared {
            push_both(&mut links, unit_id, other, LinkType::Entity, 1.0, Some(entity_id));
        }
        Ok(links)
    }

    /// Validate and persist externally judged causal relations.
    ///
    /// A relation is rejected when its type is not causal, it is a
    /// self-loop, or either end is missing from the bank. Strength is
    /// clamped to [0, 1].
    pub async fn add_causal_links(
        &self,
        bank_id: &str,
        relations: &[CausalRelation],
    ) -> FathomResult<LinkReport> {
        let mut links = Vec::with_capacity(relations.len());
        let mut rejected = 0;
        let mut known: HashSet<UnitId> = HashSet::new();
        for relation in relations {
            if let Some(reason) = self.reject_reason(bank_id, relation, &mut known).await? {
                warn!(
                    bank = bank_id,
                    from = %relation.from_unit_id,
                    to = %relation.to_unit_id,
                    link_type = %relation.link_type,
                    reason,
                    "Rejected causal relation"
                );
                rejected += 1;
                continue;
            }
            let weight = if relation.strength.is_finite() {
                relation.strength.clamp(0.0, 1.0)
            } else {
                0.0
            };
            links.push(MemoryLink {
                from_unit_id: relation.from_unit_id,
                to_unit_id: relation.to_unit_id,
                link_type: relation.link_type,
                weight,
                entity_id: None,
            });
        }
        let causal = self.persist(bank_id, &links).await?;
        Ok(LinkReport {
            causal,
            rejected,
            ..LinkReport::default()
        })
    }

    async fn reject_reason(
        &self,
        bank_id: &str,
        relation: &CausalRelation,
        known: &mut HashSet<UnitId>,
    ) -> FathomResult<Option<&'static str>> {
        if !relation.link_type.is_causal() {
            return Ok(Some("not a causal link type"));
        }
        if relation.from_unit_id == relation.to_unit_id {
            return Ok(Some("self-loop"));
        }
        for id in [relation.from_unit_id, relation.to_unit_id] {
            if known.contains(&id) {
                continue;
            }
            if self.store.get_unit(bank_id, id).await?.is_none() {
                return Ok(Some("unknown fact"));
            }
            known.insert(id);
        }
        Ok(None)
    }

    async fn persist(&self, bank_id: &str, links: &[MemoryLink]) -> FathomResult<usize> {
        if links.is_empty() {
            return Ok(0);
        }
        retry_transient(&self.retry, "insert_links", || {
            self.store.insert_links(bank_id, links)
        })
        .await
    }
}

fn push_both(
    links: &mut Vec<MemoryLink>,
    a: UnitId,
    b: UnitId,
    link_type: LinkType,
    weight: f32,
    entity_id: Option<EntityId>,
) {
    links.push(MemoryLink {
        from_unit_id: a,
        to_unit_id: b,
        link_type,
        weight,
        entity_id,
    });
    links.push(MemoryLink {
        from_unit_id: b,
        to_unit_id: a,
        link_type,
        weight,
        entity_id,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraphStore;
    use chrono::Utc;
    use fathom_types::memory::FactType;

    fn builder(config: LinkConfig) -> (LinkBuilder, Arc<InMemoryGraphStore>) {
        let store = Arc::new(InMemoryGraphStore::new());
        (
            LinkBuilder::new(store.clone(), config, RetrySettings::default()),
            store,
        )
    }

    fn unit(text: &str, embedding: Vec<f32>) -> MemoryUnit {
        MemoryUnit::new("b", text, FactType::World, embedding)
    }

    #[test]
    fn test_temporal_weight_shape() {
        let (b, _) = builder(LinkConfig::default());
        assert_eq!(b.temporal_weight(Duration::zero()), 1.0);
        let six = b.temporal_weight(Duration::hours(6));
        let twelve = b.temporal_weight(Duration::hours(12));
        assert!((six - 0.75).abs() < 1e-6);
        assert!(twelve < six);
        assert_eq!(b.temporal_weight(Duration::hours(23)), 0.3);
        assert_eq!(b.temporal_weight(Duration::hours(-6)), six);
    }

    #[tokio::test]
    async fn test_temporal_links_inside_window_only() {
        let (b, store) = builder(LinkConfig::default());
        let now = Utc::now();
        let base = unit("base", vec![1.0, 0.0]).with_event_date(now);
        let near = unit("near", vec![0.0, 1.0]).with_event_date(now - Duration::hours(6));
        let far = unit("far", vec![0.0, 1.0]).with_event_date(now - Duration::days(3));
        for u in [&base, &near, &far] {
            store.insert_unit(u).await.unwrap();
        }
        let report = b.build_links("b", base.id).await.unwrap();
        assert_eq!(report.temporal, 2);
        let out = store.outgoing_links("b", base.id).await.unwrap();
        let temporal: Vec<_> = out
            .iter()
            .filter(|l| l.link_type == LinkType::Temporal)
            .collect();
        assert_eq!(temporal.len(), 1);
        assert_eq!(temporal[0].to_unit_id, near.id);
        assert!((temporal[0].weight - 0.75).abs() < 1e-3);
        let back = store.outgoing_links("b", near.id).await.unwrap();
        assert!(back.iter().any(|l| l.to_unit_id == base.id));
    }

    #[tokio::test]
    async fn test_semantic_threshold() {
        let (b, store) = builder(LinkConfig::default());
        let old = Utc::now() - Duration::days(30);
        let base = unit("base", vec![1.0, 0.0]);
        let close = unit("close", vec![0.8, 0.6]).with_event_date(old); // cos = 0.8
        let apart = unit("apart", vec![0.6, 0.8]).with_event_date(old); // cos = 0.6
        for u in [&base, &close, &apart] {
            store.insert_unit(u).await.unwrap();
        }
        let report = b.build_links("b", base.id).await.unwrap();
        assert_eq!(report.semantic, 2);
        let out = store.outgoing_links("b", base.id).await.unwrap();
        let semantic: Vec<_> = out
            .iter()
            .filter(|l| l.link_type == LinkType::Semantic)
            .collect();
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].to_unit_id, close.id);
        assert!((semantic[0].weight - 0.8).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_entity_links_exhaustive_and_idempotent() {
        let (b, store) = builder(LinkConfig::default());
        let alice = EntityId::new();
        let base = unit("base", vec![1.0, 0.0]);
        store.insert_unit(&base).await.unwrap();
        store.attach_entities("b", base.id, &[alice]).await.unwrap();
        for years in 1..=3 {
            let old = unit("old", vec![0.0, 1.0])
                .with_event_date(Utc::now() - Duration::days(365 * years));
            store.insert_unit(&old).await.unwrap();
            store.attach_entities("b", old.id, &[alice]).await.unwrap();
        }
        let report = b.build_links("b", base.id).await.unwrap();
        assert_eq!(report.entity, 6);
        let out = store.outgoing_links("b", base.id).await.unwrap();
        assert!(out
            .iter()
            .filter(|l| l.link_type == LinkType::Entity)
            .all(|l| l.weight == 1.0 && l.entity_id == Some(alice)));

        let again = b.build_links("b", base.id).await.unwrap();
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn test_entity_links_alone_then_full_build() {
        let (b, store) = builder(LinkConfig::default());
        let alice = EntityId::new();
        let now = Utc::now();
        let first = unit("first", vec![1.0, 0.0]).with_event_date(now);
        let second = unit("second", vec![1.0, 0.0]).with_event_date(now);
        for u in [&first, &second] {
            store.insert_unit(u).await.unwrap();
            store.attach_entities("b", u.id, &[alice]).await.unwrap();
        }

        assert_eq!(b.build_entity_links("b", second.id).await.unwrap(), 2);
        let out = store.outgoing_links("b", first.id).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].link_type, LinkType::Entity);

        let report = b.build_links("b", second.id).await.unwrap();
        assert_eq!(report.entity, 0);
        assert_eq!(report.temporal, 2);
        assert_eq!(report.semantic, 2);
    }

    #[tokio::test]
    async fn test_rebuild_refreshes_weight() {
        let store = Arc::new(InMemoryGraphStore::new());
        let now = Utc::now();
        let a = unit("a", vec![1.0, 0.0]).with_event_date(now);
        let c = unit("c", vec![0.0, 1.0]).with_event_date(now - Duration::hours(20));
        for u in [&a, &c] {
            store.insert_unit(u).await.unwrap();
        }
        let strict = LinkBuilder::new(store.clone(), LinkConfig::default(), RetrySettings::default());
        assert_eq!(strict.build_links("b", a.id).await.unwrap().temporal, 2);

        let lenient = LinkBuilder::new(
            store.clone(),
            LinkConfig {
                temporal_min_weight: 0.5,
                ..LinkConfig::default()
            },
            RetrySettings::default(),
        );
        assert_eq!(lenient.build_links("b", a.id).await.unwrap().total(), 0);
        let out = store.outgoing_links("b", c.id).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0].weight - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_entity_fanout_cap() {
        let (b, store) = builder(LinkConfig {
            entity_fanout_cap: Some(2),
            ..LinkConfig::default()
        });
        let topic = EntityId::new();
        let base = unit("base", vec![1.0, 0.0]);
        store.insert_unit(&base).await.unwrap();
        store.attach_entities("b", base.id, &[topic]).await.unwrap();
        for days in 1..=5 {
            let other = unit("other", vec![0.0, 1.0])
                .with_event_date(Utc::now() - Duration::days(days * 10));
            store.insert_unit(&other).await.unwrap();
            store.attach_entities("b", other.id, &[topic]).await.unwrap();
        }
        let report = b.build_links("b", base.id).await.unwrap();
        assert_eq!(report.entity, 4);
    }

    #[tokio::test]
    async fn test_shared_entities_record_lowest_id() {
        let (b, store) = builder(LinkConfig::default());
        let mut ids = [EntityId::new(), EntityId::new()];
        ids.sort();
        let a = unit("a", vec![1.0, 0.0]);
        let c = unit("c", vec![0.0, 1.0]).with_event_date(Utc::now() - Duration::days(9));
        for u in [&a, &c] {
            store.insert_unit(u).await.unwrap();
            store.attach_entities("b", u.id, &ids).await.unwrap();
        }
        let report = b.build_links("b", a.id).await.unwrap();
        assert_eq!(report.entity, 2);
        let out = store.outgoing_links("b", a.id).await.unwrap();
        assert_eq!(out[0].entity_id, Some(ids[0]));
    }

    #[tokio::test]
    async fn test_causal_validation() {
        let (b, store) = builder(LinkConfig::default());
        let rain = unit("it rained", vec![1.0, 0.0]);
        let wet = unit("the street is wet", vec![0.0, 1.0]);
        store.insert_unit(&rain).await.unwrap();
        store.insert_unit(&wet).await.unwrap();

        let relation = |from, to, link_type, strength| CausalRelation {
            from_unit_id: from,
            to_unit_id: to,
            link_type,
            strength,
        };
        let report = b
            .add_causal_links(
                "b",
                &[
                    relation(rain.id, wet.id, LinkType::Causes, 1.4),
                    relation(rain.id, rain.id, LinkType::Causes, 0.5),
                    relation(rain.id, UnitId::new(), LinkType::Enables, 0.5),
                    relation(rain.id, wet.id, LinkType::Semantic, 0.5),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.causal, 1);
        assert_eq!(report.rejected, 3);
        let out = store.outgoing_links("b", rain.id).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].weight, 1.0);
        assert!(store.outgoing_links("b", wet.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_unit() {
        let (b, _) = builder(LinkConfig::default());
        let err = b.build_links("b", UnitId::new()).await.unwrap_err();
        assert!(matches!(err, FathomError::NotFound { .. }));
    }
}
