//! In-memory graph store.

use super::{ordered_pair, sort_hits, GraphStore};
use crate::similarity::cosine_similarity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{
    BankStats, Entity, EntityId, EntityType, FactType, LinkType, MemoryLink, MemoryUnit, UnitId,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Bank {
    units: HashMap<UnitId, MemoryUnit>,
    entities: HashMap<EntityId, Entity>,
    unit_entities: HashMap<UnitId, BTreeSet<EntityId>>,
    entity_units: HashMap<EntityId, BTreeSet<UnitId>>,
    cooccurrences: HashMap<(EntityId, EntityId), u64>,
    links: HashMap<UnitId, Vec<MemoryLink>>,
}

/// Graph store keeping every bank in process memory.
#[derive(Default)]
pub struct InMemoryGraphStore {
    banks: RwLock<HashMap<String, Bank>>,
}

impl InMemoryGraphStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> FathomResult<RwLockReadGuard<'_, HashMap<String, Bank>>> {
        self.banks
            .read()
            .map_err(|e| FathomError::Internal(e.to_string()))
    }

    fn write(&self) -> FathomResult<RwLockWriteGuard<'_, HashMap<String, Bank>>> {
        self.banks
            .write()
            .map_err(|e| FathomError::Internal(e.to_string()))
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn insert_unit(&self, unit: &MemoryUnit) -> FathomResult<()> {
        let mut banks = self.write()?;
        let bank = banks.entry(unit.bank_id.clone()).or_default();
        if bank.units.contains_key(&unit.id) {
            return Err(FathomError::Store(format!("unit {} already exists", unit.id)));
        }
        bank.units.insert(unit.id, unit.clone());
        Ok(())
    }

    async fn get_unit(&self, bank_id: &str, id: UnitId) -> FathomResult<Option<MemoryUnit>> {
        let banks = self.read()?;
        Ok(banks.get(bank_id).and_then(|b| b.units.get(&id).cloned()))
    }

    async fn get_units(&self, bank_id: &str, ids: &[UnitId]) -> FathomResult<Vec<MemoryUnit>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| bank.units.get(id).cloned()).collect())
    }

    async fn list_unit_ids(&self, bank_id: &str) -> FathomResult<Vec<UnitId>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(Vec::new());
        };
        let mut units: Vec<&MemoryUnit> = bank.units.values().collect();
        units.sort_by(|a, b| a.anchor_time().cmp(&b.anchor_time()).then(a.id.cmp(&b.id)));
        Ok(units.into_iter().map(|u| u.id).collect())
    }

    async fn vector_search(
        &self,
        bank_id: &str,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        fact_types: Option<&[FactType]>,
    ) -> FathomResult<Vec<(MemoryUnit, f32)>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(MemoryUnit, f32)> = bank
            .units
            .values()
            .filter(|u| fact_types.map_or(true, |types| types.contains(&u.fact_type)))
            .map(|u| (u, cosine_similarity(embedding, &u.embedding)))
            .filter(|(_, sim)| *sim >= min_similarity)
            .map(|(u, sim)| (u.clone(), sim))
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn units_in_time_range(
        &self,
        bank_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FathomResult<Vec<MemoryUnit>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(Vec::new());
        };
        let mut units: Vec<MemoryUnit> = bank
            .units
            .values()
            .filter(|u| {
                let t = u.anchor_time();
                t >= from && t <= to
            })
            .cloned()
            .collect();
        units.sort_by(|a, b| a.anchor_time().cmp(&b.anchor_time()).then(a.id.cmp(&b.id)));
        Ok(units)
    }

    async fn record_access(
        &self,
        bank_id: &str,
        ids: &[UnitId],
        at: DateTime<Utc>,
    ) -> FathomResult<()> {
        let mut banks = self.write()?;
        let Some(bank) = banks.get_mut(bank_id) else {
            return Ok(());
        };
        for id in ids {
            if let Some(unit) = bank.units.get_mut(id) {
                unit.access_count += 1;
                unit.last_accessed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn max_access_count(&self, bank_id: &str) -> FathomResult<u64> {
        let banks = self.read()?;
        Ok(banks
            .get(bank_id)
            .and_then(|b| b.units.values().map(|u| u.access_count).max())
            .unwrap_or(0))
    }

    async fn entity_candidates(
        &self,
        bank_id: &str,
        entity_type: EntityType,
    ) -> FathomResult<Vec<Entity>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(Vec::new());
        };
        let mut entities: Vec<Entity> = bank
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.id);
        Ok(entities)
    }

    async fn insert_entity(&self, entity: &Entity) -> FathomResult<()> {
        let mut banks = self.write()?;
        let bank = banks.entry(entity.bank_id.clone()).or_default();
        if bank.entities.contains_key(&entity.id) {
            return Err(FathomError::Store(format!(
                "entity {} already exists",
                entity.id
            )));
        }
        bank.entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_entities(&self, bank_id: &str, ids: &[EntityId]) -> FathomResult<Vec<Entity>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| bank.entities.get(id).cloned())
            .collect())
    }

    async fn touch_entity(
        &self,
        bank_id: &str,
        id: EntityId,
        seen_at: DateTime<Utc>,
    ) -> FathomResult<()> {
        let mut banks = self.write()?;
        let entity = banks
            .get_mut(bank_id)
            .and_then(|b| b.entities.get_mut(&id))
            .ok_or_else(|| FathomError::entity_not_found(id))?;
        entity.mention_count += 1;
        if seen_at > entity.last_seen {
            entity.last_seen = seen_at;
        }
        Ok(())
    }

    async fn attach_entities(
        &self,
        bank_id: &str,
        unit_id: UnitId,
        entity_ids: &[EntityId],
    ) -> FathomResult<()> {
        let mut banks = self.write()?;
        let bank = banks
            .get_mut(bank_id)
            .ok_or_else(|| FathomError::unit_not_found(unit_id))?;
        if !bank.units.contains_key(&unit_id) {
            return Err(FathomError::unit_not_found(unit_id));
        }
        for entity_id in entity_ids {
            bank.unit_entities.entry(unit_id).or_default().insert(*entity_id);
            bank.entity_units.entry(*entity_id).or_default().insert(unit_id);
        }
        Ok(())
    }

    async fn entities_for_unit(
        &self,
        bank_id: &str,
        unit_id: UnitId,
    ) -> FathomResult<Vec<EntityId>> {
        let banks = self.read()?;
        Ok(banks
            .get(bank_id)
            .and_then(|b| b.unit_entities.get(&unit_id))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn units_for_entity(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        limit: Option<usize>,
    ) -> FathomResult<Vec<UnitId>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(Vec::new());
        };
        let Some(unit_ids) = bank.entity_units.get(&entity_id) else {
            return Ok(Vec::new());
        };
        let mut units: Vec<&MemoryUnit> = unit_ids
            .iter()
            .filter_map(|id| bank.units.get(id))
            .collect();
        units.sort_by(|a, b| b.anchor_time().cmp(&a.anchor_time()).then(a.id.cmp(&b.id)));
        let ids = units.into_iter().map(|u| u.id);
        Ok(match limit {
            Some(n) => ids.take(n).collect(),
            None => ids.collect(),
        })
    }

    async fn cooccurrence_counts(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        others: &[EntityId],
    ) -> FathomResult<HashMap<EntityId, u64>> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(HashMap::new());
        };
        Ok(others
            .iter()
            .filter(|other| **other != entity_id)
            .filter_map(|other| {
                bank.cooccurrences
                    .get(&ordered_pair(entity_id, *other))
                    .map(|count| (*other, *count))
            })
            .collect())
    }

    async fn record_cooccurrences(
        &self,
        bank_id: &str,
        entity_ids: &[EntityId],
    ) -> FathomResult<()> {
        let distinct: BTreeSet<EntityId> = entity_ids.iter().copied().collect();
        let distinct: Vec<EntityId> = distinct.into_iter().collect();
        let mut banks = self.write()?;
        let bank = banks.entry(bank_id.to_string()).or_default();
        for (i, a) in distinct.iter().enumerate() {
            for b in &distinct[i + 1..] {
                *bank.cooccurrences.entry(ordered_pair(*a, *b)).or_default() += 1;
            }
        }
        Ok(())
    }

    async fn insert_links(&self, bank_id: &str, links: &[MemoryLink]) -> FathomResult<usize> {
        let mut banks = self.write()?;
        let bank = banks.entry(bank_id.to_string()).or_default();
        let mut created = 0;
        for link in links {
            let outgoing = bank.links.entry(link.from_unit_id).or_default();
            match outgoing.iter_mut().find(|l| l.key() == link.key()) {
                Some(existing) => {
                    existing.weight = link.weight;
                    existing.entity_id = link.entity_id;
                }
                None => {
                    outgoing.push(link.clone());
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    async fn outgoing_links(
        &self,
        bank_id: &str,
        unit_id: UnitId,
    ) -> FathomResult<Vec<MemoryLink>> {
        let banks = self.read()?;
        Ok(banks
            .get(bank_id)
            .and_then(|b| b.links.get(&unit_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn bank_stats(&self, bank_id: &str) -> FathomResult<BankStats> {
        let banks = self.read()?;
        let Some(bank) = banks.get(bank_id) else {
            return Ok(BankStats::default());
        };
        let mut links_by_type: HashMap<String, u64> = HashMap::new();
        for link in bank.links.values().flatten() {
            *links_by_type
                .entry(link.link_type.as_str().to_string())
                .or_default() += 1;
        }
        // Keep every type present so callers can index without checking.
        for t in LinkType::ALL {
            links_by_type.entry(t.as_str().to_string()).or_default();
        }
        Ok(BankStats {
            units: bank.units.len() as u64,
            entities: bank.entities.len() as u64,
            links_by_type,
        })
    }
}
