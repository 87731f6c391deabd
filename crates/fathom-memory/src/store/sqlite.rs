//! Graph store backed by SQLite.
//!
//! One connection behind a mutex, shared by every bank. Every statement runs
//! on tokio's blocking pool. Timestamps are stored
//! as RFC 3339 text; `anchor_ms` duplicates the anchor time as epoch millis so
//! range and recency queries can use an index.

use super::{ordered_pair, sort_hits, GraphStore};
use crate::migration::run_migrations;
use crate::similarity::{cosine_similarity, embedding_from_bytes, embedding_to_bytes};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{
    BankStats, Entity, EntityId, EntityType, FactType, LinkType, MemoryLink, MemoryUnit, UnitId,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const UNIT_COLUMNS: &str = "id, bank_id, text, fact_type, embedding, event_date, mentioned_at, \
     confidence_score, access_count, last_accessed_at, document_id, chunk_id";

const ENTITY_COLUMNS: &str =
    "id, bank_id, canonical_name, entity_type, first_seen, last_seen, mention_count";

/// Graph store over a single SQLite database.
#[derive(Clone)]
pub struct SqliteGraphStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGraphStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(db_path: &Path) -> FathomResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(|e| FathomError::Store(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| FathomError::Store(e.to_string()))?;
        run_migrations(&conn).map_err(|e| FathomError::Store(e.to_string()))?;
        debug!(path = %db_path.display(), "Opened graph store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> FathomResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FathomError::Store(e.to_string()))?;
        run_migrations(&conn).map_err(|e| FathomError::Store(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> FathomResult<T>
    where
        F: FnOnce(&mut Connection) -> FathomResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| FathomError::Internal(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| FathomError::Internal(format!("spawn_blocking failed: {e}")))?
    }
}

fn store_err(e: rusqlite::Error) -> FathomError {
    FathomError::Store(e.to_string())
}

fn parse_time(raw: &str) -> FathomResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FathomError::Serialization(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_time(raw: Option<String>) -> FathomResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn parse_uuid(raw: &str) -> FathomResult<uuid::Uuid> {
    uuid::Uuid::parse_str(raw)
        .map_err(|e| FathomError::Serialization(format!("bad id '{raw}': {e}")))
}

/// Unit row as read from SQLite, before text fields are parsed.
struct UnitRow {
    id: String,
    bank_id: String,
    text: String,
    fact_type: String,
    embedding: Vec<u8>,
    event_date: Option<String>,
    mentioned_at: String,
    confidence_score: Option<f64>,
    access_count: i64,
    last_accessed_at: Option<String>,
    document_id: Option<String>,
    chunk_id: Option<String>,
}

impl UnitRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            bank_id: row.get(1)?,
            text: row.get(2)?,
            fact_type: row.get(3)?,
            embedding: row.get(4)?,
            event_date: row.get(5)?,
            mentioned_at: row.get(6)?,
            confidence_score: row.get(7)?,
            access_count: row.get(8)?,
            last_accessed_at: row.get(9)?,
            document_id: row.get(10)?,
            chunk_id: row.get(11)?,
        })
    }

    fn into_unit(self) -> FathomResult<MemoryUnit> {
        Ok(MemoryUnit {
            id: UnitId(parse_uuid(&self.id)?),
            bank_id: self.bank_id,
            text: self.text,
            fact_type: self.fact_type.parse()?,
            embedding: embedding_from_bytes(&self.embedding),
            event_date: parse_opt_time(self.event_date)?,
            mentioned_at: parse_time(&self.mentioned_at)?,
            confidence_score: self.confidence_score.map(|c| c as f32),
            access_count: self.access_count.max(0) as u64,
            last_accessed_at: parse_opt_time(self.last_accessed_at)?,
            document_id: self.document_id,
            chunk_id: self.chunk_id,
        })
    }
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<[String; 6]> {
    Ok([
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ])
}

fn into_entity(cols: [String; 6], mention_count: i64) -> FathomResult<Entity> {
    let [id, bank_id, canonical_name, entity_type, first_seen, last_seen] = cols;
    Ok(Entity {
        id: EntityId(parse_uuid(&id)?),
        bank_id,
        canonical_name,
        entity_type: entity_type.parse()?,
        first_seen: parse_time(&first_seen)?,
        last_seen: parse_time(&last_seen)?,
        mention_count: mention_count.max(0) as u64,
    })
}

fn query_units(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> FathomResult<Vec<MemoryUnit>> {
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params, UnitRow::from_row)
        .map_err(store_err)?;
    let mut units = Vec::new();
    for row in rows {
        units.push(row.map_err(store_err)?.into_unit()?);
    }
    Ok(units)
}

fn query_entities(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> FathomResult<Vec<Entity>> {
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params, |row| Ok((entity_from_row(row)?, row.get::<_, i64>(6)?)))
        .map_err(store_err)?;
    let mut entities = Vec::new();
    for row in rows {
        let (cols, count) = row.map_err(store_err)?;
        entities.push(into_entity(cols, count)?);
    }
    Ok(entities)
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn insert_unit(&self, unit: &MemoryUnit) -> FathomResult<()> {
        let unit = unit.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO memory_units (id, bank_id, text, fact_type, embedding, event_date, mentioned_at,
                     anchor_ms, confidence_score, access_count, last_accessed_at, document_id, chunk_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    unit.id.0.to_string(),
                    unit.bank_id,
                    unit.text,
                    unit.fact_type.as_str(),
                    embedding_to_bytes(&unit.embedding),
                    unit.event_date.map(|d| d.to_rfc3339()),
                    unit.mentioned_at.to_rfc3339(),
                    unit.anchor_time().timestamp_millis(),
                    unit.confidence_score.map(|c| c as f64),
                    unit.access_count as i64,
                    unit.last_accessed_at.map(|d| d.to_rfc3339()),
                    unit.document_id,
                    unit.chunk_id,
                ],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn get_unit(&self, bank_id: &str, id: UnitId) -> FathomResult<Option<MemoryUnit>> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {UNIT_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND id = ?2"
                    ),
                    params![bank_id, id.0.to_string()],
                    UnitRow::from_row,
                )
                .optional()
                .map_err(store_err)?;
            row.map(UnitRow::into_unit).transpose()
        })
        .await
    }

    async fn get_units(&self, bank_id: &str, ids: &[UnitId]) -> FathomResult<Vec<MemoryUnit>> {
        let bank_id = bank_id.to_string();
        let ids = ids.to_vec();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {UNIT_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND id = ?2"
                ))
                .map_err(store_err)?;
            let mut units = Vec::with_capacity(ids.len());
            for id in ids {
                let row = stmt
                    .query_row(params![bank_id, id.0.to_string()], UnitRow::from_row)
                    .optional()
                    .map_err(store_err)?;
                if let Some(row) = row {
                    units.push(row.into_unit()?);
                }
            }
            Ok(units)
        })
        .await
    }

    async fn list_unit_ids(&self, bank_id: &str) -> FathomResult<Vec<UnitId>> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM memory_units WHERE bank_id = ?1 ORDER BY anchor_ms ASC, id ASC",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![bank_id], |row| row.get::<_, String>(0))
                .map_err(store_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(UnitId(parse_uuid(&row.map_err(store_err)?)?));
            }
            Ok(ids)
        })
        .await
    }

    async fn vector_search(
        &self,
        bank_id: &str,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        fact_types: Option<&[FactType]>,
    ) -> FathomResult<Vec<(MemoryUnit, f32)>> {
        let bank = bank_id.to_string();
        let embedding = embedding.to_vec();
        let fact_types = fact_types.map(<[FactType]>::to_vec);
        // Brute-force scan: rank every embedding in the bank in process.
        let hits = self
            .call(move |conn| {
                let units = query_units(
                    conn,
                    &format!("SELECT {UNIT_COLUMNS} FROM memory_units WHERE bank_id = ?1"),
                    &[&bank],
                )?;
                let mut hits: Vec<(MemoryUnit, f32)> = units
                    .into_iter()
                    .filter(|u| {
                        fact_types
                            .as_ref()
                            .map_or(true, |types| types.contains(&u.fact_type))
                    })
                    .map(|u| {
                        let sim = cosine_similarity(&embedding, &u.embedding);
                        (u, sim)
                    })
                    .filter(|(_, sim)| *sim >= min_similarity)
                    .collect();
                sort_hits(&mut hits);
                hits.truncate(limit);
                Ok(hits)
            })
            .await?;
        debug!(bank_id, hits = hits.len(), "Vector search");
        Ok(hits)
    }

    async fn units_in_time_range(
        &self,
        bank_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FathomResult<Vec<MemoryUnit>> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            query_units(
                conn,
                &format!(
                    "SELECT {UNIT_COLUMNS} FROM memory_units
                     WHERE bank_id = ?1 AND anchor_ms >= ?2 AND anchor_ms <= ?3
                     ORDER BY anchor_ms ASC, id ASC"
                ),
                &[&bank_id, &from.timestamp_millis(), &to.timestamp_millis()],
            )
        })
        .await
    }

    async fn record_access(
        &self,
        bank_id: &str,
        ids: &[UnitId],
        at: DateTime<Utc>,
    ) -> FathomResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let bank_id = bank_id.to_string();
        let ids = ids.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction().map_err(store_err)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "UPDATE memory_units SET access_count = access_count + 1, last_accessed_at = ?1
                         WHERE bank_id = ?2 AND id = ?3",
                    )
                    .map_err(store_err)?;
                let at = at.to_rfc3339();
                for id in &ids {
                    stmt.execute(params![at, bank_id, id.0.to_string()])
                        .map_err(store_err)?;
                }
            }
            tx.commit().map_err(store_err)
        })
        .await
    }

    async fn max_access_count(&self, bank_id: &str) -> FathomResult<u64> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            let max: Option<i64> = conn
                .query_row(
                    "SELECT MAX(access_count) FROM memory_units WHERE bank_id = ?1",
                    params![bank_id],
                    |row| row.get(0),
                )
                .map_err(store_err)?;
            Ok(max.unwrap_or(0).max(0) as u64)
        })
        .await
    }

    async fn entity_candidates(
        &self,
        bank_id: &str,
        entity_type: EntityType,
    ) -> FathomResult<Vec<Entity>> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            query_entities(
                conn,
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE bank_id = ?1 AND entity_type = ?2 ORDER BY id"
                ),
                &[&bank_id, &entity_type.as_str()],
            )
        })
        .await
    }

    async fn insert_entity(&self, entity: &Entity) -> FathomResult<()> {
        let entity = entity.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO entities (id, bank_id, canonical_name, entity_type, first_seen, last_seen, mention_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity.id.0.to_string(),
                    entity.bank_id,
                    entity.canonical_name,
                    entity.entity_type.as_str(),
                    entity.first_seen.to_rfc3339(),
                    entity.last_seen.to_rfc3339(),
                    entity.mention_count as i64,
                ],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn get_entities(&self, bank_id: &str, ids: &[EntityId]) -> FathomResult<Vec<Entity>> {
        let bank_id = bank_id.to_string();
        let ids = ids.to_vec();
        self.call(move |conn| {
            let mut entities = Vec::with_capacity(ids.len());
            for id in ids {
                let found = query_entities(
                    conn,
                    &format!(
                        "SELECT {ENTITY_COLUMNS} FROM entities WHERE bank_id = ?1 AND id = ?2"
                    ),
                    &[&bank_id, &id.0.to_string()],
                )?;
                entities.extend(found);
            }
            Ok(entities)
        })
        .await
    }

    async fn touch_entity(
        &self,
        bank_id: &str,
        id: EntityId,
        seen_at: DateTime<Utc>,
    ) -> FathomResult<()> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            let last_seen: Option<String> = conn
                .query_row(
                    "SELECT last_seen FROM entities WHERE bank_id = ?1 AND id = ?2",
                    params![bank_id, id.0.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?;
            let Some(last_seen) = last_seen else {
                return Err(FathomError::entity_not_found(id));
            };
            let last_seen = parse_time(&last_seen)?.max(seen_at);
            conn.execute(
                "UPDATE entities SET mention_count = mention_count + 1, last_seen = ?1
                 WHERE bank_id = ?2 AND id = ?3",
                params![last_seen.to_rfc3339(), bank_id, id.0.to_string()],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn attach_entities(
        &self,
        bank_id: &str,
        unit_id: UnitId,
        entity_ids: &[EntityId],
    ) -> FathomResult<()> {
        let bank_id = bank_id.to_string();
        let entity_ids = entity_ids.to_vec();
        self.call(move |conn| {
            let anchor_ms: Option<i64> = conn
                .query_row(
                    "SELECT anchor_ms FROM memory_units WHERE bank_id = ?1 AND id = ?2",
                    params![bank_id, unit_id.0.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?;
            let Some(anchor_ms) = anchor_ms else {
                return Err(FathomError::unit_not_found(unit_id));
            };
            let tx = conn.transaction().map_err(store_err)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR IGNORE INTO unit_entities (unit_id, entity_id, bank_id, anchor_ms)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(store_err)?;
                for entity_id in &entity_ids {
                    stmt.execute(params![
                        unit_id.0.to_string(),
                        entity_id.0.to_string(),
                        bank_id,
                        anchor_ms
                    ])
                    .map_err(store_err)?;
                }
            }
            tx.commit().map_err(store_err)
        })
        .await
    }

    async fn entities_for_unit(
        &self,
        bank_id: &str,
        unit_id: UnitId,
    ) -> FathomResult<Vec<EntityId>> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entity_id FROM unit_entities WHERE bank_id = ?1 AND unit_id = ?2
                     ORDER BY entity_id",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![bank_id, unit_id.0.to_string()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(store_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(EntityId(parse_uuid(&row.map_err(store_err)?)?));
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }

    async fn units_for_entity(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        limit: Option<usize>,
    ) -> FathomResult<Vec<UnitId>> {
        let bank_id = bank_id.to_string();
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT unit_id FROM unit_entities WHERE bank_id = ?1 AND entity_id = ?2
                     ORDER BY anchor_ms DESC, unit_id ASC LIMIT ?3",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![bank_id, entity_id.0.to_string(), limit], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(store_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(UnitId(parse_uuid(&row.map_err(store_err)?)?));
            }
            Ok(ids)
        })
        .await
    }

    async fn cooccurrence_counts(
        &self,
        bank_id: &str,
        entity_id: EntityId,
        others: &[EntityId],
    ) -> FathomResult<HashMap<EntityId, u64>> {
        let bank_id = bank_id.to_string();
        let others: Vec<EntityId> = others.iter().copied().filter(|o| *o != entity_id).collect();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT cooccurrence_count FROM entity_cooccurrences
                     WHERE bank_id = ?1 AND entity_id_1 = ?2 AND entity_id_2 = ?3",
                )
                .map_err(store_err)?;
            let mut counts = HashMap::new();
            for other in others {
                let (a, b) = ordered_pair(entity_id, other);
                let count: Option<i64> = stmt
                    .query_row(params![bank_id, a.0.to_string(), b.0.to_string()], |row| {
                        row.get(0)
                    })
                    .optional()
                    .map_err(store_err)?;
                if let Some(count) = count {
                    counts.insert(other, count.max(0) as u64);
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn record_cooccurrences(
        &self,
        bank_id: &str,
        entity_ids: &[EntityId],
    ) -> FathomResult<()> {
        let distinct: Vec<EntityId> = entity_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if distinct.len() < 2 {
            return Ok(());
        }
        let bank_id = bank_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.call(move |conn| {
            let tx = conn.transaction().map_err(store_err)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO entity_cooccurrences (bank_id, entity_id_1, entity_id_2, cooccurrence_count, last_cooccurred)
                         VALUES (?1, ?2, ?3, 1, ?4)
                         ON CONFLICT(entity_id_1, entity_id_2)
                         DO UPDATE SET cooccurrence_count = cooccurrence_count + 1, last_cooccurred = ?4",
                    )
                    .map_err(store_err)?;
                for (i, a) in distinct.iter().enumerate() {
                    for b in &distinct[i + 1..] {
                        stmt.execute(params![bank_id, a.0.to_string(), b.0.to_string(), now])
                            .map_err(store_err)?;
                    }
                }
            }
            tx.commit().map_err(store_err)
        })
        .await
    }

    async fn insert_links(&self, bank_id: &str, links: &[MemoryLink]) -> FathomResult<usize> {
        if links.is_empty() {
            return Ok(0);
        }
        let bank_id = bank_id.to_string();
        let links = links.to_vec();
        let now = Utc::now().to_rfc3339();
        self.call(move |conn| {
            let tx = conn.transaction().map_err(store_err)?;
            let mut created = 0;
            {
                let mut insert = tx
                    .prepare_cached(
                        "INSERT OR IGNORE INTO memory_links (bank_id, from_unit_id, to_unit_id, link_type, weight, entity_id, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .map_err(store_err)?;
                let mut refresh = tx
                    .prepare_cached(
                        "UPDATE memory_links SET weight = ?1, entity_id = ?2
                         WHERE from_unit_id = ?3 AND to_unit_id = ?4 AND link_type = ?5",
                    )
                    .map_err(store_err)?;
                for link in &links {
                    let from = link.from_unit_id.0.to_string();
                    let to = link.to_unit_id.0.to_string();
                    let entity_id = link.entity_id.map(|e| e.0.to_string());
                    let inserted = insert
                        .execute(params![
                            bank_id,
                            from,
                            to,
                            link.link_type.as_str(),
                            link.weight as f64,
                            entity_id,
                            now,
                        ])
                        .map_err(store_err)?;
                    if inserted == 0 {
                        refresh
                            .execute(params![
                                link.weight as f64,
                                entity_id,
                                from,
                                to,
                                link.link_type.as_str()
                            ])
                            .map_err(store_err)?;
                    }
                    created += inserted;
                }
            }
            tx.commit().map_err(store_err)?;
            Ok(created)
        })
        .await
    }

    async fn outgoing_links(
        &self,
        bank_id: &str,
        unit_id: UnitId,
    ) -> FathomResult<Vec<MemoryLink>> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT from_unit_id, to_unit_id, link_type, weight, entity_id FROM memory_links
                     WHERE bank_id = ?1 AND from_unit_id = ?2",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![bank_id, unit_id.0.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .map_err(store_err)?;
            let mut links = Vec::new();
            for row in rows {
                let (from, to, link_type, weight, entity_id) = row.map_err(store_err)?;
                links.push(MemoryLink {
                    from_unit_id: UnitId(parse_uuid(&from)?),
                    to_unit_id: UnitId(parse_uuid(&to)?),
                    link_type: link_type.parse::<LinkType>()?,
                    weight: weight as f32,
                    entity_id: entity_id
                        .as_deref()
                        .map(parse_uuid)
                        .transpose()?
                        .map(EntityId),
                });
            }
            Ok(links)
        })
        .await
    }

    async fn bank_stats(&self, bank_id: &str) -> FathomResult<BankStats> {
        let bank_id = bank_id.to_string();
        self.call(move |conn| {
            let count = |sql: &str| -> FathomResult<u64> {
                conn.query_row(sql, params![bank_id], |row| row.get::<_, i64>(0))
                    .map(|n| n.max(0) as u64)
                    .map_err(store_err)
            };
            let units = count("SELECT COUNT(*) FROM memory_units WHERE bank_id = ?1")?;
            let entities = count("SELECT COUNT(*) FROM entities WHERE bank_id = ?1")?;

            let mut links_by_type: HashMap<String, u64> = LinkType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), 0))
                .collect();
            let mut stmt = conn
                .prepare(
                    "SELECT link_type, COUNT(*) FROM memory_links WHERE bank_id = ?1 GROUP BY link_type",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![bank_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(store_err)?;
            for row in rows {
                let (link_type, n) = row.map_err(store_err)?;
                links_by_type.insert(link_type, n.max(0) as u64);
            }
            Ok(BankStats {
                units,
                entities,
                links_by_type,
            })
        })
        .await
    }
}
