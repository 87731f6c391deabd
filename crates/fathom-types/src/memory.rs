//! Memory graph types: facts, entities, links, and ingestion payloads.

use crate::error::{FathomError, FathomResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifier of an isolated memory namespace (one agent or user).
pub type BankId = String;

/// Unique identifier for a memory unit (fact).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub Uuid);

impl UnitId {
    /// Create a new random UnitId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UnitId {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(UnitId)
            .map_err(|e| FathomError::Validation(format!("bad unit id '{s}': {e}")))
    }
}

/// Unique identifier for a canonical entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Create a new random EntityId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(EntityId)
            .map_err(|e| FathomError::Validation(format!("bad entity id '{s}': {e}")))
    }
}

/// What kind of statement a fact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    /// Objective statement about the world.
    World,
    /// Something the agent itself did or said.
    Agent,
    /// A belief held with a confidence score.
    Opinion,
    /// Legacy observation facts.
    Observation,
}

impl FactType {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::World => "world",
            FactType::Agent => "agent",
            FactType::Opinion => "opinion",
            FactType::Observation => "observation",
        }
    }
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FactType {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "world" => Ok(FactType::World),
            "agent" => Ok(FactType::Agent),
            "opinion" => Ok(FactType::Opinion),
            "observation" => Ok(FactType::Observation),
            other => Err(FathomError::Validation(format!("unknown fact type '{other}'"))),
        }
    }
}

/// An atomic, self-contained statement stored in a bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    /// Unique ID.
    pub id: UnitId,
    /// Owning bank.
    pub bank_id: BankId,
    /// The statement itself.
    pub text: String,
    /// Kind of statement.
    pub fact_type: FactType,
    /// Fixed-dimension embedding of `text`.
    pub embedding: Vec<f32>,
    /// When the content of the fact happened, if known.
    pub event_date: Option<DateTime<Utc>>,
    /// When the fact was recorded.
    pub mentioned_at: DateTime<Utc>,
    /// Confidence for opinions (0.0 - 1.0); `None` for every other type.
    pub confidence_score: Option<f32>,
    /// How many times this fact was returned by a search.
    pub access_count: u64,
    /// When this fact was last returned by a search.
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Source document reference.
    pub document_id: Option<String>,
    /// Source chunk reference inside the document.
    pub chunk_id: Option<String>,
}

impl MemoryUnit {
    /// Build a fresh, never-accessed unit recorded now.
    pub fn new(
        bank_id: impl Into<BankId>,
        text: impl Into<String>,
        fact_type: FactType,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: UnitId::new(),
            bank_id: bank_id.into(),
            text: text.into(),
            fact_type,
            embedding,
            event_date: None,
            mentioned_at: Utc::now(),
            confidence_score: None,
            access_count: 0,
            last_accessed_at: None,
            document_id: None,
            chunk_id: None,
        }
    }

    /// Set the event date.
    pub fn with_event_date(mut self, event_date: DateTime<Utc>) -> Self {
        self.event_date = Some(event_date);
        self
    }

    /// Set the confidence score (opinions only).
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence_score = Some(confidence);
        self
    }

    /// The time used for temporal linking and recency: the event date,
    /// falling back to the recording time.
    pub fn anchor_time(&self) -> DateTime<Utc> {
        self.event_date.unwrap_or(self.mentioned_at)
    }

    /// Check structural invariants before the unit is written.
    pub fn validate(&self, embedding_dim: usize) -> FathomResult<()> {
        if self.bank_id.trim().is_empty() {
            return Err(FathomError::Validation("bank id is empty".into()));
        }
        if self.text.trim().is_empty() {
            return Err(FathomError::Validation("fact text is empty".into()));
        }
        if self.embedding.len() != embedding_dim {
            return Err(FathomError::Validation(format!(
                "embedding has dimension {}, expected {embedding_dim}",
                self.embedding.len()
            )));
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(FathomError::Validation(
                "embedding contains non-finite values".into(),
            ));
        }
        match (self.fact_type, self.confidence_score) {
            (FactType::Opinion, Some(c)) if (0.0..=1.0).contains(&c) => Ok(()),
            (FactType::Opinion, Some(c)) => Err(FathomError::Validation(format!(
                "opinion confidence {c} outside [0, 1]"
            ))),
            (FactType::Opinion, None) => Err(FathomError::Validation(
                "opinion requires a confidence score".into(),
            )),
            (_, Some(_)) => Err(FathomError::Validation(format!(
                "{} facts do not carry a confidence score",
                self.fact_type
            ))),
            (_, None) => Ok(()),
        }
    }
}

/// Types of canonical entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A person.
    Person,
    /// An organization.
    Org,
    /// A place.
    Place,
    /// A product.
    Product,
    /// A concept or idea.
    Concept,
    /// Anything else.
    Other,
}

impl EntityType {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Org => "org",
            EntityType::Place => "place",
            EntityType::Product => "product",
            EntityType::Concept => "concept",
            EntityType::Other => "other",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(EntityType::Person),
            "org" | "organization" => Ok(EntityType::Org),
            "place" | "location" => Ok(EntityType::Place),
            "product" => Ok(EntityType::Product),
            "concept" => Ok(EntityType::Concept),
            "other" => Ok(EntityType::Other),
            other => Err(FathomError::Validation(format!(
                "unknown entity type '{other}'"
            ))),
        }
    }
}

/// A canonical real-world referent within a bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique entity ID.
    pub id: EntityId,
    /// Owning bank.
    pub bank_id: BankId,
    /// Display name as first seen.
    pub canonical_name: String,
    /// Entity type.
    pub entity_type: EntityType,
    /// First time a mention resolved here.
    pub first_seen: DateTime<Utc>,
    /// Most recent mention time.
    pub last_seen: DateTime<Utc>,
    /// Number of mentions resolved to this entity.
    pub mention_count: u64,
}

/// A named-entity mention as produced by the extraction provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMention {
    /// Surface form found in the text.
    pub name: String,
    /// Extracted type.
    pub entity_type: EntityType,
}

impl EntityMention {
    /// Create a mention.
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name: name.into(),
            entity_type,
        }
    }
}

/// Kind of edge between two facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Close in time.
    Temporal,
    /// Close in embedding space.
    Semantic,
    /// Mentions a shared entity.
    Entity,
    /// The source fact causes the target.
    Causes,
    /// The source fact is caused by the target.
    CausedBy,
    /// The source fact enables the target.
    Enables,
    /// The source fact prevents the target.
    Prevents,
}

impl LinkType {
    /// Every link type, in storage order.
    pub const ALL: [LinkType; 7] = [
        LinkType::Temporal,
        LinkType::Semantic,
        LinkType::Entity,
        LinkType::Causes,
        LinkType::CausedBy,
        LinkType::Enables,
        LinkType::Prevents,
    ];

    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Temporal => "temporal",
            LinkType::Semantic => "semantic",
            LinkType::Entity => "entity",
            LinkType::Causes => "causes",
            LinkType::CausedBy => "caused_by",
            LinkType::Enables => "enables",
            LinkType::Prevents => "prevents",
        }
    }

    /// Whether this is one of the causal subtypes.
    pub fn is_causal(&self) -> bool {
        matches!(
            self,
            LinkType::Causes | LinkType::CausedBy | LinkType::Enables | LinkType::Prevents
        )
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkType {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LinkType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FathomError::Validation(format!("unknown link type '{s}'")))
    }
}

/// A typed, weighted edge between two facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryLink {
    /// Source fact.
    pub from_unit_id: UnitId,
    /// Target fact.
    pub to_unit_id: UnitId,
    /// Edge kind.
    pub link_type: LinkType,
    /// Edge weight in [0, 1].
    pub weight: f32,
    /// Shared entity for entity links.
    pub entity_id: Option<EntityId>,
}

impl MemoryLink {
    /// Dedup key: one edge per ordered pair per link type.
    pub fn key(&self) -> (UnitId, UnitId, LinkType) {
        (self.from_unit_id, self.to_unit_id, self.link_type)
    }
}

/// A cause/effect judgement between two committed facts, supplied by an
/// external classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalRelation {
    /// Source fact.
    pub from_unit_id: UnitId,
    /// Target fact.
    pub to_unit_id: UnitId,
    /// One of the causal link types.
    pub link_type: LinkType,
    /// Strength of the judgement, used as the edge weight.
    pub strength: f32,
}

/// Counts of edges created by one link-construction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    /// New temporal edges.
    pub temporal: usize,
    /// New semantic edges.
    pub semantic: usize,
    /// New entity edges.
    pub entity: usize,
    /// New causal edges.
    pub causal: usize,
    /// Causal relations rejected by validation.
    pub rejected: usize,
}

impl LinkReport {
    /// Total number of new edges.
    pub fn total(&self) -> usize {
        self.temporal + self.semantic + self.entity + self.causal
    }

    /// Accumulate another report into this one.
    pub fn merge(&mut self, other: LinkReport) {
        self.temporal += other.temporal;
        self.semantic += other.semantic;
        self.entity += other.entity;
        self.causal += other.causal;
        self.rejected += other.rejected;
    }
}

/// Per-bank record counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BankStats {
    /// Number of memory units.
    pub units: u64,
    /// Number of entities.
    pub entities: u64,
    /// Number of links, keyed by link type string.
    pub links_by_type: HashMap<String, u64>,
}

impl BankStats {
    /// Total number of links across every type.
    pub fn total_links(&self) -> u64 {
        self.links_by_type.values().sum()
    }
}

/// A fact already extracted from text, ready to be retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFact {
    /// The statement.
    pub text: String,
    /// Kind of statement.
    #[serde(default = "default_fact_type")]
    pub fact_type: FactType,
    /// When the content happened.
    #[serde(default)]
    pub event_date: Option<DateTime<Utc>>,
    /// Pre-computed embedding; computed by the embedding provider when absent.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Confidence for opinions.
    #[serde(default)]
    pub confidence: Option<f32>,
    /// Pre-extracted mentions; extracted by the entity provider when absent.
    #[serde(default)]
    pub entities: Option<Vec<EntityMention>>,
    /// Source document reference.
    #[serde(default)]
    pub document_id: Option<String>,
    /// Source chunk reference.
    #[serde(default)]
    pub chunk_id: Option<String>,
}

fn default_fact_type() -> FactType {
    FactType::World
}

impl CandidateFact {
    /// A world fact with only text set.
    pub fn world(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fact_type: FactType::World,
            event_date: None,
            embedding: None,
            confidence: None,
            entities: None,
            document_id: None,
            chunk_id: None,
        }
    }
}

/// A causal judgement expressed as indices into a retain batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalHint {
    /// Index of the source fact in the batch.
    pub from_index: usize,
    /// Index of the target fact in the batch.
    pub to_index: usize,
    /// Causal link type.
    pub link_type: LinkType,
    /// Strength of the judgement.
    #[serde(default = "default_strength")]
    pub strength: f32,
}

fn default_strength() -> f32 {
    1.0
}

/// A batch of facts to retain into one bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainRequest {
    /// Target bank.
    pub bank_id: BankId,
    /// Facts to store.
    pub facts: Vec<CandidateFact>,
    /// Causal relations between facts in this batch.
    #[serde(default)]
    pub causal: Vec<CausalHint>,
}

/// Outcome of a retain call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetainReport {
    /// Ids of the committed units, in input order.
    pub unit_ids: Vec<UnitId>,
    /// Number of entity mentions resolved.
    pub entities_resolved: usize,
    /// Number of background jobs queued.
    pub jobs_enqueued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_validation() {
        let unit = MemoryUnit::new("bank", "Alice works at Google", FactType::World, vec![0.0; 4]);
        assert!(unit.validate(4).is_ok());
        assert!(unit.validate(8).is_err());

        let opinion = MemoryUnit::new("bank", "Rust is great", FactType::Opinion, vec![0.0; 4]);
        assert!(opinion.validate(4).is_err());
        assert!(opinion.clone().with_confidence(0.8).validate(4).is_ok());
        assert!(opinion.with_confidence(1.5).validate(4).is_err());

        let world_with_conf = MemoryUnit::new("bank", "x", FactType::World, vec![0.0; 4])
            .with_confidence(0.5);
        assert!(world_with_conf.validate(4).is_err());
    }

    #[test]
    fn test_anchor_time_falls_back_to_mentioned_at() {
        let unit = MemoryUnit::new("bank", "x", FactType::World, vec![1.0]);
        assert_eq!(unit.anchor_time(), unit.mentioned_at);
        let date = Utc::now() - chrono::Duration::days(3);
        let dated = unit.with_event_date(date);
        assert_eq!(dated.anchor_time(), date);
    }

    #[test]
    fn test_link_type_string_forms() {
        for t in LinkType::ALL {
            let parsed: LinkType = t.as_str().parse().unwrap();
            assert_eq!(parsed, t);
        }
        assert!(LinkType::Enables.is_causal());
        assert!(!LinkType::Entity.is_causal());
        assert_eq!(
            serde_json::to_string(&LinkType::CausedBy).unwrap(),
            "\"caused_by\""
        );
    }

    #[test]
    fn test_candidate_fact_defaults() {
        let fact: CandidateFact = serde_json::from_str(r#"{"text": "Alice loves hiking"}"#).unwrap();
        assert_eq!(fact.fact_type, FactType::World);
        assert!(fact.embedding.is_none());
        assert!(fact.entities.is_none());
    }

    #[test]
    fn test_link_report_merge() {
        let mut a = LinkReport {
            temporal: 1,
            semantic: 2,
            ..Default::default()
        };
        a.merge(LinkReport {
            entity: 4,
            rejected: 1,
            ..Default::default()
        });
        assert_eq!(a.total(), 7);
        assert_eq!(a.rejected, 1);
    }
}
