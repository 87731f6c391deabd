//! Traits for the external services the memory core consumes.
//!
//! The core never talks to a model directly. Embeddings, entity mentions, and
//! cause/effect or opinion judgements arrive through these traits as
//! already-typed data.

use crate::error::FathomResult;
use crate::memory::{EntityMention, LinkType, MemoryUnit, UnitId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Computes fixed-dimension text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Compute embedding vectors for a batch of texts.
    async fn embed(&self, texts: &[&str]) -> FathomResult<Vec<Vec<f32>>>;

    /// Compute the embedding for a single text.
    async fn embed_one(&self, text: &str) -> FathomResult<Vec<f32>> {
        let results = self.embed(&[text]).await?;
        results.into_iter().next().ok_or_else(|| {
            crate::error::FathomError::Provider("empty embedding response".to_string())
        })
    }

    /// Dimensionality of the vectors this provider produces.
    fn dimensions(&self) -> usize;
}

/// Extracts named-entity mentions from text.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    /// Return the mentions found in `text`.
    async fn extract(&self, text: &str) -> FathomResult<Vec<EntityMention>>;
}

/// A cause/effect judgement between two facts in a classified batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalJudgement {
    /// Cause side.
    pub from_unit_id: UnitId,
    /// Effect side.
    pub to_unit_id: UnitId,
    /// Causal link subtype.
    pub link_type: LinkType,
    /// Strength of the judgement (0.0 - 1.0).
    pub strength: f32,
}

/// An opinion formed from a batch of facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpinionDraft {
    /// The opinion statement.
    pub text: String,
    /// Confidence (0.0 - 1.0).
    pub confidence: f32,
    /// Mentions in the opinion text.
    #[serde(default)]
    pub entities: Vec<EntityMention>,
}

/// Output of one classification call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Causal relations among the classified facts.
    pub causal: Vec<CausalJudgement>,
    /// Opinions derived from the classified facts.
    pub opinions: Vec<OpinionDraft>,
}

/// LLM-backed judgements over newly committed facts.
#[async_trait]
pub trait FactClassifier: Send + Sync {
    /// Classify causal structure and form opinions over `units`.
    async fn classify(&self, bank_id: &str, units: &[MemoryUnit]) -> FathomResult<Classification>;
}
