//! The retain path: candidate facts in, committed and entity-linked units out.
//!
//! A fact is visible to search as soon as it is committed, its entities are
//! attached, and its entity links are written. Temporal, semantic, and
//! causal links follow from the background queue.

use crate::jobs::{BackgroundJob, JobWorker};
use crate::linker::LinkBuilder;
use crate::names::normalize_name;
use crate::resolver::EntityResolver;
use crate::retry::retry_transient;
use crate::store::GraphStore;
use fathom_types::config::RetrySettings;
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{
    CandidateFact, CausalRelation, EntityMention, MemoryUnit, RetainReport, RetainRequest,
};
use fathom_types::provider::{EmbeddingProvider, EntityExtractor};
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns retain requests into committed facts and queued link work.
pub struct Ingestor {
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) resolver: Arc<EntityResolver>,
    pub(crate) linker: Arc<LinkBuilder>,
    pub(crate) jobs: Arc<JobWorker>,
    pub(crate) embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub(crate) extractor: Option<Arc<dyn EntityExtractor>>,
    pub(crate) classify: bool,
    pub(crate) embedding_dim: usize,
    pub(crate) retry: RetrySettings,
}

impl Ingestor {
    /// Commit every fact of the request in order.
    ///
    /// Facts committed before a failing one stay committed; the error is
    /// returned and nothing after it is processed.
    pub async fn retain(&self, request: &RetainRequest) -> FathomResult<RetainReport> {
        let bank_id = request.bank_id.as_str();
        if bank_id.trim().is_empty() {
            return Err(FathomError::Validation("bank id is empty".into()));
        }
        if request.facts.is_empty() {
            return Err(FathomError::Validation("retain request has no facts".into()));
        }
        for hint in &request.causal {
            if hint.from_index >= request.facts.len() || hint.to_index >= request.facts.len() {
                return Err(FathomError::Validation(format!(
                    "causal hint {} -> {} is outside the batch of {} facts",
                    hint.from_index,
                    hint.to_index,
                    request.facts.len()
                )));
            }
        }

        let mut report = RetainReport::default();
        for fact in &request.facts {
            let (unit, mentions) = self.prepare(bank_id, fact).await?;
            report.entities_resolved += self.commit(&unit, &mentions).await?;
            self.jobs
                .enqueue(BackgroundJob::BuildLinks {
                    bank_id: bank_id.to_string(),
                    unit_id: unit.id,
                })
                .await?;
            report.jobs_enqueued += 1;
            debug!(bank = bank_id, unit = %unit.id, entities = mentions.len(), "Retained fact");
            report.unit_ids.push(unit.id);
        }

        if !request.causal.is_empty() {
            let relations = request
                .causal
                .iter()
                .map(|hint| CausalRelation {
                    from_unit_id: report.unit_ids[hint.from_index],
                    to_unit_id: report.unit_ids[hint.to_index],
                    link_type: hint.link_type,
                    strength: hint.strength,
                })
                .collect();
            self.jobs
                .enqueue(BackgroundJob::CausalLinks {
                    bank_id: bank_id.to_string(),
                    relations,
                })
                .await?;
            report.jobs_enqueued += 1;
        }

        if self.classify {
            self.jobs
                .enqueue(BackgroundJob::Classify {
                    bank_id: bank_id.to_string(),
                    unit_ids: report.unit_ids.clone(),
                })
                .await?;
            report.jobs_enqueued += 1;
        }
        Ok(report)
    }

    /// Insert a unit (retrying transient store errors), resolve its
    /// mentions, and write its entity links. Returns the number of distinct
    /// entities attached.
    async fn commit(&self, unit: &MemoryUnit, mentions: &[EntityMention]) -> FathomResult<usize> {
        retry_transient(&self.retry, "insert_unit", || self.store.insert_unit(unit)).await?;
        if mentions.is_empty() {
            return Ok(0);
        }
        let entities = self
            .resolver
            .resolve_mentions(&unit.bank_id, unit.id, mentions, unit.mentioned_at)
            .await?;
        self.linker.build_entity_links(&unit.bank_id, unit.id).await?;
        Ok(entities.len())
    }

    /// Build the unit and its mention list, calling providers for whatever
    /// the candidate does not carry.
    async fn prepare(
        &self,
        bank_id: &str,
        fact: &CandidateFact,
    ) -> FathomResult<(MemoryUnit, Vec<EntityMention>)> {
        let embedding = match &fact.embedding {
            Some(v) => v.clone(),
            None => {
                let embedder = self.embedder.as_ref().ok_or_else(|| {
                    FathomError::Validation(
                        "fact has no embedding and no embedding provider is configured".into(),
                    )
                })?;
                retry_transient(&self.retry, "embed", || embedder.embed_one(&fact.text)).await?
            }
        };

        let mut unit = MemoryUnit::new(bank_id, fact.text.trim(), fact.fact_type, embedding);
        unit.event_date = fact.event_date;
        unit.confidence_score = fact.confidence;
        unit.document_id = fact.document_id.clone();
        unit.chunk_id = fact.chunk_id.clone();
        unit.validate(self.embedding_dim)?;

        let mut mentions = match (&fact.entities, &self.extractor) {
            (Some(m), _) => m.clone(),
            (None, Some(extractor)) => match extractor.extract(&fact.text).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(bank = bank_id, error = %e, "Entity extraction failed; storing fact without entities");
                    Vec::new()
                }
            },
            (None, None) => Vec::new(),
        };
        mentions.retain(|m| !normalize_name(&m.name).is_empty());
        Ok((unit, mentions))
    }
}
