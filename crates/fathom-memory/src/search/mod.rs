//! Spreading-activation retrieval.
//!
//! A search seeds activation from the closest facts by vector similarity,
//! spreads it over the link graph within the thinking budget, scores every
//! fact it expanded, and returns the best `top_k`. Access counters of the
//! returned facts are bumped as the very last step, so a cancelled or
//! timed-out search leaves the store untouched.

pub mod activation;
pub mod mmr;
pub mod scoring;

use crate::admission::AdmissionController;
use crate::metrics::{op, MetricsCollector};
use crate::store::GraphStore;
use activation::{spread, SpreadParams};
use chrono::Utc;
use fathom_types::config::SearchConfig;
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::UnitId;
use fathom_types::search::{ScoredFact, SearchRequest, SearchResponse, SearchTrace};
use scoring::{cap_tokens, rank_order, Scorer};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Runs searches against one store.
pub struct SearchEngine {
    store: Arc<dyn GraphStore>,
    config: SearchConfig,
    admission: Arc<AdmissionController>,
    metrics: Arc<dyn MetricsCollector>,
    embedding_dim: usize,
}

impl SearchEngine {
    /// Create an engine.
    pub fn new(
        store: Arc<dyn GraphStore>,
        config: SearchConfig,
        admission: Arc<AdmissionController>,
        metrics: Arc<dyn MetricsCollector>,
        embedding_dim: usize,
    ) -> Self {
        Self {
            store,
            config,
            admission,
            metrics,
            embedding_dim,
        }
    }

    /// The scoring and traversal settings in use.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Run a search to completion.
    pub async fn search(&self, request: &SearchRequest) -> FathomResult<SearchResponse> {
        self.run(request, None).await
    }

    /// Run a search that stops with [`FathomError::Cancelled`] once `cancel`
    /// reads `true`.
    pub async fn search_with_cancel(
        &self,
        request: &SearchRequest,
        cancel: watch::Receiver<bool>,
    ) -> FathomResult<SearchResponse> {
        self.run(request, Some(cancel)).await
    }

    async fn run(
        &self,
        request: &SearchRequest,
        cancel: Option<watch::Receiver<bool>>,
    ) -> FathomResult<SearchResponse> {
        let start = Instant::now();
        let result = self.run_inner(request, cancel.as_ref(), start).await;
        self.metrics.record_operation(
            op::SEARCH,
            &request.bank_id,
            Some(&request.budget.label()),
            start.elapsed(),
            result.is_ok(),
        );
        result
    }

    async fn run_inner(
        &self,
        request: &SearchRequest,
        cancel: Option<&watch::Receiver<bool>>,
        start: Instant,
    ) -> FathomResult<SearchResponse> {
        request.validate(self.embedding_dim)?;
        let _permit = self.admission.acquire().await?;

        let response = match self.config.timeout_ms {
            Some(ms) => tokio::time::timeout(
                Duration::from_millis(ms),
                self.execute(request, cancel, start),
            )
            .await
            .map_err(|_| FathomError::Timeout(format!("search exceeded {ms}ms")))??,
            None => self.execute(request, cancel, start).await?,
        };

        if is_cancelled(cancel) {
            return Err(FathomError::Cancelled);
        }
        if !response.results.is_empty() {
            let ids: Vec<UnitId> = response.results.iter().map(|r| r.unit.id).collect();
            self.store
                .record_access(&request.bank_id, &ids, Utc::now())
                .await?;
        }
        Ok(response)
    }

    /// Everything except the access update.
    async fn execute(
        &self,
        request: &SearchRequest,
        cancel: Option<&watch::Receiver<bool>>,
        start: Instant,
    ) -> FathomResult<SearchResponse> {
        let bank_id = request.bank_id.as_str();
        let budget = request.budget.expansions();

        let entry_hits = self
            .store
            .vector_search(
                bank_id,
                &request.query_embedding,
                self.config.entry_points,
                self.config.entry_similarity_floor,
                request.fact_types.as_deref(),
            )
            .await?;
        let entry_points: Vec<(UnitId, f32)> =
            entry_hits.iter().map(|(u, sim)| (u.id, *sim)).collect();

        if entry_points.is_empty() {
            debug!(bank = bank_id, "No entry points above the similarity floor");
            return Ok(SearchResponse {
                trace: request.include_trace.then(|| SearchTrace {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    ..Default::default()
                }),
                entities: request.include_entities.then(Vec::new),
                ..Default::default()
            });
        }

        let spread = spread(
            self.store.as_ref(),
            SpreadParams {
                bank_id,
                entry_points: &entry_points,
                budget,
                decay: self.config.decay,
                trace: request.include_trace,
            },
            cancel,
        )
        .await?;

        let units = self.store.get_units(bank_id, &spread.visited).await?;
        let bank_max = self.store.max_access_count(bank_id).await?;
        let now = request.now.unwrap_or_else(Utc::now);
        let scorer = Scorer::new(&self.config, &request.query_embedding, now, bank_max);

        let mut ranked: Vec<ScoredFact> = units
            .into_iter()
            .filter(|u| request.accepts(u.fact_type))
            .map(|u| {
                let activation = spread.activation.get(&u.id).copied().unwrap_or(0.0);
                scorer.score(u, activation)
            })
            .collect();
        ranked.sort_by(rank_order);

        let mut results = match request.mmr_lambda {
            Some(lambda) => {
                let picked = mmr::mmr_select(&ranked, lambda, request.top_k);
                let mut selected: Vec<ScoredFact> =
                    picked.into_iter().map(|i| ranked[i].clone()).collect();
                selected.sort_by(rank_order);
                selected
            }
            None => {
                ranked.truncate(request.top_k);
                ranked
            }
        };
        if let Some(max_tokens) = request.max_tokens {
            cap_tokens(&mut results, max_tokens);
        }

        let entities = if request.include_entities {
            let mut ids = BTreeSet::new();
            for r in &results {
                ids.extend(self.store.entities_for_unit(bank_id, r.unit.id).await?);
            }
            let ids: Vec<_> = ids.into_iter().collect();
            Some(self.store.get_entities(bank_id, &ids).await?)
        } else {
            None
        };

        debug!(
            bank = bank_id,
            budget,
            entry_points = entry_points.len(),
            visited = spread.visited.len(),
            results = results.len(),
            exhausted = spread.budget_exhausted,
            "Search complete"
        );

        Ok(SearchResponse {
            visited: spread.visited.len(),
            trace: request.include_trace.then(|| SearchTrace {
                entry_points,
                steps: spread.steps,
                budget_exhausted: spread.budget_exhausted,
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
            results,
            entities,
        })
    }
}

fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.is_some_and(|rx| *rx.borrow())
}
