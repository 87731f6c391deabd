//! The `MemoryGraph` facade: one handle over the store, the resolver, the
//! link builder, the search engine, and the background job worker.

use crate::admission::{AdmissionController, Occupancy};
use crate::ingest::Ingestor;
use crate::jobs::{FailedJob, GraphJobRunner, JobStats, JobWorker};
use crate::linker::LinkBuilder;
use crate::metrics::{op, MetricsCollector, NoopMetrics};
use crate::resolver::EntityResolver;
use crate::search::SearchEngine;
use crate::store::{GraphStore, InMemoryGraphStore, SqliteGraphStore};
use chrono::Utc;
use fathom_types::config::FathomConfig;
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{
    BankStats, CausalRelation, EntityId, EntityMention, LinkReport, RetainReport, RetainRequest,
    UnitId,
};
use fathom_types::provider::{EmbeddingProvider, EntityExtractor, FactClassifier};
use fathom_types::search::{SearchRequest, SearchResponse};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;

/// Assembles a [`MemoryGraph`] from a config and optional providers.
pub struct MemoryGraphBuilder {
    config: FathomConfig,
    store: Option<Arc<dyn GraphStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    extractor: Option<Arc<dyn EntityExtractor>>,
    classifier: Option<Arc<dyn FactClassifier>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl MemoryGraphBuilder {
    /// Use this store instead of opening the configured SQLite database.
    pub fn store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Keep everything in memory.
    pub fn in_memory(self) -> Self {
        self.store(Arc::new(InMemoryGraphStore::new()))
    }

    /// Embed facts retained without an embedding.
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Extract mentions from facts retained without them.
    pub fn extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Classify new facts for causal links and opinions.
    pub fn classifier(mut self, classifier: Arc<dyn FactClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Report operation outcomes here.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the config, open the store, and start the job worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> FathomResult<MemoryGraph> {
        self.config.validate()?;
        if let Some(embedder) = &self.embedder {
            if embedder.dimensions() != self.config.storage.embedding_dim {
                return Err(FathomError::Config(format!(
                    "embedding provider produces {} dimensions, storage expects {}",
                    embedder.dimensions(),
                    self.config.storage.embedding_dim
                )));
            }
        }

        let store: Arc<dyn GraphStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteGraphStore::open(&self.config.db_path())?),
        };
        let config = self.config;
        let dim = config.storage.embedding_dim;

        let resolver = Arc::new(EntityResolver::new(
            store.clone(),
            config.resolver.clone(),
            config.retry.clone(),
        ));
        let linker = Arc::new(LinkBuilder::new(
            store.clone(),
            config.links.clone(),
            config.retry.clone(),
        ));
        let runner = Arc::new(GraphJobRunner {
            store: store.clone(),
            linker: linker.clone(),
            resolver: resolver.clone(),
            classifier: self.classifier.clone(),
            embedder: self.embedder.clone(),
            embedding_dim: dim,
            retry: config.retry.clone(),
            metrics: self.metrics.clone(),
        });
        let jobs = Arc::new(JobWorker::start(
            runner,
            &config.concurrency,
            config.retry.clone(),
        ));
        let admission = Arc::new(AdmissionController::from_config(&config.concurrency));
        let search = SearchEngine::new(
            store.clone(),
            config.search.clone(),
            admission.clone(),
            self.metrics.clone(),
            dim,
        );
        let ingestor = Ingestor {
            store: store.clone(),
            resolver: resolver.clone(),
            linker: linker.clone(),
            jobs: jobs.clone(),
            embedder: self.embedder,
            extractor: self.extractor,
            classify: self.classifier.is_some(),
            embedding_dim: dim,
            retry: config.retry.clone(),
        };

        info!(
            embedding_dim = dim,
            max_searches = config.concurrency.max_concurrent_searches,
            "Memory graph ready"
        );
        Ok(MemoryGraph {
            config,
            store,
            resolver,
            linker,
            search,
            admission,
            jobs,
            ingestor,
            metrics: self.metrics,
        })
    }
}

/// Long-term memory for agents: facts, entities, and the links between them.
pub struct MemoryGraph {
    config: FathomConfig,
    store: Arc<dyn GraphStore>,
    resolver: Arc<EntityResolver>,
    linker: Arc<LinkBuilder>,
    search: SearchEngine,
    admission: Arc<AdmissionController>,
    jobs: Arc<JobWorker>,
    ingestor: Ingestor,
    metrics: Arc<dyn MetricsCollector>,
}

impl MemoryGraph {
    /// Start assembling a graph.
    pub fn builder(config: FathomConfig) -> MemoryGraphBuilder {
        MemoryGraphBuilder {
            config,
            store: None,
            embedder: None,
            extractor: None,
            classifier: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Open the configured SQLite database with no providers.
    pub fn open(config: FathomConfig) -> FathomResult<Self> {
        Self::builder(config).build()
    }

    /// An in-memory graph with no providers.
    pub fn open_in_memory(config: FathomConfig) -> FathomResult<Self> {
        Self::builder(config).in_memory().build()
    }

    /// The configuration in use.
    pub fn config(&self) -> &FathomConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    fn observe<T>(
        &self,
        operation: &str,
        bank_id: &str,
        budget: Option<&str>,
        started: Instant,
        result: &FathomResult<T>,
    ) {
        self.metrics
            .record_operation(operation, bank_id, budget, started.elapsed(), result.is_ok());
    }

    /// Map a mention to an existing or new entity of the bank.
    pub async fn resolve_entity(
        &self,
        bank_id: &str,
        mention: &EntityMention,
    ) -> FathomResult<EntityId> {
        let started = Instant::now();
        let result = self
            .resolver
            .resolve(bank_id, mention, Utc::now(), &[])
            .await;
        self.observe(op::RESOLVE, bank_id, None, started, &result);
        result
    }

    /// Compute temporal, semantic, and entity links for a committed fact.
    /// Safe to call again: existing edges are kept and not duplicated.
    pub async fn build_links(&self, bank_id: &str, unit_id: UnitId) -> FathomResult<LinkReport> {
        let started = Instant::now();
        let result = self.linker.build_links(bank_id, unit_id).await;
        self.observe(op::LINK, bank_id, None, started, &result);
        result
    }

    /// Validate and persist directed causal links.
    pub async fn add_causal_links(
        &self,
        bank_id: &str,
        relations: &[CausalRelation],
    ) -> FathomResult<LinkReport> {
        let started = Instant::now();
        let result = self.linker.add_causal_links(bank_id, relations).await;
        self.observe(op::LINK, bank_id, None, started, &result);
        result
    }

    /// Rebuild links for every fact of the bank, oldest first. On a fully
    /// linked bank the report is all zeros.
    pub async fn relink(&self, bank_id: &str) -> FathomResult<LinkReport> {
        let mut report = LinkReport::default();
        for unit_id in self.store.list_unit_ids(bank_id).await? {
            report.merge(self.build_links(bank_id, unit_id).await?);
        }
        info!(bank = bank_id, new_edges = report.total(), "Relink finished");
        Ok(report)
    }

    /// Spreading-activation search.
    pub async fn search(&self, request: &SearchRequest) -> FathomResult<SearchResponse> {
        self.search.search(request).await
    }

    /// Spreading-activation search that stops once `cancel` reads `true`.
    pub async fn search_with_cancel(
        &self,
        request: &SearchRequest,
        cancel: watch::Receiver<bool>,
    ) -> FathomResult<SearchResponse> {
        self.search.search_with_cancel(request, cancel).await
    }

    /// Commit a batch of facts and queue their link work.
    pub async fn retain(&self, request: &RetainRequest) -> FathomResult<RetainReport> {
        let started = Instant::now();
        let result = self.ingestor.retain(request).await;
        self.observe(op::RETAIN, &request.bank_id, None, started, &result);
        result
    }

    /// Retain several batches in order, stopping at the first failure.
    pub async fn retain_batch(&self, requests: &[RetainRequest]) -> FathomResult<Vec<RetainReport>> {
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            reports.push(self.retain(request).await?);
        }
        Ok(reports)
    }

    /// Counts of facts, entities, and links per type.
    pub async fn bank_stats(&self, bank_id: &str) -> FathomResult<BankStats> {
        self.store.bank_stats(bank_id).await
    }

    /// Search slots in use.
    pub fn occupancy(&self) -> Occupancy {
        self.admission.occupancy()
    }

    /// Background job counters.
    pub fn job_stats(&self) -> JobStats {
        self.jobs.stats()
    }

    /// Jobs that exhausted their retries.
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.jobs.failed_jobs()
    }

    /// Re-queue failed jobs.
    pub async fn retry_failed_jobs(&self) -> FathomResult<usize> {
        self.jobs.retry_failed().await
    }

    /// Wait for the background queue to drain.
    pub async fn wait_idle(&self) {
        self.jobs.wait_idle().await
    }

    /// Stop admitting searches, drain background work, and stop the worker.
    pub async fn shutdown(&self) {
        self.admission.close();
        self.jobs.shutdown().await;
        info!("Memory graph shut down");
    }
}
