//! Background work dispatched after a fact commit.
//!
//! Link construction, causal linking, and classification run off the
//! ingestion path on a bounded queue. A full queue makes `enqueue` wait,
//! and `try_enqueue` fail with `Capacity`. Each job runs under the retry
//! helper; jobs that still fail are logged and parked in a failed list
//! that can be re-queued.
//!
//! A job may hand back follow-up jobs. They run in the same slot right
//! after it, each with its own retries, so a retried job never repeats the
//! side effects of the work it handed off.

use crate::linker::LinkBuilder;
use crate::metrics::{op, MetricsCollector};
use crate::names::normalize_name;
use crate::resolver::EntityResolver;
use crate::retry::{retry_with, RetryOutcome};
use crate::store::GraphStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_types::config::{ConcurrencyConfig, RetrySettings};
use fathom_types::error::{FathomError, FathomResult};
use fathom_types::memory::{CausalRelation, FactType, MemoryUnit, UnitId};
use fathom_types::provider::{EmbeddingProvider, FactClassifier, OpinionDraft};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundJob {
    /// Compute temporal, semantic, and entity links for a committed fact.
    BuildLinks {
        /// Bank of the fact.
        bank_id: String,
        /// The fact.
        unit_id: UnitId,
    },
    /// Persist externally judged causal relations.
    CausalLinks {
        /// Bank of the facts.
        bank_id: String,
        /// Relations to validate and persist.
        relations: Vec<CausalRelation>,
    },
    /// Ask the classifier for causal relations and opinions over new facts.
    Classify {
        /// Bank of the facts.
        bank_id: String,
        /// The newly committed facts.
        unit_ids: Vec<UnitId>,
    },
    /// Commit one classifier opinion as an opinion fact under a fixed id.
    FormOpinion {
        /// Bank of the opinion.
        bank_id: String,
        /// Id the opinion fact is stored under.
        unit_id: UnitId,
        /// The classifier's draft.
        opinion: OpinionDraft,
    },
}

impl BackgroundJob {
    /// Short job name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BackgroundJob::BuildLinks { .. } => "build_links",
            BackgroundJob::CausalLinks { .. } => "causal_links",
            BackgroundJob::Classify { .. } => "classify",
            BackgroundJob::FormOpinion { .. } => "form_opinion",
        }
    }

    /// Bank the job operates on.
    pub fn bank_id(&self) -> &str {
        match self {
            BackgroundJob::BuildLinks { bank_id, .. }
            | BackgroundJob::CausalLinks { bank_id, .. }
            | BackgroundJob::Classify { bank_id, .. }
            | BackgroundJob::FormOpinion { bank_id, .. } => bank_id,
        }
    }
}

/// Executes jobs for the worker.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run one job to completion, returning any follow-up jobs.
    async fn run(&self, job: &BackgroundJob) -> FathomResult<Vec<BackgroundJob>>;
}

/// A job that failed after every retry.
#[derive(Debug, Clone)]
pub struct FailedJob {
    /// The job.
    pub job: BackgroundJob,
    /// Error message from the last attempt.
    pub error: String,
    /// Attempts made.
    pub attempts: u32,
    /// When it was given up on.
    pub failed_at: DateTime<Utc>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    /// Jobs accepted onto the queue.
    pub enqueued: u64,
    /// Jobs that finished successfully.
    pub completed: u64,
    /// Jobs that failed after retries.
    pub failed: u64,
}

impl JobStats {
    /// Jobs queued or running.
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> JobStats {
        JobStats {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Bounded job queue with a fixed number of concurrent runners.
pub struct JobWorker {
    tx: Mutex<Option<mpsc::Sender<BackgroundJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    failed: Arc<Mutex<Vec<FailedJob>>>,
    settled: Arc<Notify>,
}

impl JobWorker {
    /// Spawn the dispatcher. Must be called inside a tokio runtime.
    pub fn start(
        runner: Arc<dyn JobRunner>,
        config: &ConcurrencyConfig,
        retry: RetrySettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.job_queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let failed = Arc::new(Mutex::new(Vec::new()));
        let settled = Arc::new(Notify::new());
        let workers = config.job_workers.max(1);

        let dispatcher = tokio::spawn(dispatch(
            rx,
            runner,
            Arc::new(Semaphore::new(workers)),
            retry,
            counters.clone(),
            failed.clone(),
            settled.clone(),
        ));
        info!(
            workers,
            capacity = config.job_queue_capacity,
            "Background job worker started"
        );

        Self {
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            counters,
            failed,
            settled,
        }
    }

    fn sender(&self) -> FathomResult<mpsc::Sender<BackgroundJob>> {
        self.tx
            .lock()
            .map_err(|e| FathomError::Internal(e.to_string()))?
            .clone()
            .ok_or_else(|| FathomError::Internal("job worker is shut down".into()))
    }

    /// Queue a job, waiting for space if the queue is full.
    pub async fn enqueue(&self, job: BackgroundJob) -> FathomResult<()> {
        let tx = self.sender()?;
        // Count before sending so a fast job can never finish "before" it was enqueued.
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).await.is_err() {
            self.counters.enqueued.fetch_sub(1, Ordering::SeqCst);
            return Err(FathomError::Internal("job worker is shut down".into()));
        }
        Ok(())
    }

    /// Queue a job only if there is room right now.
    pub fn try_enqueue(&self, job: BackgroundJob) -> FathomResult<()> {
        let tx = self.sender()?;
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.counters.enqueued.fetch_sub(1, Ordering::SeqCst);
                match e {
                    mpsc::error::TrySendError::Full(job) => Err(FathomError::Capacity(format!(
                        "job queue full, dropped {} job for bank {}",
                        job.kind(),
                        job.bank_id()
                    ))),
                    mpsc::error::TrySendError::Closed(_) => {
                        Err(FathomError::Internal("job worker is shut down".into()))
                    }
                }
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> JobStats {
        self.counters.snapshot()
    }

    /// Jobs that exhausted their retries.
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.failed
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// Move every failed job back onto the queue. Returns how many were queued.
    pub async fn retry_failed(&self) -> FathomResult<usize> {
        let jobs: Vec<FailedJob> = {
            let mut failed = self
                .failed
                .lock()
                .map_err(|e| FathomError::Internal(e.to_string()))?;
            std::mem::take(&mut *failed)
        };
        let n = jobs.len();
        for failed in jobs {
            self.enqueue(failed.job).await?;
        }
        if n > 0 {
            info!(jobs = n, "Re-queued failed background jobs");
        }
        Ok(n)
    }

    /// Wait until every enqueued job has completed or failed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.settled.notified();
            if self.counters.snapshot().pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close the queue, let queued and running jobs finish, and join the
    /// dispatcher.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().ok().and_then(|mut tx| tx.take());
        drop(tx);
        let handle = self.dispatcher.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job dispatcher ended abnormally");
            }
        }
        let stats = self.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            "Background job worker stopped"
        );
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<BackgroundJob>,
    runner: Arc<dyn JobRunner>,
    slots: Arc<Semaphore>,
    retry: RetrySettings,
    counters: Arc<Counters>,
    failed: Arc<Mutex<Vec<FailedJob>>>,
    settled: Arc<Notify>,
) {
    let mut running: Vec<JoinHandle<()>> = Vec::new();
    while let Some(job) = rx.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        running.retain(|h| !h.is_finished());

        let runner = runner.clone();
        let retry = retry.clone();
        let counters = counters.clone();
        let failed = failed.clone();
        let settled = settled.clone();
        running.push(tokio::spawn(async move {
            let _permit = permit;
            let mut queue = VecDeque::from([job]);
            while let Some(job) = queue.pop_front() {
                let outcome = retry_with(
                    &retry,
                    job.kind(),
                    || runner.run(&job),
                    FathomError::is_retryable,
                )
                .await;
                match outcome {
                    RetryOutcome::Success {
                        result: follow_ups, ..
                    } => {
                        debug!(
                            job = job.kind(),
                            bank = job.bank_id(),
                            follow_ups = follow_ups.len(),
                            "Background job done"
                        );
                        // Follow-ups are counted before this job settles so
                        // `wait_idle` never sees a gap.
                        counters
                            .enqueued
                            .fetch_add(follow_ups.len() as u64, Ordering::SeqCst);
                        queue.extend(follow_ups);
                        counters.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    RetryOutcome::Exhausted {
                        last_error,
                        attempts,
                    } => {
                        error!(
                            job = job.kind(),
                            bank = job.bank_id(),
                            attempts,
                            error = %last_error,
                            "Background job failed"
                        );
                        if let Ok(mut list) = failed.lock() {
                            list.push(FailedJob {
                                job,
                                error: last_error.to_string(),
                                attempts,
                                failed_at: Utc::now(),
                            });
                        }
                        counters.failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
                settled.notify_waiters();
            }
        }));
    }
    futures::future::join_all(running).await;
}

/// Runs jobs against the memory graph.
pub struct GraphJobRunner {
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) linker: Arc<LinkBuilder>,
    pub(crate) resolver: Arc<EntityResolver>,
    pub(crate) classifier: Option<Arc<dyn FactClassifier>>,
    pub(crate) embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub(crate) embedding_dim: usize,
    pub(crate) retry: RetrySettings,
    pub(crate) metrics: Arc<dyn MetricsCollector>,
}

impl GraphJobRunner {
    /// Ask the classifier about new facts. Writes nothing itself: causal
    /// relations and opinions come back as follow-up jobs.
    async fn classify(&self, bank_id: &str, unit_ids: &[UnitId]) -> FathomResult<Vec<BackgroundJob>> {
        let Some(classifier) = &self.classifier else {
            debug!(bank = bank_id, "No classifier configured; skipping classification");
            return Ok(Vec::new());
        };
        let units = self.store.get_units(bank_id, unit_ids).await?;
        if units.is_empty() {
            return Ok(Vec::new());
        }
        let classification = match classifier.classify(bank_id, &units).await {
            Ok(c) => c,
            Err(e) => {
                // Derived facts are optional; the underlying facts stay.
                warn!(bank = bank_id, error = %e, "Classification failed; no opinions formed");
                return Ok(Vec::new());
            }
        };

        let mut follow_ups = Vec::with_capacity(classification.opinions.len() + 1);
        if !classification.causal.is_empty() {
            let relations = classification
                .causal
                .into_iter()
                .map(|c| CausalRelation {
                    from_unit_id: c.from_unit_id,
                    to_unit_id: c.to_unit_id,
                    link_type: c.link_type,
                    strength: c.strength,
                })
                .collect();
            follow_ups.push(BackgroundJob::CausalLinks {
                bank_id: bank_id.to_string(),
                relations,
            });
        }
        for opinion in classification.opinions {
            follow_ups.push(BackgroundJob::FormOpinion {
                bank_id: bank_id.to_string(),
                unit_id: UnitId::new(),
                opinion,
            });
        }
        Ok(follow_ups)
    }

    /// Commit an opinion fact unless it already exists, then make sure its
    /// entities and entity links are in place. Safe to re-run.
    async fn form_opinion(
        &self,
        bank_id: &str,
        unit_id: UnitId,
        opinion: &OpinionDraft,
    ) -> FathomResult<Vec<BackgroundJob>> {
        let unit = match self.store.get_unit(bank_id, unit_id).await? {
            Some(unit) => unit,
            None => {
                let Some(embedder) = &self.embedder else {
                    warn!(bank = bank_id, "No embedding provider; dropping opinion");
                    return Ok(Vec::new());
                };
                let embedding = embedder.embed_one(&opinion.text).await?;
                let mut unit =
                    MemoryUnit::new(bank_id, opinion.text.clone(), FactType::Opinion, embedding)
                        .with_confidence(opinion.confidence);
                unit.id = unit_id;
                if let Err(e) = unit.validate(self.embedding_dim) {
                    warn!(bank = bank_id, error = %e, "Dropping invalid opinion");
                    return Ok(Vec::new());
                }
                self.store.insert_unit(&unit).await?;
                info!(bank = bank_id, unit = %unit_id, "Formed opinion");
                unit
            }
        };

        let mentions: Vec<_> = opinion
            .entities
            .iter()
            .filter(|m| !normalize_name(&m.name).is_empty())
            .cloned()
            .collect();
        if !mentions.is_empty() && self.store.entities_for_unit(bank_id, unit_id).await?.is_empty()
        {
            self.resolver
                .resolve_mentions(bank_id, unit_id, &mentions, unit.mentioned_at)
                .await?;
        }
        self.linker.build_entity_links(bank_id, unit_id).await?;
        Ok(vec![BackgroundJob::BuildLinks {
            bank_id: bank_id.to_string(),
            unit_id,
        }])
    }
}

#[async_trait]
impl JobRunner for GraphJobRunner {
    async fn run(&self, job: &BackgroundJob) -> FathomResult<Vec<BackgroundJob>> {
        let started = Instant::now();
        let (operation, result) = match job {
            BackgroundJob::BuildLinks { bank_id, unit_id } => (
                op::LINK,
                self.linker
                    .build_links(bank_id, *unit_id)
                    .await
                    .map(|_| Vec::new()),
            ),
            BackgroundJob::CausalLinks { bank_id, relations } => (
                op::LINK,
                self.linker
                    .add_causal_links(bank_id, relations)
                    .await
                    .map(|_| Vec::new()),
            ),
            BackgroundJob::Classify { bank_id, unit_ids } => {
                (op::CLASSIFY, self.classify(bank_id, unit_ids).await)
            }
            BackgroundJob::FormOpinion {
                bank_id,
                unit_id,
                opinion,
            } => (
                op::OPINION,
                self.form_opinion(bank_id, *unit_id, opinion).await,
            ),
        };
        self.metrics.record_operation(
            operation,
            job.bank_id(),
            None,
            started.elapsed(),
            result.is_ok(),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct CountingRunner {
        runs: AtomicU32,
        fail_first: u32,
        error: fn() -> FathomError,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _job: &BackgroundJob) -> FathomResult<Vec<BackgroundJob>> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.error)())
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct BlockingRunner {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl JobRunner for BlockingRunner {
        async fn run(&self, _job: &BackgroundJob) -> FathomResult<Vec<BackgroundJob>> {
            self.gate.notified().await;
            Ok(Vec::new())
        }
    }

    /// Classify hands back two link jobs; link jobs fail once each.
    struct ChainRunner {
        classify_runs: AtomicU32,
        link_runs: AtomicU32,
    }

    #[async_trait]
    impl JobRunner for ChainRunner {
        async fn run(&self, job: &BackgroundJob) -> FathomResult<Vec<BackgroundJob>> {
            match job {
                BackgroundJob::Classify { bank_id, unit_ids } => {
                    self.classify_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(unit_ids
                        .iter()
                        .map(|id| BackgroundJob::BuildLinks {
                            bank_id: bank_id.clone(),
                            unit_id: *id,
                        })
                        .collect())
                }
                _ => {
                    if self.link_runs.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                        Err(FathomError::Store("busy".into()))
                    } else {
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            min_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        }
    }

    fn job() -> BackgroundJob {
        BackgroundJob::BuildLinks {
            bank_id: "b".into(),
            unit_id: UnitId::new(),
        }
    }

    #[tokio::test]
    async fn test_jobs_complete() {
        let runner = Arc::new(CountingRunner {
            runs: AtomicU32::new(0),
            fail_first: 0,
            error: || FathomError::Store("x".into()),
        });
        let worker = JobWorker::start(runner.clone(), &ConcurrencyConfig::default(), fast_retry());
        for _ in 0..10 {
            worker.enqueue(job()).await.unwrap();
        }
        worker.wait_idle().await;
        assert_eq!(worker.stats().completed, 10);
        assert_eq!(worker.stats().pending(), 0);
        worker.shutdown().await;
        assert!(worker.enqueue(job()).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let runner = Arc::new(CountingRunner {
            runs: AtomicU32::new(0),
            fail_first: 2,
            error: || FathomError::Store("busy".into()),
        });
        let worker = JobWorker::start(runner.clone(), &ConcurrencyConfig::default(), fast_retry());
        worker.enqueue(job()).await.unwrap();
        worker.wait_idle().await;
        assert_eq!(worker.stats().completed, 1);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
        assert!(worker.failed_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_jobs_kept_and_requeued() {
        let runner = Arc::new(CountingRunner {
            runs: AtomicU32::new(0),
            fail_first: 1,
            error: || FathomError::unit_not_found("x"),
        });
        let worker = JobWorker::start(runner.clone(), &ConcurrencyConfig::default(), fast_retry());
        worker.enqueue(job()).await.unwrap();
        worker.wait_idle().await;
        assert_eq!(worker.stats().failed, 1);
        let failed = worker.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);

        assert_eq!(worker.retry_failed().await.unwrap(), 1);
        worker.wait_idle().await;
        assert_eq!(worker.stats().completed, 1);
        assert!(worker.failed_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_follow_ups_run_without_repeating_parent() {
        let runner = Arc::new(ChainRunner {
            classify_runs: AtomicU32::new(0),
            link_runs: AtomicU32::new(0),
        });
        let config = ConcurrencyConfig {
            job_workers: 1,
            ..ConcurrencyConfig::default()
        };
        let worker = JobWorker::start(runner.clone(), &config, fast_retry());
        worker
            .enqueue(BackgroundJob::Classify {
                bank_id: "b".into(),
                unit_ids: vec![UnitId::new(), UnitId::new()],
            })
            .await
            .unwrap();
        worker.wait_idle().await;

        assert_eq!(runner.classify_runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.link_runs.load(Ordering::SeqCst), 4);
        let stats = worker.stats();
        assert_eq!((stats.enqueued, stats.completed, stats.failed), (3, 3, 0));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_try_enqueue_full_queue() {
        let gate = Arc::new(Notify::new());
        let runner = Arc::new(BlockingRunner { gate: gate.clone() });
        let config = ConcurrencyConfig {
            job_queue_capacity: 1,
            job_workers: 1,
            ..ConcurrencyConfig::default()
        };
        let worker = JobWorker::start(runner, &config, fast_retry());
        // One job running (holding the only slot), one waiting in the
        // dispatcher for a slot, one filling the queue.
        worker.enqueue(job()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.enqueue(job()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.enqueue(job()).await.unwrap();
        let err = worker.try_enqueue(job()).unwrap_err();
        assert!(matches!(err, FathomError::Capacity(_)));
        assert_eq!(worker.stats().enqueued, 3);

        // Release the runners one at a time until everything drains.
        while worker.stats().pending() > 0 {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(worker.stats().completed, 3);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let runner = Arc::new(CountingRunner {
            runs: AtomicU32::new(0),
            fail_first: 0,
            error: || FathomError::Store("x".into()),
        });
        let worker = JobWorker::start(runner.clone(), &ConcurrencyConfig::default(), fast_retry());
        for _ in 0..5 {
            worker.enqueue(job()).await.unwrap();
        }
        worker.shutdown().await;
        assert_eq!(worker.stats().completed, 5);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 5);
    }
}
