//! Configuration types for the Fathom memory graph.
//!
//! Every section derives `Default` and is `#[serde(default)]`, so a config
//! file only needs to name the values it overrides.

use crate::error::{FathomError, FathomResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FathomConfig {
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Directory for the database and logs.
    pub data_dir: PathBuf,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Search scoring and traversal settings.
    pub search: SearchConfig,
    /// Link construction settings.
    pub links: LinkConfig,
    /// Entity resolution settings.
    pub resolver: ResolverConfig,
    /// Admission control and background job settings.
    pub concurrency: ConcurrencyConfig,
    /// Retry settings for store and provider calls.
    pub retry: RetrySettings,
}

impl Default for FathomConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: fathom_home(),
            storage: StorageConfig::default(),
            search: SearchConfig::default(),
            links: LinkConfig::default(),
            resolver: ResolverConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl FathomConfig {
    /// Validate every section.
    pub fn validate(&self) -> FathomResult<()> {
        self.storage.validate()?;
        self.search.validate()?;
        self.links.validate()?;
        self.resolver.validate()?;
        self.concurrency.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Database path, defaulting to `<data_dir>/fathom.db`.
    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("fathom.db"))
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path; `None` means `<data_dir>/fathom.db`.
    pub db_path: Option<PathBuf>,
    /// Dimension every stored embedding must have.
    pub embedding_dim: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            embedding_dim: 384,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> FathomResult<()> {
        if self.embedding_dim == 0 {
            return Err(FathomError::Config("storage.embedding_dim must be > 0".into()));
        }
        Ok(())
    }
}

/// Search scoring weights, traversal constants, and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Weight of propagated activation in the final score.
    pub w_activation: f32,
    /// Weight of query similarity in the final score.
    pub w_semantic: f32,
    /// Weight of recency in the final score.
    pub w_recency: f32,
    /// Weight of access frequency in the final score.
    pub w_frequency: f32,
    /// Per-hop activation decay.
    pub decay: f32,
    /// Number of entry points seeded from vector search.
    pub entry_points: usize,
    /// Minimum cosine similarity for an entry point.
    pub entry_similarity_floor: f32,
    /// Age at which recency falls to 0.5.
    pub recency_half_life_days: f64,
    /// Result count when the caller does not give one.
    pub default_top_k: usize,
    /// Expansion budget when the caller does not give one.
    pub default_budget: usize,
    /// Per-search deadline; `None` disables it.
    pub timeout_ms: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            w_activation: 0.30,
            w_semantic: 0.30,
            w_recency: 0.25,
            w_frequency: 0.15,
            decay: 0.8,
            entry_points: 3,
            entry_similarity_floor: 0.5,
            recency_half_life_days: 365.0,
            default_top_k: 10,
            default_budget: 300,
            timeout_ms: None,
        }
    }
}

impl SearchConfig {
    /// Check weights, decay, and thresholds.
    pub fn validate(&self) -> FathomResult<()> {
        let weights = [
            ("w_activation", self.w_activation),
            ("w_semantic", self.w_semantic),
            ("w_recency", self.w_recency),
            ("w_frequency", self.w_frequency),
        ];
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                return Err(FathomError::Config(format!(
                    "search.{name} must be a non-negative number, got {w}"
                )));
            }
        }
        if weights.iter().map(|(_, w)| w).sum::<f32>() <= 0.0 {
            return Err(FathomError::Config(
                "search weights must not all be zero".into(),
            ));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(FathomError::Config(format!(
                "search.decay must be in (0, 1], got {}",
                self.decay
            )));
        }
        if self.entry_points == 0 {
            return Err(FathomError::Config("search.entry_points must be > 0".into()));
        }
        unit_interval("search.entry_similarity_floor", self.entry_similarity_floor)?;
        if !(self.recency_half_life_days > 0.0) {
            return Err(FathomError::Config(
                "search.recency_half_life_days must be > 0".into(),
            ));
        }
        if self.default_top_k == 0 || self.default_budget == 0 {
            return Err(FathomError::Config(
                "search.default_top_k and search.default_budget must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Link construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Temporal window on either side of a fact.
    pub temporal_window_hours: u64,
    /// Floor for temporal link weight.
    pub temporal_min_weight: f32,
    /// Minimum cosine similarity for a semantic link.
    pub semantic_threshold: f32,
    /// Nearest neighbors considered for semantic links.
    pub semantic_candidates: usize,
    /// Most recent facts linked per shared entity; `None` links all of them.
    pub entity_fanout_cap: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            temporal_window_hours: 24,
            temporal_min_weight: 0.3,
            semantic_threshold: 0.7,
            semantic_candidates: 50,
            entity_fanout_cap: None,
        }
    }
}

impl LinkConfig {
    /// Check windows and thresholds.
    pub fn validate(&self) -> FathomResult<()> {
        if self.temporal_window_hours == 0 {
            return Err(FathomError::Config(
                "links.temporal_window_hours must be > 0".into(),
            ));
        }
        unit_interval("links.temporal_min_weight", self.temporal_min_weight)?;
        unit_interval("links.semantic_threshold", self.semantic_threshold)?;
        if self.semantic_candidates == 0 {
            return Err(FathomError::Config(
                "links.semantic_candidates must be > 0".into(),
            ));
        }
        if self.entity_fanout_cap == Some(0) {
            return Err(FathomError::Config(
                "links.entity_fanout_cap must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Entity resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Weight of name similarity.
    pub name_weight: f32,
    /// Weight of co-occurrence evidence.
    pub cooccurrence_weight: f32,
    /// Weight of temporal proximity.
    pub temporal_weight: f32,
    /// Minimum score to resolve to an existing entity.
    pub acceptance_threshold: f32,
    /// Gap at which temporal proximity reaches zero.
    pub temporal_window_days: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            name_weight: 0.5,
            cooccurrence_weight: 0.3,
            temporal_weight: 0.2,
            acceptance_threshold: 0.6,
            temporal_window_days: 7.0,
        }
    }
}

impl ResolverConfig {
    /// Check weights and threshold.
    pub fn validate(&self) -> FathomResult<()> {
        unit_interval("resolver.name_weight", self.name_weight)?;
        unit_interval("resolver.cooccurrence_weight", self.cooccurrence_weight)?;
        unit_interval("resolver.temporal_weight", self.temporal_weight)?;
        unit_interval("resolver.acceptance_threshold", self.acceptance_threshold)?;
        if !(self.temporal_window_days > 0.0) {
            return Err(FathomError::Config(
                "resolver.temporal_window_days must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Admission control and background job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum searches in flight at once.
    pub max_concurrent_searches: usize,
    /// How long a search waits for admission; `None` waits indefinitely.
    pub admission_timeout_ms: Option<u64>,
    /// Bounded background job queue length.
    pub job_queue_capacity: usize,
    /// Background jobs run concurrently.
    pub job_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_searches: 32,
            admission_timeout_ms: Some(30_000),
            job_queue_capacity: 1024,
            job_workers: 4,
        }
    }
}

impl ConcurrencyConfig {
    fn validate(&self) -> FathomResult<()> {
        if self.max_concurrent_searches == 0
            || self.job_queue_capacity == 0
            || self.job_workers == 0
        {
            return Err(FathomError::Config(
                "concurrency limits and queue capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Retry settings for ingestion-side writes and provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Initial backoff.
    pub min_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> FathomResult<()> {
        if self.max_attempts == 0 {
            return Err(FathomError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(FathomError::Config(
                "retry.min_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(FathomError::Config("retry.jitter must be in [0, 1]".into()));
        }
        Ok(())
    }
}

fn unit_interval(name: &str, value: f32) -> FathomResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FathomError::Config(format!(
            "{name} must be in [0, 1], got {value}"
        )))
    }
}

/// Default Fathom home directory (`~/.fathom`).
pub fn fathom_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".fathom")
}
