//! Composite ranking of visited facts.

use crate::similarity::cosine_similarity;
use chrono::{DateTime, Utc};
use fathom_types::config::SearchConfig;
use fathom_types::memory::MemoryUnit;
use fathom_types::search::{ScoreBreakdown, ScoredFact};
use std::cmp::Ordering;

/// Logarithmic recency decay: `1 / (1 + log2(1 + age / half_life))`.
///
/// 1.0 at age zero, 0.5 at one half-life. Facts dated in the future
/// count as age zero.
pub fn recency(anchor: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f32 {
    let age_days = ((now - anchor).num_milliseconds().max(0) as f64) / 86_400_000.0;
    (1.0 / (1.0 + (1.0 + age_days / half_life_days).log2())) as f32
}

/// Access count normalized against the bank maximum; 0 when nothing in the
/// bank has been accessed.
pub fn frequency(access_count: u64, bank_max: u64) -> f32 {
    if bank_max == 0 {
        0.0
    } else {
        (access_count.min(bank_max) as f64 / bank_max as f64) as f32
    }
}

/// Query similarity clamped to [0, 1].
pub fn semantic(query: &[f32], embedding: &[f32]) -> f32 {
    cosine_similarity(query, embedding).clamp(0.0, 1.0)
}

/// Applies the configured weights.
pub struct Scorer<'a> {
    config: &'a SearchConfig,
    query: &'a [f32],
    now: DateTime<Utc>,
    bank_max_access: u64,
}

impl<'a> Scorer<'a> {
    /// Scorer for one search.
    pub fn new(
        config: &'a SearchConfig,
        query: &'a [f32],
        now: DateTime<Utc>,
        bank_max_access: u64,
    ) -> Self {
        Self {
            config,
            query,
            now,
            bank_max_access,
        }
    }

    /// Weighted sum of the four components.
    pub fn combine(&self, activation: f32, semantic: f32, recency: f32, frequency: f32) -> ScoreBreakdown {
        let final_weight = self.config.w_activation * activation
            + self.config.w_semantic * semantic
            + self.config.w_recency * recency
            + self.config.w_frequency * frequency;
        ScoreBreakdown {
            activation,
            semantic,
            recency,
            frequency,
            final_weight,
        }
    }

    /// Score a visited fact with the activation it ended the spread with.
    pub fn score(&self, unit: MemoryUnit, activation: f32) -> ScoredFact {
        let score = self.combine(
            activation,
            semantic(self.query, &unit.embedding),
            recency(unit.anchor_time(), self.now, self.config.recency_half_life_days),
            frequency(unit.access_count, self.bank_max_access),
        );
        ScoredFact { unit, score }
    }
}

/// Result order: final weight descending, then most recent anchor, then
/// unit id.
pub fn rank_order(a: &ScoredFact, b: &ScoredFact) -> Ordering {
    b.score
        .final_weight
        .total_cmp(&a.score.final_weight)
        .then_with(|| b.unit.anchor_time().cmp(&a.unit.anchor_time()))
        .then_with(|| a.unit.id.cmp(&b.unit.id))
}

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Keep results until their cumulative token estimate would exceed
/// `max_tokens`. The first result is always kept.
pub fn cap_tokens(results: &mut Vec<ScoredFact>, max_tokens: usize) {
    let mut used = 0;
    let mut keep = 0;
    for (i, r) in results.iter().enumerate() {
        let t = estimate_tokens(&r.unit.text);
        if i > 0 && used + t > max_tokens {
            break;
        }
        used += t;
        keep = i + 1;
    }
    results.truncate(keep);
}
