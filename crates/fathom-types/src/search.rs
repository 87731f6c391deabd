//! Search request/response types for spreading-activation retrieval.

use crate::error::{FathomError, FathomResult};
use crate::memory::{BankId, Entity, FactType, LinkType, MemoryUnit, UnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many facts a single search may expand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingBudget {
    /// 100 expansions.
    Low,
    /// 300 expansions.
    Mid,
    /// 1000 expansions.
    High,
    /// An explicit number of expansions.
    Custom(usize),
}

impl ThinkingBudget {
    /// Number of facts this budget allows the search to visit.
    pub fn expansions(&self) -> usize {
        match self {
            ThinkingBudget::Low => 100,
            ThinkingBudget::Mid => 300,
            ThinkingBudget::High => 1000,
            ThinkingBudget::Custom(n) => *n,
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> String {
        match self {
            ThinkingBudget::Low => "low".to_string(),
            ThinkingBudget::Mid => "mid".to_string(),
            ThinkingBudget::High => "high".to_string(),
            ThinkingBudget::Custom(n) => n.to_string(),
        }
    }
}

impl std::str::FromStr for ThinkingBudget {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ThinkingBudget::Low),
            "mid" | "medium" => Ok(ThinkingBudget::Mid),
            "high" => Ok(ThinkingBudget::High),
            other => other
                .parse::<usize>()
                .map(ThinkingBudget::Custom)
                .map_err(|_| FathomError::Validation(format!("invalid budget '{s}'"))),
        }
    }
}

/// A retrieval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Bank to search.
    pub bank_id: BankId,
    /// Natural-language query.
    pub query_text: String,
    /// Embedding of `query_text`.
    pub query_embedding: Vec<f32>,
    /// Maximum facts to expand.
    pub budget: ThinkingBudget,
    /// Maximum facts to return.
    pub top_k: usize,
    /// Restrict entry points and results to these fact types.
    #[serde(default)]
    pub fact_types: Option<Vec<FactType>>,
    /// Diversify results with MMR using this lambda.
    #[serde(default)]
    pub mmr_lambda: Option<f32>,
    /// Return the exploration trace.
    #[serde(default)]
    pub include_trace: bool,
    /// Return the entities mentioned by the results.
    #[serde(default)]
    pub include_entities: bool,
    /// Cut results once their estimated token count exceeds this.
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Reference time for recency scoring; defaults to the current time.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

impl SearchRequest {
    /// A request with default options.
    pub fn new(
        bank_id: impl Into<BankId>,
        query_text: impl Into<String>,
        query_embedding: Vec<f32>,
    ) -> Self {
        Self {
            bank_id: bank_id.into(),
            query_text: query_text.into(),
            query_embedding,
            budget: ThinkingBudget::Mid,
            top_k: 10,
            fact_types: None,
            mmr_lambda: None,
            include_trace: false,
            include_entities: false,
            max_tokens: None,
            now: None,
        }
    }

    /// Set the thinking budget.
    pub fn budget(mut self, budget: ThinkingBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Set the result count.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Restrict to the given fact types.
    pub fn fact_types(mut self, types: Vec<FactType>) -> Self {
        self.fact_types = Some(types);
        self
    }

    /// Enable MMR diversification.
    pub fn mmr(mut self, lambda: f32) -> Self {
        self.mmr_lambda = Some(lambda);
        self
    }

    /// Ask for the exploration trace.
    pub fn with_trace(mut self) -> Self {
        self.include_trace = true;
        self
    }

    /// Ask for entity records.
    pub fn with_entities(mut self) -> Self {
        self.include_entities = true;
        self
    }

    /// Fix the reference time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Reject malformed requests before any work is done.
    pub fn validate(&self, embedding_dim: usize) -> FathomResult<()> {
        if self.bank_id.trim().is_empty() {
            return Err(FathomError::Validation("bank id is empty".into()));
        }
        if self.query_text.trim().is_empty() {
            return Err(FathomError::Validation("query text is empty".into()));
        }
        if self.query_embedding.is_empty() {
            return Err(FathomError::Validation("query embedding is empty".into()));
        }
        if self.query_embedding.len() != embedding_dim {
            return Err(FathomError::Validation(format!(
                "query embedding has dimension {}, expected {embedding_dim}",
                self.query_embedding.len()
            )));
        }
        if self.budget.expansions() == 0 {
            return Err(FathomError::Validation(
                "thinking budget must be positive".into(),
            ));
        }
        if self.top_k == 0 {
            return Err(FathomError::Validation("top_k must be positive".into()));
        }
        if let Some(lambda) = self.mmr_lambda {
            if !(0.0..=1.0).contains(&lambda) {
                return Err(FathomError::Validation(format!(
                    "mmr lambda {lambda} outside [0, 1]"
                )));
            }
        }
        if let Some(types) = &self.fact_types {
            if types.is_empty() {
                return Err(FathomError::Validation("fact type filter is empty".into()));
            }
        }
        Ok(())
    }

    /// Whether a fact of this type passes the request's type filter.
    pub fn accepts(&self, fact_type: FactType) -> bool {
        self.fact_types
            .as_ref()
            .map_or(true, |types| types.contains(&fact_type))
    }
}

/// The weighted components behind a result's final score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Propagated activation.
    pub activation: f32,
    /// Cosine similarity to the query, clamped to [0, 1].
    pub semantic: f32,
    /// Logarithmic recency decay.
    pub recency: f32,
    /// Access count normalized against the bank maximum.
    pub frequency: f32,
    /// Weighted sum of the components.
    pub final_weight: f32,
}

/// One ranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredFact {
    /// The fact.
    pub unit: MemoryUnit,
    /// Score components.
    pub score: ScoreBreakdown,
}

/// One expansion step of the activation spread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// Expansion order, starting at 0.
    pub order: usize,
    /// Expanded fact.
    pub unit_id: UnitId,
    /// Activation when expanded.
    pub activation: f32,
    /// The fact and link type this activation arrived through; `None` for
    /// entry points.
    pub via: Option<(UnitId, LinkType)>,
    /// Number of neighbors whose activation improved.
    pub neighbors_updated: usize,
}

/// Record of how a search explored the graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchTrace {
    /// Entry points and their seed activation.
    pub entry_points: Vec<(UnitId, f32)>,
    /// Expansions, in order.
    pub steps: Vec<TraceStep>,
    /// Whether propagation stopped because the budget ran out.
    pub budget_exhausted: bool,
    /// Wall-clock time spent.
    pub elapsed_ms: u64,
}

/// Result of a search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Ranked results, best first.
    pub results: Vec<ScoredFact>,
    /// Number of distinct facts visited.
    pub visited: usize,
    /// Entities mentioned by the results, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<Entity>>,
    /// Exploration trace, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<SearchTrace>,
}
