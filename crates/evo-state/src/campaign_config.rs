//! Campaign configuration carried on every campaign record

use serde::{Deserialize, Serialize};

/// Name under which a campaign's selection policy versions are stored.
pub const SELECTION_POLICY: &str = "selection";

/// Configuration fixed at campaign creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Number of rounds to run; rounds are numbered `0..max_rounds`.
    pub max_rounds: u32,
    /// Variants requested from the generation stage per round.
    pub variants_per_round: usize,
    /// Evaluator ensemble applied to every variant.
    pub evaluators: Vec<EvaluatorSpec>,
    /// Initial selection policy (stored as version 1).
    pub selection: SelectionConfig,
    /// Seed for every randomized decision in the campaign.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Founder contents inserted verbatim into round 0 before the generator
    /// is asked for the remainder.
    #[serde(default)]
    pub initial_population: Vec<String>,
    /// Default hint passed to the generator when the plan does not give one.
    #[serde(default)]
    pub mutation_hint: Option<String>,
}

impl CampaignConfig {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_rounds == 0 {
            return Err("max_rounds must be at least 1".to_string());
        }
        if self.variants_per_round == 0 {
            return Err("variants_per_round must be at least 1".to_string());
        }
        if self.evaluators.is_empty() {
            return Err("at least one evaluator is required".to_string());
        }
        let mut kinds = std::collections::HashSet::new();
        for spec in &self.evaluators {
            if spec.kind.trim().is_empty() {
                return Err("evaluator kind must not be empty".to_string());
            }
            if !kinds.insert(spec.kind.as_str()) {
                return Err(format!("evaluator {} listed twice", spec.kind));
            }
            if !spec.weight.is_finite() || spec.weight < 0.0 {
                return Err(format!("evaluator {} has invalid weight", spec.kind));
            }
        }
        if self.evaluators.iter().map(|e| e.weight).sum::<f64>() <= 0.0 {
            return Err("evaluator weights must sum to a positive value".to_string());
        }
        self.selection.validate()
    }
}

/// One member of the evaluation ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    pub kind: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Evaluator kind whose score replaces this one's when over budget.
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub max_cost: Option<f64>,
    /// Keep an over-budget score when no fallback is configured.
    #[serde(default)]
    pub allow_over_budget: bool,
}

impl EvaluatorSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            weight: default_weight(),
            fallback: None,
            max_latency_ms: None,
            max_cost: None,
            allow_over_budget: false,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_fallback(mut self, kind: impl Into<String>) -> Self {
        self.fallback = Some(kind.into());
        self
    }

    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    pub fn with_max_cost(mut self, cost: f64) -> Self {
        self.max_cost = Some(cost);
        self
    }
}

fn default_weight() -> f64 {
    1.0
}

/// Selection strategy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    TopK,
    Tournament,
    Diversity,
    Adaptive,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::TopK => "top_k",
            SelectionStrategy::Tournament => "tournament",
            SelectionStrategy::Diversity => "diversity",
            SelectionStrategy::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned selection policy body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategy,
    /// Number of survivors per round.
    pub k: usize,
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    /// Multiplicative penalty applied to similar candidates, in `[0, 1]`.
    #[serde(default = "default_diversity_penalty")]
    pub diversity_penalty: f64,
}

impl SelectionConfig {
    pub fn top_k(k: usize) -> Self {
        Self::with_strategy(SelectionStrategy::TopK, k)
    }

    pub fn with_strategy(strategy: SelectionStrategy, k: usize) -> Self {
        Self {
            strategy,
            k,
            tournament_size: default_tournament_size(),
            diversity_penalty: default_diversity_penalty(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.k == 0 {
            return Err("selection k must be at least 1".to_string());
        }
        if self.tournament_size == 0 {
            return Err("tournament_size must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.diversity_penalty) {
            return Err("diversity_penalty must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

fn default_tournament_size() -> usize {
    3
}

fn default_diversity_penalty() -> f64 {
    0.5
}
