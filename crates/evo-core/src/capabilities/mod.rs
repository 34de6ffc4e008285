//! External capabilities consumed by the pipeline.
//!
//! Planning, generation, evaluation and reporting are black boxes to the
//! engine. Each is a narrow async trait returning structured data or a typed
//! [`CapabilityError`]; the engine never looks past what they return.
//!
//! Implementations are passed to the orchestrator explicitly through
//! [`Capabilities`], so tests substitute scripted fakes without global state.

pub mod demo;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evo_state::{CampaignConfig, MutationDescriptor, RoundResult, VariantId};
use serde::{Deserialize, Serialize};

/// Failure of one capability call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("call failed: {0}")]
    Failed(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("invalid output: {0}")]
    InvalidOutput(String),
}

impl CapabilityError {
    /// Invalid output is deterministic; everything else may succeed on retry.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CapabilityError::InvalidOutput(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityError::Failed(_) => "failed",
            CapabilityError::Timeout(_) => "timeout",
            CapabilityError::Unavailable(_) => "unavailable",
            CapabilityError::InvalidOutput(_) => "invalid_output",
        }
    }
}

pub type CapabilityResult<T> = std::result::Result<T, CapabilityError>;

// ---------------------------------------------------------------------------
// Requests and outputs
// ---------------------------------------------------------------------------

/// Input for one generation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// `None` for founders.
    pub parent_content: Option<String>,
    pub mutation_hint: Option<String>,
    pub count: usize,
    pub round_number: u32,
    pub unit_index: usize,
}

/// One candidate returned by a generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub content: String,
    #[serde(default)]
    pub mutation: Option<MutationDescriptor>,
}

impl Candidate {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            mutation: None,
        }
    }
}

/// Input for one (variant, evaluator) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub variant_id: VariantId,
    pub content: String,
    pub evaluator_kind: String,
    pub generation: u32,
    pub round_number: u32,
}

/// Score and supporting data for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutput {
    /// Expected in `[0, 1]`; the store clamps.
    pub score: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Cost reported by the evaluator, compared against `max_cost`.
    #[serde(default)]
    pub cost: Option<f64>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce the opaque stage plan for a round.
    ///
    /// Recognised keys: `variant_count` (overrides `variants_per_round`) and
    /// `mutation_hint`. Everything else is recorded verbatim.
    async fn plan(
        &self,
        config: &CampaignConfig,
        round_number: u32,
        prior: Option<&RoundResult>,
    ) -> CapabilityResult<serde_json::Value>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>>;
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> CapabilityResult<EvaluationOutput>;
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn summarize(&self, result: &RoundResult) -> CapabilityResult<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// Registry and bundle
// ---------------------------------------------------------------------------

/// Evaluators by kind, with an optional catch-all.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    by_kind: HashMap<String, Arc<dyn Evaluator>>,
    fallback_all: Option<Arc<dyn Evaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: impl Into<String>, evaluator: Arc<dyn Evaluator>) -> Self {
        self.by_kind.insert(kind.into(), evaluator);
        self
    }

    /// Serve every kind not registered explicitly (e.g. one HTTP endpoint).
    pub fn with_default(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.fallback_all = Some(evaluator);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Evaluator>> {
        self.by_kind
            .get(kind)
            .cloned()
            .or_else(|| self.fallback_all.clone())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.by_kind.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Every evaluator and fallback named by `config` must resolve.
    pub fn check(&self, config: &CampaignConfig) -> Result<(), String> {
        for spec in &config.evaluators {
            let names = std::iter::once(&spec.kind).chain(spec.fallback.iter());
            for name in names {
                if self.get(name).is_none() {
                    return Err(format!("no evaluator registered for kind {name}"));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("kinds", &self.kinds())
            .field("has_default", &self.fallback_all.is_some())
            .finish()
    }
}

/// The capability set handed to the orchestrator.
#[derive(Clone)]
pub struct Capabilities {
    pub planner: Arc<dyn Planner>,
    pub generator: Arc<dyn Generator>,
    pub evaluators: EvaluatorRegistry,
    pub reporter: Arc<dyn Reporter>,
}

impl Capabilities {
    pub fn new(
        planner: Arc<dyn Planner>,
        generator: Arc<dyn Generator>,
        evaluators: EvaluatorRegistry,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            planner,
            generator,
            evaluators,
            reporter,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_state::{EvaluatorSpec, SelectionConfig};

    fn config(kinds: &[(&str, Option<&str>)]) -> CampaignConfig {
        CampaignConfig {
            max_rounds: 1,
            variants_per_round: 1,
            evaluators: kinds
                .iter()
                .map(|(k, fb)| {
                    let spec = EvaluatorSpec::new(*k);
                    match fb {
                        Some(f) => spec.with_fallback(*f),
                        None => spec,
                    }
                })
                .collect(),
            selection: SelectionConfig::top_k(1),
            seed: None,
            initial_population: vec![],
            mutation_hint: None,
        }
    }

    #[test]
    fn registry_resolves_registered_and_default() {
        let reg = EvaluatorRegistry::new().register("quality", Arc::new(demo::DemoEvaluator));
        assert!(reg.get("quality").is_some());
        assert!(reg.get("speed").is_none());
        assert!(reg.check(&config(&[("quality", Some("speed"))])).is_err());

        let reg = reg.with_default(Arc::new(demo::DemoEvaluator));
        assert!(reg.get("speed").is_some());
        assert!(reg.check(&config(&[("quality", Some("speed"))])).is_ok());
    }

    #[test]
    fn invalid_output_is_not_transient() {
        assert!(CapabilityError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CapabilityError::Unavailable("down".into()).is_transient());
        assert!(!CapabilityError::InvalidOutput("bad json".into()).is_transient());
    }
}
