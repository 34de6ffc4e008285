//! Deterministic capabilities for demos and tests.
//!
//! Scores are derived from a hash of (evaluator kind, content), so the same
//! campaign seed and inputs always evolve the same way.

use std::sync::Arc;

use async_trait::async_trait;
use evo_state::{CampaignConfig, MutationDescriptor, RoundResult};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{
    Candidate, CapabilityResult, Capabilities, EvaluationOutput, EvaluationRequest,
    EvaluatorRegistry, GenerationRequest, Generator, Evaluator, Planner, Reporter,
};

const MUTATIONS: [&str; 4] = ["rephrase", "extend", "simplify", "recombine"];

/// Map arbitrary text to a stable value in `[0, 1]`.
pub fn stable_unit(text: &str) -> f64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// Echoes the campaign config into the plan.
pub struct DemoPlanner;

#[async_trait]
impl Planner for DemoPlanner {
    async fn plan(
        &self,
        config: &CampaignConfig,
        round_number: u32,
        prior: Option<&RoundResult>,
    ) -> CapabilityResult<serde_json::Value> {
        let focus = if round_number == 0 {
            "explore"
        } else {
            "refine"
        };
        Ok(json!({
            "variant_count": config.variants_per_round,
            "mutation_hint": config.mutation_hint.clone().unwrap_or_else(|| focus.to_string()),
            "focus": focus,
            "prior_best": prior.and_then(|p| p.best_fitness),
        }))
    }
}

/// Produces `count` textual mutations of the parent.
pub struct DemoGenerator;

#[async_trait]
impl Generator for DemoGenerator {
    async fn generate(&self, request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>> {
        let base = request
            .parent_content
            .clone()
            .unwrap_or_else(|| "candidate".to_string());
        let hint = request.mutation_hint.as_deref().unwrap_or("mutate");
        Ok((0..request.count)
            .map(|i| {
                let kind = MUTATIONS[(request.unit_index + i) % MUTATIONS.len()];
                Candidate {
                    content: format!(
                        "{base}\n// r{} u{} #{i} {kind} ({hint})",
                        request.round_number, request.unit_index
                    ),
                    mutation: Some(MutationDescriptor {
                        kind: kind.to_string(),
                        hint: request.mutation_hint.clone(),
                        detail: json!({ "unit": request.unit_index, "index": i }),
                    }),
                }
            })
            .collect())
    }
}

/// Hash-derived score per (kind, content).
pub struct DemoEvaluator;

#[async_trait]
impl Evaluator for DemoEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> CapabilityResult<EvaluationOutput> {
        let score = stable_unit(&format!("{}:{}", request.evaluator_kind, request.content));
        Ok(EvaluationOutput {
            score,
            payload: json!({
                "evaluator": request.evaluator_kind,
                "length": request.content.len(),
            }),
            cost: Some(0.0),
        })
    }
}

pub struct DemoReporter;

#[async_trait]
impl Reporter for DemoReporter {
    async fn summarize(&self, result: &RoundResult) -> CapabilityResult<serde_json::Value> {
        Ok(json!({
            "round": result.round_number,
            "population": result.population,
            "selected": result.selected_ids.len(),
            "best_fitness": result.best_fitness,
            "mean_fitness": result.mean_fitness,
        }))
    }
}

/// The full demo set. `DemoEvaluator` serves every evaluator kind.
pub fn capabilities() -> Capabilities {
    Capabilities::new(
        Arc::new(DemoPlanner),
        Arc::new(DemoGenerator),
        EvaluatorRegistry::new().with_default(Arc::new(DemoEvaluator)),
        Arc::new(DemoReporter),
    )
}
