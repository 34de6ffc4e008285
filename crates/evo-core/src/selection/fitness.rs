//! Collapse per-evaluator scores into one fitness per variant.

use std::collections::HashMap;

use evo_state::{EvaluationRecord, EvaluationStatus, EvaluatorSpec, VariantId, VariantRecord};
use serde::Serialize;

/// Fitness assigned to a variant with no completed evaluation.
pub const FLOOR_FITNESS: f64 = 0.0;

/// A variant with its aggregated fitness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredVariant {
    pub variant: VariantRecord,
    pub fitness: f64,
    /// False when no evaluator completed; such variants are never selected.
    pub eligible: bool,
    pub completed: usize,
    pub failed: usize,
}

impl ScoredVariant {
    pub fn id(&self) -> VariantId {
        self.variant.id
    }
}

/// Weighted mean of completed scores per variant, in the order of `variants`.
///
/// Weights come from the matching [`EvaluatorSpec`]; kinds not in `specs`
/// count with weight 1. If every completed kind has weight 0 the plain mean
/// is used.
pub fn aggregate(
    variants: &[VariantRecord],
    evaluations: &[EvaluationRecord],
    specs: &[EvaluatorSpec],
) -> Vec<ScoredVariant> {
    let weights: HashMap<&str, f64> = specs.iter().map(|s| (s.kind.as_str(), s.weight)).collect();
    let mut by_variant: HashMap<VariantId, Vec<&EvaluationRecord>> = HashMap::new();
    for eval in evaluations {
        by_variant.entry(eval.variant_id).or_default().push(eval);
    }

    variants
        .iter()
        .map(|variant| {
            let evals = by_variant.get(&variant.id).map(Vec::as_slice).unwrap_or(&[]);
            let scores: Vec<(f64, f64)> = evals
                .iter()
                .filter(|e| e.status == EvaluationStatus::Completed)
                .filter_map(|e| {
                    let w = weights.get(e.evaluator_kind.as_str()).copied().unwrap_or(1.0);
                    e.score.filter(|s| s.is_finite()).map(|s| (s, w))
                })
                .collect();
            let failed = evals
                .iter()
                .filter(|e| e.status == EvaluationStatus::Failed)
                .count();

            let fitness = weighted_mean(&scores).unwrap_or(FLOOR_FITNESS);
            ScoredVariant {
                variant: variant.clone(),
                fitness,
                eligible: !scores.is_empty(),
                completed: scores.len(),
                failed,
            }
        })
        .collect()
}

fn weighted_mean(scores: &[(f64, f64)]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let total_weight: f64 = scores.iter().map(|(_, w)| w).sum();
    if total_weight > 0.0 {
        Some(scores.iter().map(|(s, w)| s * w).sum::<f64>() / total_weight)
    } else {
        Some(scores.iter().map(|(s, _)| s).sum::<f64>() / scores.len() as f64)
    }
}
