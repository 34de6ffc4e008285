//! Fitness aggregation and selection strategies.
//!
//! - `fitness`: weighted combination of per-evaluator scores
//! - `strategies`: top_k, tournament, diversity, adaptive

pub mod fitness;
pub mod strategies;

pub use fitness::{aggregate, ScoredVariant, FLOOR_FITNESS};
pub use strategies::{rank_order, ranked, select, similarity, SelectionContext};

/// Best and mean fitness over eligible variants.
pub fn fitness_summary(population: &[ScoredVariant]) -> (Option<f64>, Option<f64>) {
    let eligible: Vec<f64> = population
        .iter()
        .filter(|v| v.eligible)
        .map(|v| v.fitness)
        .collect();
    if eligible.is_empty() {
        return (None, None);
    }
    let best = eligible.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = eligible.iter().sum::<f64>() / eligible.len() as f64;
    (Some(best), Some(mean))
}
