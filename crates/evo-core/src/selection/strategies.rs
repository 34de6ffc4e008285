//! Selection strategies.
//!
//! All strategies are pure functions of the scored population, `k` and a
//! seed. Ties are broken by creation order, then id.

use std::cmp::Ordering;

use evo_state::{SelectionConfig, SelectionStrategy, VariantId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::fitness::ScoredVariant;

/// Round-level inputs a strategy may depend on besides the population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionContext {
    pub seed: u64,
    pub round_number: u32,
    pub max_rounds: u32,
}

impl SelectionContext {
    /// Seed for this round's RNG; differs per round for the same campaign.
    pub fn round_seed(&self) -> u64 {
        self.seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(u64::from(self.round_number))
    }

    /// Share of picks made by fitness alone: 0 in round 0, 1 in the last round.
    pub fn exploitation_ratio(&self) -> f64 {
        if self.max_rounds <= 1 {
            return 1.0;
        }
        (f64::from(self.round_number) / f64::from(self.max_rounds - 1)).clamp(0.0, 1.0)
    }
}

/// Descending fitness, then creation order, then id.
pub fn rank_order(a: &ScoredVariant, b: &ScoredVariant) -> Ordering {
    b.fitness
        .total_cmp(&a.fitness)
        .then(a.variant.created_at.cmp(&b.variant.created_at))
        .then(a.variant.id.cmp(&b.variant.id))
}

/// Eligible variants in rank order.
pub fn ranked(population: &[ScoredVariant]) -> Vec<&ScoredVariant> {
    let mut out: Vec<&ScoredVariant> = population.iter().filter(|v| v.eligible).collect();
    out.sort_by(|a, b| rank_order(a, b));
    out
}

/// Choose up to `config.k` variants. Ineligible variants are never chosen;
/// asking for more than exist returns all eligible ones.
pub fn select(
    population: &[ScoredVariant],
    config: &SelectionConfig,
    ctx: SelectionContext,
) -> Vec<VariantId> {
    let candidates = ranked(population);
    let k = config.k.min(candidates.len());
    match config.strategy {
        SelectionStrategy::TopK => top_k(&candidates, k),
        SelectionStrategy::Tournament => {
            tournament(&candidates, k, config.tournament_size, ctx.round_seed())
        }
        SelectionStrategy::Diversity => diversity(&candidates, &[], k, config.diversity_penalty),
        SelectionStrategy::Adaptive => adaptive(&candidates, k, config.diversity_penalty, ctx),
    }
}

/// First `k` by rank.
pub fn top_k(ranked: &[&ScoredVariant], k: usize) -> Vec<VariantId> {
    ranked.iter().take(k).map(|v| v.id()).collect()
}

/// Seeded tournaments without replacement.
///
/// Each tournament samples `size` distinct remaining variants and takes the
/// best-ranked one.
pub fn tournament(ranked: &[&ScoredVariant], k: usize, size: usize, seed: u64) -> Vec<VariantId> {
    let mut rng = StdRng::seed_from_u64(seed);
    // Indices into `ranked`, so the smallest index in a sample is its winner.
    let mut remaining: Vec<usize> = (0..ranked.len()).collect();
    let mut picked = Vec::with_capacity(k);

    while picked.len() < k && !remaining.is_empty() {
        let draw = size.max(1).min(remaining.len());
        // Partial Fisher-Yates over the first `draw` slots.
        for i in 0..draw {
            let j = rng.gen_range(i..remaining.len());
            remaining.swap(i, j);
        }
        let slot = remaining[..draw]
            .iter()
            .enumerate()
            .min_by_key(|(_, idx)| **idx)
            .map(|(slot, _)| slot)
            .unwrap_or(0);
        let winner = remaining.swap_remove(slot);
        picked.push(ranked[winner].id());
    }
    picked
}

/// Similarity used by the diversity penalty, in `[0, 1]`.
///
/// The strongest of: fingerprint prefix overlap, same mutation kind (0.5),
/// same parent (0.5); both of the latter give 0.75.
pub fn similarity(a: &ScoredVariant, b: &ScoredVariant) -> f64 {
    let fingerprint = a.variant.fingerprint.similarity(&b.variant.fingerprint);
    let same_kind = match (&a.variant.mutation, &b.variant.mutation) {
        (Some(x), Some(y)) => x.kind == y.kind,
        _ => false,
    };
    let same_parent = a.variant.parent_id.is_some() && a.variant.parent_id == b.variant.parent_id;
    let structural = match (same_kind, same_parent) {
        (true, true) => 0.75,
        (true, false) | (false, true) => 0.5,
        (false, false) => 0.0,
    };
    fingerprint.max(structural)
}

/// Greedy pick with a multiplicative penalty on variants similar to earlier
/// picks: `fitness * (1 - penalty * similarity)`, compounded per pick.
///
/// `already` are picks made before this call; they penalise but are not
/// returned again.
pub fn diversity(
    ranked: &[&ScoredVariant],
    already: &[&ScoredVariant],
    n: usize,
    penalty: f64,
) -> Vec<VariantId> {
    let mut pool: Vec<(&ScoredVariant, f64)> = ranked
        .iter()
        .filter(|v| !already.iter().any(|a| a.id() == v.id()))
        .map(|v| (*v, v.fitness))
        .collect();
    for prior in already {
        apply_penalty(&mut pool, prior, penalty);
    }

    let mut picked = Vec::with_capacity(n);
    while picked.len() < n && !pool.is_empty() {
        // Pool stays in rank order, so the first maximum wins ties.
        let mut best = 0;
        for (i, (_, adjusted)) in pool.iter().enumerate().skip(1) {
            if adjusted.total_cmp(&pool[best].1) == Ordering::Greater {
                best = i;
            }
        }
        let (chosen, _) = pool.remove(best);
        picked.push(chosen.id());
        apply_penalty(&mut pool, chosen, penalty);
    }
    picked
}

fn apply_penalty(pool: &mut [(&ScoredVariant, f64)], chosen: &ScoredVariant, penalty: f64) {
    for (candidate, adjusted) in pool.iter_mut() {
        *adjusted *= 1.0 - penalty * similarity(chosen, candidate);
    }
}

/// `round(k * r)` picks by rank, the rest by diversity, where `r` moves from
/// 0 in the first round to 1 in the last.
pub fn adaptive(
    ranked: &[&ScoredVariant],
    k: usize,
    penalty: f64,
    ctx: SelectionContext,
) -> Vec<VariantId> {
    let exploit = ((k as f64) * ctx.exploitation_ratio()).round() as usize;
    let exploit = exploit.min(k);
    let mut picked = top_k(ranked, exploit);
    let already: Vec<&ScoredVariant> = ranked[..exploit.min(ranked.len())].to_vec();
    picked.extend(diversity(ranked, &already, k - exploit, penalty));
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use evo_state::{CampaignId, MutationDescriptor, NewVariant, RoundId};

    fn population(scores: &[f64]) -> Vec<ScoredVariant> {
        let base = Utc::now();
        let campaign = CampaignId::new();
        let round = RoundId::new();
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let v = NewVariant::founder(campaign, round, format!("variant-{i}"), None)
                    .into_record(base + Duration::milliseconds(i as i64));
                ScoredVariant {
                    variant: v,
                    fitness: *s,
                    eligible: true,
                    completed: 1,
                    failed: 0,
                }
            })
            .collect()
    }

    fn ctx(round_number: u32, max_rounds: u32) -> SelectionContext {
        SelectionContext {
            seed: 42,
            round_number,
            max_rounds,
        }
    }

    #[test]
    fn top_k_takes_highest() {
        let pop = population(&[0.9, 0.7, 0.5, 0.3, 0.1]);
        let picked = select(&pop, &SelectionConfig::top_k(3), ctx(0, 3));
        assert_eq!(picked, vec![pop[0].id(), pop[1].id(), pop[2].id()]);

        // Input order does not matter.
        let mut reversed = pop.clone();
        reversed.reverse();
        let again = select(&reversed, &SelectionConfig::top_k(3), ctx(0, 3));
        assert_eq!(again, picked);
    }

    #[test]
    fn ties_break_by_creation_order() {
        let pop = population(&[0.5, 0.5, 0.5]);
        let picked = select(&pop, &SelectionConfig::top_k(2), ctx(0, 1));
        assert_eq!(picked, vec![pop[0].id(), pop[1].id()]);
    }

    #[test]
    fn k_larger_than_population_selects_all_eligible() {
        let mut pop = population(&[0.2, 0.8, 0.4]);
        pop[2].eligible = false;
        let picked = select(&pop, &SelectionConfig::top_k(10), ctx(0, 1));
        assert_eq!(picked, vec![pop[1].id(), pop[0].id()]);
    }

    #[test]
    fn tournament_is_seeded_and_without_replacement() {
        let pop = population(&[0.9, 0.8, 0.7, 0.6, 0.5, 0.4, 0.3, 0.2]);
        let cfg = SelectionConfig::with_strategy(SelectionStrategy::Tournament, 4);
        let a = select(&pop, &cfg, ctx(1, 3));
        let b = select(&pop, &cfg, ctx(1, 3));
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        let unique: std::collections::HashSet<_> = a.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn tournament_of_whole_population_is_top_k() {
        let pop = population(&[0.1, 0.9, 0.5]);
        let mut cfg = SelectionConfig::with_strategy(SelectionStrategy::Tournament, 2);
        cfg.tournament_size = 10;
        let picked = select(&pop, &cfg, ctx(0, 1));
        assert_eq!(picked, vec![pop[1].id(), pop[2].id()]);
    }

    #[test]
    fn diversity_skips_near_duplicates() {
        let mut pop = population(&[0.9, 0.85, 0.6]);
        let parent = Some(evo_state::VariantId::new());
        for v in pop.iter_mut().take(2) {
            v.variant.parent_id = parent;
            v.variant.mutation = Some(MutationDescriptor::new("rephrase"));
        }
        let mut cfg = SelectionConfig::with_strategy(SelectionStrategy::Diversity, 2);
        cfg.diversity_penalty = 1.0;
        let picked = select(&pop, &cfg, ctx(0, 1));
        // 0.85 * (1 - 0.75) < 0.6
        assert_eq!(picked, vec![pop[0].id(), pop[2].id()]);

        let plain = select(&pop, &SelectionConfig::top_k(2), ctx(0, 1));
        assert_eq!(plain, vec![pop[0].id(), pop[1].id()]);
    }

    #[test]
    fn adaptive_moves_from_exploration_to_exploitation() {
        assert_eq!(ctx(0, 5).exploitation_ratio(), 0.0);
        assert_eq!(ctx(4, 5).exploitation_ratio(), 1.0);
        assert_eq!(ctx(0, 1).exploitation_ratio(), 1.0);

        let pop = population(&[0.9, 0.8, 0.7, 0.6]);
        let cfg = SelectionConfig::with_strategy(SelectionStrategy::Adaptive, 2);
        let last = select(&pop, &cfg, ctx(4, 5));
        assert_eq!(last, vec![pop[0].id(), pop[1].id()]);

        let first = select(&pop, &cfg, ctx(0, 5));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], pop[0].id());
    }
}
