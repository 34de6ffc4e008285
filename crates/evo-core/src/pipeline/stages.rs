//! Pipeline stages.
//!
//! A stage is a function of the [`RoundContext`] and what earlier stages
//! persisted. It returns a [`StageOutput`] (the stage decision plus the
//! round patch written with the transition out of the stage). Stages write
//! variants, evaluations and selection flags through the repository and are
//! safe to re-run after a crash: every write they make is idempotent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use evo_state::{
    CampaignConfig, CampaignRecord, EvaluationStatus, EvaluationStore, EvaluatorSpec,
    MutationDescriptor, PolicyStore, Repository, RoundPatch, RoundRecord, RoundResult,
    RoundStore, VariantId, VariantRecord, VariantStore, SELECTION_POLICY,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::worker::{call_with_retry, run_bounded};
use super::StageKind;
use crate::capabilities::{
    Capabilities, CapabilityError, EvaluationOutput, EvaluationRequest, EvaluatorRegistry,
    GenerationRequest,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::lineage::Lineage;
use crate::metrics::METRICS;
use crate::obs;
use crate::recording::DecisionRecorder;
use crate::selection::{self, SelectionContext};

/// Everything a stage may read. `round` is re-read before each stage.
pub struct RoundContext {
    pub repo: Arc<dyn Repository>,
    pub lineage: Arc<Lineage>,
    pub capabilities: Capabilities,
    pub engine: EngineConfig,
    pub campaign: CampaignRecord,
    pub round: RoundRecord,
    pub recorder: DecisionRecorder,
    pub cancel: CancellationToken,
}

impl RoundContext {
    pub fn config(&self) -> &CampaignConfig {
        &self.campaign.config
    }

    /// Population size for this round: the plan's `variant_count` if set.
    pub fn variant_target(&self) -> usize {
        self.round
            .plan
            .as_ref()
            .and_then(|p| p.get("variant_count"))
            .and_then(Value::as_u64)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(self.config().variants_per_round)
    }

    pub fn mutation_hint(&self) -> Option<String> {
        self.round
            .plan
            .as_ref()
            .and_then(|p| p.get("mutation_hint"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.config().mutation_hint.clone())
    }

    /// Campaign seed, or one derived from the campaign id.
    pub fn seed(&self) -> u64 {
        self.config().seed.unwrap_or_else(|| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&self.campaign.id.0.as_bytes()[..8]);
            u64::from_le_bytes(bytes)
        })
    }

    fn cancelled(&self) -> EngineError {
        EngineError::Cancelled {
            round_id: self.round.id.to_string(),
            status: self.round.status,
        }
    }

    async fn previous_round(&self) -> EngineResult<Option<RoundRecord>> {
        match self.round.round_number.checked_sub(1) {
            Some(n) => Ok(self.repo.find_round(&self.campaign.id, n).await?),
            None => Ok(None),
        }
    }
}

/// Decision fields and round patch produced by one stage invocation.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub input: Value,
    /// `None` records the invocation as failed without failing the round.
    pub output: Option<Value>,
    pub rationale: String,
    pub confidence: f64,
    pub patch: RoundPatch,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, ctx: &RoundContext) -> EngineResult<StageOutput>;
}

/// Stage implementations keyed by [`StageKind`].
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<StageKind, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five built-in stages.
    pub fn standard() -> Self {
        Self::new()
            .register(Arc::new(PlanningStage))
            .register(Arc::new(GenerationStage))
            .register(Arc::new(EvaluationStage))
            .register(Arc::new(SelectionStage))
            .register(Arc::new(ReportingStage))
    }

    /// Add or replace the stage for its kind.
    pub fn register(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.kind(), stage);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn missing(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|k| !self.stages.contains_key(k))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

pub struct PlanningStage;

#[async_trait]
impl Stage for PlanningStage {
    fn kind(&self) -> StageKind {
        StageKind::Planning
    }

    #[instrument(skip_all, fields(round = ctx.round.round_number))]
    async fn run(&self, ctx: &RoundContext) -> EngineResult<StageOutput> {
        let prior = ctx.previous_round().await?.and_then(|r| r.result);
        let config = ctx.config();
        let round_number = ctx.round.round_number;
        let planner = ctx.capabilities.planner.clone();

        let plan = call_with_retry("planning", &ctx.engine, || {
            planner.plan(config, round_number, prior.as_ref())
        })
        .await
        .map_err(|source| EngineError::Capability {
            stage: StageKind::Planning,
            source,
        })?;

        if let Some(count) = plan.get("variant_count") {
            if !count.as_u64().is_some_and(|n| n > 0) {
                return Err(EngineError::Capability {
                    stage: StageKind::Planning,
                    source: CapabilityError::InvalidOutput(format!(
                        "variant_count must be a positive integer, got {count}"
                    )),
                });
            }
        }

        Ok(StageOutput {
            input: json!({
                "round_number": round_number,
                "max_rounds": config.max_rounds,
                "prior_best_fitness": prior.as_ref().and_then(|p| p.best_fitness),
            }),
            output: Some(plan.clone()),
            rationale: format!("planned round {round_number}"),
            confidence: 1.0,
            patch: RoundPatch::plan(plan),
        })
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

pub struct GenerationStage;

enum UnitOutcome {
    Produced { created: usize, deduplicated: usize },
    Failed,
}

#[async_trait]
impl Stage for GenerationStage {
    fn kind(&self) -> StageKind {
        StageKind::Generation
    }

    #[instrument(skip_all, fields(round = ctx.round.round_number))]
    async fn run(&self, ctx: &RoundContext) -> EngineResult<StageOutput> {
        let round = &ctx.round;
        let target = ctx.variant_target();
        let hint = ctx.mutation_hint();
        let existing = ctx.repo.list_variants(&round.id).await?.len();
        let mut population = existing;
        let mut seeded = 0usize;

        if round.round_number == 0 {
            for content in &ctx.config().initial_population {
                if population >= target {
                    break;
                }
                let out = ctx
                    .lineage
                    .create_variant(
                        ctx.campaign.id,
                        round.id,
                        None,
                        content.clone(),
                        Some(MutationDescriptor::new("seed")),
                    )
                    .await?;
                if out.created {
                    population += 1;
                    seeded += 1;
                }
            }
        }

        let parents: Vec<Option<VariantRecord>> = if round.round_number == 0 {
            vec![None]
        } else {
            let prev = ctx.previous_round().await?.ok_or_else(|| {
                EngineError::Invariant(format!(
                    "round {} has no predecessor",
                    round.round_number
                ))
            })?;
            let mut selected = ctx.repo.list_selected(&prev.id).await?;
            selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            if selected.is_empty() {
                return Err(EngineError::NoSelectedParents {
                    round_number: prev.round_number,
                });
            }
            selected.into_iter().map(Some).collect()
        };

        let need = target.saturating_sub(population);
        let requests: Vec<(GenerationRequest, Option<VariantRecord>)> = (0..need)
            .map(|i| {
                let unit_index = population + i;
                let parent = parents[unit_index % parents.len()].clone();
                (
                    GenerationRequest {
                        parent_content: parent.as_ref().map(|p| p.content.clone()),
                        mutation_hint: hint.clone(),
                        count: 1,
                        round_number: round.round_number,
                        unit_index,
                    },
                    parent,
                )
            })
            .collect();

        let unit_inputs: Vec<Value> = requests
            .iter()
            .map(|(request, parent)| generation_unit_input(request, parent.as_ref()))
            .collect();

        let slots = run_bounded(
            requests,
            ctx.engine.generation_pool,
            &ctx.cancel,
            |_, (request, parent)| {
                let generator = ctx.capabilities.generator.clone();
                let lineage = ctx.lineage.clone();
                let recorder = ctx.recorder.clone();
                let engine = ctx.engine.clone();
                let campaign_id = ctx.campaign.id;
                let round_id = round.id;
                async move {
                    let result =
                        call_with_retry("generation", &engine, || generator.generate(&request))
                            .await
                            .and_then(|c| {
                                if c.is_empty() {
                                    Err(CapabilityError::InvalidOutput("no candidates".into()))
                                } else {
                                    Ok(c)
                                }
                            });
                    match result {
                        Ok(candidates) => {
                            let mut created = 0;
                            let mut deduplicated = 0;
                            for candidate in candidates.into_iter().take(request.count.max(1)) {
                                let out = lineage
                                    .create_variant(
                                        campaign_id,
                                        round_id,
                                        parent.as_ref(),
                                        candidate.content,
                                        candidate.mutation,
                                    )
                                    .await?;
                                if out.created {
                                    created += 1;
                                } else {
                                    deduplicated += 1;
                                }
                            }
                            Ok::<_, EngineError>(UnitOutcome::Produced {
                                created,
                                deduplicated,
                            })
                        }
                        Err(e) => {
                            let unit = format!("unit-{}", request.unit_index);
                            obs::emit_unit_failed("generation", &unit, &e);
                            let input = generation_unit_input(&request, parent.as_ref());
                            recorder.record_failure("generation", None, input, &e).await?;
                            Ok(UnitOutcome::Failed)
                        }
                    }
                }
            },
        )
        .await;

        let mut created = seeded;
        let mut deduplicated = 0;
        let mut failed = 0;
        let mut lost = Vec::new();
        for (slot, input) in slots.into_iter().zip(unit_inputs) {
            match slot {
                Some(Ok(UnitOutcome::Produced {
                    created: c,
                    deduplicated: d,
                })) => {
                    created += c;
                    deduplicated += d;
                }
                Some(Ok(UnitOutcome::Failed)) => failed += 1,
                Some(Err(e)) => return Err(e),
                None => lost.push(input),
            }
        }
        let not_started = lost.len();
        if not_started > 0 && ctx.cancel.is_cancelled() {
            return Err(ctx.cancelled());
        }
        // Without cancellation an empty slot means the unit's task panicked.
        for input in lost {
            let unit = format!("unit-{}", input["unit_index"]);
            obs::emit_unit_failed("generation", &unit, &"unit task aborted");
            ctx.recorder
                .record_failure("generation", None, input, &"unit task aborted")
                .await?;
        }
        obs::emit_stage_completed("generation", need, failed + not_started);

        let population = ctx.repo.list_variants(&round.id).await?.len();
        if population == 0 {
            return Err(EngineError::NoViableVariants {
                round_number: round.round_number,
            });
        }

        Ok(StageOutput {
            input: json!({
                "target": target,
                "existing": existing,
                "units": need,
                "parents": parents.iter().flatten().map(|p| p.id).collect::<Vec<_>>(),
                "mutation_hint": hint,
            }),
            output: Some(json!({
                "population": population,
                "created": created,
                "deduplicated": deduplicated,
                "failed_units": failed + not_started,
            })),
            rationale: format!("generated {created} new variants, population {population}/{target}"),
            confidence: (population as f64 / target.max(1) as f64).min(1.0),
            patch: RoundPatch::default(),
        })
    }
}

fn generation_unit_input(request: &GenerationRequest, parent: Option<&VariantRecord>) -> Value {
    json!({
        "unit_index": request.unit_index,
        "parent_id": parent.map(|p| p.id),
        "mutation_hint": request.mutation_hint,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub struct EvaluationStage;

/// What one (variant, evaluator) pair ends as.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Scored {
        score: f64,
        payload: Value,
        fallback_from: Option<String>,
    },
    Failed {
        error: String,
        payload: Value,
    },
}

/// Why a successful call is over budget, if it is.
pub fn budget_exceeded(spec: &EvaluatorSpec, latency_ms: u64, cost: Option<f64>) -> Option<String> {
    if let Some(max) = spec.max_latency_ms {
        if latency_ms > max {
            return Some(format!("latency {latency_ms}ms > {max}ms"));
        }
    }
    if let (Some(max), Some(cost)) = (spec.max_cost, cost) {
        if cost > max {
            return Some(format!("cost {cost} > {max}"));
        }
    }
    None
}

/// Evaluate one pair, applying the budget and fallback rules.
///
/// Over budget (latency OR cost) with a fallback configured: the fallback's
/// score replaces the primary's. Without a fallback the primary score is kept
/// only when `allow_over_budget`. A primary that fails outright is a failed
/// pair; the fallback only stands in for results that arrived over budget.
/// Non-finite scores count as invalid output.
pub async fn evaluate_with_budget(
    spec: &EvaluatorSpec,
    request: &EvaluationRequest,
    registry: &EvaluatorRegistry,
    engine: &EngineConfig,
) -> Verdict {
    let Some(primary) = registry.get(&spec.kind) else {
        return Verdict::Failed {
            error: format!("no evaluator registered for {}", spec.kind),
            payload: Value::Null,
        };
    };

    let started = Instant::now();
    let primary_result = call_with_retry(&spec.kind, engine, || primary.evaluate(request))
        .await
        .and_then(finite_score);
    let latency_ms = started.elapsed().as_millis() as u64;

    let out = match primary_result {
        Ok(out) => out,
        Err(e) => {
            return Verdict::Failed {
                error: e.to_string(),
                payload: Value::Null,
            }
        }
    };
    let Some(reason) = budget_exceeded(spec, latency_ms, out.cost) else {
        return Verdict::Scored {
            score: out.score,
            payload: out.payload,
            fallback_from: None,
        };
    };

    if let Some(fallback_kind) = &spec.fallback {
        match run_fallback(fallback_kind, request, registry, engine).await {
            Ok(fb) => {
                METRICS.inc_fallbacks_used();
                obs::emit_fallback_used(&spec.kind, fallback_kind, &reason);
                return Verdict::Scored {
                    score: fb.score,
                    payload: json!({
                        "fallback": fallback_kind,
                        "reason": reason,
                        "result": fb.payload,
                        "primary_score": out.score,
                    }),
                    fallback_from: Some(spec.kind.clone()),
                };
            }
            Err(fb_err) if !spec.allow_over_budget => {
                return Verdict::Failed {
                    error: format!("over budget: {reason}; fallback {fallback_kind} failed: {fb_err}"),
                    payload: out.payload,
                };
            }
            Err(_) => {}
        }
    }

    if spec.allow_over_budget {
        Verdict::Scored {
            score: out.score,
            payload: json!({ "result": out.payload, "over_budget": reason }),
            fallback_from: None,
        }
    } else {
        Verdict::Failed {
            error: format!("over budget: {reason}"),
            payload: out.payload,
        }
    }
}

fn finite_score(out: EvaluationOutput) -> Result<EvaluationOutput, CapabilityError> {
    if out.score.is_finite() {
        Ok(out)
    } else {
        Err(CapabilityError::InvalidOutput(format!(
            "non-finite score {}",
            out.score
        )))
    }
}

async fn run_fallback(
    kind: &str,
    request: &EvaluationRequest,
    registry: &EvaluatorRegistry,
    engine: &EngineConfig,
) -> Result<EvaluationOutput, CapabilityError> {
    let evaluator = registry
        .get(kind)
        .ok_or_else(|| CapabilityError::Unavailable(format!("no evaluator {kind}")))?;
    let request = EvaluationRequest {
        evaluator_kind: kind.to_string(),
        ..request.clone()
    };
    call_with_retry(kind, engine, || evaluator.evaluate(&request))
        .await
        .and_then(finite_score)
}

#[async_trait]
impl Stage for EvaluationStage {
    fn kind(&self) -> StageKind {
        StageKind::Evaluation
    }

    #[instrument(skip_all, fields(round = ctx.round.round_number))]
    async fn run(&self, ctx: &RoundContext) -> EngineResult<StageOutput> {
        let round = &ctx.round;
        let variants = ctx.repo.list_variants(&round.id).await?;
        let done: HashMap<(VariantId, String), EvaluationStatus> = ctx
            .repo
            .list_evaluations(&round.id)
            .await?
            .into_iter()
            .map(|e| ((e.variant_id, e.evaluator_kind), e.status))
            .collect();

        let mut pairs = Vec::new();
        let mut skipped = 0usize;
        for variant in &variants {
            for spec in &ctx.config().evaluators {
                let terminal = done
                    .get(&(variant.id, spec.kind.clone()))
                    .is_some_and(|s| s.is_terminal());
                if terminal {
                    skipped += 1;
                } else {
                    pairs.push((variant.clone(), spec.clone()));
                }
            }
        }
        let total = pairs.len();

        let slots = run_bounded(
            pairs,
            ctx.engine.evaluation_pool,
            &ctx.cancel,
            |_, (variant, spec)| {
                let repo = ctx.repo.clone();
                let registry = ctx.capabilities.evaluators.clone();
                let recorder = ctx.recorder.clone();
                let engine = ctx.engine.clone();
                let round_id = round.id;
                let round_number = round.round_number;
                async move {
                    let eval = repo.create_evaluation(&variant.id, &round_id, &spec.kind).await?;
                    if eval.status.is_terminal() {
                        return Ok::<_, EngineError>(None);
                    }
                    repo.start_evaluation(&eval.id).await?;
                    let request = EvaluationRequest {
                        variant_id: variant.id,
                        content: variant.content.clone(),
                        evaluator_kind: spec.kind.clone(),
                        generation: variant.generation,
                        round_number,
                    };
                    match evaluate_with_budget(&spec, &request, &registry, &engine).await {
                        Verdict::Scored {
                            score,
                            payload,
                            fallback_from,
                        } => {
                            let fell_back = fallback_from.is_some();
                            repo.complete_evaluation(&eval.id, score, payload, fallback_from)
                                .await?;
                            METRICS.inc_evaluations_completed();
                            Ok(Some((true, fell_back)))
                        }
                        Verdict::Failed { error, payload } => {
                            obs::emit_unit_failed("evaluation", &spec.kind, &error);
                            // Decision first: a failed pair is skipped on resume.
                            recorder
                                .record_failure(
                                    "evaluation",
                                    Some(variant.id),
                                    json!({ "evaluator": spec.kind, "evaluation_id": eval.id }),
                                    &error,
                                )
                                .await?;
                            repo.fail_evaluation(&eval.id, error, payload).await?;
                            METRICS.inc_evaluations_failed();
                            Ok(Some((false, false)))
                        }
                    }
                }
            },
        )
        .await;

        let mut completed = 0;
        let mut failed = 0;
        let mut fallbacks = 0;
        let mut not_started = 0;
        for slot in slots {
            match slot {
                Some(Ok(Some((true, fell_back)))) => {
                    completed += 1;
                    if fell_back {
                        fallbacks += 1;
                    }
                }
                Some(Ok(Some((false, _)))) => failed += 1,
                Some(Ok(None)) => skipped += 1,
                Some(Err(e)) => return Err(e),
                None => not_started += 1,
            }
        }
        if not_started > 0 {
            if ctx.cancel.is_cancelled() {
                return Err(ctx.cancelled());
            }
            // A pair whose task died is left pending and the round fails.
            return Err(EngineError::Invariant(format!(
                "{not_started} evaluation units did not finish"
            )));
        }
        obs::emit_stage_completed("evaluation", total, failed);
        debug!(completed, failed, skipped, "evaluation settled");

        let attempted = completed + failed;
        Ok(StageOutput {
            input: json!({
                "variants": variants.len(),
                "evaluators": ctx.config().evaluators.iter().map(|e| &e.kind).collect::<Vec<_>>(),
                "pairs": total,
            }),
            output: Some(json!({
                "completed": completed,
                "failed": failed,
                "fallbacks": fallbacks,
                "skipped": skipped,
            })),
            rationale: format!("{completed} evaluations completed, {failed} failed"),
            confidence: if attempted == 0 {
                1.0
            } else {
                completed as f64 / attempted as f64
            },
            patch: RoundPatch::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

pub struct SelectionStage;

#[async_trait]
impl Stage for SelectionStage {
    fn kind(&self) -> StageKind {
        StageKind::Selection
    }

    #[instrument(skip_all, fields(round = ctx.round.round_number))]
    async fn run(&self, ctx: &RoundContext) -> EngineResult<StageOutput> {
        let round = &ctx.round;
        let variants = ctx.repo.list_variants(&round.id).await?;
        let evaluations = ctx.repo.list_evaluations(&round.id).await?;
        let scored = selection::aggregate(&variants, &evaluations, &ctx.config().evaluators);
        let eligible = scored.iter().filter(|v| v.eligible).count();

        let policy = ctx
            .repo
            .latest_policy(&ctx.campaign.id, SELECTION_POLICY)
            .await?;
        let config = policy
            .as_ref()
            .map(|p| p.config.clone())
            .unwrap_or_else(|| ctx.config().selection.clone());

        let already = ctx.repo.list_selected(&round.id).await?;
        let ids = if already.is_empty() {
            selection::select(
                &scored,
                &config,
                SelectionContext {
                    seed: ctx.seed(),
                    round_number: round.round_number,
                    max_rounds: ctx.config().max_rounds,
                },
            )
        } else {
            // Resumed after the flags were written; keep them.
            already.iter().map(|v| v.id).collect()
        };
        ctx.repo.mark_selected(&round.id, &ids).await?;

        let (best, mean) = selection::fitness_summary(&scored);
        let patch = match &policy {
            Some(p) => RoundPatch::policy(p.id),
            None => RoundPatch::default(),
        };
        Ok(StageOutput {
            input: json!({
                "population": scored.len(),
                "eligible": eligible,
                "strategy": config.strategy,
                "k": config.k,
                "policy_version": policy.as_ref().map(|p| p.version),
            }),
            output: Some(json!({
                "selected": ids,
                "best_fitness": best,
                "mean_fitness": mean,
            })),
            rationale: format!(
                "selected {} of {eligible} eligible variants by {}",
                ids.len(),
                config.strategy
            ),
            confidence: if eligible == 0 { 0.0 } else { 1.0 },
            patch,
        })
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

pub struct ReportingStage;

/// Rebuild the round outcome from what is persisted.
pub async fn build_result(ctx: &RoundContext) -> EngineResult<RoundResult> {
    let round = &ctx.round;
    let variants = ctx.repo.list_variants(&round.id).await?;
    let evaluations = ctx.repo.list_evaluations(&round.id).await?;
    let scored = selection::aggregate(&variants, &evaluations, &ctx.config().evaluators);

    let mut selected: Vec<&selection::ScoredVariant> =
        scored.iter().filter(|v| v.variant.selected).collect();
    selected.sort_by(|a, b| selection::rank_order(a, b));

    let ineligible = scored.iter().filter(|v| !v.eligible).count();
    let mut warnings = Vec::new();
    if ineligible == scored.len() {
        warnings.push("no variant has a completed evaluation; nothing selected".to_string());
    } else if ineligible > 0 {
        warnings.push(format!(
            "{ineligible} variant(s) had no completed evaluation and were not selectable"
        ));
    }

    let (best_fitness, mean_fitness) = selection::fitness_summary(&scored);
    Ok(RoundResult {
        round_id: round.id,
        campaign_id: round.campaign_id,
        round_number: round.round_number,
        trace_id: round.trace_id,
        plan: round.plan.clone(),
        population: scored.len(),
        evaluated: scored.len() - ineligible,
        evaluation_failures: evaluations
            .iter()
            .filter(|e| e.status == EvaluationStatus::Failed)
            .count(),
        selected_ids: selected.iter().map(|v| v.id()).collect(),
        best_fitness,
        mean_fitness,
        policy_id: round.policy_id,
        report: None,
        warnings,
    })
}

#[async_trait]
impl Stage for ReportingStage {
    fn kind(&self) -> StageKind {
        StageKind::Reporting
    }

    #[instrument(skip_all, fields(round = ctx.round.round_number))]
    async fn run(&self, ctx: &RoundContext) -> EngineResult<StageOutput> {
        let mut result = build_result(ctx).await?;
        let reporter = ctx.capabilities.reporter.clone();
        let input = json!({
            "population": result.population,
            "selected": result.selected_ids.len(),
        });

        let summary = {
            let snapshot = result.clone();
            call_with_retry("reporting", &ctx.engine, || reporter.summarize(&snapshot)).await
        };
        let (output, rationale, confidence) = match summary {
            Ok(report) => {
                result.report = Some(report.clone());
                (Some(report), "round summarized".to_string(), 1.0)
            }
            Err(e) => {
                obs::emit_report_failed(&ctx.round.id.to_string(), &e);
                result.warnings.push(format!("report failed: {e}"));
                (None, format!("report unavailable: {e}"), 0.0)
            }
        };

        Ok(StageOutput {
            input,
            output,
            rationale,
            confidence,
            patch: RoundPatch::result(result),
        })
    }
}
