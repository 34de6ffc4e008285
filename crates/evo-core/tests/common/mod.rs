#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use evo_core::capabilities::demo;
use evo_core::{
    CampaignService, Candidate, Capabilities, CapabilityError, CapabilityResult, EngineConfig,
    EvaluationOutput, EvaluationRequest, Evaluator, GenerationRequest, Generator, Orchestrator,
    Planner, Reporter,
};
use evo_state::{
    CampaignConfig, CampaignRecord, EvaluatorSpec, MemoryRepository, Repository, RoundResult,
    SelectionConfig,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub fn config(max_rounds: u32, variants: usize, k: usize) -> CampaignConfig {
    CampaignConfig {
        max_rounds,
        variants_per_round: variants,
        evaluators: vec![
            EvaluatorSpec::new("quality"),
            EvaluatorSpec::new("style").with_weight(0.5),
        ],
        selection: SelectionConfig::top_k(k),
        seed: Some(7),
        initial_population: vec![],
        mutation_hint: None,
    }
}

/// Create and start a campaign.
pub async fn active_campaign(repo: Arc<dyn Repository>, config: CampaignConfig) -> CampaignRecord {
    let svc = CampaignService::new(repo);
    let c = svc.create("test campaign", None, config).await.unwrap();
    svc.start(&c.id).await.unwrap()
}

pub fn orchestrator(repo: Arc<MemoryRepository>, caps: Capabilities) -> Orchestrator {
    Orchestrator::new(repo, caps, EngineConfig::fast())
}

pub fn demo_orchestrator(repo: Arc<MemoryRepository>) -> Orchestrator {
    orchestrator(repo, demo::capabilities())
}

/// Planner that counts calls and delegates to the demo planner.
#[derive(Default)]
pub struct CountingPlanner {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Planner for CountingPlanner {
    async fn plan(
        &self,
        config: &CampaignConfig,
        round_number: u32,
        prior: Option<&RoundResult>,
    ) -> CapabilityResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        demo::DemoPlanner.plan(config, round_number, prior).await
    }
}

/// Planner whose output is rejected by the planning stage.
pub struct BadPlanner;

#[async_trait]
impl Planner for BadPlanner {
    async fn plan(
        &self,
        _config: &CampaignConfig,
        _round_number: u32,
        _prior: Option<&RoundResult>,
    ) -> CapabilityResult<serde_json::Value> {
        Ok(json!({ "variant_count": -3 }))
    }
}

/// Planner whose backend never answers.
pub struct OfflinePlanner;

#[async_trait]
impl Planner for OfflinePlanner {
    async fn plan(
        &self,
        _config: &CampaignConfig,
        _round_number: u32,
        _prior: Option<&RoundResult>,
    ) -> CapabilityResult<serde_json::Value> {
        Err(CapabilityError::Unavailable("planner backend returned 503".into()))
    }
}

/// Always fails.
pub struct BrokenGenerator;

#[async_trait]
impl Generator for BrokenGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>> {
        Err(CapabilityError::Failed("model offline".into()))
    }
}

/// Panics on the first unit, generates like the demo generator otherwise.
pub struct PanickingGenerator;

#[async_trait]
impl Generator for PanickingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>> {
        if request.unit_index == 0 {
            panic!("generator crashed");
        }
        demo::DemoGenerator.generate(request).await
    }
}

/// Returns the same content for every request.
pub struct ConstantGenerator;

#[async_trait]
impl Generator for ConstantGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>> {
        Ok(vec![Candidate::new("always the same")])
    }
}

/// Cancels `token` on every call, then generates like the demo generator.
pub struct CancellingGenerator {
    pub token: CancellationToken,
}

#[async_trait]
impl Generator for CancellingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>> {
        self.token.cancel();
        demo::DemoGenerator.generate(request).await
    }
}

/// Takes the repository offline the first time it is called.
pub struct OutageGenerator {
    pub repo: Arc<MemoryRepository>,
    pub tripped: AtomicUsize,
}

#[async_trait]
impl Generator for OutageGenerator {
    async fn generate(&self, request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>> {
        if self.tripped.fetch_add(1, Ordering::SeqCst) == 0 {
            self.repo.set_unavailable(true);
        }
        demo::DemoGenerator.generate(request).await
    }
}

/// Rejects every variant; takes the repository offline on the first call.
pub struct OutageEvaluator {
    pub repo: Arc<MemoryRepository>,
    pub tripped: AtomicUsize,
}

#[async_trait]
impl Evaluator for OutageEvaluator {
    async fn evaluate(&self, _request: &EvaluationRequest) -> CapabilityResult<EvaluationOutput> {
        if self.tripped.fetch_add(1, Ordering::SeqCst) == 0 {
            self.repo.set_unavailable(true);
        }
        Err(CapabilityError::InvalidOutput("unparseable verdict".into()))
    }
}

/// Fixed score and cost.
pub struct FixedEvaluator {
    pub score: f64,
    pub cost: f64,
}

#[async_trait]
impl Evaluator for FixedEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> CapabilityResult<EvaluationOutput> {
        Ok(EvaluationOutput {
            score: self.score,
            payload: json!({ "kind": request.evaluator_kind }),
            cost: Some(self.cost),
        })
    }
}

/// Evaluator whose backend never answers.
pub struct OfflineEvaluator;

#[async_trait]
impl Evaluator for OfflineEvaluator {
    async fn evaluate(&self, _request: &EvaluationRequest) -> CapabilityResult<EvaluationOutput> {
        Err(CapabilityError::Unavailable("evaluator backend returned 502".into()))
    }
}

/// Fails for content containing `marker`, demo scores otherwise.
pub struct PickyEvaluator {
    pub marker: &'static str,
}

#[async_trait]
impl Evaluator for PickyEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> CapabilityResult<EvaluationOutput> {
        if request.content.contains(self.marker) {
            return Err(CapabilityError::InvalidOutput("unparseable verdict".into()));
        }
        demo::DemoEvaluator.evaluate(request).await
    }
}

pub struct BrokenReporter;

#[async_trait]
impl Reporter for BrokenReporter {
    async fn summarize(&self, _result: &RoundResult) -> CapabilityResult<serde_json::Value> {
        Err(CapabilityError::InvalidOutput("template error".into()))
    }
}
