mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use evo_core::capabilities::demo;
use evo_core::{
    CampaignService, EngineConfig, EngineError, ErrorKind, EvaluatorRegistry, OrderingError,
    Orchestrator, RunControl,
};
use evo_state::{
    CampaignStatus, CampaignStore, DecisionLog, EvaluationStatus, EvaluationStore, EvaluatorSpec,
    MemoryRepository, RoundStatus, RoundStore, SelectionConfig, SelectionStrategy, VariantStore,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn round_zero_seeds_founders_and_completes() {
    let repo = Arc::new(MemoryRepository::new());
    let mut cfg = config(2, 4, 2);
    cfg.initial_population = vec!["alpha".into(), "beta".into()];
    let c = active_campaign(repo.clone(), cfg).await;
    let orch = demo_orchestrator(repo.clone());

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();

    assert_eq!(result.population, 4);
    assert_eq!(result.selected_ids.len(), 2);
    assert!(result.best_fitness.is_some());
    assert!(result.report.is_some());

    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Completed);
    let variants = repo.list_variants(&round.id).await.unwrap();
    assert!(variants.iter().all(|v| v.parent_id.is_none() && v.generation == 0));
    let contents: HashSet<&str> = variants.iter().map(|v| v.content.as_str()).collect();
    assert!(contents.contains("alpha") && contents.contains("beta"));

    // One decision per stage, in pipeline order.
    let stages: Vec<String> = repo
        .decisions_by_trace(&round.trace_id)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.stage)
        .collect();
    assert_eq!(
        stages,
        vec!["planning", "generation", "evaluation", "selection", "reporting"]
    );
}

#[tokio::test]
async fn later_rounds_breed_from_selected_parents() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(3, 4, 2)).await;
    let orch = demo_orchestrator(repo.clone());

    for n in 0..3 {
        orch.execute_round(&c.id, n, RunControl::default())
            .await
            .unwrap();
    }

    let rounds = repo.list_rounds(&c.id).await.unwrap();
    for pair in rounds.windows(2) {
        let parents: HashSet<_> = repo
            .list_selected(&pair[0].id)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        for child in repo.list_variants(&pair[1].id).await.unwrap() {
            assert_eq!(child.generation, pair[1].round_number);
            let parent_id = child.parent_id.expect("bred variants have a parent");
            assert!(parents.contains(&parent_id));
            let parent = repo.get_variant(&parent_id).await.unwrap();
            assert_eq!(child.generation, parent.generation + 1);

            let ancestry = orch.lineage().get_ancestry(&child.id).await.unwrap();
            assert_eq!(ancestry.len() as u32, child.generation + 1);
            assert!(ancestry[0].is_founder());
        }
    }
}

#[tokio::test]
async fn completed_round_is_returned_without_writes() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(2, 3, 1)).await;
    let orch = demo_orchestrator(repo.clone());

    let first = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    let writes = repo.write_count();
    let again = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();

    assert_eq!(first, again);
    assert_eq!(repo.write_count(), writes);
}

#[tokio::test]
async fn campaign_completes_after_max_rounds() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(3, 3, 1)).await;
    let orch = demo_orchestrator(repo.clone());

    let results = orch
        .execute_campaign(&c.id, RunControl::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    let campaign = repo.get_campaign(&c.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);

    let err = orch
        .execute_round(&c.id, 3, RunControl::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Ordering);
}

#[tokio::test]
async fn out_of_order_round_is_rejected_before_writing() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(3, 3, 1)).await;
    let orch = demo_orchestrator(repo.clone());

    let writes = repo.write_count();
    let err = orch
        .execute_round(&c.id, 2, RunControl::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ordering(OrderingError::OutOfOrder {
            requested: 2,
            expected: 0
        })
    ));
    assert_eq!(repo.write_count(), writes);
    assert!(repo.list_rounds(&c.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn inactive_campaign_is_an_ordering_error() {
    let repo = Arc::new(MemoryRepository::new());
    let svc = CampaignService::new(repo.clone());
    let c = svc.create("draft", None, config(2, 3, 1)).await.unwrap();
    let orch = demo_orchestrator(repo.clone());

    let err = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ordering(OrderingError::CampaignNotActive { .. })
    ));
}

#[tokio::test]
async fn variant_with_no_scores_is_kept_but_not_selectable() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 4, 4)).await;
    // Unit 1's content carries "u1 #"; both evaluators reject it.
    let picky = Arc::new(PickyEvaluator { marker: "u1 #" });
    let caps = demo::capabilities().with_evaluators(
        EvaluatorRegistry::new()
            .register("quality", picky.clone())
            .register("style", picky),
    );
    let orch = orchestrator(repo.clone(), caps);

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.population, 4);
    assert_eq!(result.evaluated, 3);
    assert_eq!(result.evaluation_failures, 2);
    // k = 4 but only three variants are eligible.
    assert_eq!(result.selected_ids.len(), 3);
    assert!(!result.warnings.is_empty());

    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    let rejected = repo
        .list_variants(&round.id)
        .await
        .unwrap()
        .into_iter()
        .find(|v| v.content.contains("u1 #"))
        .unwrap();
    assert!(!rejected.selected);

    let failures: Vec<_> = repo
        .decisions_by_round(&round.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.stage == "evaluation" && d.variant_id == Some(rejected.id))
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|d| d.output.is_none()));
}

#[tokio::test]
async fn concurrent_executions_run_the_round_once() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 4, 2)).await;
    let planner = Arc::new(CountingPlanner::default());
    let orch = orchestrator(repo.clone(), demo::capabilities().with_planner(planner.clone()));

    let (a, b) = tokio::join!(
        orch.execute_round(&c.id, 0, RunControl::default()),
        orch.execute_round(&c.id, 0, RunControl::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    assert_eq!(repo.list_variants(&round.id).await.unwrap().len(), 4);
    assert_eq!(repo.list_rounds(&c.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_before_start_resumes_later() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 3, 1)).await;
    let orch = demo_orchestrator(repo.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = orch
        .execute_round(&c.id, 0, RunControl::new(cancel))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    assert!(!round.status.is_terminal());

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.population, 3);
}

#[tokio::test]
async fn cancellation_mid_generation_stops_new_units() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 4, 2)).await;
    let cancel = CancellationToken::new();
    let caps = demo::capabilities().with_generator(Arc::new(CancellingGenerator {
        token: cancel.clone(),
    }));
    let engine = EngineConfig {
        generation_pool: 1,
        ..EngineConfig::fast()
    };
    let orch = Orchestrator::new(repo.clone(), caps, engine);

    let err = orch
        .execute_round(&c.id, 0, RunControl::new(cancel))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Cancelled {
            status: RoundStatus::Generating,
            ..
        }
    ));
    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Generating);
    assert_eq!(repo.list_variants(&round.id).await.unwrap().len(), 1);

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.population, 4);
}

#[tokio::test]
async fn duplicate_content_is_stored_once() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 4, 1)).await;
    let orch = orchestrator(
        repo.clone(),
        demo::capabilities().with_generator(Arc::new(ConstantGenerator)),
    );

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.population, 1);
    assert_eq!(result.selected_ids.len(), 1);
}

#[tokio::test]
async fn panicked_generation_unit_is_recorded() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 3, 1)).await;
    let orch = orchestrator(
        repo.clone(),
        demo::capabilities().with_generator(Arc::new(PanickingGenerator)),
    );

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.population, 2);

    let failures: Vec<_> = repo
        .decisions_by_round(&result.round_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.stage == "generation" && d.output.is_none())
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].input["unit_index"], 0);
    assert!(failures[0].rationale.contains("unit task aborted"));
}

#[tokio::test]
async fn no_viable_variants_fails_round_and_campaign() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(2, 3, 1)).await;
    let orch = orchestrator(
        repo.clone(),
        demo::capabilities().with_generator(Arc::new(BrokenGenerator)),
    );

    let err = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoViableVariants { round_number: 0 }));

    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    let failure = round.failure.unwrap();
    assert_eq!(failure.stage, "generation");
    assert_eq!(failure.kind, "stage");
    assert_eq!(
        repo.get_campaign(&c.id).await.unwrap().status,
        CampaignStatus::Failed
    );

    // 3 unit failures plus the stage failure.
    let decisions = repo.decisions_by_round(&round.id).await.unwrap();
    let generation: Vec<_> = decisions
        .iter()
        .filter(|d| d.stage == "generation")
        .collect();
    assert_eq!(generation.len(), 4);
    assert!(generation.iter().all(|d| d.output.is_none()));

    let again = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap_err();
    assert!(matches!(again, EngineError::RoundFailed { .. }));
}

#[tokio::test]
async fn invalid_plan_fails_in_planning() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 3, 1)).await;
    let orch = orchestrator(
        repo.clone(),
        demo::capabilities().with_planner(Arc::new(BadPlanner)),
    );

    let err = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(err.stage().as_deref(), Some("planning"));
    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    assert_eq!(round.failure.unwrap().stage, "planning");
}

#[tokio::test]
async fn storage_outage_leaves_round_resumable() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 3, 1)).await;
    let caps = demo::capabilities().with_generator(Arc::new(OutageGenerator {
        repo: repo.clone(),
        tripped: AtomicUsize::new(0),
    }));
    let engine = EngineConfig {
        lease_ttl: std::time::Duration::from_millis(300),
        ..EngineConfig::fast()
    };
    let orch = Orchestrator::new(repo.clone(), caps, engine);

    let err = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert!(err.is_retryable());

    repo.set_unavailable(false);
    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Generating);

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.population, 3);
}

#[tokio::test]
async fn failed_pair_keeps_its_decision_across_an_outage() {
    let repo = Arc::new(MemoryRepository::new());
    let mut cfg = config(1, 1, 1);
    cfg.evaluators = vec![EvaluatorSpec::new("quality")];
    let c = active_campaign(repo.clone(), cfg).await;
    let caps = demo::capabilities().with_evaluators(EvaluatorRegistry::new().register(
        "quality",
        Arc::new(OutageEvaluator {
            repo: repo.clone(),
            tripped: AtomicUsize::new(0),
        }),
    ));
    let engine = EngineConfig {
        lease_ttl: std::time::Duration::from_millis(300),
        ..EngineConfig::fast()
    };
    let orch = Orchestrator::new(repo.clone(), caps, engine);

    let err = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);

    repo.set_unavailable(false);
    let round = repo.find_round(&c.id, 0).await.unwrap().unwrap();
    let pending = repo.list_evaluations(&round.id).await.unwrap();
    assert!(pending.iter().all(|e| !e.status.is_terminal()));

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.evaluation_failures, 1);

    let failed = repo.list_evaluations(&result.round_id).await.unwrap();
    assert_eq!(failed[0].status, EvaluationStatus::Failed);
    let decisions: Vec<_> = repo
        .decisions_by_round(&result.round_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.stage == "evaluation" && d.output.is_none())
        .collect();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].variant_id, Some(failed[0].variant_id));
}

#[tokio::test]
async fn over_budget_score_is_replaced_by_fallback() {
    let repo = Arc::new(MemoryRepository::new());
    let mut cfg = config(1, 3, 1);
    cfg.evaluators = vec![EvaluatorSpec::new("premium")
        .with_max_cost(1.0)
        .with_fallback("cheap")];
    let c = active_campaign(repo.clone(), cfg).await;
    let caps = demo::capabilities().with_evaluators(
        EvaluatorRegistry::new()
            .register("premium", Arc::new(FixedEvaluator { score: 0.9, cost: 5.0 }))
            .register("cheap", Arc::new(FixedEvaluator { score: 0.4, cost: 0.0 })),
    );
    let orch = orchestrator(repo.clone(), caps);

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.best_fitness, Some(0.4));

    let evaluations = repo.list_evaluations(&result.round_id).await.unwrap();
    assert_eq!(evaluations.len(), 3);
    for e in evaluations {
        assert_eq!(e.status, EvaluationStatus::Completed);
        assert_eq!(e.score, Some(0.4));
        assert_eq!(e.fallback_from.as_deref(), Some("premium"));
    }
}

#[tokio::test]
async fn over_budget_without_fallback_fails_the_pair() {
    let repo = Arc::new(MemoryRepository::new());
    let mut cfg = config(1, 2, 1);
    cfg.evaluators = vec![EvaluatorSpec::new("premium").with_max_cost(1.0)];
    let c = active_campaign(repo.clone(), cfg).await;
    let caps = demo::capabilities().with_evaluators(
        EvaluatorRegistry::new()
            .register("premium", Arc::new(FixedEvaluator { score: 0.9, cost: 5.0 })),
    );
    let orch = orchestrator(repo.clone(), caps);

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.evaluation_failures, 2);
    assert!(result.selected_ids.is_empty());
    assert_eq!(result.best_fitness, None);
}

#[tokio::test]
async fn failed_primary_is_recorded_and_not_replaced_by_fallback() {
    let repo = Arc::new(MemoryRepository::new());
    let mut cfg = config(1, 2, 1);
    cfg.evaluators = vec![EvaluatorSpec::new("premium")
        .with_max_cost(1.0)
        .with_fallback("cheap")];
    let c = active_campaign(repo.clone(), cfg).await;
    let caps = demo::capabilities().with_evaluators(
        EvaluatorRegistry::new()
            .register("premium", Arc::new(OfflineEvaluator))
            .register("cheap", Arc::new(FixedEvaluator { score: 0.4, cost: 0.0 })),
    );
    let orch = orchestrator(repo.clone(), caps);

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.evaluation_failures, 2);
    assert!(result.selected_ids.is_empty());

    let evaluations = repo.list_evaluations(&result.round_id).await.unwrap();
    assert!(evaluations
        .iter()
        .all(|e| e.status == EvaluationStatus::Failed && e.fallback_from.is_none()));

    // One failure decision per pair, each naming the variant.
    let failures: Vec<_> = repo
        .decisions_by_round(&result.round_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.stage == "evaluation" && d.output.is_none())
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|d| d.variant_id.is_some()));
    assert!(failures[0].rationale.contains("unavailable"));
}

#[tokio::test]
async fn non_finite_score_fails_the_pair() {
    let repo = Arc::new(MemoryRepository::new());
    let mut cfg = config(1, 3, 1);
    cfg.evaluators = vec![EvaluatorSpec::new("quality")];
    let c = active_campaign(repo.clone(), cfg).await;
    let caps = demo::capabilities().with_evaluators(EvaluatorRegistry::new().register(
        "quality",
        Arc::new(FixedEvaluator {
            score: f64::NAN,
            cost: 0.0,
        }),
    ));
    let orch = orchestrator(repo.clone(), caps);

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert_eq!(result.evaluation_failures, 3);
    assert!(result.selected_ids.is_empty());
    assert_eq!(result.best_fitness, None);
    let evaluations = repo.list_evaluations(&result.round_id).await.unwrap();
    assert!(evaluations
        .iter()
        .all(|e| e.status == EvaluationStatus::Failed && e.score.is_none()));
    assert!(evaluations[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("non-finite")));
}

#[tokio::test]
async fn unknown_evaluator_is_a_config_error() {
    let repo = Arc::new(MemoryRepository::new());
    let mut cfg = config(1, 2, 1);
    cfg.evaluators = vec![EvaluatorSpec::new("nobody")];
    let c = active_campaign(repo.clone(), cfg).await;
    let caps = demo::capabilities().with_evaluators(
        EvaluatorRegistry::new().register("quality", Arc::new(demo::DemoEvaluator)),
    );
    let orch = orchestrator(repo.clone(), caps);

    let err = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(repo.list_rounds(&c.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn report_failure_is_a_warning() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 2, 1)).await;
    let orch = orchestrator(
        repo.clone(),
        demo::capabilities().with_reporter(Arc::new(BrokenReporter)),
    );

    let result = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    assert!(result.report.is_none());
    assert!(result.warnings.iter().any(|w| w.contains("report failed")));

    let reporting = repo
        .decisions_by_round(&result.round_id)
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.stage == "reporting")
        .unwrap();
    assert!(reporting.output.is_none());
}

#[tokio::test]
async fn updated_policy_applies_to_next_round() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(2, 4, 2)).await;
    let orch = demo_orchestrator(repo.clone());
    let svc = CampaignService::new(repo.clone());

    let r0 = orch
        .execute_round(&c.id, 0, RunControl::default())
        .await
        .unwrap();
    let policy = svc
        .update_selection_policy(
            &c.id,
            SelectionConfig::with_strategy(SelectionStrategy::Tournament, 1),
        )
        .await
        .unwrap();
    let r1 = orch
        .execute_round(&c.id, 1, RunControl::default())
        .await
        .unwrap();

    assert_ne!(r0.policy_id, Some(policy.id));
    assert_eq!(r1.policy_id, Some(policy.id));
    assert_eq!(r1.selected_ids.len(), 1);
}

#[tokio::test]
async fn seeded_campaigns_select_the_same_survivors() {
    async fn run() -> Vec<String> {
        let repo = Arc::new(MemoryRepository::new());
        let mut cfg = config(2, 5, 2);
        cfg.selection = SelectionConfig::with_strategy(SelectionStrategy::Tournament, 2);
        let c = active_campaign(repo.clone(), cfg).await;
        let orch = demo_orchestrator(repo.clone());
        orch.execute_campaign(&c.id, RunControl::default())
            .await
            .unwrap();
        let mut contents = Vec::new();
        for round in repo.list_rounds(&c.id).await.unwrap() {
            let mut selected: Vec<String> = repo
                .list_selected(&round.id)
                .await
                .unwrap()
                .into_iter()
                .map(|v| v.content)
                .collect();
            selected.sort();
            contents.extend(selected);
        }
        contents
    }

    assert_eq!(run().await, run().await);
}
