mod common;

use std::sync::Arc;

use common::*;
use evo_core::capabilities::demo;
use evo_core::{ErrorKind, JobFilter, JobManager, JobStatus, JobTarget};
use evo_state::{CampaignId, CampaignStatus, CampaignStore, MemoryRepository, RoundResult};

#[tokio::test]
async fn round_job_completes_with_result() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(2, 3, 1)).await;
    let jobs = JobManager::new(demo_orchestrator(repo.clone()));

    let submitted = jobs.submit_round(c.id, 0);
    assert_eq!(
        submitted.target,
        JobTarget::Round {
            campaign_id: c.id,
            round_number: 0
        }
    );

    let done = jobs.wait(&submitted.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 1.0);
    assert!(done.started_at.is_some() && done.completed_at.is_some());
    let result: RoundResult = serde_json::from_value(done.result.unwrap()).unwrap();
    assert_eq!(result.round_number, 0);
    assert_eq!(result.population, 3);
}

#[tokio::test]
async fn active_job_for_same_target_is_reused() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 3, 1)).await;
    let jobs = JobManager::new(demo_orchestrator(repo.clone()));

    let first = jobs.submit_round(c.id, 0);
    let second = jobs.submit_round(c.id, 0);
    assert_eq!(first.id, second.id);

    jobs.wait(&first.id).await.unwrap();
    let third = jobs.submit_round(c.id, 0);
    assert_ne!(third.id, first.id);
    let again = jobs.wait(&third.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Completed);
}

#[tokio::test]
async fn campaign_job_runs_every_round() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(3, 3, 1)).await;
    let jobs = JobManager::new(demo_orchestrator(repo.clone()));

    let job = jobs.submit_campaign(c.id);
    let done = jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    let results: Vec<RoundResult> = serde_json::from_value(done.result.unwrap()).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(
        repo.get_campaign(&c.id).await.unwrap().status,
        CampaignStatus::Completed
    );
}

#[tokio::test]
async fn failed_job_carries_structured_error() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 2, 1)).await;
    let orch = orchestrator(
        repo.clone(),
        demo::capabilities().with_generator(Arc::new(BrokenGenerator)),
    );
    let jobs = JobManager::new(orch);

    let job = jobs.submit_round(c.id, 0);
    let done = jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Stage);
    assert_eq!(error.stage.as_deref(), Some("generation"));
    assert!(!error.retryable);
    assert!(done.result.is_none());
}

#[tokio::test]
async fn exhausted_capability_retries_are_not_retryable() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 2, 1)).await;
    let orch = orchestrator(
        repo.clone(),
        demo::capabilities().with_planner(Arc::new(OfflinePlanner)),
    );
    let jobs = JobManager::new(orch);

    let job = jobs.submit_round(c.id, 0);
    let done = jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Capability);
    assert_eq!(error.stage.as_deref(), Some("planning"));
    assert!(!error.retryable);

    // The round is already failed, so resubmitting cannot succeed.
    let again = jobs.submit_round(c.id, 0);
    let done = jobs.wait(&again.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert!(!done.error.unwrap().retryable);
}

#[tokio::test]
async fn ordering_error_fails_job() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(3, 2, 1)).await;
    let jobs = JobManager::new(demo_orchestrator(repo.clone()));

    let job = jobs.submit_round(c.id, 2);
    let done = jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.unwrap().kind, ErrorKind::Ordering);
}

#[tokio::test]
async fn cancel_reports_unknown_and_finished_jobs() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 2, 1)).await;
    let jobs = JobManager::new(demo_orchestrator(repo.clone()));

    let job = jobs.submit_round(c.id, 0);
    jobs.wait(&job.id).await.unwrap();
    assert!(!jobs.cancel(&job.id));
    assert!(!jobs.cancel(&evo_core::JobId::new()));
}

#[tokio::test]
async fn cancelled_job_leaves_round_resumable() {
    let repo = Arc::new(MemoryRepository::new());
    let c = active_campaign(repo.clone(), config(1, 3, 1)).await;
    let jobs = JobManager::new(demo_orchestrator(repo.clone()));

    // Cancel before the spawned task gets to run.
    let job = jobs.submit_round(c.id, 0);
    assert!(jobs.cancel(&job.id));
    let done = jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);

    let retry = jobs.submit_round(c.id, 0);
    let done = jobs.wait(&retry.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn list_filters_and_cleanup_removes_finished() {
    let repo = Arc::new(MemoryRepository::new());
    let a = active_campaign(repo.clone(), config(1, 2, 1)).await;
    let b = active_campaign(repo.clone(), config(1, 2, 1)).await;
    let jobs = JobManager::new(demo_orchestrator(repo.clone()));

    let ja = jobs.submit_round(a.id, 0);
    let jb = jobs.submit_round(b.id, 0);
    jobs.wait(&ja.id).await.unwrap();
    jobs.wait(&jb.id).await.unwrap();

    let all = jobs.list(&JobFilter::default());
    assert_eq!(all.len(), 2);
    assert!(all[0].created_at >= all[1].created_at);

    let only_a = jobs.list(&JobFilter {
        campaign_id: Some(a.id),
        status: None,
    });
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].id, ja.id);

    let none = jobs.list(&JobFilter {
        campaign_id: Some(CampaignId::new()),
        status: Some(JobStatus::Completed),
    });
    assert!(none.is_empty());

    assert_eq!(jobs.cleanup(chrono::Duration::hours(1)), 0);
    assert_eq!(jobs.cleanup(chrono::Duration::zero()), 2);
    assert!(jobs.get(&ja.id).is_none());
}
