//! Asynchronous, cancellable round and campaign executions.
//!
//! Each submitted job runs on its own tokio task. Its state lives in a
//! `watch` channel so pollers read the latest snapshot and `wait` can block
//! until the job is terminal. Jobs are kept in memory only; a restarted
//! daemon resumes work by submitting the same round again.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use evo_state::CampaignId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::obs;
use crate::pipeline::{Orchestrator, RunControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What a job executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTarget {
    Round {
        campaign_id: CampaignId,
        round_number: u32,
    },
    Campaign {
        campaign_id: CampaignId,
    },
}

impl JobTarget {
    pub fn campaign_id(&self) -> CampaignId {
        match self {
            JobTarget::Round { campaign_id, .. } | JobTarget::Campaign { campaign_id } => {
                *campaign_id
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Structured failure shown to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub stage: Option<String>,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for JobError {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            stage: err.stage(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub target: JobTarget,
    pub status: JobStatus,
    /// In `[0, 1]`, never decreasing.
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    fn new(target: JobTarget) -> Self {
        Self {
            id: JobId::new(),
            target,
            status: JobStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Listing filter; also the query string of `GET /jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub campaign_id: Option<CampaignId>,
    pub status: Option<JobStatus>,
}

struct JobEntry {
    state: Arc<watch::Sender<JobSnapshot>>,
    cancel: CancellationToken,
}

/// Runs orchestrator work as background jobs.
#[derive(Clone)]
pub struct JobManager {
    orchestrator: Orchestrator,
    jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
}

impl JobManager {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Execute one round in the background. Returns the active job for the
    /// same round instead when there is one.
    pub fn submit_round(&self, campaign_id: CampaignId, round_number: u32) -> JobSnapshot {
        self.submit(JobTarget::Round {
            campaign_id,
            round_number,
        })
    }

    /// Execute every remaining round of a campaign in the background.
    pub fn submit_campaign(&self, campaign_id: CampaignId) -> JobSnapshot {
        self.submit(JobTarget::Campaign { campaign_id })
    }

    fn submit(&self, target: JobTarget) -> JobSnapshot {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let active = jobs
            .values()
            .map(|entry| entry.state.borrow().clone())
            .find(|snap| snap.target == target && !snap.status.is_terminal());
        if let Some(active) = active {
            info!(job_id = %active.id, "joining active job for the same target");
            return active;
        }

        let snapshot = JobSnapshot::new(target);
        let (tx, _rx) = watch::channel(snapshot.clone());
        let state = Arc::new(tx);
        let cancel = CancellationToken::new();
        jobs.insert(
            snapshot.id,
            JobEntry {
                state: state.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(jobs);

        obs::emit_job_status(&snapshot.id.to_string(), JobStatus::Pending.as_str());
        let span = info_span!("job", job_id = %snapshot.id);
        tokio::spawn(run_job(self.orchestrator.clone(), state, cancel).instrument(span));
        snapshot
    }

    pub fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(id).map(|entry| entry.state.borrow().clone())
    }

    /// Jobs matching `filter`, newest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<JobSnapshot> = jobs
            .values()
            .map(|entry| entry.state.borrow().clone())
            .filter(|s| {
                filter
                    .campaign_id
                    .map_or(true, |c| s.target.campaign_id() == c)
                    && filter.status.map_or(true, |st| s.status == st)
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Request cooperative cancellation. `false` when the job is unknown or
    /// already terminal.
    pub fn cancel(&self, id: &JobId) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(id) {
            Some(entry) if !entry.state.borrow().status.is_terminal() => {
                entry.cancel.cancel();
                info!(job_id = %id, "job cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Wait until the job is terminal. `None` for an unknown id.
    pub async fn wait(&self, id: &JobId) -> Option<JobSnapshot> {
        let mut rx = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.get(id)?.state.subscribe()
        };
        if rx.wait_for(|s| s.status.is_terminal()).await.is_err() {
            warn!(job_id = %id, "job state closed before it finished");
        }
        let snapshot = rx.borrow().clone();
        Some(snapshot)
    }

    /// Drop terminal jobs that finished more than `max_age` ago.
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let snap = entry.state.borrow();
            !(snap.status.is_terminal() && snap.completed_at.is_some_and(|t| t <= cutoff))
        });
        before - jobs.len()
    }
}

async fn run_job(
    orchestrator: Orchestrator,
    state: Arc<watch::Sender<JobSnapshot>>,
    cancel: CancellationToken,
) {
    let (id, target) = {
        let snap = state.borrow();
        (snap.id, snap.target.clone())
    };

    if cancel.is_cancelled() {
        finish(&state, JobStatus::Cancelled, None, None);
        return;
    }

    state.send_modify(|s| {
        s.status = JobStatus::Running;
        s.started_at = Some(Utc::now());
    });
    obs::emit_job_status(&id.to_string(), JobStatus::Running.as_str());

    let progress_state = state.clone();
    let control = RunControl::new(cancel).with_progress(Arc::new(move |f: f64| {
        progress_state.send_modify(|s| s.progress = s.progress.max(f.clamp(0.0, 1.0)));
    }));

    let outcome = match &target {
        JobTarget::Round {
            campaign_id,
            round_number,
        } => orchestrator
            .execute_round(campaign_id, *round_number, control)
            .await
            .and_then(|r| to_json(&r)),
        JobTarget::Campaign { campaign_id } => orchestrator
            .execute_campaign(campaign_id, control)
            .await
            .and_then(|r| to_json(&r)),
    };

    match outcome {
        Ok(result) => finish(&state, JobStatus::Completed, Some(result), None),
        Err(e) if e.kind() == ErrorKind::Cancelled => {
            finish(&state, JobStatus::Cancelled, None, Some(JobError::from(&e)))
        }
        Err(e) => {
            warn!(job_id = %id, error = %e, "job failed");
            finish(&state, JobStatus::Failed, None, Some(JobError::from(&e)))
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> EngineResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| EngineError::Invariant(e.to_string()))
}

fn finish(
    state: &watch::Sender<JobSnapshot>,
    status: JobStatus,
    result: Option<serde_json::Value>,
    error: Option<JobError>,
) {
    state.send_modify(|s| {
        s.status = status;
        if status == JobStatus::Completed {
            s.progress = 1.0;
        }
        s.result = result;
        s.error = error;
        s.completed_at = Some(Utc::now());
    });
    obs::emit_job_status(&state.borrow().id.to_string(), status.as_str());
}
