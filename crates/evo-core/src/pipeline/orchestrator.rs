//! Round orchestrator.
//!
//! Drives one round through `pending -> planning -> ... -> completed`,
//! persisting every transition with compare-and-set so a crashed or
//! cancelled execution resumes from the last durable status. Only one
//! executor works on a round at a time: it holds a persisted lease that a
//! background task renews, and concurrent callers wait for the outcome.

use std::sync::Arc;

use evo_state::{
    CampaignId, CampaignRecord, CampaignStatus, CampaignStore, NewRound, Repository,
    RoundFailure, RoundId, RoundPatch, RoundRecord, RoundResult, RoundStatus, RoundStore,
    StorageError, TraceId,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

use super::stages::{RoundContext, StageRegistry};
use super::{RunControl, StageKind};
use crate::capabilities::Capabilities;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind, OrderingError};
use crate::lineage::Lineage;
use crate::metrics::METRICS;
use crate::obs::RoundSpan;
use crate::recording::DecisionRecorder;

/// Executes rounds and campaigns against a repository and capability set.
#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<dyn Repository>,
    lineage: Arc<Lineage>,
    capabilities: Capabilities,
    config: EngineConfig,
    stages: StageRegistry,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        capabilities: Capabilities,
        config: EngineConfig,
    ) -> Self {
        Self {
            lineage: Arc::new(Lineage::new(repo.clone())),
            repo,
            capabilities,
            config,
            stages: StageRegistry::standard(),
        }
    }

    /// Replace the stage implementations (tests swap single stages).
    pub fn with_stages(mut self, stages: StageRegistry) -> Self {
        self.stages = stages;
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn lineage(&self) -> &Arc<Lineage> {
        &self.lineage
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute round `round_number` of a campaign to completion.
    ///
    /// A completed round returns its stored result without writing. A round
    /// already started is resumed from its persisted status. Ordering and
    /// config errors are raised before anything is written.
    #[instrument(skip(self, campaign_id, control), fields(campaign_id = %campaign_id))]
    pub async fn execute_round(
        &self,
        campaign_id: &CampaignId,
        round_number: u32,
        control: RunControl,
    ) -> EngineResult<RoundResult> {
        let campaign = self.repo.get_campaign(campaign_id).await?;

        if let Some(existing) = self.repo.find_round(campaign_id, round_number).await? {
            if let Some(done) = settled(&existing)? {
                return Ok(done);
            }
        }

        self.check_startable(&campaign, round_number)?;

        let round = match self
            .repo
            .create_round(NewRound {
                campaign_id: *campaign_id,
                round_number,
                trace_id: TraceId::new(),
            })
            .await
        {
            Ok(round) => round,
            Err(StorageError::DuplicateRound { .. }) => self
                .repo
                .find_round(campaign_id, round_number)
                .await?
                .ok_or_else(|| {
                    EngineError::Invariant(format!("round {round_number} vanished after create"))
                })?,
            Err(e) => return Err(e.into()),
        };

        let owner = format!("orchestrator-{}", Uuid::new_v4());
        let ttl = chrono::Duration::from_std(self.config.lease_ttl)
            .map_err(|e| EngineError::InvalidConfig(format!("lease_ttl: {e}")))?;

        loop {
            if self.repo.acquire_round_lease(&round.id, &owner, ttl).await? {
                break;
            }
            debug!(round_id = %round.id, "round leased elsewhere, waiting");
            tokio::select! {
                _ = control.cancel.cancelled() => {
                    return Err(EngineError::Cancelled {
                        round_id: round.id.to_string(),
                        status: round.status,
                    });
                }
                _ = tokio::time::sleep(self.config.lease_poll) => {}
            }
            let current = self.repo.get_round(&round.id).await?;
            if let Some(done) = settled(&current)? {
                return Ok(done);
            }
        }

        let heartbeat = CancellationToken::new();
        let _stop_heartbeat = heartbeat.clone().drop_guard();
        tokio::spawn(renew_lease(
            self.repo.clone(),
            round.id,
            owner.clone(),
            ttl,
            self.config.lease_ttl / 3,
            heartbeat,
        ));

        // The lease may have been taken after another executor finished.
        let round = self.repo.get_round(&round.id).await?;
        let span = RoundSpan::start(
            &campaign_id.to_string(),
            round_number,
            &round.trace_id.to_string(),
        );
        let round_id = round.id;
        let outcome = self
            .drive(&campaign, round, &control)
            .instrument(span.span().clone())
            .await;

        if let Err(e) = self.repo.release_round_lease(&round_id, &owner).await {
            warn!(round_id = %round_id, error = %e, "failed to release round lease");
        }

        match outcome {
            Ok(result) => {
                span.finish("completed");
                METRICS.flush();
                if round_number + 1 >= campaign.config.max_rounds {
                    self.settle_campaign(campaign_id, CampaignStatus::Completed)
                        .await?;
                }
                control.report(1.0);
                Ok(result)
            }
            Err(e) if matches!(e.kind(), ErrorKind::Infrastructure | ErrorKind::Cancelled) => {
                span.finish("interrupted");
                Err(e)
            }
            Err(e) => {
                span.finish("failed");
                self.fail_round(&round_id, &e).await?;
                self.settle_campaign(campaign_id, CampaignStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }

    /// Run rounds from the next pending number until the campaign completes,
    /// a round fails, or `control` is cancelled.
    #[instrument(skip(self, campaign_id, control), fields(campaign_id = %campaign_id))]
    pub async fn execute_campaign(
        &self,
        campaign_id: &CampaignId,
        control: RunControl,
    ) -> EngineResult<Vec<RoundResult>> {
        let mut results = Vec::new();
        loop {
            let campaign = self.repo.get_campaign(campaign_id).await?;
            if campaign.status == CampaignStatus::Completed {
                break;
            }
            let max_rounds = campaign.config.max_rounds;
            let rounds = self.repo.list_rounds(campaign_id).await?;
            let next = match rounds.last() {
                Some(r) if r.status == RoundStatus::Completed => r.round_number + 1,
                Some(r) => r.round_number,
                None => 0,
            };
            if next >= max_rounds {
                if campaign.status == CampaignStatus::Active {
                    self.settle_campaign(campaign_id, CampaignStatus::Completed)
                        .await?;
                }
                break;
            }
            if control.is_cancelled() {
                return Err(EngineError::Cancelled {
                    round_id: format!("{campaign_id}/{next}"),
                    status: RoundStatus::Pending,
                });
            }
            let width = 1.0 / f64::from(max_rounds);
            let round_control = control.scaled(f64::from(next) * width, width);
            results.push(self.execute_round(campaign_id, next, round_control).await?);
        }
        control.report(1.0);
        Ok(results)
    }

    fn check_startable(&self, campaign: &CampaignRecord, round_number: u32) -> EngineResult<()> {
        if campaign.status != CampaignStatus::Active {
            return Err(OrderingError::CampaignNotActive {
                campaign_id: campaign.id.to_string(),
                status: campaign.status.to_string(),
            }
            .into());
        }
        if round_number >= campaign.config.max_rounds {
            return Err(OrderingError::BeyondMaxRounds {
                requested: round_number,
                max_rounds: campaign.config.max_rounds,
            }
            .into());
        }
        self.capabilities
            .evaluators
            .check(&campaign.config)
            .map_err(EngineError::InvalidConfig)?;
        let missing = self.stages.missing();
        if !missing.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "no stage registered for {missing:?}"
            )));
        }
        Ok(())
    }

    async fn drive(
        &self,
        campaign: &CampaignRecord,
        mut round: RoundRecord,
        control: &RunControl,
    ) -> EngineResult<RoundResult> {
        let recorder = DecisionRecorder::new(
            self.repo.clone(),
            round.trace_id,
            campaign.id,
            round.id,
        );
        loop {
            let status = round.status;
            if let Some(done) = settled(&round)? {
                return Ok(done);
            }
            if status == RoundStatus::Pending {
                round = self
                    .repo
                    .transition_round(
                        &round.id,
                        RoundStatus::Pending,
                        RoundStatus::Planning,
                        RoundPatch::default(),
                    )
                    .await?;
                METRICS.inc_rounds_started();
                continue;
            }

            let kind = StageKind::for_status(status).ok_or_else(|| {
                EngineError::Invariant(format!("no stage runs in status {status}"))
            })?;
            if control.is_cancelled() {
                info!(round_id = %round.id, %status, "cancelled between stages");
                return Err(EngineError::Cancelled {
                    round_id: round.id.to_string(),
                    status,
                });
            }
            control.report(kind.index() as f64 / StageKind::ALL.len() as f64);

            let stage = self
                .stages
                .get(kind)
                .ok_or_else(|| EngineError::InvalidConfig(format!("no stage for {kind}")))?;
            let ctx = RoundContext {
                repo: self.repo.clone(),
                lineage: self.lineage.clone(),
                capabilities: self.capabilities.clone(),
                engine: self.config.clone(),
                campaign: campaign.clone(),
                round: round.clone(),
                recorder: recorder.clone(),
                cancel: control.cancel.clone(),
            };

            let output = match stage.run(&ctx).await {
                Ok(output) => output,
                Err(e) => {
                    if e.kind() != ErrorKind::Infrastructure {
                        let input = json!({
                            "round_number": round.round_number,
                            "status": status,
                        });
                        recorder.record_failure(kind.as_str(), None, input, &e).await?;
                    }
                    return Err(e);
                }
            };

            match output.output {
                Some(value) => {
                    recorder
                        .record(
                            kind.as_str(),
                            None,
                            output.input,
                            value,
                            output.rationale,
                            output.confidence,
                        )
                        .await?
                }
                None => {
                    recorder
                        .record_failure(kind.as_str(), None, output.input, &output.rationale)
                        .await?
                }
            };

            let next = status
                .next()
                .ok_or_else(|| EngineError::Invariant(format!("{status} has no successor")))?;
            round = self
                .repo
                .transition_round(&round.id, status, next, output.patch)
                .await?;
            if next == RoundStatus::Completed {
                METRICS.inc_rounds_completed();
            }
        }
    }

    async fn fail_round(&self, round_id: &RoundId, error: &EngineError) -> EngineResult<()> {
        let current = self.repo.get_round(round_id).await?;
        if current.status.is_terminal() {
            return Ok(());
        }
        let stage = error
            .stage()
            .or_else(|| StageKind::for_status(current.status).map(|k| k.as_str().to_string()))
            .unwrap_or_else(|| current.status.to_string());
        let failure = RoundFailure {
            stage,
            kind: error.kind().to_string(),
            message: error.to_string(),
        };
        self.repo
            .transition_round(
                round_id,
                current.status,
                RoundStatus::Failed,
                RoundPatch::failure(failure),
            )
            .await?;
        METRICS.inc_rounds_failed();
        Ok(())
    }

    async fn settle_campaign(&self, id: &CampaignId, to: CampaignStatus) -> EngineResult<()> {
        let campaign = self.repo.get_campaign(id).await?;
        if campaign.status.is_terminal() {
            return Ok(());
        }
        self.repo.transition_campaign(id, campaign.status, to).await?;
        info!(campaign_id = %id, status = %to, "campaign settled");
        Ok(())
    }
}

/// Stored outcome of a terminal round; `None` while it is still running.
fn settled(round: &RoundRecord) -> EngineResult<Option<RoundResult>> {
    match round.status {
        RoundStatus::Completed => round.result.clone().map(Some).ok_or_else(|| {
            EngineError::Invariant(format!("completed round {} has no result", round.id))
        }),
        RoundStatus::Failed => {
            let failure = round.failure.clone();
            Err(EngineError::RoundFailed {
                round_id: round.id.to_string(),
                stage: failure
                    .as_ref()
                    .map(|f| f.stage.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                message: failure
                    .map(|f| f.message)
                    .unwrap_or_else(|| "no failure recorded".to_string()),
            })
        }
        _ => Ok(None),
    }
}

async fn renew_lease(
    repo: Arc<dyn Repository>,
    round_id: RoundId,
    owner: String,
    ttl: chrono::Duration,
    every: std::time::Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match repo.acquire_round_lease(&round_id, &owner, ttl).await {
            Ok(true) => debug!(round_id = %round_id, "lease renewed"),
            Ok(false) => {
                warn!(round_id = %round_id, "round lease lost to another executor");
                return;
            }
            Err(e) => warn!(round_id = %round_id, error = %e, "lease renewal failed"),
        }
    }
}
