//! Decision recorder: binds appends to one round's trace.

use std::sync::Arc;

use evo_state::{
    CampaignId, DecisionLog, DecisionRecord, NewDecision, Repository, RoundId, TraceId,
    VariantId,
};
use serde_json::Value;

use crate::error::EngineResult;

/// Appends [`DecisionRecord`]s for one round execution.
///
/// Cheap to clone; every parallel unit gets its own copy and each append is
/// an independent write.
#[derive(Clone)]
pub struct DecisionRecorder {
    log: Arc<dyn Repository>,
    trace_id: TraceId,
    campaign_id: CampaignId,
    round_id: RoundId,
}

impl DecisionRecorder {
    pub fn new(
        log: Arc<dyn Repository>,
        trace_id: TraceId,
        campaign_id: CampaignId,
        round_id: RoundId,
    ) -> Self {
        Self {
            log,
            trace_id,
            campaign_id,
            round_id,
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Record a successful stage or unit invocation.
    pub async fn record(
        &self,
        stage: &str,
        variant_id: Option<VariantId>,
        input: Value,
        output: Value,
        rationale: impl Into<String>,
        confidence: f64,
    ) -> EngineResult<DecisionRecord> {
        self.append(stage, variant_id, input, Some(output), rationale.into(), confidence)
            .await
    }

    /// Record a failed invocation: no output, the error as rationale.
    pub async fn record_failure(
        &self,
        stage: &str,
        variant_id: Option<VariantId>,
        input: Value,
        error: &(dyn std::fmt::Display + Sync),
    ) -> EngineResult<DecisionRecord> {
        self.append(stage, variant_id, input, None, format!("failed: {error}"), 0.0)
            .await
    }

    async fn append(
        &self,
        stage: &str,
        variant_id: Option<VariantId>,
        input: Value,
        output: Option<Value>,
        rationale: String,
        confidence: f64,
    ) -> EngineResult<DecisionRecord> {
        let record = self
            .log
            .append_decision(NewDecision {
                trace_id: self.trace_id,
                campaign_id: self.campaign_id,
                round_id: Some(self.round_id),
                variant_id,
                stage: stage.to_string(),
                input,
                output,
                rationale,
                confidence: confidence.clamp(0.0, 1.0),
            })
            .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_state::MemoryRepository;
    use serde_json::json;

    #[tokio::test]
    async fn failure_has_no_output_and_zero_confidence() {
        let repo = Arc::new(MemoryRepository::new());
        let recorder =
            DecisionRecorder::new(repo.clone(), TraceId::new(), CampaignId::new(), RoundId::new());
        recorder
            .record("planning", None, json!({}), json!({"ok": true}), "planned", 1.5)
            .await
            .unwrap();
        recorder
            .record_failure("generation", None, json!({"unit": 0}), &"timeout")
            .await
            .unwrap();

        let all = repo.decisions_by_trace(&recorder.trace_id()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].confidence, 1.0);
        assert!(all[1].output.is_none());
        assert_eq!(all[1].rationale, "failed: timeout");
        assert_eq!(all[1].confidence, 0.0);
    }
}
