//! Entity records shared by every repository backend
//!
//! These are the backend-agnostic shapes returned by the storage traits.
//! SurrealDB row types live in `schema` and convert to these at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign_config::{CampaignConfig, SelectionConfig};
use crate::ids::{
    CampaignId, ContentFingerprint, DecisionId, EvaluationId, PolicyId, RoundId, TraceId,
    VariantId,
};

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "active" => Some(CampaignStatus::Active),
            "paused" => Some(CampaignStatus::Paused),
            "completed" => Some(CampaignStatus::Completed),
            "failed" => Some(CampaignStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }

    /// Monotonic except for `active <-> paused`.
    pub fn can_transition_to(&self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Paused, Completed)
                | (Draft, Failed)
                | (Active, Failed)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: CampaignId,
    pub name: String,
    pub description: Option<String>,
    pub config: CampaignConfig,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CampaignRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Apply a validated status change and stamp lifecycle timestamps.
    pub fn apply_status(&mut self, to: CampaignStatus, now: DateTime<Utc>) {
        if to == CampaignStatus::Active && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
    }
}

/// Input for creating a campaign (always starts as draft)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub config: CampaignConfig,
}

/// Filter for campaign listings
#[derive(Debug, Clone, Default)]
pub struct CampaignFilter {
    pub status: Option<CampaignStatus>,
    /// Audit views set this to see soft-deleted campaigns.
    pub include_deleted: bool,
}

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

/// Round lifecycle status, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Planning,
    Generating,
    Evaluating,
    Selecting,
    Reporting,
    Completed,
    Failed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::Planning => "planning",
            RoundStatus::Generating => "generating",
            RoundStatus::Evaluating => "evaluating",
            RoundStatus::Selecting => "selecting",
            RoundStatus::Reporting => "reporting",
            RoundStatus::Completed => "completed",
            RoundStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RoundStatus::Pending),
            "planning" => Some(RoundStatus::Planning),
            "generating" => Some(RoundStatus::Generating),
            "evaluating" => Some(RoundStatus::Evaluating),
            "selecting" => Some(RoundStatus::Selecting),
            "reporting" => Some(RoundStatus::Reporting),
            "completed" => Some(RoundStatus::Completed),
            "failed" => Some(RoundStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundStatus::Completed | RoundStatus::Failed)
    }

    /// The forward edge out of this status, if any.
    pub fn next(&self) -> Option<RoundStatus> {
        match self {
            RoundStatus::Pending => Some(RoundStatus::Planning),
            RoundStatus::Planning => Some(RoundStatus::Generating),
            RoundStatus::Generating => Some(RoundStatus::Evaluating),
            RoundStatus::Evaluating => Some(RoundStatus::Selecting),
            RoundStatus::Selecting => Some(RoundStatus::Reporting),
            RoundStatus::Reporting => Some(RoundStatus::Completed),
            RoundStatus::Completed | RoundStatus::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: RoundStatus) -> bool {
        self.next() == Some(to) || (to == RoundStatus::Failed && !self.is_terminal())
    }
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a round ended in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundFailure {
    pub stage: String,
    pub kind: String,
    pub message: String,
}

/// Outcome of a completed round, stored on the round and returned verbatim
/// on every later `execute_round` call for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_id: RoundId,
    pub campaign_id: CampaignId,
    pub round_number: u32,
    pub trace_id: TraceId,
    pub plan: Option<serde_json::Value>,
    pub population: usize,
    /// Variants with at least one completed evaluation.
    pub evaluated: usize,
    pub evaluation_failures: usize,
    pub selected_ids: Vec<VariantId>,
    pub best_fitness: Option<f64>,
    pub mean_fitness: Option<f64>,
    pub policy_id: Option<PolicyId>,
    pub report: Option<serde_json::Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Persisted round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub id: RoundId,
    pub campaign_id: CampaignId,
    pub round_number: u32,
    pub status: RoundStatus,
    pub trace_id: TraceId,
    pub plan: Option<serde_json::Value>,
    pub policy_id: Option<PolicyId>,
    pub result: Option<RoundResult>,
    pub failure: Option<RoundFailure>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RoundRecord {
    pub fn new(new: NewRound, now: DateTime<Utc>) -> Self {
        Self {
            id: RoundId::new(),
            campaign_id: new.campaign_id,
            round_number: new.round_number,
            status: RoundStatus::Pending,
            trace_id: new.trace_id,
            plan: None,
            policy_id: None,
            result: None,
            failure: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply an already validated transition plus its patch.
    pub fn apply_transition(&mut self, to: RoundStatus, patch: RoundPatch, now: DateTime<Utc>) {
        if self.status == RoundStatus::Pending && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if let Some(plan) = patch.plan {
            self.plan = Some(plan);
        }
        if let Some(policy_id) = patch.policy_id {
            self.policy_id = Some(policy_id);
        }
        if let Some(result) = patch.result {
            self.result = Some(result);
        }
        if let Some(failure) = patch.failure {
            self.failure = Some(failure);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
            self.lease_owner = None;
            self.lease_expires_at = None;
        }
        self.status = to;
        self.updated_at = now;
    }

    /// True when `owner` may take the execution lease at `now`.
    pub fn lease_available_to(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.lease_owner, self.lease_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => true,
        }
    }
}

/// Input for creating a round
#[derive(Debug, Clone)]
pub struct NewRound {
    pub campaign_id: CampaignId,
    pub round_number: u32,
    pub trace_id: TraceId,
}

/// Fields written alongside a round transition
#[derive(Debug, Clone, Default)]
pub struct RoundPatch {
    pub plan: Option<serde_json::Value>,
    pub policy_id: Option<PolicyId>,
    pub result: Option<RoundResult>,
    pub failure: Option<RoundFailure>,
}

impl RoundPatch {
    pub fn plan(plan: serde_json::Value) -> Self {
        Self {
            plan: Some(plan),
            ..Default::default()
        }
    }

    pub fn policy(policy_id: PolicyId) -> Self {
        Self {
            policy_id: Some(policy_id),
            ..Default::default()
        }
    }

    pub fn result(result: RoundResult) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failure(failure: RoundFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Variant
// ---------------------------------------------------------------------------

/// How a variant was derived from its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationDescriptor {
    pub kind: String,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl MutationDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            hint: None,
            detail: serde_json::Value::Null,
        }
    }
}

/// Persisted variant. Immutable after creation except `selected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub id: VariantId,
    pub campaign_id: CampaignId,
    pub round_id: RoundId,
    pub parent_id: Option<VariantId>,
    pub generation: u32,
    pub content: String,
    pub fingerprint: ContentFingerprint,
    pub mutation: Option<MutationDescriptor>,
    pub selected: bool,
    pub created_at: DateTime<Utc>,
}

impl VariantRecord {
    pub fn is_founder(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Input for inserting a variant
#[derive(Debug, Clone)]
pub struct NewVariant {
    pub campaign_id: CampaignId,
    pub round_id: RoundId,
    pub parent_id: Option<VariantId>,
    pub generation: u32,
    pub content: String,
    pub fingerprint: ContentFingerprint,
    pub mutation: Option<MutationDescriptor>,
}

impl NewVariant {
    /// A generation-0 variant with no parent.
    pub fn founder(
        campaign_id: CampaignId,
        round_id: RoundId,
        content: impl Into<String>,
        mutation: Option<MutationDescriptor>,
    ) -> Self {
        let content = content.into();
        Self {
            campaign_id,
            round_id,
            parent_id: None,
            generation: 0,
            fingerprint: ContentFingerprint::of(&content),
            content,
            mutation,
        }
    }

    /// A child one generation below `parent`.
    pub fn child(
        parent: &VariantRecord,
        round_id: RoundId,
        content: impl Into<String>,
        mutation: Option<MutationDescriptor>,
    ) -> Self {
        let content = content.into();
        Self {
            campaign_id: parent.campaign_id,
            round_id,
            parent_id: Some(parent.id),
            generation: parent.generation + 1,
            fingerprint: ContentFingerprint::of(&content),
            content,
            mutation,
        }
    }

    pub fn into_record(self, now: DateTime<Utc>) -> VariantRecord {
        VariantRecord {
            id: VariantId::new(),
            campaign_id: self.campaign_id,
            round_id: self.round_id,
            parent_id: self.parent_id,
            generation: self.generation,
            content: self.content,
            fingerprint: self.fingerprint,
            mutation: self.mutation,
            selected: false,
            created_at: now,
        }
    }
}

/// Result of `insert_variant`: the stored variant and whether it is new.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub variant: VariantRecord,
    pub created: bool,
}

/// Check the lineage invariants for a variant about to be inserted.
///
/// Shared by every backend so the rules are identical everywhere.
pub fn check_lineage(
    new: &NewVariant,
    parent: Option<&VariantRecord>,
) -> Result<(), crate::StorageError> {
    use crate::StorageError::LineageViolation;
    match (new.parent_id, parent) {
        (None, _) if new.generation != 0 => Err(LineageViolation(format!(
            "founder must have generation 0, got {}",
            new.generation
        ))),
        (None, _) => Ok(()),
        (Some(pid), None) => Err(LineageViolation(format!("parent {pid} does not exist"))),
        (Some(pid), Some(p)) if p.id != pid => {
            Err(LineageViolation(format!("parent {pid} lookup mismatch")))
        }
        (Some(_), Some(p)) if p.campaign_id != new.campaign_id => Err(LineageViolation(
            format!("parent {} belongs to another campaign", p.id),
        )),
        (Some(_), Some(p)) if new.generation != p.generation + 1 => {
            Err(LineageViolation(format!(
                "generation {} does not follow parent generation {}",
                new.generation, p.generation
            )))
        }
        (Some(_), Some(p)) if p.round_id == new.round_id => Err(LineageViolation(format!(
            "parent {} is in the same round",
            p.id
        ))),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Running => "running",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EvaluationStatus::Pending),
            "running" => Some(EvaluationStatus::Running),
            "completed" => Some(EvaluationStatus::Completed),
            "failed" => Some(EvaluationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EvaluationStatus::Completed | EvaluationStatus::Failed)
    }
}

/// One (variant, evaluator) score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: EvaluationId,
    pub variant_id: VariantId,
    pub round_id: RoundId,
    pub evaluator_kind: String,
    pub status: EvaluationStatus,
    /// Normalized to `[0, 1]`; `None` until completed.
    pub score: Option<f64>,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    /// Primary evaluator kind when this score came from its fallback.
    pub fallback_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationRecord {
    pub fn new(
        variant_id: VariantId,
        round_id: RoundId,
        evaluator_kind: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EvaluationId::new(),
            variant_id,
            round_id,
            evaluator_kind: evaluator_kind.into(),
            status: EvaluationStatus::Pending,
            score: None,
            payload: serde_json::Value::Null,
            error: None,
            fallback_from: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// One immutable version of a named campaign policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub campaign_id: CampaignId,
    pub name: String,
    pub version: u32,
    pub config: SelectionConfig,
    /// Only the newest version is active.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Append-only audit record of one stage invocation or unit failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: DecisionId,
    pub trace_id: TraceId,
    pub campaign_id: CampaignId,
    pub round_id: Option<RoundId>,
    pub variant_id: Option<VariantId>,
    /// Producing stage or agent kind (`planning`, `generation`, ...).
    pub stage: String,
    pub input: serde_json::Value,
    /// `None` when the invocation failed.
    pub output: Option<serde_json::Value>,
    pub rationale: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// Tie-breaker for records sharing a timestamp.
    pub seq: u64,
}

/// Input for appending a decision
#[derive(Debug, Clone)]
pub struct NewDecision {
    pub trace_id: TraceId,
    pub campaign_id: CampaignId,
    pub round_id: Option<RoundId>,
    pub variant_id: Option<VariantId>,
    pub stage: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub rationale: String,
    pub confidence: f64,
}
