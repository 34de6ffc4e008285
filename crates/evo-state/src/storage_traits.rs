//! Storage trait definitions for Evo
//!
//! These traits define the repository layer, the only writer of durable state:
//! - `CampaignStore`: campaigns and their lifecycle
//! - `RoundStore`: rounds, compare-and-set transitions, execution leases
//! - `VariantStore`: the lineage forest and per-round selection
//! - `EvaluationStore`: (variant, evaluator) scores
//! - `PolicyStore`: append-only versioned policies
//! - `DecisionLog`: append-only audit trail
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! via the `fakes` module, SurrealDB via `surreal_repository`.

use async_trait::async_trait;
use chrono::Duration;

use crate::campaign_config::SelectionConfig;
use crate::error::StorageError;
use crate::ids::{CampaignId, EvaluationId, PolicyId, RoundId, TraceId, VariantId};
use crate::records::{
    CampaignFilter, CampaignRecord, CampaignStatus, DecisionRecord, EvaluationRecord,
    InsertOutcome, NewCampaign, NewDecision, NewRound, NewVariant, PolicyRecord, RoundPatch,
    RoundRecord, RoundStatus, VariantRecord,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CampaignStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Persist a new campaign in `draft`.
    async fn create_campaign(&self, new: NewCampaign) -> StorageResult<CampaignRecord>;

    /// Fetch a live campaign. Soft-deleted campaigns are `CampaignNotFound`.
    async fn get_campaign(&self, id: &CampaignId) -> StorageResult<CampaignRecord>;

    /// Fetch a campaign regardless of soft deletion (audit views).
    async fn get_campaign_including_deleted(
        &self,
        id: &CampaignId,
    ) -> StorageResult<CampaignRecord>;

    /// List campaigns, newest first.
    async fn list_campaigns(&self, filter: CampaignFilter) -> StorageResult<Vec<CampaignRecord>>;

    /// Compare-and-set status change.
    ///
    /// Returns the stored record unchanged when it is already `to`. Fails with
    /// `InvalidTransition` when `from -> to` is not a legal edge or the
    /// persisted status is neither `from` nor `to`.
    async fn transition_campaign(
        &self,
        id: &CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> StorageResult<CampaignRecord>;

    /// Mark a campaign deleted. Idempotent.
    async fn soft_delete_campaign(&self, id: &CampaignId) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// RoundStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Create a round in `pending`.
    ///
    /// Enforced atomically by the store:
    /// - the number is 0 for the first round, otherwise `latest + 1`
    ///   (`RoundOutOfOrder`)
    /// - the latest round is terminal (`ActiveRoundExists`)
    /// - `(campaign_id, round_number)` is unique (`DuplicateRound`)
    async fn create_round(&self, new: NewRound) -> StorageResult<RoundRecord>;

    async fn get_round(&self, id: &RoundId) -> StorageResult<RoundRecord>;

    async fn find_round(
        &self,
        campaign_id: &CampaignId,
        round_number: u32,
    ) -> StorageResult<Option<RoundRecord>>;

    /// All rounds of a campaign, ascending by number.
    async fn list_rounds(&self, campaign_id: &CampaignId) -> StorageResult<Vec<RoundRecord>>;

    /// Compare-and-set transition `from -> to`, writing `patch` with it.
    ///
    /// Idempotent: if the persisted status is already `to` the stored record
    /// is returned and nothing is written. Otherwise a status other than
    /// `from` yields `StaleState`.
    async fn transition_round(
        &self,
        id: &RoundId,
        from: RoundStatus,
        to: RoundStatus,
        patch: RoundPatch,
    ) -> StorageResult<RoundRecord>;

    /// Take or renew the execution lease. `false` means another live owner
    /// holds it.
    async fn acquire_round_lease(
        &self,
        id: &RoundId,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<bool>;

    /// Drop the lease if `owner` still holds it.
    async fn release_round_lease(&self, id: &RoundId, owner: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// VariantStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VariantStore: Send + Sync {
    /// Insert a variant, deduplicating on `(round_id, fingerprint)`.
    ///
    /// Lineage rules are checked against the persisted parent before the
    /// write; violations are `LineageViolation` and nothing is stored.
    async fn insert_variant(&self, new: NewVariant) -> StorageResult<InsertOutcome>;

    async fn get_variant(&self, id: &VariantId) -> StorageResult<VariantRecord>;

    /// Variants of a round in creation order.
    async fn list_variants(&self, round_id: &RoundId) -> StorageResult<Vec<VariantRecord>>;

    /// Direct children of a variant, in creation order.
    async fn children_of(&self, parent_id: &VariantId) -> StorageResult<Vec<VariantRecord>>;

    /// Every variant of a campaign, in creation order.
    async fn list_campaign_variants(
        &self,
        campaign_id: &CampaignId,
    ) -> StorageResult<Vec<VariantRecord>>;

    /// Set `selected` on exactly `ids` within the round.
    ///
    /// The flag is written once per round: repeating the same set is a no-op,
    /// a different set is `SelectionConflict`.
    async fn mark_selected(
        &self,
        round_id: &RoundId,
        ids: &[VariantId],
    ) -> StorageResult<Vec<VariantRecord>>;

    async fn list_selected(&self, round_id: &RoundId) -> StorageResult<Vec<VariantRecord>>;
}

// ---------------------------------------------------------------------------
// EvaluationStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Create the pending evaluation for `(variant_id, evaluator_kind)`, or
    /// return the existing one.
    async fn create_evaluation(
        &self,
        variant_id: &VariantId,
        round_id: &RoundId,
        evaluator_kind: &str,
    ) -> StorageResult<EvaluationRecord>;

    /// `pending -> running`. Idempotent when already running.
    async fn start_evaluation(&self, id: &EvaluationId) -> StorageResult<EvaluationRecord>;

    async fn complete_evaluation(
        &self,
        id: &EvaluationId,
        score: f64,
        payload: serde_json::Value,
        fallback_from: Option<String>,
    ) -> StorageResult<EvaluationRecord>;

    async fn fail_evaluation(
        &self,
        id: &EvaluationId,
        error: String,
        payload: serde_json::Value,
    ) -> StorageResult<EvaluationRecord>;

    /// Evaluations of a round, in creation order.
    async fn list_evaluations(&self, round_id: &RoundId) -> StorageResult<Vec<EvaluationRecord>>;

    async fn evaluations_for_variant(
        &self,
        variant_id: &VariantId,
    ) -> StorageResult<Vec<EvaluationRecord>>;
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Append version `max + 1` of `name` and deactivate older versions.
    async fn append_policy(
        &self,
        campaign_id: &CampaignId,
        name: &str,
        config: SelectionConfig,
    ) -> StorageResult<PolicyRecord>;

    async fn get_policy(&self, id: &PolicyId) -> StorageResult<PolicyRecord>;

    async fn latest_policy(
        &self,
        campaign_id: &CampaignId,
        name: &str,
    ) -> StorageResult<Option<PolicyRecord>>;

    /// All versions, oldest first.
    async fn policy_history(
        &self,
        campaign_id: &CampaignId,
        name: &str,
    ) -> StorageResult<Vec<PolicyRecord>>;
}

// ---------------------------------------------------------------------------
// DecisionLog
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// Append one record. Concurrent appends never overwrite each other.
    async fn append_decision(&self, new: NewDecision) -> StorageResult<DecisionRecord>;

    /// Records for a trace in creation order.
    async fn decisions_by_trace(&self, trace_id: &TraceId) -> StorageResult<Vec<DecisionRecord>>;

    /// Records for a round in creation order.
    async fn decisions_by_round(&self, round_id: &RoundId) -> StorageResult<Vec<DecisionRecord>>;
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Every store in one object, as handed to the engine.
pub trait Repository:
    CampaignStore + RoundStore + VariantStore + EvaluationStore + PolicyStore + DecisionLog
{
}

impl<T> Repository for T where
    T: CampaignStore + RoundStore + VariantStore + EvaluationStore + PolicyStore + DecisionLog
{
}

/// Ordering used for "creation order" everywhere: timestamp, then id.
pub(crate) fn creation_order(a: &VariantRecord, b: &VariantRecord) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

/// Validate a selection set for `mark_selected` against what is stored.
///
/// Returns `Ok(true)` when the flags must be written, `Ok(false)` when the
/// same set is already applied.
pub(crate) fn check_selection(
    round_id: &RoundId,
    population: &[VariantRecord],
    ids: &[VariantId],
) -> StorageResult<bool> {
    use std::collections::BTreeSet;

    let wanted: BTreeSet<VariantId> = ids.iter().copied().collect();
    for id in &wanted {
        if !population.iter().any(|v| v.id == *id) {
            return Err(StorageError::VariantNotFound {
                variant_id: id.to_string(),
            });
        }
    }
    let already: BTreeSet<VariantId> = population
        .iter()
        .filter(|v| v.selected)
        .map(|v| v.id)
        .collect();
    if already.is_empty() {
        return Ok(true);
    }
    if already == wanted {
        return Ok(false);
    }
    Err(StorageError::SelectionConflict {
        round_id: round_id.to_string(),
    })
}
