//! In-memory repository
//!
//! `MemoryRepository` satisfies every storage trait without external
//! dependencies. All tables sit behind one mutex, so multi-row checks
//! (round ordering, deduplication, selection) are atomic exactly like the
//! unique indexes of the SurrealDB backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::campaign_config::SelectionConfig;
use crate::error::StorageError;
use crate::ids::*;
use crate::records::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    campaigns: HashMap<CampaignId, CampaignRecord>,
    rounds: HashMap<RoundId, RoundRecord>,
    variants: HashMap<VariantId, VariantRecord>,
    evaluations: HashMap<EvaluationId, EvaluationRecord>,
    policies: HashMap<PolicyId, PolicyRecord>,
    decisions: Vec<DecisionRecord>,
}

/// In-memory implementation of [`Repository`].
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    writes: AtomicU64,
    decision_seq: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating operations that changed stored state.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate an outage: every call fails with `Backend` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn tables(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("memory repository unavailable".into()));
        }
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory repository lock poisoned".into()))
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn campaign_not_found(id: &CampaignId) -> StorageError {
    StorageError::CampaignNotFound {
        campaign_id: id.to_string(),
    }
}

fn round_not_found(id: &RoundId) -> StorageError {
    StorageError::RoundNotFound {
        round_id: id.to_string(),
    }
}

fn variant_not_found(id: &VariantId) -> StorageError {
    StorageError::VariantNotFound {
        variant_id: id.to_string(),
    }
}

fn evaluation_not_found(id: &EvaluationId) -> StorageError {
    StorageError::EvaluationNotFound {
        evaluation_id: id.to_string(),
    }
}

fn sorted_variants<'a>(iter: impl Iterator<Item = &'a VariantRecord>) -> Vec<VariantRecord> {
    let mut out: Vec<VariantRecord> = iter.cloned().collect();
    out.sort_by(creation_order);
    out
}

// ---------------------------------------------------------------------------
// CampaignStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CampaignStore for MemoryRepository {
    async fn create_campaign(&self, new: NewCampaign) -> StorageResult<CampaignRecord> {
        let now = Utc::now();
        let record = CampaignRecord {
            id: CampaignId::new(),
            name: new.name,
            description: new.description,
            config: new.config,
            status: CampaignStatus::Draft,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deleted_at: None,
        };
        self.tables()?.campaigns.insert(record.id, record.clone());
        self.wrote();
        Ok(record)
    }

    async fn get_campaign(&self, id: &CampaignId) -> StorageResult<CampaignRecord> {
        self.tables()?
            .campaigns
            .get(id)
            .filter(|c| !c.is_deleted())
            .cloned()
            .ok_or_else(|| campaign_not_found(id))
    }

    async fn get_campaign_including_deleted(
        &self,
        id: &CampaignId,
    ) -> StorageResult<CampaignRecord> {
        self.tables()?
            .campaigns
            .get(id)
            .cloned()
            .ok_or_else(|| campaign_not_found(id))
    }

    async fn list_campaigns(&self, filter: CampaignFilter) -> StorageResult<Vec<CampaignRecord>> {
        let tables = self.tables()?;
        let mut out: Vec<CampaignRecord> = tables
            .campaigns
            .values()
            .filter(|c| filter.include_deleted || !c.is_deleted())
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn transition_campaign(
        &self,
        id: &CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> StorageResult<CampaignRecord> {
        let mut tables = self.tables()?;
        let campaign = tables
            .campaigns
            .get_mut(id)
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| campaign_not_found(id))?;

        if campaign.status == to {
            return Ok(campaign.clone());
        }
        if campaign.status != from || !from.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                entity: "campaign",
                from: campaign.status.to_string(),
                to: to.to_string(),
            });
        }
        campaign.apply_status(to, Utc::now());
        let out = campaign.clone();
        drop(tables);
        self.wrote();
        Ok(out)
    }

    async fn soft_delete_campaign(&self, id: &CampaignId) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let campaign = tables
            .campaigns
            .get_mut(id)
            .ok_or_else(|| campaign_not_found(id))?;
        if campaign.deleted_at.is_none() {
            let now = Utc::now();
            campaign.deleted_at = Some(now);
            campaign.updated_at = now;
            drop(tables);
            self.wrote();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RoundStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RoundStore for MemoryRepository {
    async fn create_round(&self, new: NewRound) -> StorageResult<RoundRecord> {
        let mut tables = self.tables()?;
        if !tables.campaigns.contains_key(&new.campaign_id) {
            return Err(campaign_not_found(&new.campaign_id));
        }

        let latest = tables
            .rounds
            .values()
            .filter(|r| r.campaign_id == new.campaign_id)
            .max_by_key(|r| r.round_number);

        if let Some(existing) = tables
            .rounds
            .values()
            .find(|r| r.campaign_id == new.campaign_id && r.round_number == new.round_number)
        {
            return Err(StorageError::DuplicateRound {
                campaign_id: existing.campaign_id.to_string(),
                round_number: existing.round_number,
            });
        }

        let expected = latest.map_or(0, |r| r.round_number + 1);
        if let Some(latest) = latest {
            if !latest.status.is_terminal() {
                return Err(StorageError::ActiveRoundExists {
                    campaign_id: new.campaign_id.to_string(),
                    round_number: latest.round_number,
                });
            }
        }
        if new.round_number != expected {
            return Err(StorageError::RoundOutOfOrder {
                requested: new.round_number,
                expected,
            });
        }

        let record = RoundRecord::new(new, Utc::now());
        tables.rounds.insert(record.id, record.clone());
        drop(tables);
        self.wrote();
        Ok(record)
    }

    async fn get_round(&self, id: &RoundId) -> StorageResult<RoundRecord> {
        self.tables()?
            .rounds
            .get(id)
            .cloned()
            .ok_or_else(|| round_not_found(id))
    }

    async fn find_round(
        &self,
        campaign_id: &CampaignId,
        round_number: u32,
    ) -> StorageResult<Option<RoundRecord>> {
        Ok(self
            .tables()?
            .rounds
            .values()
            .find(|r| r.campaign_id == *campaign_id && r.round_number == round_number)
            .cloned())
    }

    async fn list_rounds(&self, campaign_id: &CampaignId) -> StorageResult<Vec<RoundRecord>> {
        let mut out: Vec<RoundRecord> = self
            .tables()?
            .rounds
            .values()
            .filter(|r| r.campaign_id == *campaign_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.round_number);
        Ok(out)
    }

    async fn transition_round(
        &self,
        id: &RoundId,
        from: RoundStatus,
        to: RoundStatus,
        patch: RoundPatch,
    ) -> StorageResult<RoundRecord> {
        if !from.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                entity: "round",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut tables = self.tables()?;
        let round = tables.rounds.get_mut(id).ok_or_else(|| round_not_found(id))?;
        if round.status == to {
            return Ok(round.clone());
        }
        if round.status != from {
            return Err(StorageError::StaleState {
                round_id: id.to_string(),
                expected: from.to_string(),
                actual: round.status.to_string(),
            });
        }
        round.apply_transition(to, patch, Utc::now());
        let out = round.clone();
        drop(tables);
        self.wrote();
        Ok(out)
    }

    async fn acquire_round_lease(
        &self,
        id: &RoundId,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let mut tables = self.tables()?;
        let round = tables.rounds.get_mut(id).ok_or_else(|| round_not_found(id))?;
        let now = Utc::now();
        if round.status.is_terminal() || !round.lease_available_to(owner, now) {
            return Ok(false);
        }
        round.lease_owner = Some(owner.to_string());
        round.lease_expires_at = Some(now + ttl);
        drop(tables);
        self.wrote();
        Ok(true)
    }

    async fn release_round_lease(&self, id: &RoundId, owner: &str) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let round = tables.rounds.get_mut(id).ok_or_else(|| round_not_found(id))?;
        if round.lease_owner.as_deref() == Some(owner) {
            round.lease_owner = None;
            round.lease_expires_at = None;
            drop(tables);
            self.wrote();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VariantStore
// ---------------------------------------------------------------------------

#[async_trait]
impl VariantStore for MemoryRepository {
    async fn insert_variant(&self, new: NewVariant) -> StorageResult<InsertOutcome> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables
            .variants
            .values()
            .find(|v| v.round_id == new.round_id && v.fingerprint == new.fingerprint)
        {
            return Ok(InsertOutcome {
                variant: existing.clone(),
                created: false,
            });
        }

        let parent = new.parent_id.and_then(|pid| tables.variants.get(&pid));
        check_lineage(&new, parent)?;

        let record = new.into_record(Utc::now());
        tables.variants.insert(record.id, record.clone());
        drop(tables);
        self.wrote();
        Ok(InsertOutcome {
            variant: record,
            created: true,
        })
    }

    async fn get_variant(&self, id: &VariantId) -> StorageResult<VariantRecord> {
        self.tables()?
            .variants
            .get(id)
            .cloned()
            .ok_or_else(|| variant_not_found(id))
    }

    async fn list_variants(&self, round_id: &RoundId) -> StorageResult<Vec<VariantRecord>> {
        let tables = self.tables()?;
        Ok(sorted_variants(
            tables.variants.values().filter(|v| v.round_id == *round_id),
        ))
    }

    async fn children_of(&self, parent_id: &VariantId) -> StorageResult<Vec<VariantRecord>> {
        let tables = self.tables()?;
        Ok(sorted_variants(
            tables
                .variants
                .values()
                .filter(|v| v.parent_id == Some(*parent_id)),
        ))
    }

    async fn list_campaign_variants(
        &self,
        campaign_id: &CampaignId,
    ) -> StorageResult<Vec<VariantRecord>> {
        let tables = self.tables()?;
        Ok(sorted_variants(
            tables
                .variants
                .values()
                .filter(|v| v.campaign_id == *campaign_id),
        ))
    }

    async fn mark_selected(
        &self,
        round_id: &RoundId,
        ids: &[VariantId],
    ) -> StorageResult<Vec<VariantRecord>> {
        let mut tables = self.tables()?;
        let population = sorted_variants(
            tables.variants.values().filter(|v| v.round_id == *round_id),
        );
        if check_selection(round_id, &population, ids)? && !ids.is_empty() {
            for id in ids {
                if let Some(v) = tables.variants.get_mut(id) {
                    v.selected = true;
                }
            }
            self.wrote();
        }
        Ok(sorted_variants(
            tables
                .variants
                .values()
                .filter(|v| v.round_id == *round_id && v.selected),
        ))
    }

    async fn list_selected(&self, round_id: &RoundId) -> StorageResult<Vec<VariantRecord>> {
        let tables = self.tables()?;
        Ok(sorted_variants(
            tables
                .variants
                .values()
                .filter(|v| v.round_id == *round_id && v.selected),
        ))
    }
}

// ---------------------------------------------------------------------------
// EvaluationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EvaluationStore for MemoryRepository {
    async fn create_evaluation(
        &self,
        variant_id: &VariantId,
        round_id: &RoundId,
        evaluator_kind: &str,
    ) -> StorageResult<EvaluationRecord> {
        let mut tables = self.tables()?;
        if !tables.variants.contains_key(variant_id) {
            return Err(variant_not_found(variant_id));
        }
        if let Some(existing) = tables
            .evaluations
            .values()
            .find(|e| e.variant_id == *variant_id && e.evaluator_kind == evaluator_kind)
        {
            return Ok(existing.clone());
        }
        let record = EvaluationRecord::new(*variant_id, *round_id, evaluator_kind, Utc::now());
        tables.evaluations.insert(record.id, record.clone());
        drop(tables);
        self.wrote();
        Ok(record)
    }

    async fn start_evaluation(&self, id: &EvaluationId) -> StorageResult<EvaluationRecord> {
        let mut tables = self.tables()?;
        let eval = tables
            .evaluations
            .get_mut(id)
            .ok_or_else(|| evaluation_not_found(id))?;
        match eval.status {
            EvaluationStatus::Running => return Ok(eval.clone()),
            EvaluationStatus::Pending => {}
            other => {
                return Err(StorageError::InvalidTransition {
                    entity: "evaluation",
                    from: other.as_str().to_string(),
                    to: "running".to_string(),
                })
            }
        }
        eval.status = EvaluationStatus::Running;
        eval.started_at = Some(Utc::now());
        let out = eval.clone();
        drop(tables);
        self.wrote();
        Ok(out)
    }

    async fn complete_evaluation(
        &self,
        id: &EvaluationId,
        score: f64,
        payload: serde_json::Value,
        fallback_from: Option<String>,
    ) -> StorageResult<EvaluationRecord> {
        let mut tables = self.tables()?;
        let eval = tables
            .evaluations
            .get_mut(id)
            .ok_or_else(|| evaluation_not_found(id))?;
        if eval.status.is_terminal() {
            return Err(StorageError::InvalidTransition {
                entity: "evaluation",
                from: eval.status.as_str().to_string(),
                to: "completed".to_string(),
            });
        }
        eval.status = EvaluationStatus::Completed;
        eval.score = Some(score.clamp(0.0, 1.0));
        eval.payload = payload;
        eval.fallback_from = fallback_from;
        eval.completed_at = Some(Utc::now());
        let out = eval.clone();
        drop(tables);
        self.wrote();
        Ok(out)
    }

    async fn fail_evaluation(
        &self,
        id: &EvaluationId,
        error: String,
        payload: serde_json::Value,
    ) -> StorageResult<EvaluationRecord> {
        let mut tables = self.tables()?;
        let eval = tables
            .evaluations
            .get_mut(id)
            .ok_or_else(|| evaluation_not_found(id))?;
        if eval.status.is_terminal() {
            return Err(StorageError::InvalidTransition {
                entity: "evaluation",
                from: eval.status.as_str().to_string(),
                to: "failed".to_string(),
            });
        }
        eval.status = EvaluationStatus::Failed;
        eval.error = Some(error);
        eval.payload = payload;
        eval.completed_at = Some(Utc::now());
        let out = eval.clone();
        drop(tables);
        self.wrote();
        Ok(out)
    }

    async fn list_evaluations(&self, round_id: &RoundId) -> StorageResult<Vec<EvaluationRecord>> {
        let mut out: Vec<EvaluationRecord> = self
            .tables()?
            .evaluations
            .values()
            .filter(|e| e.round_id == *round_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn evaluations_for_variant(
        &self,
        variant_id: &VariantId,
    ) -> StorageResult<Vec<EvaluationRecord>> {
        let mut out: Vec<EvaluationRecord> = self
            .tables()?
            .evaluations
            .values()
            .filter(|e| e.variant_id == *variant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PolicyStore for MemoryRepository {
    async fn append_policy(
        &self,
        campaign_id: &CampaignId,
        name: &str,
        config: SelectionConfig,
    ) -> StorageResult<PolicyRecord> {
        let mut tables = self.tables()?;
        if !tables.campaigns.contains_key(campaign_id) {
            return Err(campaign_not_found(campaign_id));
        }
        let mut version = 0;
        for policy in tables
            .policies
            .values_mut()
            .filter(|p| p.campaign_id == *campaign_id && p.name == name)
        {
            version = version.max(policy.version);
            policy.active = false;
        }
        let record = PolicyRecord {
            id: PolicyId::new(),
            campaign_id: *campaign_id,
            name: name.to_string(),
            version: version + 1,
            config,
            active: true,
            created_at: Utc::now(),
        };
        tables.policies.insert(record.id, record.clone());
        drop(tables);
        self.wrote();
        Ok(record)
    }

    async fn get_policy(&self, id: &PolicyId) -> StorageResult<PolicyRecord> {
        self.tables()?
            .policies
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::PolicyNotFound {
                policy_id: id.to_string(),
            })
    }

    async fn latest_policy(
        &self,
        campaign_id: &CampaignId,
        name: &str,
    ) -> StorageResult<Option<PolicyRecord>> {
        Ok(self
            .tables()?
            .policies
            .values()
            .filter(|p| p.campaign_id == *campaign_id && p.name == name)
            .max_by_key(|p| p.version)
            .cloned())
    }

    async fn policy_history(
        &self,
        campaign_id: &CampaignId,
        name: &str,
    ) -> StorageResult<Vec<PolicyRecord>> {
        let mut out: Vec<PolicyRecord> = self
            .tables()?
            .policies
            .values()
            .filter(|p| p.campaign_id == *campaign_id && p.name == name)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.version);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// DecisionLog
// ---------------------------------------------------------------------------

#[async_trait]
impl DecisionLog for MemoryRepository {
    async fn append_decision(&self, new: NewDecision) -> StorageResult<DecisionRecord> {
        let mut tables = self.tables()?;
        let record = DecisionRecord {
            id: DecisionId::new(),
            trace_id: new.trace_id,
            campaign_id: new.campaign_id,
            round_id: new.round_id,
            variant_id: new.variant_id,
            stage: new.stage,
            input: new.input,
            output: new.output,
            rationale: new.rationale,
            confidence: new.confidence,
            created_at: Utc::now(),
            seq: self.decision_seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        tables.decisions.push(record.clone());
        drop(tables);
        self.wrote();
        Ok(record)
    }

    async fn decisions_by_trace(&self, trace_id: &TraceId) -> StorageResult<Vec<DecisionRecord>> {
        Ok(self
            .tables()?
            .decisions
            .iter()
            .filter(|d| d.trace_id == *trace_id)
            .cloned()
            .collect())
    }

    async fn decisions_by_round(&self, round_id: &RoundId) -> StorageResult<Vec<DecisionRecord>> {
        Ok(self
            .tables()?
            .decisions
            .iter()
            .filter(|d| d.round_id == Some(*round_id))
            .cloned()
            .collect())
    }
}
