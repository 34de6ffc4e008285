//! SurrealDB-backed repository
//!
//! Uses the row types in `schema` for persistence, converting to/from
//! `records` types at the boundary. Status changes are compare-and-set
//! `UPDATE ... WHERE status = $from` statements, and the unique indexes
//! from `migrations` back every uniqueness rule.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use crate::campaign_config::SelectionConfig;
use crate::error::StorageError;
use crate::handle::{self, SurrealConfig};
use crate::ids::*;
use crate::records::*;
use crate::schema::{CampaignRow, DecisionRow, EvaluationRow, PolicyRow, RoundRow, VariantRow};
use crate::storage_traits::*;

/// SurrealDB-backed implementation of [`Repository`].
pub struct SurrealRepository {
    db: Surreal<Any>,
    decision_seq: AtomicU64,
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Unique index violations surface as query errors mentioning the index.
fn is_unique_violation(e: &surrealdb::Error) -> bool {
    e.to_string().contains("already contains")
}

fn dt(t: chrono::DateTime<Utc>) -> SurrealDatetime {
    SurrealDatetime::from(t)
}

/// Query parameter. Datetimes must reach SurrealDB as native datetimes,
/// which a round trip through `serde_json::Value` would turn into strings.
#[derive(serde::Serialize)]
#[serde(untagged)]
enum Bind {
    Json(Value),
    Time(SurrealDatetime),
    OptTime(Option<SurrealDatetime>),
}

impl From<Value> for Bind {
    fn from(v: Value) -> Self {
        Bind::Json(v)
    }
}

impl From<SurrealDatetime> for Bind {
    fn from(t: SurrealDatetime) -> Self {
        Bind::Time(t)
    }
}

impl From<Option<SurrealDatetime>> for Bind {
    fn from(t: Option<SurrealDatetime>) -> Self {
        Bind::OptTime(t)
    }
}

impl SurrealRepository {
    pub fn new(db: Surreal<Any>) -> Self {
        Self {
            db,
            decision_seq: AtomicU64::new(0),
        }
    }

    /// Create an in-memory instance (`mem://`, schema initialized).
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://").await?;
        info!("SurrealRepository connected (in-memory)");
        Ok(Self::new(db))
    }

    /// Connect to a remote endpoint with credentials.
    pub async fn connect(config: &SurrealConfig) -> crate::Result<Self> {
        Ok(Self::new(handle::connect_remote(config).await?))
    }

    /// Create from environment variables (see [`handle::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        Ok(Self::new(handle::connect_from_env().await?))
    }

    // -- private helpers -----------------------------------------------------

    async fn rows<T: DeserializeOwned>(
        &self,
        sql: &str,
        binds: Vec<(&'static str, Bind)>,
    ) -> StorageResult<Vec<T>> {
        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await.map_err(backend)?;
        res.take(0).map_err(backend)
    }

    async fn first<T: DeserializeOwned>(
        &self,
        sql: &str,
        binds: Vec<(&'static str, Bind)>,
    ) -> StorageResult<Option<T>> {
        Ok(self.rows(sql, binds).await?.into_iter().next())
    }

    async fn fetch_campaign(&self, id: &CampaignId) -> StorageResult<CampaignRecord> {
        self.first::<CampaignRow>(
            "SELECT * FROM campaigns WHERE campaign_id = $cid",
            vec![("cid", Bind::from(json!(id.to_string())))],
        )
        .await?
        .ok_or_else(|| StorageError::CampaignNotFound {
            campaign_id: id.to_string(),
        })?
        .into_record()
    }

    async fn fetch_round(&self, id: &RoundId) -> StorageResult<RoundRecord> {
        self.first::<RoundRow>(
            "SELECT * FROM rounds WHERE round_id = $rid",
            vec![("rid", Bind::from(json!(id.to_string())))],
        )
        .await?
        .ok_or_else(|| StorageError::RoundNotFound {
            round_id: id.to_string(),
        })?
        .into_record()
    }

    async fn fetch_variant(&self, id: &VariantId) -> StorageResult<Option<VariantRecord>> {
        self.first::<VariantRow>(
            "SELECT * FROM variants WHERE variant_id = $vid",
            vec![("vid", Bind::from(json!(id.to_string())))],
        )
        .await?
        .map(VariantRow::into_record)
        .transpose()
    }

    async fn fetch_by_fingerprint(
        &self,
        round_id: &RoundId,
        fingerprint: &ContentFingerprint,
    ) -> StorageResult<Option<VariantRecord>> {
        self.first::<VariantRow>(
            "SELECT * FROM variants WHERE round_id = $rid AND content_fingerprint = $fp",
            vec![
                ("rid", Bind::from(json!(round_id.to_string()))),
                ("fp", Bind::from(json!(fingerprint.as_str()))),
            ],
        )
        .await?
        .map(VariantRow::into_record)
        .transpose()
    }

    async fn variants_where(
        &self,
        sql: &str,
        binds: Vec<(&'static str, Bind)>,
    ) -> StorageResult<Vec<VariantRecord>> {
        let mut out = self
            .rows::<VariantRow>(sql, binds)
            .await?
            .into_iter()
            .map(VariantRow::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by(creation_order);
        Ok(out)
    }

    async fn fetch_evaluation(&self, id: &EvaluationId) -> StorageResult<EvaluationRecord> {
        self.first::<EvaluationRow>(
            "SELECT * FROM evaluations WHERE evaluation_id = $eid",
            vec![("eid", Bind::from(json!(id.to_string())))],
        )
        .await?
        .ok_or_else(|| StorageError::EvaluationNotFound {
            evaluation_id: id.to_string(),
        })?
        .into_record()
    }

    async fn evaluations_where(
        &self,
        sql: &str,
        binds: Vec<(&'static str, Bind)>,
    ) -> StorageResult<Vec<EvaluationRecord>> {
        let mut out = self
            .rows::<EvaluationRow>(sql, binds)
            .await?
            .into_iter()
            .map(EvaluationRow::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Write a terminal evaluation state if the row is not terminal yet.
    async fn finish_evaluation(
        &self,
        id: &EvaluationId,
        updated: EvaluationRecord,
        to: EvaluationStatus,
    ) -> StorageResult<EvaluationRecord> {
        let rows: Vec<EvaluationRow> = self
            .rows(
                "UPDATE evaluations SET status = $status, score = $score, payload = $payload, \
                 error = $error, fallback_from = $fallback, completed_at = $completed \
                 WHERE evaluation_id = $eid AND status INSIDE ['pending', 'running'] \
                 RETURN AFTER",
                vec![
                    ("eid", Bind::from(json!(id.to_string()))),
                    ("status", Bind::from(json!(to.as_str()))),
                    ("score", Bind::from(json!(updated.score))),
                    ("payload", Bind::from(updated.payload.clone())),
                    ("error", Bind::from(json!(updated.error))),
                    ("fallback", Bind::from(json!(updated.fallback_from))),
                    ("completed", Bind::from(updated.completed_at.map(dt))),
                ],
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => row.into_record(),
            None => {
                let current = self.fetch_evaluation(id).await?;
                Err(StorageError::InvalidTransition {
                    entity: "evaluation",
                    from: current.status.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
            }
        }
    }

    async fn policies_for(
        &self,
        campaign_id: &CampaignId,
        name: &str,
    ) -> StorageResult<Vec<PolicyRecord>> {
        let mut out = self
            .rows::<PolicyRow>(
                "SELECT * FROM policies WHERE campaign_id = $cid AND name = $name",
                vec![
                    ("cid", Bind::from(json!(campaign_id.to_string()))),
                    ("name", Bind::from(json!(name))),
                ],
            )
            .await?
            .into_iter()
            .map(PolicyRow::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by_key(|p| p.version);
        Ok(out)
    }

    async fn decisions_where(
        &self,
        sql: &str,
        binds: Vec<(&'static str, Bind)>,
    ) -> StorageResult<Vec<DecisionRecord>> {
        let mut out = self
            .rows::<DecisionRow>(sql, binds)
            .await?
            .into_iter()
            .map(DecisionRow::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// CampaignStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CampaignStore for SurrealRepository {
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
        debug!(campaign_id = %record.id, "creating campaign");

        let _created: Option<CampaignRow> = self
            .db
            .create("campaigns")
            .content(CampaignRow::from_record(&record)?)
            .await
            .map_err(backend)?;
        Ok(record)
    }

    async fn get_campaign(&self, id: &CampaignId) -> StorageResult<CampaignRecord> {
        let record = self.fetch_campaign(id).await?;
        if record.is_deleted() {
            return Err(StorageError::CampaignNotFound {
                campaign_id: id.to_string(),
            });
        }
        Ok(record)
    }

    async fn get_campaign_including_deleted(
        &self,
        id: &CampaignId,
    ) -> StorageResult<CampaignRecord> {
        self.fetch_campaign(id).await
    }

    async fn list_campaigns(&self, filter: CampaignFilter) -> StorageResult<Vec<CampaignRecord>> {
        let rows: Vec<CampaignRow> = self
            .rows("SELECT * FROM campaigns ORDER BY created_at DESC", vec![])
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            if !filter.include_deleted && record.is_deleted() {
                continue;
            }
            if filter.status.is_some_and(|s| s != record.status) {
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn transition_campaign(
        &self,
        id: &CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> StorageResult<CampaignRecord> {
        let mut record = self.get_campaign(id).await?;
        if record.status == to {
            return Ok(record);
        }
        if record.status != from || !from.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                entity: "campaign",
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }
        record.apply_status(to, Utc::now());

        let rows: Vec<CampaignRow> = self
            .rows(
                "UPDATE campaigns SET status = $to, updated_at = $updated, \
                 started_at = $started, completed_at = $completed \
                 WHERE campaign_id = $cid AND status = $from RETURN AFTER",
                vec![
                    ("cid", Bind::from(json!(id.to_string()))),
                    ("from", Bind::from(json!(from.as_str()))),
                    ("to", Bind::from(json!(to.as_str()))),
                    ("updated", Bind::from(dt(record.updated_at))),
                    ("started", Bind::from(record.started_at.map(dt))),
                    ("completed", Bind::from(record.completed_at.map(dt))),
                ],
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => row.into_record(),
            None => {
                let current = self.get_campaign(id).await?;
                if current.status == to {
                    return Ok(current);
                }
                Err(StorageError::InvalidTransition {
                    entity: "campaign",
                    from: current.status.to_string(),
                    to: to.to_string(),
                })
            }
        }
    }

    async fn soft_delete_campaign(&self, id: &CampaignId) -> StorageResult<()> {
        let record = self.fetch_campaign(id).await?;
        if record.is_deleted() {
            return Ok(());
        }
        let now = dt(Utc::now());
        let _: Vec<CampaignRow> = self
            .rows(
                "UPDATE campaigns SET deleted_at = $now, updated_at = $now \
                 WHERE campaign_id = $cid AND deleted_at = NONE RETURN AFTER",
                vec![("cid", Bind::from(json!(id.to_string()))), ("now", Bind::from(now))],
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RoundStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RoundStore for SurrealRepository {
    async fn create_round(&self, new: NewRound) -> StorageResult<RoundRecord> {
        self.fetch_campaign(&new.campaign_id).await?;

        if let Some(existing) = self.find_round(&new.campaign_id, new.round_number).await? {
            return Err(StorageError::DuplicateRound {
                campaign_id: existing.campaign_id.to_string(),
                round_number: existing.round_number,
            });
        }

        let latest = self
            .first::<RoundRow>(
                "SELECT * FROM rounds WHERE campaign_id = $cid ORDER BY round_number DESC LIMIT 1",
                vec![("cid", Bind::from(json!(new.campaign_id.to_string())))],
            )
            .await?
            .map(RoundRow::into_record)
            .transpose()?;

        let expected = latest.as_ref().map_or(0, |r| r.round_number + 1);
        if let Some(latest) = &latest {
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

        let campaign_id = new.campaign_id;
        let round_number = new.round_number;
        let record = RoundRecord::new(new, Utc::now());
        let created: Result<Option<RoundRow>, _> = self
            .db
            .create("rounds")
            .content(RoundRow::from_record(&record)?)
            .await;
        match created {
            Ok(_) => Ok(record),
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateRound {
                campaign_id: campaign_id.to_string(),
                round_number,
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_round(&self, id: &RoundId) -> StorageResult<RoundRecord> {
        self.fetch_round(id).await
    }

    async fn find_round(
        &self,
        campaign_id: &CampaignId,
        round_number: u32,
    ) -> StorageResult<Option<RoundRecord>> {
        self.first::<RoundRow>(
            "SELECT * FROM rounds WHERE campaign_id = $cid AND round_number = $n",
            vec![
                ("cid", Bind::from(json!(campaign_id.to_string()))),
                ("n", Bind::from(json!(round_number))),
            ],
        )
        .await?
        .map(RoundRow::into_record)
        .transpose()
    }

    async fn list_rounds(&self, campaign_id: &CampaignId) -> StorageResult<Vec<RoundRecord>> {
        self.rows::<RoundRow>(
            "SELECT * FROM rounds WHERE campaign_id = $cid ORDER BY round_number ASC",
            vec![("cid", Bind::from(json!(campaign_id.to_string())))],
        )
        .await?
        .into_iter()
        .map(RoundRow::into_record)
        .collect()
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
        let mut record = self.fetch_round(id).await?;
        if record.status == to {
            return Ok(record);
        }
        if record.status != from {
            return Err(StorageError::StaleState {
                round_id: id.to_string(),
                expected: from.to_string(),
                actual: record.status.to_string(),
            });
        }
        record.apply_transition(to, patch, Utc::now());
        let row = RoundRow::from_record(&record)?;

        let lease_clause = if to.is_terminal() {
            ", lease_owner = NONE, lease_expires_at = NONE"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE rounds SET status = $to, plan = $plan, policy_id = $policy, \
             result = $result, failure = $failure, updated_at = $updated, \
             started_at = $started, completed_at = $completed{lease_clause} \
             WHERE round_id = $rid AND status = $from RETURN AFTER"
        );
        let rows: Vec<RoundRow> = self
            .rows(
                &sql,
                vec![
                    ("rid", Bind::from(json!(id.to_string()))),
                    ("from", Bind::from(json!(from.as_str()))),
                    ("to", Bind::from(json!(to.as_str()))),
                    ("plan", Bind::from(json!(row.plan))),
                    ("policy", Bind::from(json!(row.policy_id))),
                    ("result", Bind::from(json!(row.result))),
                    ("failure", Bind::from(json!(row.failure))),
                    ("updated", Bind::from(dt(record.updated_at))),
                    ("started", Bind::from(record.started_at.map(dt))),
                    ("completed", Bind::from(record.completed_at.map(dt))),
                ],
            )
            .await?;

        match rows.into_iter().next() {
            Some(row) => row.into_record(),
            None => {
                let current = self.fetch_round(id).await?;
                if current.status == to {
                    return Ok(current);
                }
                Err(StorageError::StaleState {
                    round_id: id.to_string(),
                    expected: from.to_string(),
                    actual: current.status.to_string(),
                })
            }
        }
    }

    async fn acquire_round_lease(
        &self,
        id: &RoundId,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let record = self.fetch_round(id).await?;
        let now = Utc::now();
        if record.status.is_terminal() || !record.lease_available_to(owner, now) {
            return Ok(false);
        }
        let seen_clause = match record.lease_owner {
            Some(_) => "lease_owner = $seen",
            None => "lease_owner = NONE",
        };
        let sql = format!(
            "UPDATE rounds SET lease_owner = $owner, lease_expires_at = $expires \
             WHERE round_id = $rid AND {seen_clause} \
             AND status NOTINSIDE ['completed', 'failed'] RETURN AFTER"
        );
        let rows: Vec<RoundRow> = self
            .rows(
                &sql,
                vec![
                    ("rid", Bind::from(json!(id.to_string()))),
                    ("seen", Bind::from(json!(record.lease_owner))),
                    ("owner", Bind::from(json!(owner))),
                    ("expires", Bind::from(dt(now + ttl))),
                ],
            )
            .await?;
        if rows.is_empty() {
            warn!(round_id = %id, owner, "lease compare-and-set lost");
        }
        Ok(!rows.is_empty())
    }

    async fn release_round_lease(&self, id: &RoundId, owner: &str) -> StorageResult<()> {
        let _: Vec<RoundRow> = self
            .rows(
                "UPDATE rounds SET lease_owner = NONE, lease_expires_at = NONE \
                 WHERE round_id = $rid AND lease_owner = $owner RETURN AFTER",
                vec![("rid", Bind::from(json!(id.to_string()))), ("owner", Bind::from(json!(owner)))],
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VariantStore
// ---------------------------------------------------------------------------

#[async_trait]
impl VariantStore for SurrealRepository {
    async fn insert_variant(&self, new: NewVariant) -> StorageResult<InsertOutcome> {
        if let Some(existing) = self.fetch_by_fingerprint(&new.round_id, &new.fingerprint).await? {
            return Ok(InsertOutcome {
                variant: existing,
                created: false,
            });
        }

        let parent = match new.parent_id {
            Some(pid) => self.fetch_variant(&pid).await?,
            None => None,
        };
        check_lineage(&new, parent.as_ref())?;

        let round_id = new.round_id;
        let fingerprint = new.fingerprint.clone();
        let record = new.into_record(Utc::now());
        let created: Result<Option<VariantRow>, _> = self
            .db
            .create("variants")
            .content(VariantRow::from_record(&record)?)
            .await;
        match created {
            Ok(_) => Ok(InsertOutcome {
                variant: record,
                created: true,
            }),
            // Lost a race against an identical insert in the same round.
            Err(e) if is_unique_violation(&e) => {
                let existing = self
                    .fetch_by_fingerprint(&round_id, &fingerprint)
                    .await?
                    .ok_or_else(|| backend(e))?;
                Ok(InsertOutcome {
                    variant: existing,
                    created: false,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_variant(&self, id: &VariantId) -> StorageResult<VariantRecord> {
        self.fetch_variant(id)
            .await?
            .ok_or_else(|| StorageError::VariantNotFound {
                variant_id: id.to_string(),
            })
    }

    async fn list_variants(&self, round_id: &RoundId) -> StorageResult<Vec<VariantRecord>> {
        self.variants_where(
            "SELECT * FROM variants WHERE round_id = $rid",
            vec![("rid", Bind::from(json!(round_id.to_string())))],
        )
        .await
    }

    async fn children_of(&self, parent_id: &VariantId) -> StorageResult<Vec<VariantRecord>> {
        self.variants_where(
            "SELECT * FROM variants WHERE parent_id = $pid",
            vec![("pid", Bind::from(json!(parent_id.to_string())))],
        )
        .await
    }

    async fn list_campaign_variants(
        &self,
        campaign_id: &CampaignId,
    ) -> StorageResult<Vec<VariantRecord>> {
        self.variants_where(
            "SELECT * FROM variants WHERE campaign_id = $cid",
            vec![("cid", Bind::from(json!(campaign_id.to_string())))],
        )
        .await
    }

    async fn mark_selected(
        &self,
        round_id: &RoundId,
        ids: &[VariantId],
    ) -> StorageResult<Vec<VariantRecord>> {
        let population = self.list_variants(round_id).await?;
        if check_selection(round_id, &population, ids)? && !ids.is_empty() {
            let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            let _: Vec<VariantRow> = self
                .rows(
                    "UPDATE variants SET selected = true \
                     WHERE round_id = $rid AND variant_id INSIDE $ids RETURN AFTER",
                    vec![
                        ("rid", Bind::from(json!(round_id.to_string()))),
                        ("ids", Bind::from(json!(id_strings))),
                    ],
                )
                .await?;
        }
        self.list_selected(round_id).await
    }

    async fn list_selected(&self, round_id: &RoundId) -> StorageResult<Vec<VariantRecord>> {
        self.variants_where(
            "SELECT * FROM variants WHERE round_id = $rid AND selected = true",
            vec![("rid", Bind::from(json!(round_id.to_string())))],
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// EvaluationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EvaluationStore for SurrealRepository {
    async fn create_evaluation(
        &self,
        variant_id: &VariantId,
        round_id: &RoundId,
        evaluator_kind: &str,
    ) -> StorageResult<EvaluationRecord> {
        let find = || async {
            self.evaluations_where(
                "SELECT * FROM evaluations WHERE variant_id = $vid AND evaluator_kind = $kind",
                vec![
                    ("vid", Bind::from(json!(variant_id.to_string()))),
                    ("kind", Bind::from(json!(evaluator_kind))),
                ],
            )
            .await
            .map(|v| v.into_iter().next())
        };

        if let Some(existing) = find().await? {
            return Ok(existing);
        }
        if self.fetch_variant(variant_id).await?.is_none() {
            return Err(StorageError::VariantNotFound {
                variant_id: variant_id.to_string(),
            });
        }

        let record = EvaluationRecord::new(*variant_id, *round_id, evaluator_kind, Utc::now());
        let created: Result<Option<EvaluationRow>, _> = self
            .db
            .create("evaluations")
            .content(EvaluationRow::from_record(&record))
            .await;
        match created {
            Ok(_) => Ok(record),
            Err(e) if is_unique_violation(&e) => find().await?.ok_or_else(|| backend(e)),
            Err(e) => Err(backend(e)),
        }
    }

    async fn start_evaluation(&self, id: &EvaluationId) -> StorageResult<EvaluationRecord> {
        let rows: Vec<EvaluationRow> = self
            .rows(
                "UPDATE evaluations SET status = 'running', started_at = $now \
                 WHERE evaluation_id = $eid AND status = 'pending' RETURN AFTER",
                vec![
                    ("eid", Bind::from(json!(id.to_string()))),
                    ("now", Bind::from(dt(Utc::now()))),
                ],
            )
            .await?;
        if let Some(row) = rows.into_iter().next() {
            return row.into_record();
        }
        let current = self.fetch_evaluation(id).await?;
        if current.status == EvaluationStatus::Running {
            return Ok(current);
        }
        Err(StorageError::InvalidTransition {
            entity: "evaluation",
            from: current.status.as_str().to_string(),
            to: "running".to_string(),
        })
    }

    async fn complete_evaluation(
        &self,
        id: &EvaluationId,
        score: f64,
        payload: Value,
        fallback_from: Option<String>,
    ) -> StorageResult<EvaluationRecord> {
        let mut updated = self.fetch_evaluation(id).await?;
        updated.score = Some(score.clamp(0.0, 1.0));
        updated.payload = payload;
        updated.fallback_from = fallback_from;
        updated.completed_at = Some(Utc::now());
        self.finish_evaluation(id, updated, EvaluationStatus::Completed)
            .await
    }

    async fn fail_evaluation(
        &self,
        id: &EvaluationId,
        error: String,
        payload: Value,
    ) -> StorageResult<EvaluationRecord> {
        let mut updated = self.fetch_evaluation(id).await?;
        updated.score = None;
        updated.error = Some(error);
        updated.payload = payload;
        updated.completed_at = Some(Utc::now());
        self.finish_evaluation(id, updated, EvaluationStatus::Failed)
            .await
    }

    async fn list_evaluations(&self, round_id: &RoundId) -> StorageResult<Vec<EvaluationRecord>> {
        self.evaluations_where(
            "SELECT * FROM evaluations WHERE round_id = $rid",
            vec![("rid", Bind::from(json!(round_id.to_string())))],
        )
        .await
    }

    async fn evaluations_for_variant(
        &self,
        variant_id: &VariantId,
    ) -> StorageResult<Vec<EvaluationRecord>> {
        self.evaluations_where(
            "SELECT * FROM evaluations WHERE variant_id = $vid",
            vec![("vid", Bind::from(json!(variant_id.to_string())))],
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PolicyStore for SurrealRepository {
    async fn append_policy(
        &self,
        campaign_id: &CampaignId,
        name: &str,
        config: SelectionConfig,
    ) -> StorageResult<PolicyRecord> {
        self.fetch_campaign(campaign_id).await?;
        let version = self
            .policies_for(campaign_id, name)
            .await?
            .last()
            .map_or(0, |p| p.version)
            + 1;

        let record = PolicyRecord {
            id: PolicyId::new(),
            campaign_id: *campaign_id,
            name: name.to_string(),
            version,
            config,
            active: true,
            created_at: Utc::now(),
        };
        // The (campaign_id, name, version) index rejects a concurrent append
        // of the same version.
        let _created: Option<PolicyRow> = self
            .db
            .create("policies")
            .content(PolicyRow::from_record(&record)?)
            .await
            .map_err(backend)?;

        let _: Vec<PolicyRow> = self
            .rows(
                "UPDATE policies SET active = false \
                 WHERE campaign_id = $cid AND name = $name AND version < $version RETURN AFTER",
                vec![
                    ("cid", Bind::from(json!(campaign_id.to_string()))),
                    ("name", Bind::from(json!(name))),
                    ("version", Bind::from(json!(version))),
                ],
            )
            .await?;
        Ok(record)
    }

    async fn get_policy(&self, id: &PolicyId) -> StorageResult<PolicyRecord> {
        self.first::<PolicyRow>(
            "SELECT * FROM policies WHERE policy_id = $pid",
            vec![("pid", Bind::from(json!(id.to_string())))],
        )
        .await?
        .ok_or_else(|| StorageError::PolicyNotFound {
            policy_id: id.to_string(),
        })?
        .into_record()
    }

    async fn latest_policy(
        &self,
        campaign_id: &CampaignId,
        name: &str,
    ) -> StorageResult<Option<PolicyRecord>> {
        Ok(self.policies_for(campaign_id, name).await?.pop())
    }

    async fn policy_history(
        &self,
        campaign_id: &CampaignId,
        name: &str,
    ) -> StorageResult<Vec<PolicyRecord>> {
        self.policies_for(campaign_id, name).await
    }
}

// ---------------------------------------------------------------------------
// DecisionLog
// ---------------------------------------------------------------------------

#[async_trait]
impl DecisionLog for SurrealRepository {
    async fn append_decision(&self, new: NewDecision) -> StorageResult<DecisionRecord> {
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
        let _created: Option<DecisionRow> = self
            .db
            .create("decisions")
            .content(DecisionRow::from_record(&record))
            .await
            .map_err(backend)?;
        Ok(record)
    }

    async fn decisions_by_trace(&self, trace_id: &TraceId) -> StorageResult<Vec<DecisionRecord>> {
        self.decisions_where(
            "SELECT * FROM decisions WHERE trace_id = $tid",
            vec![("tid", Bind::from(json!(trace_id.to_string())))],
        )
        .await
    }

    async fn decisions_by_round(&self, round_id: &RoundId) -> StorageResult<Vec<DecisionRecord>> {
        self.decisions_where(
            "SELECT * FROM decisions WHERE round_id = $rid",
            vec![("rid", Bind::from(json!(round_id.to_string())))],
        )
        .await
    }
}
