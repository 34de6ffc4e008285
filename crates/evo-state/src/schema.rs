//! SurrealDB row types
//!
//! Ids and enum statuses are stored as strings, timestamps as SurrealDB
//! datetimes. Conversion to the backend-agnostic records in `records`
//! happens here and nowhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::campaign_config::CampaignConfig;
use crate::error::StorageError;
use crate::ids::ContentFingerprint;
use crate::records::*;
use crate::storage_traits::StorageResult;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn parse_id<T: std::str::FromStr>(field: &str, raw: &str) -> StorageResult<T> {
    raw.parse()
        .map_err(|_| StorageError::Backend(format!("malformed {field}: {raw}")))
}

fn parse_opt_id<T: std::str::FromStr>(field: &str, raw: &Option<String>) -> StorageResult<Option<T>> {
    raw.as_deref().map(|r| parse_id(field, r)).transpose()
}

fn to_json<T: Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StorageResult<T> {
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// campaigns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Thing>,
    pub campaign_id: String,
    pub name: String,
    pub description: Option<String>,
    /// JSON text; keeps 64-bit seeds exact.
    pub config: String,
    pub status: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CampaignRow {
    pub fn from_record(r: &CampaignRecord) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            campaign_id: r.id.to_string(),
            name: r.name.clone(),
            description: r.description.clone(),
            config: serde_json::to_string(&r.config)?,
            status: r.status.as_str().to_string(),
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
            deleted_at: r.deleted_at,
        })
    }

    pub fn into_record(self) -> StorageResult<CampaignRecord> {
        let status = CampaignStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Backend(format!("unknown campaign status: {}", self.status))
        })?;
        let config: CampaignConfig = serde_json::from_str(&self.config)?;
        Ok(CampaignRecord {
            id: parse_id("campaign_id", &self.campaign_id)?,
            name: self.name,
            description: self.description,
            config,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            deleted_at: self.deleted_at,
        })
    }
}

// ---------------------------------------------------------------------------
// rounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Thing>,
    pub round_id: String,
    pub campaign_id: String,
    pub round_number: u32,
    pub status: String,
    pub trace_id: String,
    pub plan: Option<serde_json::Value>,
    pub policy_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<serde_json::Value>,
    pub lease_owner: Option<String>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RoundRow {
    pub fn from_record(r: &RoundRecord) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            round_id: r.id.to_string(),
            campaign_id: r.campaign_id.to_string(),
            round_number: r.round_number,
            status: r.status.as_str().to_string(),
            trace_id: r.trace_id.to_string(),
            plan: r.plan.clone(),
            policy_id: r.policy_id.map(|p| p.to_string()),
            result: r.result.as_ref().map(to_json).transpose()?,
            failure: r.failure.as_ref().map(to_json).transpose()?,
            lease_owner: r.lease_owner.clone(),
            lease_expires_at: r.lease_expires_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
        })
    }

    pub fn into_record(self) -> StorageResult<RoundRecord> {
        let status = RoundStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Backend(format!("unknown round status: {}", self.status))
        })?;
        Ok(RoundRecord {
            id: parse_id("round_id", &self.round_id)?,
            campaign_id: parse_id("campaign_id", &self.campaign_id)?,
            round_number: self.round_number,
            status,
            trace_id: parse_id("trace_id", &self.trace_id)?,
            plan: self.plan,
            policy_id: parse_opt_id("policy_id", &self.policy_id)?,
            result: self.result.map(from_json).transpose()?,
            failure: self.failure.map(from_json).transpose()?,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Thing>,
    pub variant_id: String,
    pub campaign_id: String,
    pub round_id: String,
    pub parent_id: Option<String>,
    pub generation: u32,
    pub content: String,
    pub content_fingerprint: String,
    pub mutation: Option<serde_json::Value>,
    pub selected: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl VariantRow {
    pub fn from_record(r: &VariantRecord) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            variant_id: r.id.to_string(),
            campaign_id: r.campaign_id.to_string(),
            round_id: r.round_id.to_string(),
            parent_id: r.parent_id.map(|p| p.to_string()),
            generation: r.generation,
            content: r.content.clone(),
            content_fingerprint: r.fingerprint.as_str().to_string(),
            mutation: r.mutation.as_ref().map(to_json).transpose()?,
            selected: r.selected,
            created_at: r.created_at,
        })
    }

    pub fn into_record(self) -> StorageResult<VariantRecord> {
        let fingerprint = ContentFingerprint::from_hex(self.content_fingerprint.clone())
            .ok_or_else(|| {
                StorageError::Backend(format!(
                    "malformed fingerprint: {}",
                    self.content_fingerprint
                ))
            })?;
        Ok(VariantRecord {
            id: parse_id("variant_id", &self.variant_id)?,
            campaign_id: parse_id("campaign_id", &self.campaign_id)?,
            round_id: parse_id("round_id", &self.round_id)?,
            parent_id: parse_opt_id("parent_id", &self.parent_id)?,
            generation: self.generation,
            content: self.content,
            fingerprint,
            mutation: self.mutation.map(from_json).transpose()?,
            selected: self.selected,
            created_at: self.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// evaluations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Thing>,
    pub evaluation_id: String,
    pub variant_id: String,
    pub round_id: String,
    pub evaluator_kind: String,
    pub status: String,
    pub score: Option<f64>,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub fallback_from: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationRow {
    pub fn from_record(r: &EvaluationRecord) -> Self {
        Self {
            id: None,
            evaluation_id: r.id.to_string(),
            variant_id: r.variant_id.to_string(),
            round_id: r.round_id.to_string(),
            evaluator_kind: r.evaluator_kind.clone(),
            status: r.status.as_str().to_string(),
            score: r.score,
            payload: r.payload.clone(),
            error: r.error.clone(),
            fallback_from: r.fallback_from.clone(),
            created_at: r.created_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
        }
    }

    pub fn into_record(self) -> StorageResult<EvaluationRecord> {
        let status = EvaluationStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Backend(format!("unknown evaluation status: {}", self.status))
        })?;
        Ok(EvaluationRecord {
            id: parse_id("evaluation_id", &self.evaluation_id)?,
            variant_id: parse_id("variant_id", &self.variant_id)?,
            round_id: parse_id("round_id", &self.round_id)?,
            evaluator_kind: self.evaluator_kind,
            status,
            score: self.score,
            payload: self.payload,
            error: self.error,
            fallback_from: self.fallback_from,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Thing>,
    pub policy_id: String,
    pub campaign_id: String,
    pub name: String,
    pub version: u32,
    pub config: serde_json::Value,
    pub active: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl PolicyRow {
    pub fn from_record(r: &PolicyRecord) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            policy_id: r.id.to_string(),
            campaign_id: r.campaign_id.to_string(),
            name: r.name.clone(),
            version: r.version,
            config: to_json(&r.config)?,
            active: r.active,
            created_at: r.created_at,
        })
    }

    pub fn into_record(self) -> StorageResult<PolicyRecord> {
        Ok(PolicyRecord {
            id: parse_id("policy_id", &self.policy_id)?,
            campaign_id: parse_id("campaign_id", &self.campaign_id)?,
            name: self.name,
            version: self.version,
            config: from_json(self.config)?,
            active: self.active,
            created_at: self.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Thing>,
    pub decision_id: String,
    pub trace_id: String,
    pub campaign_id: String,
    pub round_id: Option<String>,
    pub variant_id: Option<String>,
    pub stage: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub rationale: String,
    pub confidence: f64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub seq: u64,
}

impl DecisionRow {
    pub fn from_record(r: &DecisionRecord) -> Self {
        Self {
            id: None,
            decision_id: r.id.to_string(),
            trace_id: r.trace_id.to_string(),
            campaign_id: r.campaign_id.to_string(),
            round_id: r.round_id.map(|id| id.to_string()),
            variant_id: r.variant_id.map(|id| id.to_string()),
            stage: r.stage.clone(),
            input: r.input.clone(),
            output: r.output.clone(),
            rationale: r.rationale.clone(),
            confidence: r.confidence,
            created_at: r.created_at,
            seq: r.seq,
        }
    }

    pub fn into_record(self) -> StorageResult<DecisionRecord> {
        Ok(DecisionRecord {
            id: parse_id("decision_id", &self.decision_id)?,
            trace_id: parse_id("trace_id", &self.trace_id)?,
            campaign_id: parse_id("campaign_id", &self.campaign_id)?,
            round_id: parse_opt_id("round_id", &self.round_id)?,
            variant_id: parse_opt_id("variant_id", &self.variant_id)?,
            stage: self.stage,
            input: self.input,
            output: self.output,
            rationale: self.rationale,
            confidence: self.confidence,
            created_at: self.created_at,
            seq: self.seq,
        })
    }
}
