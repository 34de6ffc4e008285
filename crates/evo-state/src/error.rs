//! Error types for evo-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the repository traits.
///
/// Variants are grouped by how a caller should react: not-found and
/// ordering/conflict errors are rejected before any write, lineage
/// violations are integrity failures, and `Backend` means the store
/// itself is unavailable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("campaign not found: {campaign_id}")]
    CampaignNotFound { campaign_id: String },

    #[error("round not found: {round_id}")]
    RoundNotFound { round_id: String },

    #[error("variant not found: {variant_id}")]
    VariantNotFound { variant_id: String },

    #[error("evaluation not found: {evaluation_id}")]
    EvaluationNotFound { evaluation_id: String },

    #[error("policy not found: {policy_id}")]
    PolicyNotFound { policy_id: String },

    #[error("invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Compare-and-set lost: the persisted status moved on.
    #[error("round {round_id} is {actual}, expected {expected}")]
    StaleState {
        round_id: String,
        expected: String,
        actual: String,
    },

    #[error("round {requested} requested but next round is {expected}")]
    RoundOutOfOrder { requested: u32, expected: u32 },

    #[error("campaign {campaign_id} already has round {round_number} in progress")]
    ActiveRoundExists {
        campaign_id: String,
        round_number: u32,
    },

    #[error("round {campaign_id}/{round_number} already exists")]
    DuplicateRound {
        campaign_id: String,
        round_number: u32,
    },

    #[error("lineage violation: {0}")]
    LineageViolation(String),

    #[error("round {round_id} already has a different selection")]
    SelectionConflict { round_id: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True when the error says nothing about the data and the same call may
    /// succeed later.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, StorageError::Backend(_) | StorageError::Serialization(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
