//! Engine-level error taxonomy.
//!
//! Every error answers two questions for the caller: which class of failure
//! it is ([`ErrorKind`]) and whether retrying the same request can succeed.

use evo_state::{RoundStatus, StorageError};
use serde::{Deserialize, Serialize};

use crate::capabilities::CapabilityError;
use crate::pipeline::StageKind;

/// Request rejected before any state change.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderingError {
    #[error("campaign {campaign_id} is {status}, not active")]
    CampaignNotActive { campaign_id: String, status: String },

    #[error("round {requested} requested, next round is {expected}")]
    OutOfOrder { requested: u32, expected: u32 },

    #[error("campaign {campaign_id} has round {round_number} in progress")]
    RoundInProgress {
        campaign_id: String,
        round_number: u32,
    },

    #[error("round {requested} is beyond max_rounds {max_rounds}")]
    BeyondMaxRounds { requested: u32, max_rounds: u32 },
}

/// Coarse classification used by job snapshots and the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Ordering,
    NotFound,
    Config,
    Capability,
    Stage,
    Invariant,
    Infrastructure,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Ordering => "ordering",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Config => "config",
            ErrorKind::Capability => "capability",
            ErrorKind::Stage => "stage",
            ErrorKind::Invariant => "invariant",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("ordering error: {0}")]
    Ordering(#[from] OrderingError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{stage} capability failed: {source}")]
    Capability {
        stage: StageKind,
        #[source]
        source: CapabilityError,
    },

    #[error("generation produced no viable variants for round {round_number}")]
    NoViableVariants { round_number: u32 },

    #[error("round {round_number} has no selected parents to breed from")]
    NoSelectedParents { round_number: u32 },

    #[error("internal consistency error: {0}")]
    Invariant(String),

    #[error("round {round_id} failed in {stage}: {message}")]
    RoundFailed {
        round_id: String,
        stage: String,
        message: String,
    },

    #[error("round {round_id} left {status} after cancellation")]
    Cancelled { round_id: String, status: RoundStatus },

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CampaignNotFound { campaign_id } => EngineError::NotFound {
                entity: "campaign",
                id: campaign_id,
            },
            StorageError::RoundNotFound { round_id } => EngineError::NotFound {
                entity: "round",
                id: round_id,
            },
            StorageError::VariantNotFound { variant_id } => EngineError::NotFound {
                entity: "variant",
                id: variant_id,
            },
            StorageError::EvaluationNotFound { evaluation_id } => EngineError::NotFound {
                entity: "evaluation",
                id: evaluation_id,
            },
            StorageError::PolicyNotFound { policy_id } => EngineError::NotFound {
                entity: "policy",
                id: policy_id,
            },
            StorageError::RoundOutOfOrder {
                requested,
                expected,
            } => EngineError::Ordering(OrderingError::OutOfOrder {
                requested,
                expected,
            }),
            StorageError::ActiveRoundExists {
                campaign_id,
                round_number,
            } => EngineError::Ordering(OrderingError::RoundInProgress {
                campaign_id,
                round_number,
            }),
            StorageError::LineageViolation(msg) => EngineError::Invariant(msg),
            other => EngineError::Storage(other),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Ordering(_) => ErrorKind::Ordering,
            EngineError::InvalidConfig(_) => ErrorKind::Config,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Capability { .. } => ErrorKind::Capability,
            EngineError::NoViableVariants { .. } | EngineError::NoSelectedParents { .. } => {
                ErrorKind::Stage
            }
            EngineError::RoundFailed { .. } => ErrorKind::Stage,
            EngineError::Invariant(_) => ErrorKind::Invariant,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
            EngineError::Storage(e) if e.is_infrastructure() => ErrorKind::Infrastructure,
            EngineError::Storage(StorageError::InvalidTransition { .. })
            | EngineError::Storage(StorageError::StaleState { .. })
            | EngineError::Storage(StorageError::DuplicateRound { .. })
            | EngineError::Storage(StorageError::SelectionConflict { .. }) => ErrorKind::Ordering,
            EngineError::Storage(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether resubmitting the same request may succeed later.
    ///
    /// Only infrastructure failures and cancellation leave the round
    /// resumable. Every other kind either needs different arguments or has
    /// already marked the round failed, including capability errors whose
    /// transient retries ran out.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Infrastructure | ErrorKind::Cancelled
        )
    }

    /// Pipeline stage the failure is attributed to, when there is one.
    pub fn stage(&self) -> Option<String> {
        match self {
            EngineError::Capability { stage, .. } => Some(stage.as_str().to_string()),
            EngineError::NoViableVariants { .. } => Some(StageKind::Generation.as_str().to_string()),
            EngineError::NoSelectedParents { .. } => {
                Some(StageKind::Generation.as_str().to_string())
            }
            EngineError::RoundFailed { stage, .. } => Some(stage.clone()),
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_maps_to_not_found() {
        let err: EngineError = StorageError::CampaignNotFound {
            campaign_id: "c1".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("campaign not found"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn out_of_order_round_is_ordering() {
        let err: EngineError = StorageError::RoundOutOfOrder {
            requested: 5,
            expected: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Ordering);
        assert!(err.to_string().contains("next round is 2"));
    }

    #[test]
    fn backend_failure_is_retryable_infrastructure() {
        let err: EngineError = StorageError::Backend("connection reset".into()).into();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.is_retryable());
    }

    #[test]
    fn lineage_violation_is_invariant() {
        let err: EngineError = StorageError::LineageViolation("cycle".into()).into();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert!(!err.is_retryable());
    }

    #[test]
    fn exhausted_transient_capability_error_is_not_retryable() {
        let err = EngineError::Capability {
            stage: StageKind::Planning,
            source: CapabilityError::Unavailable("503".into()),
        };
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(!err.is_retryable());
    }

    #[test]
    fn no_viable_variants_names_generation_stage() {
        let err = EngineError::NoViableVariants { round_number: 0 };
        assert_eq!(err.kind(), ErrorKind::Stage);
        assert_eq!(err.stage().as_deref(), Some("generation"));
    }
}
