//! Evo-State: durable records for the Evo campaign engine
//!
//! This crate is the repository layer: the only writer of durable state.
//! Everything the engine knows about campaigns, rounds, variants,
//! evaluations, policies and decisions goes through the traits in
//! [`storage_traits`].
//!
//! ## Key Components
//!
//! - `Repository`: every store trait in one object
//! - `MemoryRepository`: in-process backend (tests, demos)
//! - `SurrealRepository`: SurrealDB backend (memory, surrealkv, remote)
//! - `records`: backend-agnostic entity types and their lifecycle rules

mod campaign_config;
mod error;
pub mod fakes;
mod handle;
mod ids;
pub mod migrations;
pub mod records;
mod schema;
pub mod storage_traits;
pub mod surreal_repository;

pub use campaign_config::{
    CampaignConfig, EvaluatorSpec, SelectionConfig, SelectionStrategy, SELECTION_POLICY,
};
pub use error::{StateError, StorageError};
pub use fakes::MemoryRepository;
pub use handle::{connect_from_env, connect_remote, connect_url, SurrealConfig};
pub use ids::{
    CampaignId, ContentFingerprint, DecisionId, EvaluationId, PolicyId, RoundId, TraceId,
    VariantId,
};
pub use records::{
    CampaignFilter, CampaignRecord, CampaignStatus, DecisionRecord, EvaluationRecord,
    EvaluationStatus, InsertOutcome, MutationDescriptor, NewCampaign, NewDecision, NewRound,
    NewVariant, PolicyRecord, RoundFailure, RoundPatch, RoundRecord, RoundResult, RoundStatus,
    VariantRecord,
};
pub use storage_traits::{
    CampaignStore, DecisionLog, EvaluationStore, PolicyStore, Repository, RoundStore,
    StorageResult, VariantStore,
};
pub use surreal_repository::SurrealRepository;

/// Result type for connection and schema setup
pub type Result<T> = std::result::Result<T, StateError>;
