//! Evo Core Library
//!
//! Campaign/round/variant orchestration: the round pipeline, lineage
//! queries, selection strategies, the decision recorder and background jobs.

pub mod campaign;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod jobs;
pub mod lineage;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod recording;
pub mod selection;
pub mod telemetry;

pub use campaign::{CampaignService, CampaignStats, RoundDetail, RoundStats, VariantQuery};
pub use capabilities::{
    Candidate, Capabilities, CapabilityError, CapabilityResult, EvaluationOutput,
    EvaluationRequest, Evaluator, EvaluatorRegistry, GenerationRequest, Generator, Planner,
    Reporter,
};
pub use config::{load_campaign_config, parse_campaign_config, EngineConfig};
pub use error::{EngineError, EngineResult, ErrorKind, OrderingError};
pub use jobs::{JobError, JobFilter, JobId, JobManager, JobSnapshot, JobStatus, JobTarget};
pub use lineage::{Lineage, LineageView, RelationKind, Relationship};
pub use metrics::{MetricsSnapshot, METRICS};
pub use pipeline::{
    Orchestrator, RoundContext, RunControl, Stage, StageKind, StageOutput, StageRegistry,
};
pub use recording::DecisionRecorder;
pub use telemetry::init_tracing;

/// Crate version, reported by `evo --version` and `GET /health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
