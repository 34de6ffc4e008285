//! Round pipeline: planning, generation, evaluation, selection, reporting.
//!
//! - `stages`: the [`Stage`] trait, the five built-in stages and the registry
//! - `worker`: bounded concurrent units and retried capability calls
//! - `orchestrator`: drives a round through the state machine

pub mod orchestrator;
pub mod stages;
pub mod worker;

use std::sync::Arc;

use evo_state::RoundStatus;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use orchestrator::Orchestrator;
pub use stages::{RoundContext, Stage, StageOutput, StageRegistry};

/// One pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Planning,
    Generation,
    Evaluation,
    Selection,
    Reporting,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Planning,
        StageKind::Generation,
        StageKind::Evaluation,
        StageKind::Selection,
        StageKind::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Planning => "planning",
            StageKind::Generation => "generation",
            StageKind::Evaluation => "evaluation",
            StageKind::Selection => "selection",
            StageKind::Reporting => "reporting",
        }
    }

    /// The stage that runs while a round is in `status`.
    pub fn for_status(status: RoundStatus) -> Option<StageKind> {
        match status {
            RoundStatus::Planning => Some(StageKind::Planning),
            RoundStatus::Generating => Some(StageKind::Generation),
            RoundStatus::Evaluating => Some(StageKind::Evaluation),
            RoundStatus::Selecting => Some(StageKind::Selection),
            RoundStatus::Reporting => Some(StageKind::Reporting),
            RoundStatus::Pending | RoundStatus::Completed | RoundStatus::Failed => None,
        }
    }

    /// Position in the pipeline, 0-based.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress callback, called with a fraction in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Cancellation and progress reporting for one execution.
#[derive(Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl RunControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report(&self, fraction: f64) {
        if let Some(progress) = &self.progress {
            progress(fraction.clamp(0.0, 1.0));
        }
    }

    /// A control whose progress maps `[0, 1]` onto `[start, start + width]`
    /// of this one; cancellation is shared.
    pub fn scaled(&self, start: f64, width: f64) -> RunControl {
        let progress = self.progress.clone().map(|outer| {
            Arc::new(move |f: f64| outer(start + width * f.clamp(0.0, 1.0))) as ProgressFn
        });
        RunControl {
            cancel: self.cancel.clone(),
            progress,
        }
    }
}
