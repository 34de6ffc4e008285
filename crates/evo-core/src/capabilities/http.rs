//! JSON-over-HTTP capability client.
//!
//! One external service implements all four capabilities:
//! `POST {base}/plan`, `/generate`, `/evaluate` and `/summarize`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evo_state::{CampaignConfig, RoundResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    Candidate, CapabilityError, CapabilityResult, Capabilities, EvaluationOutput,
    EvaluationRequest, Evaluator, EvaluatorRegistry, GenerationRequest, Generator, Planner,
    Reporter,
};

/// Client for an external capability service
#[derive(Clone)]
pub struct HttpCapabilities {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Serialize)]
struct PlanRequest<'a> {
    config: &'a CampaignConfig,
    round_number: u32,
    prior: Option<&'a RoundResult>,
}

impl HttpCapabilities {
    /// `timeout` bounds each HTTP request; the orchestrator applies its own
    /// per-call timeout on top.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> CapabilityResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("evo/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| CapabilityError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Use this client for every capability and every evaluator kind.
    pub fn into_capabilities(self) -> Capabilities {
        let shared = Arc::new(self);
        Capabilities::new(
            shared.clone(),
            shared.clone(),
            EvaluatorRegistry::new().with_default(shared.clone()),
            shared,
        )
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> CapabilityResult<T> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "capability request");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CapabilityError::Unavailable(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Failed(format!("{url} returned {status}: {text}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| CapabilityError::InvalidOutput(format!("{url}: {e}")))
    }
}

fn map_reqwest(err: reqwest::Error) -> CapabilityError {
    if err.is_timeout() {
        CapabilityError::Failed(format!("request timed out: {err}"))
    } else if err.is_connect() {
        CapabilityError::Unavailable(err.to_string())
    } else {
        CapabilityError::Failed(err.to_string())
    }
}

#[async_trait]
impl Planner for HttpCapabilities {
    async fn plan(
        &self,
        config: &CampaignConfig,
        round_number: u32,
        prior: Option<&RoundResult>,
    ) -> CapabilityResult<serde_json::Value> {
        self.post(
            "plan",
            &PlanRequest {
                config,
                round_number,
                prior,
            },
        )
        .await
    }
}

#[async_trait]
impl Generator for HttpCapabilities {
    async fn generate(&self, request: &GenerationRequest) -> CapabilityResult<Vec<Candidate>> {
        let response: GenerateResponse = self.post("generate", request).await?;
        Ok(response.candidates)
    }
}

#[async_trait]
impl Evaluator for HttpCapabilities {
    async fn evaluate(&self, request: &EvaluationRequest) -> CapabilityResult<EvaluationOutput> {
        let output: EvaluationOutput = self.post("evaluate", request).await?;
        if !output.score.is_finite() {
            return Err(CapabilityError::InvalidOutput(format!(
                "non-finite score from {}",
                request.evaluator_kind
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl Reporter for HttpCapabilities {
    async fn summarize(&self, result: &RoundResult) -> CapabilityResult<serde_json::Value> {
        self.post("summarize", &json!({ "result": result })).await
    }
}
