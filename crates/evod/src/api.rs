//! HTTP surface of the daemon.
//!
//! Campaign management and lineage queries answer synchronously. Round and
//! campaign execution is submitted to the [`JobManager`] and answered with
//! `202 Accepted` plus a job snapshot to poll.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use evo_core::{
    CampaignService, EngineError, ErrorKind, JobFilter, JobId, JobManager, Lineage, VariantQuery,
    METRICS, VERSION,
};
use evo_state::{
    CampaignConfig, CampaignFilter, CampaignId, CampaignStatus, DecisionLog, Repository, RoundId,
    RoundStore, SelectionConfig, TraceId, VariantId, VariantStore,
};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub campaigns: CampaignService,
    pub jobs: JobManager,
}

impl AppState {
    pub fn new(jobs: JobManager) -> Self {
        let repo = jobs.orchestrator().repository().clone();
        Self {
            campaigns: CampaignService::new(repo.clone()),
            repo,
            jobs,
        }
    }

    fn lineage(&self) -> &Arc<Lineage> {
        self.jobs.orchestrator().lineage()
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub description: Option<String>,
    pub config: CampaignConfig,
}

#[derive(Deserialize, Default)]
pub struct ListCampaignsQuery {
    pub status: Option<CampaignStatus>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
    job: evo_core::JobSnapshot,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    NotFound(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<evo_state::StorageError> for ApiError {
    fn from(err: evo_state::StorageError) -> Self {
        ApiError::Engine(err.into())
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Ordering => StatusCode::CONFLICT,
        ErrorKind::Config => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Engine(err) => {
                let kind = err.kind();
                let status = status_for(kind);
                if status.is_server_error() {
                    warn!(kind = %kind, error = %err, "request failed");
                }
                (status, kind, err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorKind::NotFound, msg),
        };
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route("/campaigns/{id}", get(get_campaign).delete(delete_campaign))
        .route("/campaigns/{id}/start", post(start_campaign))
        .route("/campaigns/{id}/pause", post(pause_campaign))
        .route("/campaigns/{id}/resume", post(resume_campaign))
        .route("/campaigns/{id}/stats", get(campaign_stats))
        .route("/campaigns/{id}/rounds", get(list_rounds))
        .route("/campaigns/{id}/policy", get(policy_history).put(update_policy))
        .route("/campaigns/{id}/rounds/{n}", get(round_detail))
        .route("/campaigns/{id}/rounds/{n}/execute", post(execute_round))
        .route("/campaigns/{id}/execute", post(execute_campaign))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/variants/{id}", get(get_variant))
        .route("/variants/{id}/evaluations", get(variant_evaluations))
        .route("/variants/{id}/lineage", get(variant_lineage))
        .route("/variants/{id}/descendants", get(variant_descendants))
        .route("/variants/{a}/compare/{b}", get(compare_variants))
        .route("/rounds/{id}/variants", get(round_variants))
        .route("/rounds/{id}/decisions", get(round_decisions))
        .route("/traces/{id}/decisions", get(trace_decisions))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": VERSION }))
}

async fn metrics() -> impl IntoResponse {
    Json(METRICS.snapshot())
}

async fn create_campaign(
    State(state): State<SharedState>,
    Json(req): Json<CreateCampaignRequest>,
) -> ApiResult<impl IntoResponse> {
    let campaign = state
        .campaigns
        .create(req.name, req.description, req.config)
        .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn list_campaigns(
    State(state): State<SharedState>,
    Query(query): Query<ListCampaignsQuery>,
) -> ApiResult<impl IntoResponse> {
    let campaigns = state
        .campaigns
        .list(CampaignFilter {
            status: query.status,
            include_deleted: query.include_deleted,
        })
        .await?;
    Ok(Json(campaigns))
}

async fn get_campaign(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.get(&id).await?))
}

async fn delete_campaign(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    state.campaigns.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_campaign(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.start(&id).await?))
}

async fn pause_campaign(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.pause(&id).await?))
}

async fn resume_campaign(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.resume(&id).await?))
}

async fn campaign_stats(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.stats(&id).await?))
}

async fn list_rounds(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    state.campaigns.get(&id).await?;
    Ok(Json(state.repo.list_rounds(&id).await?))
}

async fn round_detail(
    State(state): State<SharedState>,
    Path((id, n)): Path<(CampaignId, u32)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.round_detail(&id, n).await?))
}

async fn policy_history(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    state.campaigns.get(&id).await?;
    Ok(Json(state.campaigns.policy_history(&id).await?))
}

async fn update_policy(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
    Json(config): Json<SelectionConfig>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.update_selection_policy(&id, config).await?))
}

async fn execute_round(
    State(state): State<SharedState>,
    Path((id, n)): Path<(CampaignId, u32)>,
) -> ApiResult<impl IntoResponse> {
    // Unknown campaigns are answered now rather than as a failed job.
    state.campaigns.get(&id).await?;
    let job = state.jobs.submit_round(id, n);
    debug!(job_id = %job.id, campaign_id = %id, round = n, "round job accepted");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn execute_campaign(
    State(state): State<SharedState>,
    Path(id): Path<CampaignId>,
) -> ApiResult<impl IntoResponse> {
    state.campaigns.get(&id).await?;
    let job = state.jobs.submit_campaign(id);
    debug!(job_id = %job.id, campaign_id = %id, "campaign job accepted");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(filter): Query<JobFilter>,
) -> impl IntoResponse {
    Json(state.jobs.list(&filter))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<JobId>,
) -> ApiResult<impl IntoResponse> {
    state
        .jobs
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {id}")))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<JobId>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state.jobs.cancel(&id);
    let job = state
        .jobs
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {id}")))?;
    Ok(Json(CancelResponse { cancelled, job }))
}

async fn get_variant(
    State(state): State<SharedState>,
    Path(id): Path<VariantId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.repo.get_variant(&id).await?))
}

async fn variant_evaluations(
    State(state): State<SharedState>,
    Path(id): Path<VariantId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.variant_evaluations(&id).await?))
}

async fn variant_lineage(
    State(state): State<SharedState>,
    Path(id): Path<VariantId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.lineage().lineage_view(&id).await?))
}

async fn variant_descendants(
    State(state): State<SharedState>,
    Path(id): Path<VariantId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.lineage().get_descendants(&id).await?))
}

async fn compare_variants(
    State(state): State<SharedState>,
    Path((a, b)): Path<(VariantId, VariantId)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.lineage().compare(&a, &b).await?))
}

async fn round_variants(
    State(state): State<SharedState>,
    Path(id): Path<RoundId>,
    Query(query): Query<VariantQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.campaigns.round_variants(&id, query).await?))
}

async fn round_decisions(
    State(state): State<SharedState>,
    Path(id): Path<RoundId>,
) -> ApiResult<impl IntoResponse> {
    state.repo.get_round(&id).await?;
    Ok(Json(state.repo.decisions_by_round(&id).await?))
}

async fn trace_decisions(
    State(state): State<SharedState>,
    Path(id): Path<TraceId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.repo.decisions_by_trace(&id).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use evo_core::capabilities::demo;
    use evo_core::{EngineConfig, JobSnapshot, JobStatus, Orchestrator};
    use evo_state::{EvaluatorSpec, MemoryRepository};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let repo = Arc::new(MemoryRepository::new());
        let orch = Orchestrator::new(repo, demo::capabilities(), EngineConfig::fast());
        Arc::new(AppState::new(JobManager::new(orch)))
    }

    fn test_app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn send_json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn campaign_body(max_rounds: u32) -> serde_json::Value {
        json!({
            "name": "api",
            "config": {
                "max_rounds": max_rounds,
                "variants_per_round": 3,
                "evaluators": [EvaluatorSpec::new("quality")],
                "selection": { "strategy": "top_k", "k": 1 },
                "seed": 3,
                "initial_population": ["seed"]
            }
        })
    }

    async fn active_campaign(app: &Router, max_rounds: u32) -> CampaignId {
        let resp = app
            .clone()
            .oneshot(send_json("POST", "/campaigns", campaign_body(max_rounds)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: serde_json::Value = body_json(resp.into_body()).await;
        let id: CampaignId = created["id"].as_str().unwrap().parse().unwrap();

        let resp = app
            .clone()
            .oneshot(post(&format!("/campaigns/{id}/start")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        id
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app(test_state());
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], VERSION);
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let app = test_app(test_state());
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["rounds_started"].is_u64());
    }

    #[tokio::test]
    async fn test_create_and_list_campaigns() {
        let app = test_app(test_state());
        let id = active_campaign(&app, 2).await;

        let response = app.clone().oneshot(get("/campaigns")).await.unwrap();
        let list: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["status"], "active");

        let response = app
            .oneshot(get("/campaigns?status=draft"))
            .await
            .unwrap();
        let list: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(list.is_empty(), "campaign {id} should not be a draft");
    }

    #[tokio::test]
    async fn test_invalid_config_is_unprocessable() {
        let app = test_app(test_state());
        let mut body = campaign_body(2);
        body["config"]["max_rounds"] = json!(0);
        let response = app
            .oneshot(send_json("POST", "/campaigns", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let err: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(err["kind"], "config");
        assert!(err["error"].as_str().unwrap().contains("max_rounds"));
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_not_found() {
        let app = test_app(test_state());
        let response = app
            .oneshot(get(&format!("/campaigns/{}", CampaignId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let err: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(err["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_invalid_transition_is_conflict() {
        let app = test_app(test_state());
        let resp = app
            .clone()
            .oneshot(send_json("POST", "/campaigns", campaign_body(2)))
            .await
            .unwrap();
        let draft: serde_json::Value = body_json(resp.into_body()).await;
        let id = draft["id"].as_str().unwrap();

        let response = app
            .oneshot(post(&format!("/campaigns/{id}/pause")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let err: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(err["kind"], "ordering");
    }

    #[tokio::test]
    async fn test_execute_round_job_and_query_lineage() {
        let state = test_state();
        let app = test_app(state.clone());
        let id = active_campaign(&app, 2).await;

        let response = app
            .clone()
            .oneshot(post(&format!("/campaigns/{id}/rounds/0/execute")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job: JobSnapshot = body_json(response.into_body()).await;
        let done = state.jobs.wait(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let response = app
            .clone()
            .oneshot(get(&format!("/jobs/{}", job.id)))
            .await
            .unwrap();
        let polled: JobSnapshot = body_json(response.into_body()).await;
        assert_eq!(polled.status, JobStatus::Completed);
        assert_eq!(polled.progress, 1.0);

        let response = app
            .clone()
            .oneshot(get(&format!("/campaigns/{id}/rounds")))
            .await
            .unwrap();
        let rounds: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(rounds.len(), 1);
        let round_id = rounds[0]["id"].as_str().unwrap().to_string();
        let trace_id = rounds[0]["trace_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(get(&format!("/traces/{trace_id}/decisions")))
            .await
            .unwrap();
        let decisions: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(decisions.len(), 5);

        let response = app
            .clone()
            .oneshot(get(&format!("/rounds/{round_id}/decisions")))
            .await
            .unwrap();
        let by_round: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(by_round.len(), 5);

        let selected = done.result.unwrap()["selected_ids"][0]
            .as_str()
            .unwrap()
            .to_string();
        let response = app
            .clone()
            .oneshot(get(&format!("/variants/{selected}/lineage")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(view["generation_count"], 1);

        let response = app
            .oneshot(get(&format!("/variants/{selected}/compare/{selected}")))
            .await
            .unwrap();
        let relation: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(relation["kind"], "same");
    }

    #[tokio::test]
    async fn test_round_detail_variants_and_evaluations() {
        let state = test_state();
        let app = test_app(state.clone());
        let id = active_campaign(&app, 2).await;

        let response = app
            .clone()
            .oneshot(post(&format!("/campaigns/{id}/rounds/0/execute")))
            .await
            .unwrap();
        let job: JobSnapshot = body_json(response.into_body()).await;
        let done = state.jobs.wait(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let response = app
            .clone()
            .oneshot(get(&format!("/campaigns/{id}/rounds/0")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(detail["round"]["status"], "completed");
        assert_eq!(detail["stats"]["population"], 3);
        assert_eq!(detail["stats"]["selected"], 1);
        assert_eq!(detail["stats"]["evaluations_completed"], 3);
        assert_eq!(detail["policy"]["version"], 1);
        let round_id = detail["round"]["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(get(&format!("/campaigns/{id}/rounds/1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(get(&format!("/rounds/{round_id}/variants")))
            .await
            .unwrap();
        let all: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(all.len(), 3);

        let response = app
            .clone()
            .oneshot(get(&format!(
                "/rounds/{round_id}/variants?selected_only=true&generation=0"
            )))
            .await
            .unwrap();
        let selected: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["selected"], true);

        let response = app
            .clone()
            .oneshot(get(&format!("/rounds/{round_id}/variants?generation=1")))
            .await
            .unwrap();
        let none: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(none.is_empty());

        let variant_id = selected[0]["id"].as_str().unwrap();
        let response = app
            .clone()
            .oneshot(get(&format!("/variants/{variant_id}/evaluations")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let evals: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0]["evaluator_kind"], "quality");
        assert_eq!(evals[0]["status"], "completed");

        let response = app
            .oneshot(get(&format!("/variants/{}/evaluations", VariantId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_variants_of_unknown_round_is_not_found() {
        let app = test_app(test_state());
        let response = app
            .oneshot(get(&format!("/rounds/{}/variants", RoundId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_execute_for_unknown_campaign_is_not_found() {
        let app = test_app(test_state());
        let response = app
            .oneshot(post(&format!(
                "/campaigns/{}/rounds/0/execute",
                CampaignId::new()
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_campaign_job_and_job_listing() {
        let state = test_state();
        let app = test_app(state.clone());
        let id = active_campaign(&app, 2).await;

        let response = app
            .clone()
            .oneshot(post(&format!("/campaigns/{id}/execute")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job: JobSnapshot = body_json(response.into_body()).await;
        state.jobs.wait(&job.id).await.unwrap();

        let response = app
            .clone()
            .oneshot(get(&format!("/jobs?campaign_id={id}&status=completed")))
            .await
            .unwrap();
        let jobs: Vec<JobSnapshot> = body_json(response.into_body()).await;
        assert_eq!(jobs.len(), 1);

        let response = app
            .clone()
            .oneshot(get(&format!("/campaigns/{id}/stats")))
            .await
            .unwrap();
        let stats: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(stats["status"], "completed");
        assert_eq!(stats["completed_rounds"], 2);

        let response = app
            .oneshot(post(&format!("/jobs/{}/cancel", job.id)))
            .await
            .unwrap();
        let cancel: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(cancel["cancelled"], false);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let app = test_app(test_state());
        let response = app
            .oneshot(post(&format!("/jobs/{}/cancel", JobId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_policy_update_appends_version() {
        let app = test_app(test_state());
        let id = active_campaign(&app, 3).await;

        let response = app
            .clone()
            .oneshot(send_json(
                "PUT",
                &format!("/campaigns/{id}/policy"),
                json!({ "strategy": "tournament", "k": 2 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let policy: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(policy["version"], 2);

        let response = app
            .oneshot(get(&format!("/campaigns/{id}/policy")))
            .await
            .unwrap();
        let history: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_campaign_disappears() {
        let app = test_app(test_state());
        let id = active_campaign(&app, 1).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/campaigns/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(get(&format!("/campaigns/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get("/campaigns?include_deleted=true"))
            .await
            .unwrap();
        let list: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(list.len(), 1);
    }
}
