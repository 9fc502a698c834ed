//! Thin `axum` HTTP/SSE surface over the coordination core.
//!
//! Grounded on the orchestrator's original `ApiServer` (router assembly,
//! `TraceLayer`/`CorsLayer` wiring, `ApiError`-to-status-code mapping) and on
//! `iridite-tandem`'s `tandem-server/src/http.rs` for the SSE pattern
//! (broadcast-backed `axum::response::sse::Sse`, periodic keep-alive
//! frames). Per SPEC_FULL.md §4.15 this surface is deliberately thin:
//! handlers are direct adapters over `StateStore`, `EscalationQueue`, and
//! `BudgetLedger` reads, not a reimplementation of business logic. The
//! richer route surface from spec.md §6 (`/sandboxes`, `/actions`,
//! `/access-requests`, `/onboarding`, `/zones`) is intentionally left as
//! direct calls into `SandboxManager`, `ActionExecutor`, and `ZoneMatcher`
//! rather than full HTTP handlers.

use crate::auth::{auth_middleware, create_auth_state, AuthState};
use crate::budget::{BudgetLedger, CostSummary};
use crate::bus::EventBus;
use crate::config::ApiConfig;
use crate::constants::SSE_HEARTBEAT_INTERVAL_SECS;
use crate::error::CoreError;
use crate::escalation::EscalationQueue;
use crate::models::{AgentProfile, Project, Task, TaskStatus};
use crate::store::StateStore;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

impl IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub project_id: String,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<EventBus>,
    pub escalations: Arc<EscalationQueue>,
    pub budget: Arc<BudgetLedger>,
}

pub struct ApiServer {
    state: AppState,
    auth_state: Arc<AuthState>,
    api_config: ApiConfig,
}

impl ApiServer {
    pub fn new(state: AppState, api_config: ApiConfig) -> Self {
        let auth_state = create_auth_state(api_config.clone());
        Self {
            state,
            auth_state,
            api_config,
        }
    }

    pub fn router(&self) -> Router {
        let cors = if self.api_config.allowed_origins.is_empty() {
            CorsLayer::new()
        } else {
            let origins: Vec<axum::http::HeaderValue> = self
                .api_config
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        };

        Router::new()
            .route("/health", get(health))
            .route("/project", get(project_summary))
            .route("/events", get(events_stream))
            .route("/agents", get(list_agents))
            .route("/tasks", get(list_tasks))
            .route("/costs", get(costs))
            .layer(middleware::from_fn_with_state(self.auth_state.clone(), auth_middleware))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Binds `api_config.host:port` and serves until the process is killed.
    pub async fn run(&self) -> crate::error::Result<()> {
        let app = self.router();
        let addr = format!("{}:{}", self.api_config.host, self.api_config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoreError::Internal(e.into()))?;

        tracing::info!("API server listening on {addr}");

        axum::serve(listener, app)
            .await
            .map_err(|e| CoreError::Internal(e.into()))?;

        Ok(())
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct TaskCounts {
    total: usize,
    pending: usize,
    claimed: usize,
    in_progress: usize,
    completed: usize,
    failed: usize,
    blocked: usize,
}

#[derive(Debug, Serialize)]
struct AgentCounts {
    total: usize,
    idle: usize,
    working: usize,
    blocked: usize,
    offline: usize,
}

#[derive(Debug, Serialize)]
struct ProjectSummary {
    project: Option<Project>,
    tasks: TaskCounts,
    agents: AgentCounts,
    budget: Option<crate::models::Budget>,
    conflicts: usize,
}

/// `GET /project` returns 200 always; on a store failure it falls back to
/// empty counters rather than surfacing 500, per spec.md §6.
async fn project_summary(State(state): State<AppState>) -> impl IntoResponse {
    let project = state.store.get_project(&state.project_id).await.ok();
    let tasks = state
        .store
        .list_tasks(&state.project_id)
        .await
        .unwrap_or_default();
    let agents = state
        .store
        .list_agents(&state.project_id)
        .await
        .unwrap_or_default();

    let task_counts = TaskCounts {
        total: tasks.len(),
        pending: count_tasks(&tasks, TaskStatus::Pending),
        claimed: count_tasks(&tasks, TaskStatus::Claimed),
        in_progress: count_tasks(&tasks, TaskStatus::InProgress),
        completed: count_tasks(&tasks, TaskStatus::Completed),
        failed: count_tasks(&tasks, TaskStatus::Failed),
        blocked: count_tasks(&tasks, TaskStatus::Blocked),
    };
    let agent_counts = AgentCounts {
        total: agents.len(),
        idle: count_agents(&agents, crate::models::AgentStatus::Idle),
        working: count_agents(&agents, crate::models::AgentStatus::Working),
        blocked: count_agents(&agents, crate::models::AgentStatus::Blocked),
        offline: count_agents(&agents, crate::models::AgentStatus::Offline),
    };

    // Conflict count combines pending merge-conflict escalations with
    // blocked tasks; see DESIGN.md's open-question decision.
    let merge_conflict_escalations = state
        .escalations
        .get_pending(&state.project_id)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.escalation_type == crate::models::EscalationType::MergeConflict)
        .count();
    let conflicts = merge_conflict_escalations + task_counts.blocked;

    Json(ProjectSummary {
        budget: project.as_ref().and_then(|p| p.budget.clone()),
        project,
        tasks: task_counts,
        agents: agent_counts,
        conflicts,
    })
}

fn count_tasks(tasks: &[Task], status: TaskStatus) -> usize {
    tasks.iter().filter(|t| t.status == status).count()
}

fn count_agents(agents: &[AgentProfile], status: crate::models::AgentStatus) -> usize {
    agents.iter().filter(|a| a.status == status).count()
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    status: Option<String>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<Task>>, CoreError> {
    let mut tasks = state.store.list_tasks(&state.project_id).await?;
    if let Some(status) = query.status {
        let wanted = parse_task_status(&status)?;
        tasks.retain(|t| t.status == wanted);
    }
    Ok(Json(tasks))
}

fn parse_task_status(raw: &str) -> Result<TaskStatus, CoreError> {
    serde_json::from_value(json!(raw))
        .map_err(|_| CoreError::Validation(format!("unknown task status '{raw}'")))
}

async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentProfile>>, CoreError> {
    Ok(Json(state.store.list_agents(&state.project_id).await?))
}

async fn costs(State(state): State<AppState>) -> Result<Json<CostSummary>, CoreError> {
    Ok(Json(state.budget.summary(&state.project_id).await?))
}

/// `GET /events`: an SSE stream wrapping the event bus's per-connection
/// subscription, with a periodic heartbeat (§4.2/§6) and an initial
/// `connected` heartbeat frame so clients can confirm the stream is live.
async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let project_id = state.project_id.clone();
    let subscription = state.bus.subscribe(vec![
        "task:*".into(),
        "agent:*".into(),
        "cost:*".into(),
        "sandbox:*".into(),
        "conflict:*".into(),
        "escalation:*".into(),
        "heartbeat".into(),
    ]);

    let initial = Event::default()
        .event("heartbeat")
        .data(json!({ "status": "connected", "projectId": project_id }).to_string());

    let bus_events = subscription.into_stream().map(|event| {
        Ok(Event::default()
            .event(event.kind.clone())
            .data(serde_json::to_string(&event).unwrap_or_default()))
    });

    let stream = tokio_stream::once(Ok(initial)).chain(bus_events);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_HEARTBEAT_INTERVAL_SECS))
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AutonomyLevel, ConflictStrategy};
    use crate::store::InMemoryStateStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState {
        let bus = Arc::new(EventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(bus.clone()));
        let escalations = Arc::new(EscalationQueue::new(store.clone()));
        let budget = Arc::new(BudgetLedger::new(store.clone(), escalations.clone()));
        AppState {
            project_id: "p1".into(),
            store,
            bus,
            escalations,
            budget,
        }
    }

    fn api_config() -> ApiConfig {
        ApiConfig {
            host: "127.0.0.1".into(),
            port: 3000,
            api_key: None,
            enable_auth: false,
            allowed_origins: vec![],
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let server = ApiServer::new(state(), api_config());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn project_summary_returns_200_even_without_a_registered_project() {
        let server = ApiServer::new(state(), api_config());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/project").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn project_summary_includes_project_budget() {
        let app_state = state();
        app_state
            .store
            .create_project(Project {
                id: "p1".into(),
                name: "demo".into(),
                conflict_strategy: ConflictStrategy::Lock,
                budget: Some(crate::models::Budget {
                    total: 100.0,
                    alert_threshold_pct: 80.0,
                }),
                autonomy_level: AutonomyLevel::Supervised,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let server = ApiServer::new(app_state, api_config());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/project").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["budget"]["total"], 100.0);
    }

    #[tokio::test]
    async fn unknown_task_status_query_is_rejected_as_validation_error() {
        let server = ApiServer::new(state(), api_config());
        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/tasks?status=not-a-real-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn auth_enabled_without_key_header_is_rejected() {
        let mut config = api_config();
        config.enable_auth = true;
        config.api_key = Some("secret".into());
        let server = ApiServer::new(state(), config);
        let response = server
            .router()
            .oneshot(Request::builder().uri("/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
