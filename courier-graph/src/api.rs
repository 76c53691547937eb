//! HTTP control surface with Axum and Utoipa.
//!
//! Every endpoint answers with the same envelope: an optional result
//! payload plus an optional human-readable message. Build and generation
//! triggers return immediately — the run itself proceeds under the
//! registry's per-instance serialization, and its progress is observable
//! through the status endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use courier_common::GraphError;

use crate::model::{BuildRecord, BuildStatus};
use crate::orchestrator::{ContainerOrchestrator, ContainerState, EngineHealth, VariantStatus};
use crate::pipeline::PipelineRunner;
use crate::registry::BuildRegistry;

#[derive(OpenApi)]
#[openapi(
    paths(
        trigger_export,
        trigger_generation,
        build_status_all,
        build_status,
        build_history,
        container_status_all,
        container_action,
        container_health,
        health
    ),
    components(schemas(
        BuildRecord,
        BuildStatus,
        VariantStatus,
        ContainerState,
        EngineHealth
    )),
    info(
        title = "Courier Graph API",
        version = "1.0.0",
        description = "Routing-graph build pipeline control surface"
    )
)]
struct ApiDoc;

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(result: T) -> Self {
        ApiResponse { result: Some(result), message: None }
    }

    pub fn message(message: impl Into<String>) -> Self {
        ApiResponse { result: None, message: Some(message.into()) }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(result: T) -> Reply<T> {
    (StatusCode::OK, Json(ApiResponse::ok(result)))
}

fn accepted<T>(message: impl Into<String>) -> Reply<T> {
    (StatusCode::ACCEPTED, Json(ApiResponse::message(message)))
}

fn failure<T>(err: &GraphError) -> Reply<T> {
    let status = match err {
        GraphError::Validation(_) | GraphError::State(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GraphError::DataAccess(_)
        | GraphError::ExternalTool { .. }
        | GraphError::Container(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::message(err.to_string())))
}

fn not_found<T>(message: impl Into<String>) -> Reply<T> {
    (StatusCode::NOT_FOUND, Json(ApiResponse::message(message)))
}

pub struct AppState {
    pub registry: Arc<BuildRegistry>,
    pub runner: Arc<PipelineRunner>,
    pub orchestrator: Arc<ContainerOrchestrator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/graph/export", post(trigger_export))
        .route("/builds/generate", post(trigger_generation))
        .route("/builds/status", get(build_status_all))
        .route("/builds/status/{instance}", get(build_status))
        .route("/builds/history/{instance}", get(build_history))
        .route("/containers", get(container_status_all))
        .route("/containers/{variant}/{action}", post(container_action))
        .route("/containers/{variant}/health", get(container_health))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Trigger export of the shared routing graph only.
#[utoipa::path(
    post,
    path = "/graph/export",
    responses(
        (status = 202, description = "Export run accepted"),
    )
)]
async fn trigger_export(State(state): State<Arc<AppState>>) -> Reply<BuildRecord> {
    let runner = state.runner.clone();
    tokio::spawn(async move {
        match runner.export_graph().await {
            Ok(summary) => info!(
                build_id = %summary.record.id,
                nodes = summary.nodes,
                ways = summary.ways,
                "graph export finished"
            ),
            Err(e) => error!(error = %e, "graph export failed"),
        }
    });
    accepted("graph export started")
}

/// Trigger a full multi-variant generation run.
#[utoipa::path(
    post,
    path = "/builds/generate",
    responses(
        (status = 202, description = "Generation run accepted"),
    )
)]
async fn trigger_generation(State(state): State<Arc<AppState>>) -> Reply<BuildRecord> {
    let runner = state.runner.clone();
    tokio::spawn(async move {
        match runner.run_generation().await {
            Ok(report) => info!(
                run = %report.parent.id,
                status = report.parent.status.as_str(),
                "generation run finished"
            ),
            Err(e) => error!(error = %e, "generation run failed"),
        }
    });
    accepted("generation run started")
}

/// Most-recent build record per instance name.
#[utoipa::path(
    get,
    path = "/builds/status",
    responses(
        (status = 200, description = "Latest record per instance", body = [BuildRecord]),
    )
)]
async fn build_status_all(State(state): State<Arc<AppState>>) -> Reply<Vec<BuildRecord>> {
    match state.registry.overview() {
        Ok(records) => ok(records),
        Err(e) => failure(&e),
    }
}

/// Current (non-terminal) record for one instance, or its latest record
/// when nothing is in flight.
#[utoipa::path(
    get,
    path = "/builds/status/{instance}",
    params(("instance" = String, Path, description = "Instance name")),
    responses(
        (status = 200, description = "Build record", body = BuildRecord),
        (status = 404, description = "Instance has no builds"),
    )
)]
async fn build_status(
    State(state): State<Arc<AppState>>,
    Path(instance): Path<String>,
) -> Reply<BuildRecord> {
    let current = match state.registry.current_build(&instance) {
        Ok(current) => current,
        Err(e) => return failure(&e),
    };
    if let Some(record) = current {
        return ok(record);
    }
    match state.registry.history(&instance, 1) {
        Ok(mut records) if !records.is_empty() => ok(records.remove(0)),
        Ok(_) => not_found(format!("no builds for instance '{instance}'")),
        Err(e) => failure(&e),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Bounded build history for one instance, newest first.
#[utoipa::path(
    get,
    path = "/builds/history/{instance}",
    params(
        ("instance" = String, Path, description = "Instance name"),
        ("limit" = Option<usize>, Query, description = "Maximum records, default 20"),
    ),
    responses(
        (status = 200, description = "Build history", body = [BuildRecord]),
    )
)]
async fn build_history(
    State(state): State<Arc<AppState>>,
    Path(instance): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Reply<Vec<BuildRecord>> {
    let limit = query.limit.unwrap_or(20).min(200);
    match state.registry.history(&instance, limit) {
        Ok(records) => ok(records),
        Err(e) => failure(&e),
    }
}

/// Container state and engine health for every configured variant.
#[utoipa::path(
    get,
    path = "/containers",
    responses(
        (status = 200, description = "Per-variant container status", body = [VariantStatus]),
    )
)]
async fn container_status_all(State(state): State<Arc<AppState>>) -> Reply<Vec<VariantStatus>> {
    ok(state.orchestrator.status_all().await)
}

/// Lifecycle action on one variant's engine container.
#[utoipa::path(
    post,
    path = "/containers/{variant}/{action}",
    params(
        ("variant" = String, Path, description = "Variant name"),
        ("action" = String, Path, description = "start | stop | restart | rebuild"),
    ),
    responses(
        (status = 200, description = "Action applied"),
        (status = 400, description = "Unknown action"),
        (status = 404, description = "Unknown variant"),
    )
)]
async fn container_action(
    State(state): State<Arc<AppState>>,
    Path((variant, action)): Path<(String, String)>,
) -> Reply<VariantStatus> {
    if state.runner.config().variant_named(&variant).is_none() {
        return not_found(format!("unknown variant '{variant}'"));
    }
    let outcome = match action.as_str() {
        "start" => state.orchestrator.start(&variant).await,
        "stop" => state.orchestrator.stop(&variant).await,
        "restart" => state.orchestrator.restart(&variant).await,
        "rebuild" => state.orchestrator.rebuild(&variant).await,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::message(format!("unknown action '{action}'"))),
            )
        }
    };
    match outcome {
        Ok(()) => {
            let status = state.orchestrator.status(&variant).await;
            ok(status)
        }
        Err(e) => failure(&e),
    }
}

/// Engine health probe for one variant.
#[utoipa::path(
    get,
    path = "/containers/{variant}/health",
    params(("variant" = String, Path, description = "Variant name")),
    responses(
        (status = 200, description = "Probe verdict", body = EngineHealth),
    )
)]
async fn container_health(
    State(state): State<Arc<AppState>>,
    Path(variant): Path<String>,
) -> Reply<EngineHealth> {
    if state.runner.config().variant_named(&variant).is_none() {
        return not_found(format!("unknown variant '{variant}'"));
    }
    ok(state.orchestrator.health_check(&variant).await)
}

/// Service liveness.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up"))
)]
async fn health() -> Reply<String> {
    ok("ok".to_string())
}

pub async fn run_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "control surface listening");
    info!("API docs at http://{addr}/swagger-ui");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::store::Store;

    fn app_state() -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        store.init_schema().unwrap();
        let registry = Arc::new(BuildRegistry::new(Arc::new(store)));
        let config = Arc::new(BuildConfig::default());
        Arc::new(AppState {
            registry: registry.clone(),
            runner: Arc::new(PipelineRunner::new(registry.clone(), config.clone())),
            orchestrator: Arc::new(ContainerOrchestrator::new(registry, config)),
        })
    }

    #[test]
    fn envelope_omits_absent_fields() {
        let with_result = serde_json::to_value(ApiResponse::ok(5)).unwrap();
        assert_eq!(with_result, serde_json::json!({"result": 5}));

        let with_message = serde_json::to_value(ApiResponse::<u32>::message("queued")).unwrap();
        assert_eq!(with_message, serde_json::json!({"message": "queued"}));
    }

    #[tokio::test]
    async fn unknown_instances_answer_404_with_a_message() {
        let state = app_state();
        let (status, Json(body)) =
            build_status(State(state), Path("nope".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.result.is_none());
        assert!(body.message.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn build_status_returns_the_current_record_while_in_flight() {
        let state = app_state();
        let build = state.registry.start_build("car", 7, None).unwrap();

        let (status, Json(body)) =
            build_status(State(state.clone()), Path("car".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.result.unwrap().id, build.id);

        // After failure the latest terminal record is returned instead.
        state.registry.mark_building(&build.id).unwrap();
        state.registry.mark_failed(&build.id, "boom").unwrap();
        let (status, Json(body)) =
            build_status(State(state), Path("car".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.result.unwrap().status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_container_actions_are_rejected() {
        let state = app_state();
        let (status, Json(body)) = container_action(
            State(state.clone()),
            Path(("car".to_string(), "explode".to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.message.unwrap().contains("explode"));

        let (status, _) = container_action(
            State(state),
            Path(("hovercraft".to_string(), "start".to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
