//! Axum JSON API over the catalog cache: downstream reads and operator controls.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use elev_core::{EntityKind, SyncPolicyRow};
use elev_storage::RepositoryError;
use elev_sync::{SyncConfig, SyncOrchestrator};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "elev-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/catalog/directories", get(directories_handler))
        .route("/catalog/{kind}/{id}", get(entity_handler))
        .route("/catalog/{kind}/{id}/children", get(children_handler))
        .route("/catalog/elevations/{id}", get(elevation_handler))
        .route("/operator/sync", post(force_sync_handler))
        .route("/operator/plan", get(plan_handler))
        .route("/operator/policies", get(policies_handler))
        .route("/operator/policies/{target}", put(put_policy_handler))
        .route("/operator/parse/{id}", get(parse_status_handler))
        .route("/operator/{kind}/{id}/exclusion", put(exclusion_handler))
        .route("/operator/{kind}/{id}/errors", get(entity_errors_handler))
        .route("/operator/errors", get(errors_handler))
        .route("/operator/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(orchestrator: Arc<SyncOrchestrator>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "serving catalog api");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ELEV_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let orchestrator = Arc::new(SyncOrchestrator::from_config(SyncConfig::from_env()).await?);
    serve(orchestrator, SocketAddr::from(([0, 0, 0, 0], port))).await
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::Internal(err) => {
                error!(error = ?err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn ok<T: serde::Serialize>(value: T) -> ApiResult {
    Ok(Json(value).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn directories_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let repo = state.orchestrator.repo().downstream();
    ok(repo.visible_children(EntityKind::Directory, None).await?)
}

async fn entity_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((kind, id)): AxumPath<(EntityKind, i64)>,
) -> ApiResult {
    match state.orchestrator.repo().downstream().visible_entity(kind, id).await? {
        Some(entity) => ok(entity),
        None => Err(ApiError::NotFound(format!("{kind} {id} not found"))),
    }
}

/// Elevations come back with their enrichment; other levels as plain rows.
async fn children_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((kind, id)): AxumPath<(EntityKind, i64)>,
) -> ApiResult {
    let repo = state.orchestrator.repo().downstream();
    if repo.visible_entity(kind, id).await?.is_none() {
        return Err(ApiError::NotFound(format!("{kind} {id} not found")));
    }
    match kind.child() {
        Some(EntityKind::Elevation) => ok(repo.elevation_views(id).await?),
        Some(child) => ok(repo.visible_children(child, Some(id)).await?),
        None => Err(ApiError::BadRequest(format!("{kind} has no children"))),
    }
}

async fn elevation_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult {
    match state.orchestrator.repo().downstream().elevation_view(id).await? {
        Some(view) => ok(view),
        None => Err(ApiError::NotFound(format!("elevation {id} not found"))),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ForceSyncRequest {
    kind: Option<EntityKind>,
    id: Option<i64>,
}

async fn force_sync_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ForceSyncRequest>>,
) -> ApiResult {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let root = match (request.kind, request.id) {
        (None, None) => None,
        (Some(kind), Some(id)) => {
            if state.orchestrator.repo().visible_entity(kind, id).await?.is_none() {
                return Err(ApiError::NotFound(format!("{kind} {id} is unknown or excluded")));
            }
            Some((kind, id))
        }
        _ => return Err(ApiError::BadRequest("give both `kind` and `id`, or neither".into())),
    };
    ok(state.orchestrator.force_sync(root).await?)
}

async fn plan_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    ok(state.orchestrator.preview().await?)
}

async fn policies_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let rows = state.orchestrator.repo().policy_rows().await?;
    let out: Vec<_> = rows
        .into_iter()
        .map(|row| {
            let problem = row.validate().err().map(|e| e.to_string());
            json!({ "policy": row, "problem": problem })
        })
        .collect();
    ok(out)
}

async fn put_policy_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(target): AxumPath<String>,
    Json(mut row): Json<SyncPolicyRow>,
) -> ApiResult {
    row.target = target;
    if let Err(err) = row.validate() {
        warn!(target_name = %row.target, error = %err, "rejected policy update");
        return Err(ApiError::BadRequest(err.to_string()));
    }
    let repo = state.orchestrator.repo();
    repo.upsert_policy(&row, state.orchestrator.now()).await?;
    info!(target_name = %row.target, "policy updated by operator");
    ok(repo.get_policy(&row.target).await?)
}

async fn parse_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult {
    ok(state.orchestrator.repo().parse_status(id).await?)
}

#[derive(Debug, Deserialize)]
struct ExclusionRequest {
    excluded: bool,
}

async fn exclusion_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((kind, id)): AxumPath<(EntityKind, i64)>,
    Json(request): Json<ExclusionRequest>,
) -> ApiResult {
    let repo = state.orchestrator.repo();
    repo.set_excluded(kind, id, request.excluded).await?;
    info!(%kind, id, excluded = request.excluded, "exclusion toggled");
    ok(repo.require(kind, id).await?)
}

async fn entity_errors_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((kind, id)): AxumPath<(EntityKind, i64)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    ok(state.orchestrator.repo().downstream().errors_for(kind, id, query.limit()).await?)
}

async fn errors_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    ok(state.orchestrator.repo().downstream().recent_errors(query.limit()).await?)
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    ok(state.orchestrator.repo().downstream().recent_runs(query.limit()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use elev_core::SystemClock;
    use elev_source::FixtureTransport;
    use elev_storage::{db, EntityRepository};
    use http_body_util::BodyExt;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    async fn test_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::for_workspace(dir.path());
        config.workspace_root = workspace_root();
        let repo = EntityRepository::new(db::open(&config.database_url).await.unwrap());
        let transport =
            Arc::new(FixtureTransport::load(workspace_root().join("fixtures/catalog.json")).unwrap());
        let orchestrator = SyncOrchestrator::new(config, repo, transport, Arc::new(SystemClock));
        orchestrator.seed_policies().await.unwrap();
        (dir, app(AppState::new(Arc::new(orchestrator))))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn forced_sync_fills_the_read_api() {
        let (_dir, app) = test_app().await;
        let (status, summary) = call(&app, "POST", "/operator/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["trigger"], "manual");
        assert_eq!(summary["jobs_failed"], 0);

        let (_, dirs) = call(&app, "GET", "/catalog/directories", None).await;
        let dirs = dirs.as_array().unwrap();
        assert_eq!(dirs.len(), 2);
        let d1 = dirs[0]["id"].as_i64().unwrap();

        let (_, projects) = call(&app, "GET", &format!("/catalog/directory/{d1}/children"), None).await;
        let tower = projects[0]["id"].as_i64().unwrap();
        let (_, phases) = call(&app, "GET", &format!("/catalog/project/{tower}/children"), None).await;
        let phase = phases[0]["id"].as_i64().unwrap();
        let (status, elevations) =
            call(&app, "GET", &format!("/catalog/phase/{phase}/children"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(elevations.as_array().unwrap().len(), 2);
        assert_eq!(elevations[0]["parse"]["state"], "success");
        assert!(!elevations[0]["glass_specs"].as_array().unwrap().is_empty());

        let (_, runs) = call(&app, "GET", "/operator/runs", None).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn excluded_entities_disappear_from_reads() {
        let (_dir, app) = test_app().await;
        call(&app, "POST", "/operator/sync", None).await;
        let (_, dirs) = call(&app, "GET", "/catalog/directories", None).await;
        let d1 = dirs[0]["id"].as_i64().unwrap();

        let (status, _) = call(
            &app,
            "PUT",
            &format!("/operator/directory/{d1}/exclusion"),
            Some(json!({ "excluded": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, dirs) = call(&app, "GET", "/catalog/directories", None).await;
        assert_eq!(dirs.as_array().unwrap().len(), 1);
        let (status, _) = call(&app, "GET", &format!("/catalog/directory/{d1}/children"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            &app,
            "POST",
            "/operator/sync",
            Some(json!({ "kind": "directory", "id": d1 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn policy_updates_are_validated() {
        let (_dir, app) = test_app().await;
        let (_, policies) = call(&app, "GET", "/operator/policies", None).await;
        assert_eq!(policies.as_array().unwrap().len(), 5);

        let bad = json!({
            "target": "ignored",
            "interval_secs": 600,
            "staleness_threshold_secs": 1200,
            "priority": 2,
            "depends_on": "elevation"
        });
        let (status, body) = call(&app, "PUT", "/operator/policies/project", Some(bad)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("ancestor"));

        let good = json!({
            "target": "ignored",
            "interval_secs": 600,
            "staleness_threshold_secs": 1200,
            "priority": 2,
            "depends_on": "directory",
            "cascade": true
        });
        let (status, body) = call(&app, "PUT", "/operator/policies/project", Some(good)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interval_secs"], 600);
    }

    #[tokio::test]
    async fn unknown_rows_are_not_found() {
        let (_dir, app) = test_app().await;
        let (status, body) = call(&app, "GET", "/catalog/elevations/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
        let (status, _) = call(&app, "GET", "/operator/parse/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
