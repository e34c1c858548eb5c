//! JSON request layer over the intake pipeline and change ledger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nexus_core::{AuditEntry, Change};
use nexus_intake::{IntakeConfig, IntakePipeline};
use nexus_ledger::LedgerError;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nexus-web";

pub struct AppState {
    pub pipeline: IntakePipeline,
}

impl AppState {
    pub fn new(pipeline: IntakePipeline) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptRequest {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    change_id: String,
}

/// `{ok, change?, entry?, error?}` for ledger commands.
#[derive(Debug, Default, Serialize)]
struct CommandOutcome {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    change: Option<Change>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<AuditEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct Accepted<T> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/data", get(data_handler))
        .route("/api/audit", get(audit_handler))
        .route("/api/builder-log", get(builder_log_handler))
        .route("/api/storytime", post(storytime_handler))
        .route("/api/bookmark", post(bookmark_handler))
        .route("/api/apply", post(apply_handler))
        .route("/api/undo", post(undo_handler))
        .route("/api/reset-demo", post(reset_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serves a seeded pipeline on `port`, running the sweep scheduler when it
/// is enabled.
pub async fn serve(pipeline: IntakePipeline, port: u16) -> anyhow::Result<()> {
    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting sweep scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, scheduler = scheduler.is_some(), "serving");
    axum::serve(listener, app(AppState::new(pipeline)))
        .await
        .context("http server failed")?;
    Ok(())
}

/// Seeds a pipeline from the environment and serves it on `port`, or on
/// `NEXUS_WEB_PORT` when no port is given.
pub async fn serve_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let config = IntakeConfig::from_env();
    let port = port.unwrap_or(config.web_port);
    let pipeline = IntakePipeline::new(config)?;
    pipeline.reset().await?;
    serve(pipeline, port).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn data_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.ledger().snapshot().await).into_response()
}

async fn audit_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.ledger().audit().await).into_response()
}

async fn builder_log_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.builder_log().await).into_response()
}

async fn storytime_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TranscriptRequest>,
) -> Response {
    if req.transcript.trim().is_empty() {
        return rejected(StatusCode::BAD_REQUEST, "empty_transcript", None);
    }
    match state.pipeline.storytime(&req.transcript).await {
        Ok(outcome) => Json(Accepted { ok: true, body: outcome }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn bookmark_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TranscriptRequest>,
) -> Response {
    if req.transcript.trim().is_empty() {
        return rejected(StatusCode::BAD_REQUEST, "empty_transcript", None);
    }
    match state.pipeline.bookmark(&req.transcript).await {
        Ok(outcome) => Json(Accepted { ok: true, body: outcome }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn apply_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApplyRequest>,
) -> Response {
    // An id that does not parse cannot be pending either.
    let Ok(id) = Uuid::parse_str(req.change_id.trim()) else {
        return rejected(StatusCode::NOT_FOUND, "not_found", Some(req.change_id));
    };
    match state.pipeline.ledger().apply_change(id).await {
        Ok(change) => Json(CommandOutcome {
            ok: true,
            change: Some(change),
            ..CommandOutcome::default()
        })
        .into_response(),
        Err(err) => ledger_error(err),
    }
}

async fn undo_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.ledger().undo_last().await {
        Ok(entry) => Json(CommandOutcome {
            ok: true,
            entry: Some(entry),
            ..CommandOutcome::default()
        })
        .into_response(),
        Err(err) => ledger_error(err),
    }
}

async fn reset_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.reset().await {
        Ok(changes) => Json(serde_json::json!({ "ok": true, "proposed": changes.len() })).into_response(),
        Err(err) => server_error(err),
    }
}

fn ledger_error(err: LedgerError) -> Response {
    let status = match err {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::NotStaged { .. }
        | LedgerError::AlreadyApplied(_)
        | LedgerError::AlreadyPending(_)
        | LedgerError::DeadlineOutOfRange(_)
        | LedgerError::NothingToUndo => StatusCode::CONFLICT,
    };
    rejected(status, err.code(), Some(err.to_string()))
}

fn rejected(status: StatusCode, code: &'static str, message: Option<String>) -> Response {
    (
        status,
        Json(CommandOutcome {
            ok: false,
            error: Some(code),
            message,
            ..CommandOutcome::default()
        }),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    rejected(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        Some(format!("{err:#}")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn test_app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = IntakePipeline::new(IntakeConfig {
            workspace_root: dir.path().to_path_buf(),
            ..IntakeConfig::default()
        })
        .unwrap();
        pipeline.reset().await.unwrap();
        (app(AppState::new(pipeline)), dir)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_and_seeded_data() {
        let (app, _dir) = test_app().await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, get("/api/data")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["record"]["account"], "Acme Robotics");
        assert_eq!(body["pending"].as_array().unwrap().len(), 2);
        assert_eq!(body["pending"][0]["status"], "blocked");
    }

    #[tokio::test]
    async fn storytime_returns_insight_and_changes() {
        let (app, _dir) = test_app().await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/storytime",
                serde_json::json!({
                    "transcript": "Budget resolved today. Decision maker is David Chen—C-H-E-N. I'll send the SOC 2 evidence by Friday 5pm."
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["changes"].as_array().unwrap().len(), 3);
        assert!(body["insight"].as_str().unwrap().contains("Agenda Q1"));
        assert_eq!(body["parsed"]["decision_maker"], "David Chen");

        let (_, log) = send(&app, get("/api/builder-log")).await;
        assert_eq!(log["words"], 17);

        let (status, body) = send(&app, post_json("/api/storytime", serde_json::json!({ "transcript": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "empty_transcript");
    }

    #[tokio::test]
    async fn apply_then_undo_round_trip() {
        let (app, _dir) = test_app().await;
        let (_, body) = send(
            &app,
            post_json(
                "/api/storytime",
                serde_json::json!({ "transcript": "They confirmed the budget freeze on the call." }),
            ),
        )
        .await;
        let staged = body["changes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["field"] == "budget_status")
            .unwrap();
        assert_eq!(staged["status"], "staged");
        let id = staged["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, post_json("/api/apply", serde_json::json!({ "change_id": id }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["change"]["status"], "auto_applied");

        let (status, body) = send(&app, post_json("/api/apply", serde_json::json!({ "change_id": id }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (_, audit) = send(&app, get("/api/audit")).await;
        assert_eq!(audit[0]["kind"], "APPLY");

        let (status, body) = send(&app, post_json("/api/undo", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entry"]["kind"], "UNDO");

        let (status, body) = send(&app, post_json("/api/undo", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "nothing_to_undo");

        let (_, data) = send(&app, get("/api/data")).await;
        assert_eq!(data["record"]["budget_status"]["value"], Value::Null);
    }

    #[tokio::test]
    async fn blocked_and_unknown_changes_are_rejected() {
        let (app, _dir) = test_app().await;
        let (_, data) = send(&app, get("/api/data")).await;
        let blocked = data["pending"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, post_json("/api/apply", serde_json::json!({ "change_id": blocked }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "not_staged");

        let (status, body) = send(
            &app,
            post_json("/api/apply", serde_json::json!({ "change_id": Uuid::new_v4().to_string() })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = send(&app, post_json("/api/apply", serde_json::json!({ "change_id": "nope" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bookmark_and_reset() {
        let (app, _dir) = test_app().await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/bookmark",
                serde_json::json!({ "transcript": "Security review is a blocker. Bookmark that" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["banner"], "Objection bookmarked");
        assert_eq!(body["change"]["status"], "auto_applied");

        let (_, data) = send(&app, get("/api/data")).await;
        assert_eq!(data["record"]["tasks"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, post_json("/api/reset-demo", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["proposed"], 2);

        let (_, data) = send(&app, get("/api/data")).await;
        assert!(data["record"]["tasks"].as_array().unwrap().is_empty());
    }
}
