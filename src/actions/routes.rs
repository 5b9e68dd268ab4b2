//! REST endpoints for pending actions.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::apply::{ApplyOrchestrator, ApplyReport, ApplyRequest, Outcome, PreviewRequest};
use super::approval::{ApprovalService, EnqueueOutcome, NewAction};
use super::model::{ActionFilter, ProposedBy, codes};
use crate::error::{ApplyError, ApprovalError};
use crate::safety::ErrorSanitizer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub approvals: Arc<ApprovalService>,
    pub orchestrator: Arc<ApplyOrchestrator>,
    /// Every dynamic error string in a response passes through this.
    pub sanitizer: Arc<ErrorSanitizer>,
}

/// Build the Axum router for the pending-action API.
pub fn action_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/pending-actions", get(list_actions).post(create_action))
        .route("/api/pending-actions/summary", get(summary))
        .route("/api/pending-actions/preview", post(preview))
        .route("/api/pending-actions/apply", post(apply_batch))
        .route("/api/pending-actions/{id}", get(get_action))
        .route("/api/pending-actions/{id}/audit", get(audit_trail))
        .route("/api/pending-actions/{id}/approve", post(approve_action))
        .route("/api/pending-actions/{id}/reject", post(reject_action))
        .route("/api/pending-actions/{id}/apply", post(apply_single))
        .with_state(state)
}

// ── Error bodies ────────────────────────────────────────────────────────

const INVALID_BODY_MSG: &str = "Invalid request body";
const INVALID_QUERY_MSG: &str = "Invalid query parameters";

fn error_body(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error_code": code,
            "message": message.into(),
            "applied": 0,
            "failed": 0,
        })),
    )
        .into_response()
}

/// Parse rejections echo caller input, so production mode sends a fixed message.
fn rejection_body(state: &AppState, code: &str, fixed: &str, detail: &str) -> Response {
    let message = if state.sanitizer.is_verbose() {
        state.sanitizer.scrub_message(detail)
    } else {
        fixed.to_string()
    };
    debug!(error_code = code, "Rejected malformed request");
    error_body(StatusCode::BAD_REQUEST, code, message)
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "INVALID_ID", "Invalid action ID"))
}

fn approval_error(state: &AppState, err: ApprovalError) -> Response {
    match err {
        ApprovalError::MissingTargetFolder => {
            error_body(StatusCode::BAD_REQUEST, codes::MISSING_TARGET_FOLDER, err.to_string())
        }
        ApprovalError::EmailNotFound { .. } => {
            error_body(StatusCode::NOT_FOUND, codes::EMAIL_NOT_FOUND, err.to_string())
        }
        ApprovalError::InvalidFilter(_) => {
            error_body(StatusCode::BAD_REQUEST, "INVALID_FILTER", err.to_string())
        }
        ApprovalError::Database(e) => {
            let message = state.sanitizer.sanitize(&e);
            warn!(error = %message, "Approval request failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", message)
        }
    }
}

fn apply_error(state: &AppState, err: ApplyError) -> Response {
    let status = match &err {
        ApplyError::SafeMode
        | ApplyError::TokenMissing
        | ApplyError::TokenInvalid
        | ApplyError::TokenExpired
        | ApplyError::TokenMismatch { .. }
        | ApplyError::ConcurrentApply => StatusCode::CONFLICT,
        ApplyError::NothingToApply => StatusCode::BAD_REQUEST,
        ApplyError::GatewayUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ApplyError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match &err {
        ApplyError::Database(e) => state.sanitizer.sanitize(e),
        other => other.to_string(),
    };
    error_body(status, err.code(), message)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mailwarden",
        "safe_mode": state.orchestrator.policy().safe_mode,
    }))
}

// ── Queue ───────────────────────────────────────────────────────────────

async fn list_actions(
    State(state): State<AppState>,
    filter: Result<Query<ActionFilter>, QueryRejection>,
) -> Response {
    let Query(filter) = match filter {
        Ok(f) => f,
        Err(e) => return rejection_body(&state, "INVALID_FILTER", INVALID_QUERY_MSG, &e.body_text()),
    };

    match state.approvals.list(filter).await {
        Ok(page) => (StatusCode::OK, Json(json!(page))).into_response(),
        Err(e) => approval_error(&state, e),
    }
}

async fn summary(State(state): State<AppState>) -> Response {
    match state.approvals.summary().await {
        Ok(counts) => (StatusCode::OK, Json(json!(counts))).into_response(),
        Err(e) => approval_error(&state, e),
    }
}

async fn create_action(
    State(state): State<AppState>,
    body: Result<Json<NewAction>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(e) => return rejection_body(&state, "INVALID_REQUEST", INVALID_BODY_MSG, &e.body_text()),
    };

    match state.approvals.enqueue(request.proposed_by(ProposedBy::User)).await {
        Ok(outcome) => {
            let status = match outcome {
                EnqueueOutcome::Created(_) => StatusCode::CREATED,
                EnqueueOutcome::Duplicate(_) | EnqueueOutcome::Refused(_) => StatusCode::OK,
            };
            let label = outcome.label();
            (
                status,
                Json(json!({ "outcome": label, "action": outcome.into_action() })),
            )
                .into_response()
        }
        Err(e) => approval_error(&state, e),
    }
}

async fn get_action(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.approvals.get(id).await {
        Ok(Some(action)) => (StatusCode::OK, Json(json!(action))).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, codes::ACTION_NOT_FOUND, codes::ACTION_NOT_FOUND_MSG),
        Err(e) => approval_error(&state, e),
    }
}

async fn audit_trail(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.approvals.audit_trail(id).await {
        Ok(records) => (StatusCode::OK, Json(json!(records))).into_response(),
        Err(e) => approval_error(&state, e),
    }
}

// ── Approve / reject ────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ActorBody {
    #[serde(default)]
    actor: Option<String>,
}

/// The body is optional; an empty one means the default actor.
fn actor_from(state: &AppState, body: &Bytes) -> Result<String, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok("api".into());
    }
    let parsed: ActorBody = serde_json::from_slice(body)
        .map_err(|e| rejection_body(state, "INVALID_REQUEST", INVALID_BODY_MSG, &e.to_string()))?;
    Ok(parsed
        .actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "api".into()))
}

async fn approve_action(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
    let (id, actor) = match parse_id(&id).and_then(|id| Ok((id, actor_from(&state, &body)?))) {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    match state.approvals.approve(id, &actor).await {
        Ok(true) => (StatusCode::OK, Json(json!({ "success": true, "status": "APPROVED" }))).into_response(),
        Ok(false) => error_body(
            StatusCode::NOT_FOUND,
            codes::ACTION_NOT_FOUND,
            "Action not found or not pending",
        ),
        Err(e) => approval_error(&state, e),
    }
}

async fn reject_action(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
    let (id, actor) = match parse_id(&id).and_then(|id| Ok((id, actor_from(&state, &body)?))) {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    match state.approvals.reject(id, &actor).await {
        Ok(true) => (StatusCode::OK, Json(json!({ "success": true, "status": "REJECTED" }))).into_response(),
        Ok(false) => error_body(
            StatusCode::NOT_FOUND,
            codes::ACTION_NOT_FOUND,
            "Action not found or not pending",
        ),
        Err(e) => approval_error(&state, e),
    }
}

// ── Preview / apply ─────────────────────────────────────────────────────

async fn preview(State(state): State<AppState>, body: Result<Json<PreviewRequest>, JsonRejection>) -> Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(e) => return rejection_body(&state, "INVALID_REQUEST", INVALID_BODY_MSG, &e.body_text()),
    };

    match state.orchestrator.preview(request).await {
        Ok(preview) => (StatusCode::OK, Json(json!(preview))).into_response(),
        Err(e) => apply_error(&state, e),
    }
}

async fn apply_batch(State(state): State<AppState>, body: Result<Json<ApplyRequest>, JsonRejection>) -> Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(e) => return rejection_body(&state, "INVALID_REQUEST", INVALID_BODY_MSG, &e.body_text()),
    };

    match state.orchestrator.apply_batch(request).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))).into_response(),
        Err(e) => apply_error(&state, e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct SingleApplyRequest {
    #[serde(default)]
    apply_token: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

async fn apply_single(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<SingleApplyRequest>, JsonRejection>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(request) = match body {
        Ok(b) => b,
        Err(e) => return rejection_body(&state, "INVALID_REQUEST", INVALID_BODY_MSG, &e.body_text()),
    };

    match state
        .orchestrator
        .apply_single(id, request.apply_token.as_deref(), request.dry_run)
        .await
    {
        Ok(report) => single_report(report),
        Err(e) => apply_error(&state, e),
    }
}

/// A single apply maps its one outcome onto the response status.
fn single_report(report: ApplyReport) -> Response {
    let Some(result) = report.results.first() else {
        return (StatusCode::OK, Json(json!(report))).into_response();
    };

    let status = match result.outcome {
        Outcome::Applied | Outcome::Planned => StatusCode::OK,
        Outcome::Rejected => StatusCode::CONFLICT,
        Outcome::Failed => StatusCode::BAD_REQUEST,
        Outcome::Skipped if result.error_code.as_deref() == Some(codes::ACTION_NOT_FOUND) => StatusCode::NOT_FOUND,
        Outcome::Skipped => StatusCode::BAD_REQUEST,
    };

    if status == StatusCode::OK {
        return (status, Json(json!(report))).into_response();
    }

    debug!(action_id = %result.action_id, status = %status, "Single apply did not succeed");
    (
        status,
        Json(json!({
            "success": false,
            "error_code": result.error_code,
            "message": result.error_message,
            "applied": report.applied,
            "failed": report.failed,
            "results": report.results,
        })),
    )
        .into_response()
}
