//! Integration tests for the pending-action REST API.
//!
//! Each test spins up an Axum server on a random port and exercises the
//! real HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use mailwarden::actions::apply::ApplyOrchestrator;
use mailwarden::actions::approval::ApprovalService;
use mailwarden::actions::model::MessageRecord;
use mailwarden::actions::routes::{AppState, action_routes};
use mailwarden::config::{ApplyPolicy, ProposalConfig};
use mailwarden::error::GatewayError;
use mailwarden::gateway::{MailboxGateway, MailboxSession, UnconfiguredGateway};
use mailwarden::safety::ErrorSanitizer;
use mailwarden::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway whose sessions accept every primitive.
struct OkGateway;

struct OkSession;

#[async_trait]
impl MailboxGateway for OkGateway {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, GatewayError> {
        Ok(Box::new(OkSession))
    }
}

#[async_trait]
impl MailboxSession for OkSession {
    async fn mark_read(&mut self, _uid: u32) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn move_to_folder(&mut self, _uid: u32, _folder: &str) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn add_flag(&mut self, _uid: u32) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn delete(&mut self, _uid: u32) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn close(&mut self) -> Result<(), GatewayError> {
        Ok(())
    }
}

struct Server {
    base: String,
    db: Arc<dyn Database>,
    client: reqwest::Client,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn message(&self, uid: Option<u32>) -> String {
        let message = MessageRecord::new(format!("<{}@example.com>", uuid::Uuid::new_v4()), uid);
        self.db.insert_message(&message).await.unwrap();
        message.id
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = timeout(TEST_TIMEOUT, self.client.post(self.url(path)).json(&body).send())
            .await
            .expect("request timed out")
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = timeout(TEST_TIMEOUT, self.client.get(self.url(path)).send())
            .await
            .expect("request timed out")
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    /// Enqueue and approve an action, returning its id.
    async fn approved(&self, body: Value) -> String {
        let (status, created) = self.post("/api/pending-actions", body).await;
        assert_eq!(status, 201, "{created}");
        let id = created["action"]["id"].as_str().unwrap().to_string();
        let (status, _) = self
            .post(&format!("/api/pending-actions/{id}/approve"), json!({"actor": "tester"}))
            .await;
        assert_eq!(status, 200);
        id
    }

    async fn token(&self) -> String {
        let (status, preview) = self.post("/api/pending-actions/preview", json!({})).await;
        assert_eq!(status, 200, "{preview}");
        preview["apply_token"].as_str().unwrap().to_string()
    }
}

/// Start an Axum server on a random port.
async fn start_server(policy: ApplyPolicy, gateway: Arc<dyn MailboxGateway>) -> Server {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let sanitizer = Arc::new(ErrorSanitizer::production());
    let approvals = Arc::new(ApprovalService::new(
        Arc::clone(&db),
        policy.clone(),
        ProposalConfig::default(),
    ));
    let orchestrator = Arc::new(ApplyOrchestrator::new(
        Arc::clone(&db),
        gateway,
        policy,
        Arc::clone(&sanitizer),
    ));
    let app = action_routes(AppState {
        approvals,
        orchestrator,
        sanitizer,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        db,
        client: reqwest::Client::new(),
    }
}

fn live_policy() -> ApplyPolicy {
    ApplyPolicy {
        safe_mode: false,
        ..ApplyPolicy::default()
    }
}

#[tokio::test]
async fn health_reports_safe_mode() {
    let server = start_server(ApplyPolicy::default(), Arc::new(OkGateway)).await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["safe_mode"], true);
}

#[tokio::test]
async fn full_flow_over_http() {
    let server = start_server(live_policy(), Arc::new(OkGateway)).await;
    let email = server.message(Some(8)).await;
    let id = server
        .approved(json!({"email_id": email, "action_type": "MOVE_FOLDER", "target_folder": "Archive"}))
        .await;

    let token = server.token().await;
    let (status, report) = server
        .post("/api/pending-actions/apply", json!({"apply_token": token}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(report["success"], true);
    assert_eq!(report["applied"], 1);

    let (status, action) = server.get(&format!("/api/pending-actions/{id}")).await;
    assert_eq!(status, 200);
    assert_eq!(action["status"], "APPLIED");

    let (status, audit) = server.get(&format!("/api/pending-actions/{id}/audit")).await;
    assert_eq!(status, 200);
    let events: Vec<&str> = audit
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(events, vec!["ACTION_ENQUEUED", "ACTION_APPROVED", "ACTION_APPLIED"]);

    // Spent token
    let (status, body) = server
        .post("/api/pending-actions/apply", json!({"apply_token": token}))
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error_code"], "TOKEN_INVALID");
    assert_eq!(body["success"], false);
    assert_eq!(body["applied"], 0);
}

#[tokio::test]
async fn safe_mode_and_token_errors_are_conflicts() {
    let server = start_server(ApplyPolicy::default(), Arc::new(OkGateway)).await;
    let (status, body) = server
        .post("/api/pending-actions/apply", json!({"apply_token": "whatever"}))
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error_code"], "SAFE_MODE");

    let server = start_server(live_policy(), Arc::new(OkGateway)).await;
    let (status, body) = server.post("/api/pending-actions/apply", json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["error_code"], "TOKEN_REQUIRED");
}

#[tokio::test]
async fn unavailable_mailbox_is_503() {
    let server = start_server(live_policy(), Arc::new(UnconfiguredGateway)).await;
    let email = server.message(Some(1)).await;
    server
        .approved(json!({"email_id": email, "action_type": "MARK_READ"}))
        .await;
    let token = server.token().await;

    let (status, body) = server
        .post("/api/pending-actions/apply", json!({"apply_token": token}))
        .await;
    assert_eq!(status, 503);
    assert_eq!(body["error_code"], "GATEWAY_UNAVAILABLE");
    assert_eq!(body["message"], "Mailbox unavailable: ConnectionError");
}

#[tokio::test]
async fn single_apply_maps_outcomes_to_status() {
    let server = start_server(live_policy(), Arc::new(OkGateway)).await;

    let email = server.message(Some(1)).await;
    let delete = server
        .approved(json!({"email_id": email, "action_type": "DELETE"}))
        .await;
    let token = server.token().await;
    let (status, body) = server
        .post(
            &format!("/api/pending-actions/{delete}/apply"),
            json!({"apply_token": token}),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error_code"], "DESTRUCTIVE_NOT_ALLOWED");

    let email = server.message(None).await;
    let no_uid = server
        .approved(json!({"email_id": email, "action_type": "ADD_FLAG"}))
        .await;
    let token = server.token().await;
    let (status, body) = server
        .post(
            &format!("/api/pending-actions/{no_uid}/apply"),
            json!({"apply_token": token}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "MISSING_UID");

    let (status, body) = server
        .post(
            "/api/pending-actions/not-a-uuid/apply",
            json!({"apply_token": token}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "INVALID_ID");
}

#[tokio::test]
async fn queue_endpoints_validate_input() {
    let server = start_server(live_policy(), Arc::new(OkGateway)).await;

    let (status, body) = server
        .post("/api/pending-actions/preview", json!({}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "NOTHING_TO_APPLY");

    let (status, body) = server.get("/api/pending-actions?page=0").await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "INVALID_FILTER");

    let (status, body) = server
        .post(
            "/api/pending-actions",
            json!({"email_id": "missing", "action_type": "MARK_READ"}),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error_code"], "EMAIL_NOT_FOUND");

    let (status, body) = server
        .post(
            "/api/pending-actions",
            json!({"email_id": "x", "action_type": "MOVE_FOLDER"}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "MISSING_TARGET_FOLDER");

    let unknown = uuid::Uuid::new_v4();
    let (status, _) = server
        .post(&format!("/api/pending-actions/{unknown}/approve"), json!({}))
        .await;
    assert_eq!(status, 404);

    let email = server.message(Some(2)).await;
    let id = server
        .approved(json!({"email_id": email, "action_type": "FLAG"}))
        .await;
    let (status, _) = server
        .post(&format!("/api/pending-actions/{id}/reject"), json!({}))
        .await;
    assert_eq!(status, 404);

    let (status, page) = server.get("/api/pending-actions?status=APPROVED").await;
    assert_eq!(status, 200);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["action_type"], "ADD_FLAG");

    let (status, summary) = server.get("/api/pending-actions/summary").await;
    assert_eq!(status, 200);
    assert_eq!(summary["total"], 1);
}

#[tokio::test]
async fn malformed_bodies_do_not_echo_caller_input() {
    let server = start_server(live_policy(), Arc::new(OkGateway)).await;

    let (status, body) = server
        .post(
            "/api/pending-actions",
            json!({"email_id": "x", "action_type": "password=hunter2"}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert_eq!(body["message"], "Invalid request body");
    assert!(!body.to_string().contains("hunter2"), "{body}");

    let unknown = uuid::Uuid::new_v4();
    let (status, body) = server
        .post(
            &format!("/api/pending-actions/{unknown}/approve"),
            json!({"actor": ["secret=hunter2"]}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert!(!body.to_string().contains("hunter2"), "{body}");

    let (status, body) = server.get("/api/pending-actions?status=hunter2").await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "INVALID_FILTER");
    assert_eq!(body["message"], "Invalid query parameters");
    assert!(!body.to_string().contains("hunter2"), "{body}");
}
