//! Apply orchestrator: preview → token → apply.
//!
//! Apply checks, in order: safe mode, token presence, the apply lock, token
//! validity, per-action state, static policy. Only then is a mailbox session
//! opened. Nothing before the session touches the mailbox, and a session
//! that fails to open leaves every action APPROVED and the token unused.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::model::{
    ActionStatus, ActionType, AuditEvent, AuditRecord, MessageUpdate, PendingAction,
    StatusChange, TokenSummary, codes,
};
use crate::actions::tokens::{TokenLedger, TokenScope};
use crate::config::ApplyPolicy;
use crate::error::{ApplyError, GatewayError};
use crate::gateway::{MailboxGateway, MailboxSession, Timeouts};
use crate::safety::ErrorSanitizer;
use crate::store::Database;

/// How often the background task drops expired tokens.
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Preview selection. With no ids, all APPROVED actions are taken.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub action_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub max_count: Option<usize>,
}

/// Batch apply request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplyRequest {
    #[serde(default)]
    pub apply_token: Option<String>,
    /// Subset of the token's actions. `None` means all of them.
    #[serde(default)]
    pub action_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub max_count: Option<usize>,
}

/// One action as shown in a preview.
#[derive(Debug, Clone, Serialize)]
pub struct ActionPreview {
    pub id: Uuid,
    pub email_id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub action_type: ActionType,
    pub target_folder: Option<String>,
}

/// Preview result: a fresh token bound to exactly `actions`.
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub apply_token: String,
    pub expires_at: DateTime<Utc>,
    pub action_count: usize,
    pub summary: TokenSummary,
    pub actions: Vec<ActionPreview>,
}

/// What happened to one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Applied,
    Failed,
    Rejected,
    Skipped,
    /// Dry run: would be executed.
    Planned,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub action_id: Uuid,
    pub email_id: Option<String>,
    pub action_type: Option<ActionType>,
    /// Status after the call (current status on dry runs and skips).
    pub status: Option<ActionStatus>,
    pub outcome: Outcome,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Aggregate result of an apply call.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub success: bool,
    pub dry_run: bool,
    pub applied: usize,
    /// Failed, rejected, and skipped actions.
    pub failed: usize,
    pub planned: usize,
    pub results: Vec<ActionResult>,
}

impl ApplyReport {
    fn from_results(dry_run: bool, results: Vec<ActionResult>) -> Self {
        let count = |o: Outcome| results.iter().filter(|r| r.outcome == o).count();
        let applied = count(Outcome::Applied);
        let planned = count(Outcome::Planned);
        let failed = count(Outcome::Failed) + count(Outcome::Rejected) + count(Outcome::Skipped);
        Self {
            success: failed == 0,
            dry_run,
            applied,
            failed,
            planned,
            results,
        }
    }
}

/// Per-action decision made before any mailbox I/O.
#[derive(Debug)]
enum Plan {
    Execute {
        action: PendingAction,
        uid: u32,
    },
    /// Terminal refusal by static policy or validation.
    Refuse {
        action: PendingAction,
        status: ActionStatus,
        code: &'static str,
        message: &'static str,
    },
    /// Left untouched.
    Skip {
        action_id: Uuid,
        action: Option<PendingAction>,
        code: &'static str,
        message: &'static str,
    },
}

impl Plan {
    fn skip(action_id: Uuid, action: Option<PendingAction>, code: &'static str, message: &'static str) -> Self {
        Self::Skip {
            action_id,
            action,
            code,
            message,
        }
    }

    fn refuse(action: PendingAction, status: ActionStatus, code: &'static str, message: &'static str) -> Self {
        Self::Refuse {
            action,
            status,
            code,
            message,
        }
    }

    /// The result a dry run reports for this plan.
    fn dry_run_result(&self) -> ActionResult {
        match self {
            Self::Execute { action, .. } => result_for(action, action.status, Outcome::Planned, None, None),
            Self::Refuse {
                action,
                status,
                code,
                message,
            } => result_for(
                action,
                action.status,
                refusal_outcome(*status),
                Some(*code),
                Some(*message),
            ),
            Self::Skip {
                action_id,
                action,
                code,
                message,
            } => skip_result(*action_id, action.as_ref(), code, message),
        }
    }
}

fn refusal_outcome(status: ActionStatus) -> Outcome {
    if status == ActionStatus::Rejected {
        Outcome::Rejected
    } else {
        Outcome::Failed
    }
}

fn result_for(
    action: &PendingAction,
    status: ActionStatus,
    outcome: Outcome,
    code: Option<&str>,
    message: Option<&str>,
) -> ActionResult {
    ActionResult {
        action_id: action.id,
        email_id: Some(action.email_id.clone()),
        action_type: Some(action.action_type),
        status: Some(status),
        outcome,
        error_code: code.map(str::to_string),
        error_message: message.map(str::to_string),
    }
}

fn skip_result(action_id: Uuid, action: Option<&PendingAction>, code: &str, message: &str) -> ActionResult {
    ActionResult {
        action_id,
        email_id: action.map(|a| a.email_id.clone()),
        action_type: action.map(|a| a.action_type),
        status: action.map(|a| a.status),
        outcome: Outcome::Skipped,
        error_code: Some(code.to_string()),
        error_message: Some(message.to_string()),
    }
}

/// Drives the preview/apply pipeline. Share one instance per process.
pub struct ApplyOrchestrator {
    db: Arc<dyn Database>,
    ledger: TokenLedger,
    gateway: Arc<dyn MailboxGateway>,
    policy: ApplyPolicy,
    timeouts: Timeouts,
    sanitizer: Arc<ErrorSanitizer>,
    apply_lock: Mutex<()>,
}

impl ApplyOrchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        gateway: Arc<dyn MailboxGateway>,
        policy: ApplyPolicy,
        sanitizer: Arc<ErrorSanitizer>,
    ) -> Self {
        let ledger = TokenLedger::new(Arc::clone(&db), policy.token_ttl);
        Self {
            db,
            ledger,
            gateway,
            policy,
            timeouts: Timeouts::default(),
            sanitizer,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn policy(&self) -> &ApplyPolicy {
        &self.policy
    }

    fn cap(&self, max_count: Option<usize>) -> usize {
        let max = self.policy.max_apply_per_request;
        max_count.map_or(max, |n| n.min(max))
    }

    fn check_safe_mode(&self) -> Result<(), ApplyError> {
        if self.policy.safe_mode {
            warn!("Apply refused: SAFE_MODE enabled");
            return Err(ApplyError::SafeMode);
        }
        Ok(())
    }

    /// Select APPROVED actions and issue a token bound to exactly them.
    pub async fn preview(&self, request: PreviewRequest) -> Result<Preview, ApplyError> {
        let cap = self.cap(request.max_count);

        let mut selected = match &request.action_ids {
            Some(ids) => {
                let mut actions: Vec<PendingAction> = Vec::new();
                for id in ids {
                    if actions.iter().any(|a| a.id == *id) {
                        continue;
                    }
                    match self.db.get_action(*id).await? {
                        Some(action) if action.status == ActionStatus::Approved => actions.push(action),
                        Some(action) => {
                            debug!(action_id = %id, status = %action.status, "Preview skipping non-approved action")
                        }
                        None => debug!(action_id = %id, "Preview skipping unknown action"),
                    }
                }
                actions.sort_by_key(|a| a.created_at);
                actions
            }
            None => self.db.approved_actions(cap).await?,
        };
        selected.truncate(cap);

        if selected.is_empty() {
            return Err(ApplyError::NothingToApply);
        }

        self.ledger.purge_expired().await?;
        let token = self.ledger.issue(&selected).await?;

        let mut actions = Vec::with_capacity(selected.len());
        for action in &selected {
            let message = self.db.get_message(&action.email_id).await?;
            actions.push(ActionPreview {
                id: action.id,
                email_id: action.email_id.clone(),
                subject: message.as_ref().and_then(|m| m.subject.clone()),
                sender: message.as_ref().and_then(|m| m.sender.clone()),
                action_type: action.action_type,
                target_folder: action.target_folder.clone(),
            });
        }

        Ok(Preview {
            apply_token: token.token,
            expires_at: token.expires_at,
            action_count: token.action_count,
            summary: token.summary,
            actions,
        })
    }

    /// Apply the token's actions, or the explicit subset in `request.action_ids`.
    pub async fn apply_batch(&self, request: ApplyRequest) -> Result<ApplyReport, ApplyError> {
        self.check_safe_mode()?;
        let token = require_token(request.apply_token.as_deref())?;
        let _guard = self.apply_lock.try_lock().map_err(|_| {
            warn!("Apply refused: another apply is running");
            ApplyError::ConcurrentApply
        })?;

        let scope = match &request.action_ids {
            Some(ids) => TokenScope::Subset(ids),
            None => TokenScope::All,
        };
        let record = self.ledger.validate(token, scope).await?;

        let cap = self.cap(request.max_count);
        let targets: Vec<Uuid> = record
            .action_ids
            .iter()
            .filter(|id| {
                request
                    .action_ids
                    .as_ref()
                    .is_none_or(|wanted| wanted.contains(id))
            })
            .copied()
            .take(cap)
            .collect();

        self.execute(token, targets, request.dry_run).await
    }

    /// Apply one action. The token must cover `action_id`.
    pub async fn apply_single(
        &self,
        action_id: Uuid,
        apply_token: Option<&str>,
        dry_run: bool,
    ) -> Result<ApplyReport, ApplyError> {
        self.check_safe_mode()?;
        let token = require_token(apply_token)?;
        let _guard = self.apply_lock.try_lock().map_err(|_| {
            warn!("Apply refused: another apply is running");
            ApplyError::ConcurrentApply
        })?;

        self.ledger
            .validate(token, TokenScope::Single(action_id))
            .await?;

        self.execute(token, vec![action_id], dry_run).await
    }

    /// Everything after token validation. Caller holds the apply lock.
    async fn execute(&self, token: &str, targets: Vec<Uuid>, dry_run: bool) -> Result<ApplyReport, ApplyError> {
        if targets.is_empty() {
            return Err(ApplyError::NothingToApply);
        }

        let mut plans = Vec::with_capacity(targets.len());
        for id in targets {
            plans.push(self.plan(id).await?);
        }

        if dry_run {
            let results = plans.iter().map(Plan::dry_run_result).collect();
            let report = ApplyReport::from_results(true, results);
            info!(
                planned = report.planned,
                refused = report.failed,
                "Dry run complete"
            );
            return Ok(report);
        }

        // Refusals are terminal and need no mailbox
        let mut results: Vec<Option<ActionResult>> = Vec::with_capacity(plans.len());
        let mut executable = Vec::new();
        for plan in plans {
            match plan {
                Plan::Execute { action, uid } => {
                    results.push(None);
                    executable.push((results.len() - 1, action, uid));
                }
                Plan::Refuse {
                    action,
                    status,
                    code,
                    message,
                } => results.push(Some(self.persist_refusal(&action, status, code, message).await?)),
                Plan::Skip {
                    action_id,
                    action,
                    code,
                    message,
                } => {
                    warn!(action_id = %action_id, code, "Action skipped");
                    results.push(Some(skip_result(action_id, action.as_ref(), code, message)));
                }
            }
        }

        if executable.is_empty() {
            info!("No executable actions; mailbox not contacted");
            return Ok(ApplyReport::from_results(false, results.into_iter().flatten().collect()));
        }

        let mut session = self.open_session().await?;

        match self.ledger.consume(token).await {
            Ok(true) => {}
            Ok(false) => {
                self.close_session(session.as_mut()).await;
                warn!("Apply token was consumed or expired before use");
                return Err(ApplyError::TokenInvalid);
            }
            Err(e) => {
                self.close_session(session.as_mut()).await;
                return Err(e.into());
            }
        }

        let outcome = self.run_actions(session.as_mut(), executable, &mut results).await;
        self.close_session(session.as_mut()).await;
        outcome?;

        let report = ApplyReport::from_results(false, results.into_iter().flatten().collect());
        info!(
            applied = report.applied,
            failed = report.failed,
            "Apply complete"
        );
        Ok(report)
    }

    /// Decide what to do with one action without touching the mailbox.
    async fn plan(&self, id: Uuid) -> Result<Plan, ApplyError> {
        let Some(action) = self.db.get_action(id).await? else {
            return Ok(Plan::skip(id, None, codes::ACTION_NOT_FOUND, codes::ACTION_NOT_FOUND_MSG));
        };

        if action.status != ActionStatus::Approved {
            return Ok(Plan::skip(
                id,
                Some(action),
                codes::ACTION_NOT_APPROVED,
                codes::ACTION_NOT_APPROVED_MSG,
            ));
        }

        let refusal = match action.action_type {
            ActionType::Delete if !self.policy.allow_destructive => Some((
                ActionStatus::Rejected,
                codes::DESTRUCTIVE_NOT_ALLOWED,
                codes::DESTRUCTIVE_NOT_ALLOWED_MSG,
            )),
            ActionType::MoveFolder => match action.target_folder.as_deref() {
                None => Some((
                    ActionStatus::Failed,
                    codes::MISSING_TARGET_FOLDER,
                    codes::MISSING_TARGET_FOLDER_MSG,
                )),
                Some(folder) if !self.policy.is_safe_folder(folder) => Some((
                    ActionStatus::Failed,
                    codes::FOLDER_NOT_ALLOWED,
                    codes::FOLDER_NOT_ALLOWED_MSG,
                )),
                Some(_) => None,
            },
            _ => None,
        };
        if let Some((status, code, message)) = refusal {
            return Ok(Plan::refuse(action, status, code, message));
        }

        let Some(message) = self.db.get_message(&action.email_id).await? else {
            return Ok(Plan::refuse(
                action,
                ActionStatus::Failed,
                codes::EMAIL_NOT_FOUND,
                codes::EMAIL_NOT_FOUND_MSG,
            ));
        };
        let Some(uid) = message.uid else {
            return Ok(Plan::refuse(
                action,
                ActionStatus::Failed,
                codes::MISSING_UID,
                codes::MISSING_UID_MSG,
            ));
        };

        Ok(Plan::Execute { action, uid })
    }

    async fn persist_refusal(
        &self,
        action: &PendingAction,
        status: ActionStatus,
        code: &'static str,
        message: &'static str,
    ) -> Result<ActionResult, ApplyError> {
        let change = StatusChange {
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            ..StatusChange::default()
        };
        let audit = AuditRecord::new(
            AuditEvent::for_status(status),
            action,
            format!("{} {}: {message}", status, action.describe()),
        )
        .with_data(serde_json::json!({ "error_code": code }));

        let moved = self
            .db
            .transition_action(action.id, ActionStatus::Approved, status, &change, None, &audit)
            .await?;
        if !moved {
            return Ok(skip_result(
                action.id,
                Some(action),
                codes::ACTION_NOT_APPROVED,
                codes::ACTION_NOT_APPROVED_MSG,
            ));
        }

        warn!(action_id = %action.id, status = %status, code, "Action refused by policy");
        Ok(result_for(action, status, refusal_outcome(status), Some(code), Some(message)))
    }

    async fn open_session(&self) -> Result<Box<dyn MailboxSession>, ApplyError> {
        let opened = match timeout(self.timeouts.connect, self.gateway.open()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                op: "connect".into(),
                timeout: self.timeouts.connect,
            }),
        };

        opened.map_err(|e| {
            let reason = self.sanitizer.sanitize(&e);
            warn!(error = %reason, "Mailbox unavailable; actions left APPROVED");
            ApplyError::GatewayUnavailable { reason }
        })
    }

    async fn close_session(&self, session: &mut dyn MailboxSession) {
        match timeout(self.timeouts.operation, session.close()).await {
            Ok(Ok(())) => debug!("Mailbox session closed"),
            Ok(Err(e)) => debug!(error = %self.sanitizer.sanitize(&e), "Mailbox logout failed"),
            Err(_) => debug!("Mailbox logout timed out"),
        }
    }

    /// Run each executable action in order. A failing primitive only fails
    /// its own action; storage errors abort the batch.
    async fn run_actions(
        &self,
        session: &mut dyn MailboxSession,
        executable: Vec<(usize, PendingAction, u32)>,
        results: &mut [Option<ActionResult>],
    ) -> Result<(), ApplyError> {
        for (slot, action, uid) in executable {
            let outcome = match timeout(self.timeouts.operation, run_primitive(session, &action, uid)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    op: action.action_type.to_string(),
                    timeout: self.timeouts.operation,
                }),
            };

            let result = match outcome {
                Ok(()) => self.record_applied(&action).await?,
                Err(e) => self.record_failed(&action, &e).await?,
            };
            results[slot] = Some(result);
        }
        Ok(())
    }

    async fn record_applied(&self, action: &PendingAction) -> Result<ActionResult, ApplyError> {
        let change = StatusChange {
            applied_at: Some(Utc::now()),
            ..StatusChange::default()
        };
        let audit = AuditRecord::new(
            AuditEvent::ActionApplied,
            action,
            format!("Applied {}", action.describe()),
        )
        .with_data(serde_json::json!({ "target_folder": action.target_folder }));

        let moved = self
            .db
            .transition_action(
                action.id,
                ActionStatus::Approved,
                ActionStatus::Applied,
                &change,
                MessageUpdate::for_action(action.action_type),
                &audit,
            )
            .await?;
        if !moved {
            error!(action_id = %action.id, "Action changed state while being applied");
            return Ok(skip_result(
                action.id,
                Some(action),
                codes::ACTION_NOT_APPROVED,
                codes::ACTION_NOT_APPROVED_MSG,
            ));
        }

        info!(
            action_id = %action.id,
            email_id = %action.email_id,
            action_type = %action.action_type,
            "Action applied"
        );
        Ok(result_for(action, ActionStatus::Applied, Outcome::Applied, None, None))
    }

    async fn record_failed(&self, action: &PendingAction, err: &GatewayError) -> Result<ActionResult, ApplyError> {
        let code = match err {
            GatewayError::Timeout { .. } => codes::MAILBOX_TIMEOUT,
            _ => codes::MAILBOX_OPERATION_FAILED,
        };
        let message = self.sanitizer.sanitize(err);

        let change = StatusChange {
            error_code: Some(code.to_string()),
            error_message: Some(message.clone()),
            ..StatusChange::default()
        };
        let audit = AuditRecord::new(
            AuditEvent::ActionFailed,
            action,
            format!("Failed {}: {message}", action.describe()),
        )
        .with_data(serde_json::json!({ "error_code": code }));

        let moved = self
            .db
            .transition_action(
                action.id,
                ActionStatus::Approved,
                ActionStatus::Failed,
                &change,
                None,
                &audit,
            )
            .await?;
        if !moved {
            error!(action_id = %action.id, "Action changed state while being applied");
            return Ok(skip_result(
                action.id,
                Some(action),
                codes::ACTION_NOT_APPROVED,
                codes::ACTION_NOT_APPROVED_MSG,
            ));
        }

        warn!(action_id = %action.id, code, error = %message, "Action failed");
        Ok(result_for(
            action,
            ActionStatus::Failed,
            Outcome::Failed,
            Some(code),
            Some(message.as_str()),
        ))
    }
}

fn require_token(token: Option<&str>) -> Result<&str, ApplyError> {
    match token.map(str::trim) {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(ApplyError::TokenMissing),
    }
}

async fn run_primitive(
    session: &mut dyn MailboxSession,
    action: &PendingAction,
    uid: u32,
) -> Result<(), GatewayError> {
    match action.action_type {
        ActionType::MarkRead => session.mark_read(uid).await,
        ActionType::AddFlag => session.add_flag(uid).await,
        ActionType::Delete => session.delete(uid).await,
        ActionType::MoveFolder => match action.target_folder.as_deref() {
            Some(folder) => session.move_to_folder(uid, folder).await,
            None => Err(GatewayError::Operation {
                op: "move_to_folder".into(),
                reason: "no target folder".into(),
            }),
        },
    }
}

/// Purge expired tokens every minute.
pub fn spawn_token_purge_task(orchestrator: Arc<ApplyOrchestrator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOKEN_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = orchestrator.ledger().purge_expired().await {
                warn!(
                    error = %orchestrator.sanitizer.sanitize(&e),
                    "Failed to purge expired apply tokens"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action_result(outcome: Outcome) -> ActionResult {
        ActionResult {
            action_id: Uuid::new_v4(),
            email_id: None,
            action_type: None,
            status: None,
            outcome,
            error_code: None,
            error_message: None,
        }
    }

    #[test]
    fn report_counts_refusals_and_skips_as_failed() {
        let report = ApplyReport::from_results(
            false,
            vec![
                action_result(Outcome::Applied),
                action_result(Outcome::Failed),
                action_result(Outcome::Rejected),
                action_result(Outcome::Skipped),
            ],
        );
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 3);
        assert_eq!(report.planned, 0);
        assert!(!report.success);

        let report = ApplyReport::from_results(true, vec![action_result(Outcome::Planned)]);
        assert!(report.success);
        assert_eq!(report.planned, 1);
    }

    #[test]
    fn blank_tokens_are_missing() {
        assert!(matches!(require_token(None), Err(ApplyError::TokenMissing)));
        assert!(matches!(require_token(Some("  ")), Err(ApplyError::TokenMissing)));
        assert_eq!(require_token(Some(" abc ")).unwrap(), "abc");
    }

    #[test]
    fn outcome_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Outcome::Planned).unwrap(), "\"planned\"");
    }
}
