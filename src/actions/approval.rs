//! Approval service: enqueue, approve, reject, and list pending actions.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::model::{
    ActionFilter, ActionPage, ActionStatus, ActionSummaryCounts, ActionType, AuditEvent,
    AuditRecord, Classification, PendingAction, ProposedBy, StatusChange, codes,
};
use crate::config::{ApplyPolicy, ProposalConfig};
use crate::error::ApprovalError;
use crate::store::{Database, InsertOutcome};

/// Request to create a pending action.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAction {
    pub email_id: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub target_folder: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_proposer")]
    pub proposed_by: ProposedBy,
}

fn default_proposer() -> ProposedBy {
    ProposedBy::User
}

impl NewAction {
    pub fn new(email_id: impl Into<String>, action_type: ActionType, reason: impl Into<String>) -> Self {
        Self {
            email_id: email_id.into(),
            action_type,
            target_folder: None,
            reason: reason.into(),
            proposed_by: ProposedBy::User,
        }
    }

    pub fn move_to(email_id: impl Into<String>, folder: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target_folder: Some(folder.into()),
            ..Self::new(email_id, ActionType::MoveFolder, reason)
        }
    }

    pub fn proposed_by(mut self, proposer: ProposedBy) -> Self {
        self.proposed_by = proposer;
        self
    }
}

/// What `enqueue` did.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new PENDING action.
    Created(PendingAction),
    /// An open action for the same email and type already existed.
    Duplicate(PendingAction),
    /// Persisted directly as FAILED by folder policy.
    Refused(PendingAction),
}

impl EnqueueOutcome {
    pub fn action(&self) -> &PendingAction {
        match self {
            Self::Created(a) | Self::Duplicate(a) | Self::Refused(a) => a,
        }
    }

    pub fn into_action(self) -> PendingAction {
        match self {
            Self::Created(a) | Self::Duplicate(a) | Self::Refused(a) => a,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Duplicate(_) => "duplicate",
            Self::Refused(_) => "refused",
        }
    }
}

/// PENDING → APPROVED/REJECTED transitions and enqueue-time policy.
pub struct ApprovalService {
    db: Arc<dyn Database>,
    policy: ApplyPolicy,
    proposals: ProposalConfig,
}

impl ApprovalService {
    pub fn new(db: Arc<dyn Database>, policy: ApplyPolicy, proposals: ProposalConfig) -> Self {
        Self {
            db,
            policy,
            proposals,
        }
    }

    /// Create a pending action, subject to duplicate suppression and folder policy.
    pub async fn enqueue(&self, request: NewAction) -> Result<EnqueueOutcome, ApprovalError> {
        let target_folder = match request.action_type {
            ActionType::MoveFolder => {
                let folder = request
                    .target_folder
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .ok_or(ApprovalError::MissingTargetFolder)?;
                Some(folder)
            }
            _ => None,
        };

        if self.db.get_message(&request.email_id).await?.is_none() {
            warn!(email_id = %request.email_id, "Cannot enqueue action for unknown email");
            return Err(ApprovalError::EmailNotFound {
                id: request.email_id,
            });
        }

        let action = PendingAction::new(
            request.email_id,
            request.action_type,
            target_folder,
            request.reason,
            request.proposed_by,
        );

        if let Some(folder) = &action.target_folder {
            if !self.policy.is_safe_folder(folder) {
                let refused =
                    action.into_failed(codes::FOLDER_NOT_ALLOWED, codes::FOLDER_NOT_ALLOWED_MSG);
                let audit = AuditRecord::new(
                    AuditEvent::ActionFailed,
                    &refused,
                    format!("Refused {}: folder not allowed", refused.describe()),
                )
                .with_data(serde_json::json!({
                    "error_code": codes::FOLDER_NOT_ALLOWED,
                    "target_folder": refused.target_folder,
                }));
                self.db.insert_action(&refused, &audit).await?;

                warn!(
                    action_id = %refused.id,
                    email_id = %refused.email_id,
                    target_folder = ?refused.target_folder,
                    "Action refused: folder not in allowlist"
                );
                return Ok(EnqueueOutcome::Refused(refused));
            }
        }

        let audit = AuditRecord::new(
            AuditEvent::ActionEnqueued,
            &action,
            format!("Enqueued {}: {}", action.describe(), action.reason),
        )
        .with_data(serde_json::json!({
            "target_folder": action.target_folder,
            "proposed_by": action.proposed_by,
        }));

        match self.db.insert_action(&action, &audit).await? {
            InsertOutcome::Inserted => {
                info!(
                    action_id = %action.id,
                    email_id = %action.email_id,
                    action_type = %action.action_type,
                    proposed_by = %action.proposed_by,
                    "Action enqueued"
                );
                Ok(EnqueueOutcome::Created(action))
            }
            InsertOutcome::Duplicate(existing) => {
                debug!(
                    action_id = %existing.id,
                    email_id = %existing.email_id,
                    "Duplicate action suppressed"
                );
                Ok(EnqueueOutcome::Duplicate(existing))
            }
        }
    }

    /// Approve a PENDING action. Returns false if unknown or not pending.
    pub async fn approve(&self, action_id: Uuid, approved_by: &str) -> Result<bool, ApprovalError> {
        let Some(action) = self.db.get_action(action_id).await? else {
            debug!(action_id = %action_id, "Cannot approve unknown action");
            return Ok(false);
        };

        if action.status != ActionStatus::Pending {
            warn!(action_id = %action_id, status = %action.status, "Cannot approve non-pending action");
            return Ok(false);
        }

        let change = StatusChange {
            approved_by: Some(approved_by.to_string()),
            approved_at: Some(Utc::now()),
            ..StatusChange::default()
        };
        let audit = AuditRecord::new(
            AuditEvent::ActionApproved,
            &action,
            format!("Approved {} by {approved_by}", action.describe()),
        )
        .with_data(serde_json::json!({ "approved_by": approved_by }));

        let approved = self
            .db
            .transition_action(
                action_id,
                ActionStatus::Pending,
                ActionStatus::Approved,
                &change,
                None,
                &audit,
            )
            .await?;

        if approved {
            info!(action_id = %action_id, approved_by, "Action approved");
        }
        Ok(approved)
    }

    /// Reject a PENDING action. Returns false if unknown or not pending.
    pub async fn reject(&self, action_id: Uuid, rejected_by: &str) -> Result<bool, ApprovalError> {
        let Some(action) = self.db.get_action(action_id).await? else {
            debug!(action_id = %action_id, "Cannot reject unknown action");
            return Ok(false);
        };

        if action.status != ActionStatus::Pending {
            warn!(action_id = %action_id, status = %action.status, "Cannot reject non-pending action");
            return Ok(false);
        }

        let change = StatusChange {
            rejected_by: Some(rejected_by.to_string()),
            rejected_at: Some(Utc::now()),
            ..StatusChange::default()
        };
        let audit = AuditRecord::new(
            AuditEvent::ActionRejected,
            &action,
            format!("Rejected {} by {rejected_by}", action.describe()),
        )
        .with_data(serde_json::json!({ "rejected_by": rejected_by }));

        let rejected = self
            .db
            .transition_action(
                action_id,
                ActionStatus::Pending,
                ActionStatus::Rejected,
                &change,
                None,
                &audit,
            )
            .await?;

        if rejected {
            info!(action_id = %action_id, rejected_by, "Action rejected");
        }
        Ok(rejected)
    }

    /// Filtered, paginated listing, newest first.
    pub async fn list(&self, filter: ActionFilter) -> Result<ActionPage, ApprovalError> {
        filter.validate().map_err(ApprovalError::InvalidFilter)?;
        let (items, total) = self.db.list_actions(&filter).await?;
        Ok(ActionPage::new(items, total, &filter))
    }

    /// Counts per status, and per type among PENDING.
    pub async fn summary(&self) -> Result<ActionSummaryCounts, ApprovalError> {
        let groups = self.db.action_counts().await?;
        Ok(ActionSummaryCounts::from_groups(&groups))
    }

    pub async fn get(&self, action_id: Uuid) -> Result<Option<PendingAction>, ApprovalError> {
        Ok(self.db.get_action(action_id).await?)
    }

    pub async fn audit_trail(&self, action_id: Uuid) -> Result<Vec<AuditRecord>, ApprovalError> {
        Ok(self.db.audit_for_action(action_id).await?)
    }

    /// Turn a classification into proposed actions.
    ///
    /// Spam goes to quarantine (or DELETE when `delete_spam` is set). Everything
    /// else is archived, optionally marked read, and flagged when it needs action.
    pub async fn propose(
        &self,
        email_id: &str,
        classification: &Classification,
    ) -> Result<Vec<EnqueueOutcome>, ApprovalError> {
        let cfg = &self.proposals;
        let mut requests = Vec::new();

        if classification.spam_probability >= cfg.spam_threshold {
            if cfg.delete_spam {
                requests.push(NewAction::new(email_id, ActionType::Delete, "spam"));
            } else {
                requests.push(NewAction::move_to(email_id, cfg.quarantine_folder.clone(), "spam"));
            }
        } else {
            if cfg.mark_as_read {
                requests.push(NewAction::new(email_id, ActionType::MarkRead, "auto mark read"));
            }
            requests.push(NewAction::move_to(
                email_id,
                cfg.archive_folder.clone(),
                format!("archive: {}", classification.category),
            ));
            if classification.action_required {
                requests.push(NewAction::new(email_id, ActionType::AddFlag, "action required"));
            }
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.enqueue(request.proposed_by(ProposedBy::System)).await?);
        }

        info!(
            email_id,
            category = %classification.category,
            spam_probability = classification.spam_probability,
            proposed = outcomes.len(),
            "Classification proposals enqueued"
        );
        Ok(outcomes)
    }
}
