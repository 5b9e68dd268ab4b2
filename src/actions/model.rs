//! Action data model: pending actions, statuses, apply tokens, audit records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable codes stored in `PendingAction::error_code` and per-action results.
pub mod codes {
    pub const FOLDER_NOT_ALLOWED: &str = "FOLDER_NOT_ALLOWED";
    pub const DESTRUCTIVE_NOT_ALLOWED: &str = "DESTRUCTIVE_NOT_ALLOWED";
    pub const MISSING_TARGET_FOLDER: &str = "MISSING_TARGET_FOLDER";
    pub const EMAIL_NOT_FOUND: &str = "EMAIL_NOT_FOUND";
    pub const MISSING_UID: &str = "MISSING_UID";
    pub const ACTION_NOT_FOUND: &str = "ACTION_NOT_FOUND";
    pub const ACTION_NOT_APPROVED: &str = "ACTION_NOT_APPROVED";
    pub const MAILBOX_OPERATION_FAILED: &str = "MAILBOX_OPERATION_FAILED";
    pub const MAILBOX_TIMEOUT: &str = "MAILBOX_TIMEOUT";

    pub const FOLDER_NOT_ALLOWED_MSG: &str = "Target folder not in safe folder allowlist";
    pub const DESTRUCTIVE_NOT_ALLOWED_MSG: &str =
        "DELETE operations are not allowed (ALLOW_DESTRUCTIVE_IMAP is false)";
    pub const MISSING_TARGET_FOLDER_MSG: &str = "MOVE_FOLDER action has no target folder";
    pub const EMAIL_NOT_FOUND_MSG: &str = "Email record not found";
    pub const MISSING_UID_MSG: &str = "Email has no mailbox UID";
    pub const ACTION_NOT_FOUND_MSG: &str = "Action not found";
    pub const ACTION_NOT_APPROVED_MSG: &str = "Action is not approved";
}

/// A mailbox mutation an action may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    MarkRead,
    MoveFolder,
    #[serde(alias = "FLAG")]
    AddFlag,
    Delete,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::MarkRead,
        ActionType::MoveFolder,
        ActionType::AddFlag,
        ActionType::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarkRead => "MARK_READ",
            Self::MoveFolder => "MOVE_FOLDER",
            Self::AddFlag => "ADD_FLAG",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARK_READ" => Ok(Self::MarkRead),
            "MOVE_FOLDER" => Ok(Self::MoveFolder),
            "ADD_FLAG" | "FLAG" => Ok(Self::AddFlag),
            "DELETE" => Ok(Self::Delete),
            _ => Err(format!("Unknown action type: {}", s)),
        }
    }
}

/// Lifecycle status of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Waiting for a human decision.
    Pending,
    /// Approved, waiting to be applied.
    Approved,
    Rejected,
    Applied,
    Failed,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 5] = [
        ActionStatus::Pending,
        ActionStatus::Approved,
        ActionStatus::Rejected,
        ActionStatus::Applied,
        ActionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Applied => "APPLIED",
            Self::Failed => "FAILED",
        }
    }

    /// PENDING and APPROVED actions count towards duplicate suppression.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }

    /// The only legal moves are PENDING→{APPROVED,REJECTED} and
    /// APPROVED→{APPLIED,FAILED,REJECTED}.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Applied)
                | (Self::Approved, Self::Failed)
                | (Self::Approved, Self::Rejected)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "APPLIED" => Ok(Self::Applied),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Unknown action status: {}", s)),
        }
    }
}

/// Who proposed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposedBy {
    System,
    User,
}

impl std::fmt::Display for ProposedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for ProposedBy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            _ => Err(format!("Unknown proposer: {}", s)),
        }
    }
}

/// A mailbox mutation awaiting (or past) human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: Uuid,
    /// ID of the message-store record this action targets.
    pub email_id: String,
    pub action_type: ActionType,
    /// Destination folder. Only set for MOVE_FOLDER.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_folder: Option<String>,
    pub reason: String,
    pub proposed_by: ProposedBy,
    pub status: ActionStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    /// Always sanitized before it gets here.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingAction {
    /// Create a new PENDING action.
    pub fn new(
        email_id: impl Into<String>,
        action_type: ActionType,
        target_folder: Option<String>,
        reason: impl Into<String>,
        proposed_by: ProposedBy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email_id: email_id.into(),
            action_type,
            target_folder,
            reason: reason.into(),
            proposed_by,
            status: ActionStatus::Pending,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            applied_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark this (not yet persisted) action as terminally failed.
    pub fn into_failed(mut self, code: &str, message: &str) -> Self {
        self.status = ActionStatus::Failed;
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.to_string());
        self
    }

    /// "MOVE_FOLDER → Quarantine", "MARK_READ", ...
    pub fn describe(&self) -> String {
        match &self.target_folder {
            Some(folder) => format!("{} → {}", self.action_type, folder),
            None => self.action_type.to_string(),
        }
    }
}

/// Field changes applied together with a compare-and-set status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Message-store projection flips that accompany an APPLIED transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageUpdate {
    pub archived: Option<bool>,
    pub flagged: Option<bool>,
}

impl MessageUpdate {
    /// What a successful mailbox-side action implies for the projection.
    pub fn for_action(action_type: ActionType) -> Option<Self> {
        match action_type {
            ActionType::MoveFolder | ActionType::Delete => Some(Self {
                archived: Some(true),
                flagged: None,
            }),
            ActionType::AddFlag => Some(Self {
                archived: None,
                flagged: Some(true),
            }),
            ActionType::MarkRead => None,
        }
    }
}

/// A processed message as seen from the message store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    /// RFC 5322 Message-ID.
    pub message_id: String,
    /// Mailbox UID. Missing UIDs make every mutation fail validation.
    pub uid: Option<u32>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub archived: bool,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(message_id: impl Into<String>, uid: Option<u32>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.into(),
            uid,
            subject: None,
            sender: None,
            archived: false,
            flagged: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// Aggregation of a token's actions, for display only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub by_type: BTreeMap<String, usize>,
    pub by_folder: BTreeMap<String, usize>,
}

impl TokenSummary {
    pub fn from_actions<'a>(actions: impl IntoIterator<Item = &'a PendingAction>) -> Self {
        let mut summary = Self::default();
        for action in actions {
            *summary
                .by_type
                .entry(action.action_type.to_string())
                .or_default() += 1;
            if let Some(folder) = &action.target_folder {
                *summary.by_folder.entry(folder.clone()).or_default() += 1;
            }
        }
        summary
    }
}

/// Single-use authorization for applying an exact set of actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyToken {
    pub token: String,
    /// Fixed at issuance, in creation order.
    pub action_ids: Vec<Uuid>,
    pub action_count: usize,
    pub summary: TokenSummary,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

impl ApplyToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn covers(&self, action_id: Uuid) -> bool {
        self.action_ids.contains(&action_id)
    }
}

/// Kinds of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    ActionEnqueued,
    ActionApproved,
    ActionRejected,
    ActionApplied,
    ActionFailed,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActionEnqueued => "ACTION_ENQUEUED",
            Self::ActionApproved => "ACTION_APPROVED",
            Self::ActionRejected => "ACTION_REJECTED",
            Self::ActionApplied => "ACTION_APPLIED",
            Self::ActionFailed => "ACTION_FAILED",
        }
    }

    /// Event recorded when an action lands in `status`.
    pub fn for_status(status: ActionStatus) -> Self {
        match status {
            ActionStatus::Pending => Self::ActionEnqueued,
            ActionStatus::Approved => Self::ActionApproved,
            ActionStatus::Rejected => Self::ActionRejected,
            ActionStatus::Applied => Self::ActionApplied,
            ActionStatus::Failed => Self::ActionFailed,
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEvent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTION_ENQUEUED" => Ok(Self::ActionEnqueued),
            "ACTION_APPROVED" => Ok(Self::ActionApproved),
            "ACTION_REJECTED" => Ok(Self::ActionRejected),
            "ACTION_APPLIED" => Ok(Self::ActionApplied),
            "ACTION_FAILED" => Ok(Self::ActionFailed),
            _ => Err(format!("Unknown audit event: {}", s)),
        }
    }
}

/// Append-only record of a state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub event_type: AuditEvent,
    pub action_id: Uuid,
    pub email_id: String,
    /// Resolved from the message store when the record is written.
    pub email_message_id: Option<String>,
    pub description: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(event_type: AuditEvent, action: &PendingAction, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            action_id: action.id,
            email_id: action.email_id.clone(),
            email_message_id: None,
            description: description.into(),
            data: serde_json::json!({
                "pending_action_id": action.id,
                "email_id": action.email_id,
                "action_type": action.action_type,
            }),
            created_at: Utc::now(),
        }
    }

    /// Merge extra fields into the payload.
    pub fn with_data(mut self, extra: serde_json::Value) -> Self {
        if let (Some(base), serde_json::Value::Object(extra)) = (self.data.as_object_mut(), extra) {
            base.extend(extra);
        }
        self
    }
}

/// Classifier output for one message. Produced elsewhere, consumed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub spam_probability: f32,
    pub action_required: bool,
    pub priority: Priority,
    #[serde(default)]
    pub suggested_folder: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Listing filter. `page` is 1-based.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActionFilter {
    #[serde(default)]
    pub status: Option<ActionStatus>,
    #[serde(default)]
    pub action_type: Option<ActionType>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

pub const MAX_PAGE_SIZE: u32 = 100;

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

impl Default for ActionFilter {
    fn default() -> Self {
        Self {
            status: None,
            action_type: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl ActionFilter {
    pub fn with_status(status: ActionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.page < 1 {
            return Err("page must be >= 1".into());
        }
        if self.page_size < 1 || self.page_size > MAX_PAGE_SIZE {
            return Err(format!("page_size must be between 1 and {MAX_PAGE_SIZE}"));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// One page of actions, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPage {
    pub items: Vec<PendingAction>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub pages: u64,
}

impl ActionPage {
    pub fn new(items: Vec<PendingAction>, total: u64, filter: &ActionFilter) -> Self {
        let page_size = u64::from(filter.page_size.max(1));
        Self {
            items,
            total,
            page: filter.page,
            page_size: filter.page_size,
            pages: total.div_ceil(page_size),
        }
    }
}

/// Counts per status, plus per type among PENDING actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSummaryCounts {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub pending_by_type: BTreeMap<String, u64>,
}

impl ActionSummaryCounts {
    /// Fold `(status, type, count)` groups into a summary. Every status and
    /// type appears, zero or not.
    pub fn from_groups(groups: &[(ActionStatus, ActionType, u64)]) -> Self {
        let mut summary = Self::default();
        for status in ActionStatus::ALL {
            summary.by_status.insert(status.to_string(), 0);
        }
        for action_type in ActionType::ALL {
            summary.pending_by_type.insert(action_type.to_string(), 0);
        }
        for (status, action_type, count) in groups {
            summary.total += count;
            *summary.by_status.entry(status.to_string()).or_default() += count;
            if *status == ActionStatus::Pending {
                *summary
                    .pending_by_type
                    .entry(action_type.to_string())
                    .or_default() += count;
            }
        }
        summary
    }

    pub fn status(&self, status: ActionStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_action_is_pending() {
        let action = PendingAction::new("e1", ActionType::MarkRead, None, "read", ProposedBy::System);
        assert_eq!(action.status, ActionStatus::Pending);
        assert!(action.status.is_active());
        assert_eq!(action.created_at, action.updated_at);
    }

    #[test]
    fn legal_transitions() {
        use ActionStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Applied));
        assert!(Approved.can_transition_to(Failed));
        assert!(Approved.can_transition_to(Rejected));

        assert!(!Pending.can_transition_to(Applied));
        assert!(!Approved.can_transition_to(Pending));
        for terminal in [Rejected, Applied, Failed] {
            assert!(!terminal.is_active());
            for next in ActionStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn action_type_accepts_legacy_flag() {
        assert_eq!("FLAG".parse::<ActionType>().unwrap(), ActionType::AddFlag);
        let parsed: ActionType = serde_json::from_str("\"FLAG\"").unwrap();
        assert_eq!(parsed, ActionType::AddFlag);
        assert_eq!(serde_json::to_string(&ActionType::AddFlag).unwrap(), "\"ADD_FLAG\"");
        assert!("ARCHIVE".parse::<ActionType>().is_err());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in ActionStatus::ALL {
            assert_eq!(status.as_str().parse::<ActionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn summary_groups_by_type_and_folder() {
        let actions = vec![
            PendingAction::new("e1", ActionType::MoveFolder, Some("Archive".into()), "r", ProposedBy::System),
            PendingAction::new("e2", ActionType::MoveFolder, Some("Archive".into()), "r", ProposedBy::System),
            PendingAction::new("e3", ActionType::AddFlag, None, "r", ProposedBy::User),
        ];
        let summary = TokenSummary::from_actions(&actions);
        assert_eq!(summary.by_type["MOVE_FOLDER"], 2);
        assert_eq!(summary.by_type["ADD_FLAG"], 1);
        assert_eq!(summary.by_folder["Archive"], 2);
        assert_eq!(summary.by_folder.len(), 1);
    }

    #[test]
    fn message_update_per_action_type() {
        assert_eq!(
            MessageUpdate::for_action(ActionType::MoveFolder).unwrap().archived,
            Some(true)
        );
        assert_eq!(
            MessageUpdate::for_action(ActionType::AddFlag).unwrap().flagged,
            Some(true)
        );
        assert!(MessageUpdate::for_action(ActionType::MarkRead).is_none());
    }

    #[test]
    fn audit_record_merges_data() {
        let action = PendingAction::new("e1", ActionType::Delete, None, "spam", ProposedBy::System);
        let record = AuditRecord::new(AuditEvent::ActionFailed, &action, "failed")
            .with_data(serde_json::json!({"error_code": "X"}));
        assert_eq!(record.data["error_code"], "X");
        assert_eq!(record.data["email_id"], "e1");
    }
    #[test]
    fn filter_bounds() {
        assert!(ActionFilter::default().validate().is_ok());
        let mut filter = ActionFilter::default();
        filter.page = 0;
        assert!(filter.validate().is_err());
        filter.page = 3;
        filter.page_size = 101;
        assert!(filter.validate().is_err());
        filter.page_size = 10;
        assert_eq!(filter.offset(), 20);
    }

    #[test]
    fn page_count_rounds_up() {
        let filter = ActionFilter {
            page_size: 20,
            ..ActionFilter::default()
        };
        assert_eq!(ActionPage::new(Vec::new(), 41, &filter).pages, 3);
        assert_eq!(ActionPage::new(Vec::new(), 0, &filter).pages, 0);
    }

    #[test]
    fn summary_from_groups() {
        let summary = ActionSummaryCounts::from_groups(&[
            (ActionStatus::Pending, ActionType::MoveFolder, 3),
            (ActionStatus::Pending, ActionType::AddFlag, 1),
            (ActionStatus::Applied, ActionType::MoveFolder, 2),
        ]);
        assert_eq!(summary.total, 6);
        assert_eq!(summary.status(ActionStatus::Pending), 4);
        assert_eq!(summary.status(ActionStatus::Rejected), 0);
        assert_eq!(summary.pending_by_type["MOVE_FOLDER"], 3);
        assert_eq!(summary.pending_by_type["DELETE"], 0);
    }
}
