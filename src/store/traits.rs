//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::actions::model::{
    ActionFilter, ActionStatus, ActionType, ApplyToken, AuditRecord, MessageRecord,
    MessageUpdate, PendingAction, StatusChange,
};
use crate::error::DatabaseError;

/// Result of inserting an action.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted,
    /// An open action for the same email and type already exists.
    Duplicate(PendingAction),
}

/// Backend-agnostic database trait covering actions, tokens, messages, and audit.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a processed message record.
    async fn insert_message(&self, message: &MessageRecord) -> Result<(), DatabaseError>;

    /// Get a message record by its store ID.
    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError>;

    // ── Actions ─────────────────────────────────────────────────────

    /// Insert an action together with its audit record.
    ///
    /// Open actions (PENDING/APPROVED) are checked for an existing open
    /// action with the same `(email_id, action_type)` under the write lock.
    async fn insert_action(
        &self,
        action: &PendingAction,
        audit: &AuditRecord,
    ) -> Result<InsertOutcome, DatabaseError>;

    /// Get an action by ID.
    async fn get_action(&self, id: Uuid) -> Result<Option<PendingAction>, DatabaseError>;

    /// APPROVED actions in creation order, at most `limit`.
    async fn approved_actions(&self, limit: usize) -> Result<Vec<PendingAction>, DatabaseError>;

    /// A page of actions (newest first) plus the total matching count.
    async fn list_actions(
        &self,
        filter: &ActionFilter,
    ) -> Result<(Vec<PendingAction>, u64), DatabaseError>;

    /// Action counts grouped by status and type.
    async fn action_counts(&self) -> Result<Vec<(ActionStatus, ActionType, u64)>, DatabaseError>;

    /// Compare-and-set `from → to`, writing the audit record (and the optional
    /// message projection flip) in the same transaction.
    ///
    /// Returns false, with nothing written, if the action is not in `from`.
    /// A `from → to` pair outside the status lifecycle is an error.
    async fn transition_action(
        &self,
        id: Uuid,
        from: ActionStatus,
        to: ActionStatus,
        change: &StatusChange,
        message_update: Option<MessageUpdate>,
        audit: &AuditRecord,
    ) -> Result<bool, DatabaseError>;

    // ── Apply tokens ────────────────────────────────────────────────

    /// Persist a freshly issued token.
    async fn insert_token(&self, token: &ApplyToken) -> Result<(), DatabaseError>;

    /// Look up a token by its string value.
    async fn get_token(&self, token: &str) -> Result<Option<ApplyToken>, DatabaseError>;

    /// Mark an unused, unexpired token used. Returns false if it was already
    /// used, expired, or unknown.
    async fn consume_token(&self, token: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Delete tokens that expired before `now`. Returns how many were removed.
    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    /// Audit records for an action, oldest first.
    async fn audit_for_action(&self, action_id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError>;
}
