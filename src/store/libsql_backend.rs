//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes go through a
//! single async mutex so a status change and its audit record always commit
//! together.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::actions::model::{
    ActionFilter, ActionStatus, ActionType, ApplyToken, AuditEvent, AuditRecord, MessageRecord,
    MessageUpdate, PendingAction, ProposedBy, StatusChange, TokenSummary,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, InsertOutcome};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text comparison is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_time(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_bool(b: Option<bool>) -> libsql::Value {
    match b {
        Some(b) => libsql::Value::Integer(i64::from(b)),
        None => libsql::Value::Null,
    }
}

fn parse_column<T>(value: &str, column: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

/// Map a libsql Row to a PendingAction.
///
/// Column order matches ACTION_COLUMNS.
fn row_to_action(row: &libsql::Row) -> Result<PendingAction, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("action row parse: {e}"));

    let id_str: String = row.get(0).map_err(get)?;
    let type_str: String = row.get(2).map_err(get)?;
    let proposed_str: String = row.get(5).map_err(get)?;
    let status_str: String = row.get(6).map_err(get)?;
    let created_str: String = row.get(14).map_err(get)?;
    let updated_str: String = row.get(15).map_err(get)?;

    Ok(PendingAction {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("action id: {e}")))?,
        email_id: row.get(1).map_err(get)?,
        action_type: parse_column::<ActionType>(&type_str, "action_type")?,
        target_folder: row.get(3).ok(),
        reason: row.get(4).map_err(get)?,
        proposed_by: parse_column::<ProposedBy>(&proposed_str, "proposed_by")?,
        status: parse_column::<ActionStatus>(&status_str, "status")?,
        approved_by: row.get(7).ok(),
        approved_at: parse_optional_datetime(&row.get(8).ok()),
        rejected_by: row.get(9).ok(),
        rejected_at: parse_optional_datetime(&row.get(10).ok()),
        applied_at: parse_optional_datetime(&row.get(11).ok()),
        error_code: row.get(12).ok(),
        error_message: row.get(13).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("message row parse: {e}"));

    let uid: Option<i64> = row.get(2).ok();
    let archived: i64 = row.get(5).map_err(get)?;
    let flagged: i64 = row.get(6).map_err(get)?;
    let created_str: String = row.get(7).map_err(get)?;

    Ok(MessageRecord {
        id: row.get(0).map_err(get)?,
        message_id: row.get(1).map_err(get)?,
        uid: uid.and_then(|u| u32::try_from(u).ok()),
        subject: row.get(3).ok(),
        sender: row.get(4).ok(),
        archived: archived != 0,
        flagged: flagged != 0,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_token(row: &libsql::Row) -> Result<ApplyToken, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("token row parse: {e}"));

    let ids_json: String = row.get(1).map_err(get)?;
    let count: i64 = row.get(2).map_err(get)?;
    let summary_json: String = row.get(3).map_err(get)?;
    let created_str: String = row.get(4).map_err(get)?;
    let expires_str: String = row.get(5).map_err(get)?;
    let is_used: i64 = row.get(6).map_err(get)?;

    let action_ids: Vec<Uuid> = serde_json::from_str(&ids_json)
        .map_err(|e| DatabaseError::Serialization(format!("token action_ids: {e}")))?;
    let summary: TokenSummary = serde_json::from_str(&summary_json).unwrap_or_default();

    Ok(ApplyToken {
        token: row.get(0).map_err(get)?,
        action_ids,
        action_count: usize::try_from(count).unwrap_or(0),
        summary,
        created_at: parse_datetime(&created_str),
        expires_at: parse_datetime(&expires_str),
        is_used: is_used != 0,
        used_at: parse_optional_datetime(&row.get(7).ok()),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditRecord, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("audit row parse: {e}"));

    let id_str: String = row.get(0).map_err(get)?;
    let event_str: String = row.get(1).map_err(get)?;
    let action_str: String = row.get(2).map_err(get)?;
    let data_str: String = row.get(6).map_err(get)?;
    let created_str: String = row.get(7).map_err(get)?;

    Ok(AuditRecord {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("audit id: {e}")))?,
        event_type: parse_column::<AuditEvent>(&event_str, "event_type")?,
        action_id: Uuid::parse_str(&action_str)
            .map_err(|e| DatabaseError::Serialization(format!("audit action_id: {e}")))?,
        email_id: row.get(3).map_err(get)?,
        email_message_id: row.get(4).ok(),
        description: row.get(5).map_err(get)?,
        data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created_str),
    })
}

/// Append an audit record. `email_message_id` is resolved from `messages`.
async fn insert_audit(conn: &Connection, audit: &AuditRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO audit_log (id, event_type, action_id, email_id, email_message_id, description, data, created_at) \
         VALUES (?1, ?2, ?3, ?4, (SELECT message_id FROM messages WHERE id = ?4), ?5, ?6, ?7)",
        params![
            audit.id.to_string(),
            audit.event_type.as_str(),
            audit.action_id.to_string(),
            audit.email_id.as_str(),
            audit.description.as_str(),
            audit.data.to_string(),
            ts(&audit.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_audit: {e}")))?;
    Ok(())
}

async fn find_open_action(
    conn: &Connection,
    email_id: &str,
    action_type: ActionType,
) -> Result<Option<PendingAction>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {ACTION_COLUMNS} FROM pending_actions \
                 WHERE email_id = ?1 AND action_type = ?2 AND status IN ('PENDING', 'APPROVED') \
                 LIMIT 1"
            ),
            params![email_id, action_type.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("find_open_action: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_action(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("find_open_action: {e}"))),
    }
}

async fn insert_action_row(conn: &Connection, action: &PendingAction) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO pending_actions ({ACTION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            action.id.to_string(),
            action.email_id.as_str(),
            action.action_type.as_str(),
            opt_text(action.target_folder.as_deref()),
            action.reason.as_str(),
            action.proposed_by.to_string(),
            action.status.as_str(),
            opt_text(action.approved_by.as_deref()),
            opt_time(action.approved_at.as_ref()),
            opt_text(action.rejected_by.as_deref()),
            opt_time(action.rejected_at.as_ref()),
            opt_time(action.applied_at.as_ref()),
            opt_text(action.error_code.as_deref()),
            opt_text(action.error_message.as_deref()),
            ts(&action.created_at),
            ts(&action.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_action: {e}")))?;
    Ok(())
}

/// The body of `transition_action`, run inside an open transaction.
async fn apply_transition(
    conn: &Connection,
    id: Uuid,
    from: ActionStatus,
    to: ActionStatus,
    change: &StatusChange,
    message_update: Option<MessageUpdate>,
    audit: &AuditRecord,
) -> Result<bool, DatabaseError> {
    let updated = conn
        .execute(
            "UPDATE pending_actions SET \
                status = ?1, updated_at = ?2, \
                approved_by = COALESCE(?3, approved_by), approved_at = COALESCE(?4, approved_at), \
                rejected_by = COALESCE(?5, rejected_by), rejected_at = COALESCE(?6, rejected_at), \
                applied_at = COALESCE(?7, applied_at), \
                error_code = COALESCE(?8, error_code), error_message = COALESCE(?9, error_message) \
             WHERE id = ?10 AND status = ?11",
            params![
                to.as_str(),
                ts(&Utc::now()),
                opt_text(change.approved_by.as_deref()),
                opt_time(change.approved_at.as_ref()),
                opt_text(change.rejected_by.as_deref()),
                opt_time(change.rejected_at.as_ref()),
                opt_time(change.applied_at.as_ref()),
                opt_text(change.error_code.as_deref()),
                opt_text(change.error_message.as_deref()),
                id.to_string(),
                from.as_str(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("transition_action: {e}")))?;

    if updated == 0 {
        return Ok(false);
    }

    if let Some(update) = message_update {
        conn.execute(
            "UPDATE messages SET archived = COALESCE(?1, archived), flagged = COALESCE(?2, flagged) \
             WHERE id = (SELECT email_id FROM pending_actions WHERE id = ?3)",
            params![
                opt_bool(update.archived),
                opt_bool(update.flagged),
                id.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("transition_action message update: {e}")))?;
    }

    insert_audit(conn, audit).await?;
    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

const ACTION_COLUMNS: &str = "id, email_id, action_type, target_folder, reason, proposed_by, status, approved_by, approved_at, rejected_by, rejected_at, applied_at, error_code, error_message, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, message_id, uid, subject, sender, archived, flagged, created_at";

const TOKEN_COLUMNS: &str = "token, action_ids, action_count, summary, created_at, expires_at, is_used, used_at";

const AUDIT_COLUMNS: &str = "id, event_type, action_id, email_id, email_message_id, description, data, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &MessageRecord) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let uid = match message.uid {
            Some(uid) => libsql::Value::Integer(i64::from(uid)),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    message.id.as_str(),
                    message.message_id.as_str(),
                    uid,
                    opt_text(message.subject.as_deref()),
                    opt_text(message.sender.as_deref()),
                    i64::from(message.archived),
                    i64::from(message.flagged),
                    ts(&message.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(email_id = %message.id, "Message inserted into DB");
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    // ── Actions ─────────────────────────────────────────────────────

    async fn insert_action(
        &self,
        action: &PendingAction,
        audit: &AuditRecord,
    ) -> Result<InsertOutcome, DatabaseError> {
        let _guard = self.write_lock.lock().await;

        if action.status.is_active() {
            if let Some(existing) =
                find_open_action(self.conn(), &action.email_id, action.action_type).await?
            {
                debug!(
                    action_id = %existing.id,
                    email_id = %action.email_id,
                    action_type = %action.action_type,
                    "Open action already exists"
                );
                return Ok(InsertOutcome::Duplicate(existing));
            }
        }

        let tx = self.begin("insert_action").await?;
        let result = async {
            insert_action_row(&tx, action).await?;
            insert_audit(&tx, audit).await
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_action commit: {e}")))?;
                debug!(action_id = %action.id, status = %action.status, "Action inserted into DB");
                Ok(InsertOutcome::Inserted)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn get_action(&self, id: Uuid) -> Result<Option<PendingAction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACTION_COLUMNS} FROM pending_actions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_action: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_action(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_action: {e}"))),
        }
    }

    async fn approved_actions(&self, limit: usize) -> Result<Vec<PendingAction>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE status = 'APPROVED' \
                     ORDER BY created_at ASC, rowid ASC LIMIT ?1"
                ),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("approved_actions: {e}")))?;

        let mut actions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("approved_actions: {e}")))?
        {
            actions.push(row_to_action(&row)?);
        }
        Ok(actions)
    }

    async fn list_actions(
        &self,
        filter: &ActionFilter,
    ) -> Result<(Vec<PendingAction>, u64), DatabaseError> {
        let conn = self.conn();
        let status = opt_text(filter.status.as_ref().map(ActionStatus::as_str));
        let action_type = opt_text(filter.action_type.as_ref().map(ActionType::as_str));

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM pending_actions \
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR action_type = ?2)",
                params![status.clone(), action_type.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_actions count: {e}")))?;
        let total: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or(0),
            _ => 0,
        };

        let offset = i64::try_from(filter.offset()).unwrap_or(i64::MAX);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM pending_actions \
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR action_type = ?2) \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
                ),
                params![status, action_type, i64::from(filter.page_size), offset],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_actions: {e}")))?;

        let mut actions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_actions: {e}")))?
        {
            actions.push(row_to_action(&row)?);
        }
        Ok((actions, u64::try_from(total).unwrap_or(0)))
    }

    async fn action_counts(&self) -> Result<Vec<(ActionStatus, ActionType, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, action_type, COUNT(*) FROM pending_actions GROUP BY status, action_type",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("action_counts: {e}")))?;

        let mut groups = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("action_counts: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("action_counts row: {e}")))?;
            let action_type: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("action_counts row: {e}")))?;
            let count: i64 = row.get(2).unwrap_or(0);
            groups.push((
                parse_column::<ActionStatus>(&status, "status")?,
                parse_column::<ActionType>(&action_type, "action_type")?,
                u64::try_from(count).unwrap_or(0),
            ));
        }
        Ok(groups)
    }

    async fn transition_action(
        &self,
        id: Uuid,
        from: ActionStatus,
        to: ActionStatus,
        change: &StatusChange,
        message_update: Option<MessageUpdate>,
        audit: &AuditRecord,
    ) -> Result<bool, DatabaseError> {
        if !from.can_transition_to(to) {
            return Err(DatabaseError::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let _guard = self.write_lock.lock().await;
        let tx = self.begin("transition_action").await?;

        match apply_transition(&tx, id, from, to, change, message_update, audit).await {
            Ok(true) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("transition_action commit: {e}")))?;
                debug!(action_id = %id, from = %from, to = %to, "Action transitioned");
                Ok(true)
            }
            Ok(false) => {
                let _ = tx.rollback().await;
                debug!(action_id = %id, from = %from, to = %to, "Transition skipped, status changed");
                Ok(false)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Apply tokens ────────────────────────────────────────────────

    async fn insert_token(&self, token: &ApplyToken) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let ids_json = serde_json::to_string(&token.action_ids)
            .map_err(|e| DatabaseError::Serialization(format!("token action_ids: {e}")))?;
        let summary_json = serde_json::to_string(&token.summary)
            .map_err(|e| DatabaseError::Serialization(format!("token summary: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO apply_tokens ({TOKEN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    token.token.as_str(),
                    ids_json,
                    i64::try_from(token.action_count).unwrap_or(i64::MAX),
                    summary_json,
                    ts(&token.created_at),
                    ts(&token.expires_at),
                    i64::from(token.is_used),
                    opt_time(token.used_at.as_ref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_token: {e}")))?;
        Ok(())
    }

    async fn get_token(&self, token: &str) -> Result<Option<ApplyToken>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TOKEN_COLUMNS} FROM apply_tokens WHERE token = ?1"),
                params![token],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_token: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_token(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_token: {e}"))),
        }
    }

    async fn consume_token(&self, token: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE apply_tokens SET is_used = 1, used_at = ?1 \
                 WHERE token = ?2 AND is_used = 0 AND expires_at > ?1",
                params![ts(&now), token],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("consume_token: {e}")))?;
        Ok(count == 1)
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM apply_tokens WHERE expires_at <= ?1",
                params![ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired_tokens: {e}")))?;

        if count > 0 {
            info!(count, "Purged expired apply tokens");
        }
        Ok(count as usize)
    }

    // ── Audit ───────────────────────────────────────────────────────

    async fn audit_for_action(&self, action_id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE action_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("audit_for_action: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("audit_for_action: {e}")))?
        {
            records.push(row_to_audit(&row)?);
        }
        Ok(records)
    }
}
