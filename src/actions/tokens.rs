//! Apply token ledger: issue, validate, and consume single-use tokens.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::model::{ApplyToken, PendingAction, TokenSummary};
use crate::error::{ApplyError, DatabaseError};
use crate::store::Database;

/// Length of a token string.
pub const TOKEN_LEN: usize = 48;

/// Which actions an apply call wants a token to cover.
#[derive(Debug, Clone, Copy)]
pub enum TokenScope<'a> {
    /// Everything the token was issued for.
    All,
    /// An explicit subset. Every id must be in the token's set.
    Subset(&'a [Uuid]),
    /// One action.
    Single(Uuid),
}

/// Issues and redeems apply tokens.
pub struct TokenLedger {
    db: Arc<dyn Database>,
    ttl: Duration,
}

impl TokenLedger {
    pub fn new(db: Arc<dyn Database>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Issue a token bound to exactly `actions`, in the given order.
    pub async fn issue(&self, actions: &[PendingAction]) -> Result<ApplyToken, DatabaseError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| DatabaseError::Serialization(format!("token ttl: {e}")))?;
        let now = Utc::now();
        let token = ApplyToken {
            token: generate_token(),
            action_ids: actions.iter().map(|a| a.id).collect(),
            action_count: actions.len(),
            summary: TokenSummary::from_actions(actions),
            created_at: now,
            expires_at: now + ttl,
            is_used: false,
            used_at: None,
        };
        self.db.insert_token(&token).await?;

        info!(
            count = token.action_count,
            expires_at = %token.expires_at,
            "Apply token issued"
        );
        Ok(token)
    }

    /// Check that `token` is usable for `scope`. Mutates nothing.
    pub async fn validate(&self, token: &str, scope: TokenScope<'_>) -> Result<ApplyToken, ApplyError> {
        let Some(record) = self.db.get_token(token).await? else {
            warn!("Apply token not found");
            return Err(ApplyError::TokenInvalid);
        };

        if record.is_used {
            warn!("Apply token already used");
            return Err(ApplyError::TokenInvalid);
        }
        if record.is_expired() {
            warn!(expired_at = %record.expires_at, "Apply token expired");
            return Err(ApplyError::TokenExpired);
        }

        match scope {
            TokenScope::All => {}
            TokenScope::Subset(ids) => {
                if let Some(id) = ids.iter().find(|id| !record.covers(**id)) {
                    warn!(action_id = %id, "Action not covered by apply token");
                    return Err(ApplyError::TokenMismatch { action_id: *id });
                }
            }
            TokenScope::Single(id) => {
                if !record.covers(id) {
                    warn!(action_id = %id, "Action not covered by apply token");
                    return Err(ApplyError::TokenMismatch { action_id: id });
                }
            }
        }

        debug!(count = record.action_count, "Apply token valid");
        Ok(record)
    }

    /// Atomically mark the token used. Returns false if something else
    /// consumed it first or it expired in the meantime.
    pub async fn consume(&self, token: &str) -> Result<bool, DatabaseError> {
        let consumed = self.db.consume_token(token, Utc::now()).await?;
        if consumed {
            info!("Apply token consumed");
        }
        Ok(consumed)
    }

    /// Drop expired tokens.
    pub async fn purge_expired(&self) -> Result<usize, DatabaseError> {
        self.db.purge_expired_tokens(Utc::now()).await
    }
}

/// 48 alphanumeric characters from the OS CSPRNG.
fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::model::{ActionType, ProposedBy};
    use crate::store::LibSqlBackend;

    async fn ledger(ttl: Duration) -> TokenLedger {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        TokenLedger::new(db, ttl)
    }

    fn actions(n: usize) -> Vec<PendingAction> {
        (0..n)
            .map(|i| {
                PendingAction::new(
                    format!("e{i}"),
                    ActionType::MoveFolder,
                    Some("Archive".into()),
                    "archive",
                    ProposedBy::System,
                )
            })
            .collect()
    }

    #[test]
    fn generated_tokens_are_alphanumeric_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn issue_binds_exact_ids() {
        let ledger = ledger(Duration::from_secs(300)).await;
        let actions = actions(3);
        let token = ledger.issue(&actions).await.unwrap();

        assert_eq!(token.action_count, 3);
        assert_eq!(
            token.action_ids,
            actions.iter().map(|a| a.id).collect::<Vec<_>>()
        );
        assert_eq!(token.summary.by_folder["Archive"], 3);
        assert!(token.expires_at > token.created_at);
    }

    #[tokio::test]
    async fn validate_checks_scope() {
        let ledger = ledger(Duration::from_secs(300)).await;
        let actions = actions(2);
        let token = ledger.issue(&actions).await.unwrap();

        assert!(ledger.validate(&token.token, TokenScope::All).await.is_ok());
        assert!(
            ledger
                .validate(&token.token, TokenScope::Single(actions[1].id))
                .await
                .is_ok()
        );

        let stranger = Uuid::new_v4();
        let err = ledger
            .validate(&token.token, TokenScope::Subset(&[actions[0].id, stranger]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::TokenMismatch { action_id } if action_id == stranger));

        let err = ledger
            .validate(&token.token, TokenScope::Single(stranger))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::TokenMismatch { .. }));
    }

    #[tokio::test]
    async fn unknown_and_used_tokens_are_invalid() {
        let ledger = ledger(Duration::from_secs(300)).await;
        let err = ledger.validate("missing", TokenScope::All).await.unwrap_err();
        assert!(matches!(err, ApplyError::TokenInvalid));

        let token = ledger.issue(&actions(1)).await.unwrap();
        assert!(ledger.consume(&token.token).await.unwrap());
        assert!(!ledger.consume(&token.token).await.unwrap());

        let err = ledger.validate(&token.token, TokenScope::All).await.unwrap_err();
        assert!(matches!(err, ApplyError::TokenInvalid));
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected_and_purged() {
        let ledger = ledger(Duration::ZERO).await;
        let token = ledger.issue(&actions(1)).await.unwrap();

        let err = ledger.validate(&token.token, TokenScope::All).await.unwrap_err();
        assert!(matches!(err, ApplyError::TokenExpired));
        assert!(!ledger.consume(&token.token).await.unwrap());

        assert_eq!(ledger.purge_expired().await.unwrap(), 1);
        let err = ledger.validate(&token.token, TokenScope::All).await.unwrap_err();
        assert!(matches!(err, ApplyError::TokenInvalid));
    }
}
