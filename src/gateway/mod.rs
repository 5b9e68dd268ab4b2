//! Mailbox gateway: scoped sessions exposing the four mutating primitives.
//!
//! `open()` is the only place a `GatewayError::Connect` can come from, so the
//! orchestrator can tell "mailbox unreachable" (retry later, nothing changed)
//! apart from "the server refused this one mutation".

pub mod imap;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;

pub use imap::ImapGateway;

/// Opens mailbox sessions.
#[async_trait]
pub trait MailboxGateway: Send + Sync {
    /// Connect, authenticate, and select the inbox.
    async fn open(&self) -> Result<Box<dyn MailboxSession>, GatewayError>;
}

/// A live, authenticated mailbox connection.
#[async_trait]
pub trait MailboxSession: Send {
    /// Set the \Seen flag.
    async fn mark_read(&mut self, uid: u32) -> Result<(), GatewayError>;

    /// Move the message to `folder`, creating the folder if needed.
    async fn move_to_folder(&mut self, uid: u32, folder: &str) -> Result<(), GatewayError>;

    /// Set the \Flagged flag.
    async fn add_flag(&mut self, uid: u32) -> Result<(), GatewayError>;

    /// Move the message to the trash folder. Never expunges.
    async fn delete(&mut self, uid: u32) -> Result<(), GatewayError>;

    /// Log out. Errors are swallowed by callers; the session is done either way.
    async fn close(&mut self) -> Result<(), GatewayError>;
}

/// Time bounds for gateway calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub operation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            operation: Duration::from_secs(30),
        }
    }
}

/// Gateway used when no mailbox is configured. Every open fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredGateway;

#[async_trait]
impl MailboxGateway for UnconfiguredGateway {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, GatewayError> {
        Err(GatewayError::Connect {
            reason: "mailbox not configured".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_gateway_reports_connect_error() {
        let result = UnconfiguredGateway.open().await;
        assert!(matches!(result, Err(GatewayError::Connect { .. })));
    }
}
