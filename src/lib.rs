//! Mailwarden: approval-gated mailbox mutations.

pub mod actions;
pub mod config;
pub mod error;
pub mod gateway;
pub mod safety;
pub mod store;
