//! Pending actions: approval queue, apply tokens, and the apply pipeline.

pub mod apply;
pub mod approval;
pub mod model;
pub mod routes;
pub mod tokens;

pub use apply::{ApplyOrchestrator, ApplyReport, ApplyRequest, Outcome, Preview, PreviewRequest};
pub use approval::{ApprovalService, EnqueueOutcome, NewAction};
pub use routes::{AppState, action_routes};
pub use tokens::TokenLedger;
