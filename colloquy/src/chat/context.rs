//! Per-request execution context
//!
//! Carries the identity of the user a piece of work is running for, plus the
//! correlation ids (session / thread / run / request) stamped onto every
//! envelope, event and orchestrator call that work produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and correlation ids for one unit of gateway work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// User the work runs on behalf of
    pub user_id: String,
    /// Chat session the work belongs to
    pub session_id: String,
    /// Optional client-side thread within the channel
    pub thread_id: Option<String>,
    /// Run correlating one agent execution
    pub run_id: String,
    /// Request correlating one inbound message
    pub request_id: String,
    /// When this context was created
    pub issued_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Create a context for an inbound message on `channel_id`.
    ///
    /// Generates fresh run and request ids; the session id is derived from
    /// the (channel, user) pair so repeated messages share a session.
    pub fn new(user_id: &str, channel_id: &str, thread_id: Option<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: super::session_id_for(channel_id, user_id),
            thread_id,
            run_id: format!("run-{}", uuid::Uuid::new_v4()),
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            issued_at: Utc::now(),
        }
    }

    /// Derive a context for a follow-up request inside the same session and
    /// run. Only the request id is refreshed.
    pub fn child_request(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            issued_at: Utc::now(),
        }
    }
}
