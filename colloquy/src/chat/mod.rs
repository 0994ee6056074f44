//! Realtime chat layer: connection registry, session bookkeeping and the
//! seams to the external auth and agent-orchestration services.
//!
//! The gateway owns connection fan-out and correlation-id stamping; it never
//! executes agents itself and never stores credentials. Both of those live
//! behind traits implemented against external services.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::chat::context::ExecutionContext;

pub mod auth;
pub mod connection;
pub mod context;
pub mod events;
#[cfg(feature = "server")]
pub mod gateway;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod run;
pub mod session;

pub use auth::{AllowListVerifier, IdentityVerifier, SharedSecretVerifier, UserIdentity};
pub use connection::{Connection, ConnectionId, SendError};
pub use context::ExecutionContext as ChatExecutionContext;
pub use events::ServerEvent;
#[cfg(feature = "server")]
pub use gateway::{ChatGateway, InboundReceipt};
pub use monitor::{Alert, AlertKind, GatewayMonitor, RegistryHealth};
pub use orchestrator::{AgentOrchestrator, AgentOutcome, AgentRequest, HttpOrchestrator, LogOnlyOrchestrator};
pub use registry::{ConnectionRegistry, FanoutError, RegistrySnapshot};
pub use run::{new_shared_run_store, Run, RunState, RunStore, SharedRunStore};
pub use session::{ChatMessage, SessionRegistry, SessionState};

/// Direction of a chat message relative to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// One chat message crossing the gateway boundary, stamped with the
/// correlation ids of the execution context that carried it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub timestamp: String,
    pub direction: MessageDirection,
    pub content: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl MessageEnvelope {
    /// Build an inbound envelope stamped with the context's correlation ids.
    pub fn inbound(context: &ExecutionContext, channel_id: &str, content: String) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            channel_id: channel_id.to_string(),
            sender_id: context.user_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            direction: MessageDirection::Inbound,
            content,
            thread_id: context.thread_id.clone(),
            reply_to: None,
            session_id: Some(context.session_id.clone()),
            run_id: Some(context.run_id.clone()),
            request_id: Some(context.request_id.clone()),
        }
    }

    /// Build the outbound reply carrying the same correlation ids as the run
    /// that produced it.
    pub fn outbound_reply(
        session_id: &str,
        run_id: &str,
        channel_id: &str,
        content: String,
        reply_to: Option<String>,
    ) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            channel_id: channel_id.to_string(),
            sender_id: "assistant".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            direction: MessageDirection::Outbound,
            content,
            thread_id: None,
            reply_to,
            session_id: Some(session_id.to_string()),
            run_id: Some(run_id.to_string()),
            request_id: None,
        }
    }
}

/// Canonical session id for a (channel, user) pair.
///
/// Every inbound path derives the session id the same way so that WebSocket
/// and HTTP ingestion land in the same session.
pub fn session_id_for(channel_id: &str, user_id: &str) -> String {
    format!("chat:{}:{}", channel_id, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        assert_eq!(session_id_for("general", "u-42"), "chat:general:u-42");
    }

    #[test]
    fn test_inbound_envelope_carries_correlation_ids() {
        let ctx = ExecutionContext::new("u-1", "general", None);
        let envelope = MessageEnvelope::inbound(&ctx, "general", "hello".to_string());

        assert_eq!(envelope.sender_id, "u-1");
        assert_eq!(envelope.direction, MessageDirection::Inbound);
        assert_eq!(envelope.session_id.as_deref(), Some(ctx.session_id.as_str()));
        assert_eq!(envelope.run_id.as_deref(), Some(ctx.run_id.as_str()));
        assert_eq!(envelope.request_id.as_deref(), Some(ctx.request_id.as_str()));
    }

    #[test]
    fn test_envelope_serde_skips_absent_ids() {
        let envelope = MessageEnvelope {
            id: "msg-1".to_string(),
            channel_id: "general".to_string(),
            sender_id: "u-1".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            direction: MessageDirection::Outbound,
            content: "hi".to_string(),
            thread_id: None,
            reply_to: None,
            session_id: None,
            run_id: None,
            request_id: None,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("run_id"));
        assert!(json.contains("\"direction\":\"outbound\""));
    }
}
