//! Events streamed to WebSocket clients

use serde::{Deserialize, Serialize};

use super::MessageEnvelope;

/// Events the gateway pushes to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ServerEvent {
    /// A chat message delivered to this user (usually an assistant reply)
    #[serde(rename = "message")]
    Message { envelope: MessageEnvelope },

    /// An agent execution was dispatched for one of this user's messages
    #[serde(rename = "agent_started")]
    AgentStarted {
        run_id: String,
        session_id: String,
        timestamp: u64,
    },

    /// An agent execution finished
    #[serde(rename = "agent_completed")]
    AgentCompleted {
        run_id: String,
        session_id: String,
        success: bool,
        summary: Option<String>,
        timestamp: u64,
    },

    /// Periodic session state refresh
    #[serde(rename = "state_update")]
    StateUpdate {
        timestamp: u64,
        active_connections: usize,
        agent_busy: bool,
    },

    /// Threshold alert raised by the registry monitor
    #[serde(rename = "alert")]
    Alert {
        kind: String,
        message: String,
        timestamp: u64,
    },

    /// An inbound message was rejected
    #[serde(rename = "error")]
    Error { message: String, timestamp: u64 },

    /// WebSocket ping (keepalive)
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = ServerEvent::AgentStarted {
            run_id: "run-1".to_string(),
            session_id: "chat:general:u-1".to_string(),
            timestamp: 1000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"agent_started\""));

        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ServerEvent::AgentStarted { .. }));
    }

    #[test]
    fn test_alert_event_shape() {
        let event = ServerEvent::Alert {
            kind: "connection_limit".to_string(),
            message: "too many connections".to_string(),
            timestamp: 42,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"alert\""));
        assert!(json.contains("connection_limit"));
    }
}
