//! Chat session registry
//!
//! A session is the durable conversational state for one (channel, user)
//! pair, surviving individual WebSocket connections. The registry enforces
//! the one-active-run rule and keeps a bounded message history for
//! reconnect catch-up.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{GatewayError, GatewayResult};

use super::MessageDirection;

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// One message retained in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub direction: MessageDirection,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of one chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Run currently executing for this session, if any
    pub active_run_id: Option<String>,
    pub messages_in: u64,
    pub messages_out: u64,
    pub history: Vec<ChatMessage>,
}

impl SessionState {
    fn new(session_id: String, user_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            created_at: now,
            last_activity: now,
            active_run_id: None,
            messages_in: 0,
            messages_out: 0,
            history: Vec::new(),
        }
    }

    pub fn idle_seconds(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.last_activity)
            .num_seconds()
            .max(0) as u64
    }
}

/// Registry of chat sessions keyed by session id.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionState>>,
    history_limit: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl SessionRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            history_limit,
        }
    }

    /// Fetch or create the session, returning a snapshot of it.
    pub async fn ensure_session(&self, session_id: &str, user_id: &str) -> SessionState {
        let mut guard = self.sessions.write().await;
        guard
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id.to_string(), user_id.to_string()))
            .clone()
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Record client activity (heartbeat) on the session.
    pub async fn touch(&self, session_id: &str) {
        let mut guard = self.sessions.write().await;
        if let Some(session) = guard.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Append a message to the session history, bumping the matching counter.
    pub async fn record_message(
        &self,
        session_id: &str,
        direction: MessageDirection,
        content: &str,
    ) -> GatewayResult<()> {
        let mut guard = self.sessions.write().await;
        let session = guard
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        match direction {
            MessageDirection::Inbound => session.messages_in += 1,
            MessageDirection::Outbound => session.messages_out += 1,
        }
        session.last_activity = Utc::now();
        session.history.push(ChatMessage {
            direction,
            content: content.to_string(),
            timestamp: session.last_activity,
        });
        let overflow = session.history.len().saturating_sub(self.history_limit);
        if overflow > 0 {
            session.history.drain(0..overflow);
        }
        Ok(())
    }

    /// Claim the session for a run. Fails while another run is active.
    pub async fn set_active_run(&self, session_id: &str, run_id: &str) -> GatewayResult<()> {
        let mut guard = self.sessions.write().await;
        let session = guard
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        if let Some(existing) = &session.active_run_id {
            return Err(GatewayError::Generic(format!(
                "Session {} already has active run {}",
                session_id, existing
            )));
        }
        session.active_run_id = Some(run_id.to_string());
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Release the session after its run finished. Idempotent.
    pub async fn clear_active_run(&self, session_id: &str) {
        let mut guard = self.sessions.write().await;
        if let Some(session) = guard.get_mut(session_id) {
            session.active_run_id = None;
            session.last_activity = Utc::now();
        }
    }

    pub async fn list_active_sessions(&self) -> Vec<SessionState> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop the session entirely, returning its final state.
    pub async fn terminate_session(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.write().await.remove(session_id)
    }

    /// Remove sessions idle beyond `ttl_seconds`, keeping any with a run
    /// still in flight.
    pub async fn prune_idle(&self, ttl_seconds: u64) -> Vec<String> {
        let cutoff = Utc::now() - Duration::seconds(ttl_seconds as i64);
        let mut guard = self.sessions.write().await;
        let doomed: Vec<String> = guard
            .values()
            .filter(|s| s.active_run_id.is_none() && s.last_activity < cutoff)
            .map(|s| s.session_id.clone())
            .collect();
        for id in &doomed {
            guard.remove(id);
        }
        doomed
    }
}
