//! One WebSocket connection's sender half
//!
//! The registry never touches the socket directly; it hands events to the
//! bounded channel owned by the connection's pump task. A full channel is
//! backpressure, a closed channel means the pump task is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use super::events::ServerEvent;

pub type ConnectionId = String;

/// Delivery failure for a single connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Backpressure: event channel full")]
    Backpressure,

    #[error("Connection closed")]
    Closed,
}

/// Registered state for one client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    tx: mpsc::Sender<ServerEvent>,
    opened_at: u64,
    last_seen: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Connection {
    pub fn new(id: ConnectionId, user_id: String, tx: mpsc::Sender<ServerEvent>) -> Self {
        let now = epoch_secs();
        Self {
            id,
            user_id,
            tx,
            opened_at: now,
            last_seen: AtomicU64::new(now),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn opened_at_epoch_secs(&self) -> u64 {
        self.opened_at
    }

    /// Record client activity, refreshing the staleness clock.
    pub fn touch(&self) {
        self.last_seen.store(epoch_secs(), Ordering::Relaxed);
    }

    pub fn idle_seconds(&self) -> u64 {
        epoch_secs().saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }

    /// Whether the connection has been silent longer than `ttl_seconds`.
    pub fn is_expired(&self, ttl_seconds: u64) -> bool {
        self.idle_seconds() > ttl_seconds
    }

    /// Queue an event for delivery without blocking.
    pub fn try_send(&self, event: ServerEvent) -> Result<(), SendError> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.events_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                Err(SendError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn drop_rate_percent(&self) -> f64 {
        let sent = self.events_sent();
        let dropped = self.events_dropped();
        let total = sent.saturating_add(dropped);
        if total == 0 {
            0.0
        } else {
            (dropped as f64 / total as f64) * 100.0
        }
    }

    /// Shift the staleness clock into the past so TTL paths can be tested
    /// without sleeping.
    #[cfg(test)]
    pub(crate) fn backdate_last_seen(&self, seconds: u64) {
        self.last_seen
            .store(epoch_secs().saturating_sub(seconds), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(capacity: usize) -> (Connection, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Connection::new("conn-1".to_string(), "u-1".to_string(), tx);
        (conn, rx)
    }

    #[tokio::test]
    async fn test_send_and_counters() {
        let (conn, mut rx) = test_connection(4);
        conn.try_send(ServerEvent::Ping { timestamp: 1 }).unwrap();
        assert_eq!(conn.events_sent(), 1);
        assert!(matches!(rx.recv().await, Some(ServerEvent::Ping { .. })));
    }

    #[tokio::test]
    async fn test_backpressure_on_full_channel() {
        let (conn, _rx) = test_connection(1);
        conn.try_send(ServerEvent::Ping { timestamp: 1 }).unwrap();
        let err = conn.try_send(ServerEvent::Ping { timestamp: 2 }).unwrap_err();
        assert_eq!(err, SendError::Backpressure);
        assert_eq!(conn.events_dropped(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_detected() {
        let (conn, rx) = test_connection(1);
        drop(rx);
        let err = conn.try_send(ServerEvent::Ping { timestamp: 1 }).unwrap_err();
        assert_eq!(err, SendError::Closed);
    }

    #[tokio::test]
    async fn test_drop_rate_math() {
        let (conn, _rx) = test_connection(1);
        assert_eq!(conn.drop_rate_percent(), 0.0);
        conn.try_send(ServerEvent::Ping { timestamp: 1 }).unwrap();
        let _ = conn.try_send(ServerEvent::Ping { timestamp: 2 });
        assert!((conn.drop_rate_percent() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_staleness() {
        let (conn, _rx) = test_connection(1);
        assert!(!conn.is_expired(60));
        conn.backdate_last_seen(120);
        assert!(conn.is_expired(60));
        conn.touch();
        assert!(!conn.is_expired(60));
    }
}
