//! Connection registry with per-user fan-out
//!
//! Two maps: connection id to connection, and user id to the set of that
//! user's connection ids. All delivery goes through `try_send`, so fan-out
//! never blocks on a slow client; closed connections found during delivery
//! are unregistered inline.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionId, SendError};
use super::events::ServerEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanoutError {
    #[error("All connections closed")]
    AllConnectionsClosed,

    #[error("Partial fan-out: {failed} failed of {total} total")]
    Partial { failed: usize, total: usize },
}

/// Point-in-time registry counters for the monitor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistrySnapshot {
    pub connections: usize,
    pub users: usize,
    pub stale_connections: usize,
    pub events_sent: u64,
    pub events_dropped: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    by_user: DashMap<String, DashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and index it under its user.
    pub fn register(&self, conn: Arc<Connection>) {
        let conn_id = conn.id().to_string();
        let user_id = conn.user_id().to_string();
        self.connections.insert(conn_id.clone(), conn);
        self.by_user
            .entry(user_id.clone())
            .or_insert_with(DashSet::new)
            .insert(conn_id.clone());
        debug!(connection_id = %conn_id, user_id = %user_id, "Connection registered");
    }

    /// Remove a connection, dropping the user index entry when it was the
    /// user's last one. Idempotent.
    pub fn unregister(&self, conn_id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(conn_id)?;
        let user_id = conn.user_id().to_string();
        let mut now_empty = false;
        if let Some(set) = self.by_user.get(&user_id) {
            set.remove(conn_id);
            now_empty = set.is_empty();
        }
        if now_empty {
            self.by_user.remove_if(&user_id, |_, set| set.is_empty());
        }
        debug!(connection_id = %conn_id, user_id = %user_id, "Connection unregistered");
        Some(conn)
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(conn_id).map(|entry| entry.value().clone())
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.by_user.get(user_id) {
            Some(set) => set.iter().map(|id| id.clone()).collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// The user holding the most connections, if any.
    pub fn widest_user(&self) -> Option<(String, usize)> {
        self.by_user
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .max_by_key(|(_, n)| *n)
    }

    /// Fan one event out to every connection the user holds.
    ///
    /// Returns the delivered count. Closed connections are unregistered as
    /// they are found; backpressured connections keep the event dropped but
    /// stay registered.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> Result<usize, FanoutError> {
        let targets: Vec<ConnectionId> = match self.by_user.get(user_id) {
            Some(set) => set.iter().map(|id| id.clone()).collect(),
            None => return Ok(0),
        };
        self.deliver(&targets, event)
    }

    /// Fan one event out to every registered connection.
    pub fn broadcast_all(&self, event: &ServerEvent) -> Result<usize, FanoutError> {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.deliver(&targets, event)
    }

    fn deliver(&self, targets: &[ConnectionId], event: &ServerEvent) -> Result<usize, FanoutError> {
        let mut delivered = 0usize;
        let mut failed = 0usize;

        for conn_id in targets {
            let Some(conn) = self.get(conn_id) else { continue };
            match conn.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(SendError::Closed) => {
                    failed += 1;
                    self.unregister(conn_id);
                }
                Err(SendError::Backpressure) => {
                    failed += 1;
                    warn!(connection_id = %conn_id, "Backpressure during fan-out");
                }
            }
        }

        if failed == 0 {
            Ok(delivered)
        } else if delivered == 0 {
            Err(FanoutError::AllConnectionsClosed)
        } else {
            Err(FanoutError::Partial {
                failed,
                total: delivered + failed,
            })
        }
    }

    /// Remove every connection silent for longer than `ttl_seconds`.
    pub fn prune_expired(&self, ttl_seconds: u64) -> Vec<ConnectionId> {
        let expired: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_expired(ttl_seconds))
            .map(|entry| entry.key().clone())
            .collect();

        for conn_id in &expired {
            self.unregister(conn_id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Pruned expired connections");
        }
        expired
    }

    pub fn snapshot(&self, ttl_seconds: u64) -> RegistrySnapshot {
        let mut stale = 0usize;
        let mut sent = 0u64;
        let mut dropped = 0u64;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.is_expired(ttl_seconds) {
                stale += 1;
            }
            sent += conn.events_sent();
            dropped += conn.events_dropped();
        }
        RegistrySnapshot {
            connections: self.connections.len(),
            users: self.by_user.len(),
            stale_connections: stale,
            events_sent: sent,
            events_dropped: dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_conn(
        id: &str,
        user: &str,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(Connection::new(id.to_string(), user.to_string(), tx));
        (conn, rx)
    }

    fn ping() -> ServerEvent {
        ServerEvent::Ping { timestamp: 0 }
    }

    #[tokio::test]
    async fn test_register_unregister_round_trip() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_conn("conn-1", "u-1", 4);

        registry.register(conn);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.user_count(), 1);
        assert!(registry.get("conn-1").is_some());

        let removed = registry.unregister("conn-1");
        assert!(removed.is_some());
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.user_count(), 0, "empty user sets are dropped");

        assert!(registry.unregister("conn-1").is_none(), "idempotent");
    }

    #[tokio::test]
    async fn test_user_index_tracks_multiple_connections() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = test_conn("conn-1", "u-1", 4);
        let (c2, _rx2) = test_conn("conn-2", "u-1", 4);
        let (c3, _rx3) = test_conn("conn-3", "u-2", 4);
        registry.register(c1);
        registry.register(c2);
        registry.register(c3);

        assert_eq!(registry.connections_for_user("u-1").len(), 2);
        assert_eq!(registry.widest_user(), Some(("u-1".to_string(), 2)));

        registry.unregister("conn-1");
        assert_eq!(registry.connections_for_user("u-1").len(), 1);
        assert_eq!(registry.user_count(), 2);
    }

    #[tokio::test]
    async fn test_fanout_reaches_only_target_user() {
        let registry = ConnectionRegistry::new();
        let (c1, mut rx1) = test_conn("conn-1", "u-1", 4);
        let (c2, mut rx2) = test_conn("conn-2", "u-2", 4);
        registry.register(c1);
        registry.register(c2);

        let delivered = registry.send_to_user("u-1", &ping()).unwrap();
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fanout_to_unknown_user_is_empty() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.send_to_user("nobody", &ping()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_connections_removed_during_fanout() {
        let registry = ConnectionRegistry::new();
        let (c1, rx1) = test_conn("conn-1", "u-1", 4);
        let (c2, mut rx2) = test_conn("conn-2", "u-1", 4);
        registry.register(c1);
        registry.register(c2);
        drop(rx1);

        let result = registry.send_to_user("u-1", &ping());
        assert_eq!(
            result,
            Err(FanoutError::Partial {
                failed: 1,
                total: 2
            })
        );
        assert!(rx2.try_recv().is_ok());
        assert_eq!(registry.connection_count(), 1, "closed connection removed");
    }

    #[tokio::test]
    async fn test_all_connections_closed() {
        let registry = ConnectionRegistry::new();
        let (c1, rx1) = test_conn("conn-1", "u-1", 4);
        registry.register(c1);
        drop(rx1);

        let result = registry.send_to_user("u-1", &ping());
        assert_eq!(result, Err(FanoutError::AllConnectionsClosed));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_all() {
        let registry = ConnectionRegistry::new();
        let (c1, mut rx1) = test_conn("conn-1", "u-1", 4);
        let (c2, mut rx2) = test_conn("conn-2", "u-2", 4);
        registry.register(c1);
        registry.register(c2);

        let delivered = registry.broadcast_all(&ping()).unwrap();
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_prune_expired_removes_only_stale() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = test_conn("conn-1", "u-1", 4);
        let (c2, _rx2) = test_conn("conn-2", "u-2", 4);
        registry.register(c1.clone());
        registry.register(c2);

        assert!(registry.prune_expired(3600).is_empty());

        c1.backdate_last_seen(600);
        let snapshot = registry.snapshot(300);
        assert_eq!(snapshot.stale_connections, 1);

        let pruned = registry.prune_expired(300);
        assert_eq!(pruned, vec!["conn-1".to_string()]);
        assert_eq!(registry.connection_count(), 1);
        assert!(registry.get("conn-2").is_some());
        assert_eq!(registry.user_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_counts_traffic() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = test_conn("conn-1", "u-1", 1);
        registry.register(c1);

        registry.send_to_user("u-1", &ping()).unwrap();
        let _ = registry.send_to_user("u-1", &ping()); // channel full -> dropped

        let snapshot = registry.snapshot(3600);
        assert_eq!(snapshot.events_sent, 1);
        assert_eq!(snapshot.events_dropped, 1);
        assert_eq!(snapshot.users, 1);
    }
}
