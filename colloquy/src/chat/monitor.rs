//! Registry monitoring and threshold alerting
//!
//! Runs as a background task that periodically:
//! 1. Prunes expired connections and idle sessions (TTL policy)
//! 2. Snapshots the registry and evaluates alert thresholds
//!
//! An alert fires once when its condition becomes true and re-arms only
//! after the condition clears, so a persistently-breached threshold does not
//! spam the log on every tick.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{AlertThresholds, MonitorConfig, RegistryConfig};

use super::events::ServerEvent;
use super::registry::{ConnectionRegistry, RegistrySnapshot};
use super::session::SessionRegistry;

const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Threshold classes the monitor can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    ConnectionLimit,
    UserFanoutLimit,
    StaleConnections,
    DropRate,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::ConnectionLimit => "connection_limit",
            AlertKind::UserFanoutLimit => "user_fanout_limit",
            AlertKind::StaleConnections => "stale_connections",
            AlertKind::DropRate => "drop_rate",
        }
    }
}

/// One raised alert.
#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

/// Overall registry health as of the last tick.
#[derive(Debug, Clone)]
pub enum RegistryHealth {
    Healthy,
    Degraded { alerts: Vec<Alert> },
}

/// Evaluate thresholds against one registry snapshot.
///
/// Pure so the alerting rules are testable without a running monitor.
pub fn evaluate_thresholds(
    snapshot: &RegistrySnapshot,
    widest_user: Option<(String, usize)>,
    thresholds: &AlertThresholds,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if snapshot.connections > thresholds.max_connections {
        alerts.push(Alert {
            kind: AlertKind::ConnectionLimit,
            message: format!(
                "{} connections exceed limit {}",
                snapshot.connections, thresholds.max_connections
            ),
        });
    }

    if let Some((user_id, fanout)) = widest_user {
        if fanout > thresholds.max_connections_per_user {
            alerts.push(Alert {
                kind: AlertKind::UserFanoutLimit,
                message: format!(
                    "user {} holds {} connections, limit {}",
                    user_id, fanout, thresholds.max_connections_per_user
                ),
            });
        }
    }

    if snapshot.connections > 0 {
        let stale_ratio = (snapshot.stale_connections as f64 / snapshot.connections as f64) * 100.0;
        if stale_ratio > thresholds.max_stale_ratio_percent {
            alerts.push(Alert {
                kind: AlertKind::StaleConnections,
                message: format!(
                    "{:.1}% of connections stale, limit {:.1}%",
                    stale_ratio, thresholds.max_stale_ratio_percent
                ),
            });
        }
    }

    let total_events = snapshot.events_sent.saturating_add(snapshot.events_dropped);
    if total_events > 0 {
        let drop_rate = (snapshot.events_dropped as f64 / total_events as f64) * 100.0;
        if drop_rate > thresholds.max_drop_rate_percent {
            alerts.push(Alert {
                kind: AlertKind::DropRate,
                message: format!(
                    "{:.1}% of events dropped, limit {:.1}%",
                    drop_rate, thresholds.max_drop_rate_percent
                ),
            });
        }
    }

    alerts
}

/// Background monitor over the connection and session registries.
#[derive(Debug)]
pub struct GatewayMonitor {
    check_interval: Duration,
    thresholds: AlertThresholds,
    connection_ttl_seconds: u64,
    session_ttl_seconds: u64,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionRegistry>,
    alerts_tx: broadcast::Sender<ServerEvent>,
    active_alerts: StdMutex<HashSet<&'static str>>,
}

impl GatewayMonitor {
    pub fn new(
        monitor_config: &MonitorConfig,
        registry_config: &RegistryConfig,
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let (alerts_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            check_interval: Duration::from_secs(monitor_config.check_interval_secs),
            thresholds: monitor_config.thresholds.clone(),
            connection_ttl_seconds: registry_config.connection_ttl_seconds,
            session_ttl_seconds: registry_config.session_ttl_seconds,
            registry,
            sessions,
            alerts_tx,
            active_alerts: StdMutex::new(HashSet::new()),
        }
    }

    /// Subscribe to the alert stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.alerts_tx.subscribe()
    }

    /// Run the monitoring loop.
    pub async fn run(self: Arc<Self>) {
        info!("[Monitor] Starting registry monitor loop...");
        let mut ticker = interval(self.check_interval);

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One poll cycle: snapshot, prune, evaluate, raise.
    pub async fn tick(&self) -> RegistryHealth {
        // Snapshot before pruning so staleness is visible to the thresholds.
        let snapshot = self.registry.snapshot(self.connection_ttl_seconds);
        let widest = self.registry.widest_user();

        let pruned_connections = self.registry.prune_expired(self.connection_ttl_seconds);
        if !pruned_connections.is_empty() {
            debug!(
                "[Monitor] Pruned {} expired connections",
                pruned_connections.len()
            );
        }
        let pruned_sessions = self.sessions.prune_idle(self.session_ttl_seconds).await;
        if !pruned_sessions.is_empty() {
            debug!("[Monitor] Pruned {} idle sessions", pruned_sessions.len());
        }

        let alerts = evaluate_thresholds(&snapshot, widest, &self.thresholds);
        let raised = self.reconcile_alerts(&alerts);
        for alert in &raised {
            warn!(
                "[Monitor] Alert {}: {}",
                alert.kind.as_str(),
                alert.message
            );
            // Ignore send errors (no admin subscribers)
            let _ = self.alerts_tx.send(ServerEvent::Alert {
                kind: alert.kind.as_str().to_string(),
                message: alert.message.clone(),
                timestamp: Utc::now().timestamp() as u64,
            });
        }

        if alerts.is_empty() {
            RegistryHealth::Healthy
        } else {
            RegistryHealth::Degraded { alerts }
        }
    }

    /// Track which alert kinds are currently firing; return only the newly
    /// raised ones and re-arm the ones whose condition cleared.
    fn reconcile_alerts(&self, alerts: &[Alert]) -> Vec<Alert> {
        let mut active = self.active_alerts.lock().unwrap_or_else(|e| e.into_inner());
        let current: HashSet<&'static str> = alerts.iter().map(|a| a.kind.as_str()).collect();

        let raised: Vec<Alert> = alerts
            .iter()
            .filter(|a| !active.contains(a.kind.as_str()))
            .cloned()
            .collect();

        let cleared: Vec<&'static str> = active.difference(&current).copied().collect();
        for kind in &cleared {
            debug!("[Monitor] Alert {} cleared", kind);
        }

        *active = current;
        raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::connection::Connection;
    use tokio::sync::mpsc;

    fn snapshot(
        connections: usize,
        stale: usize,
        sent: u64,
        dropped: u64,
    ) -> RegistrySnapshot {
        RegistrySnapshot {
            connections,
            users: connections,
            stale_connections: stale,
            events_sent: sent,
            events_dropped: dropped,
        }
    }

    #[test]
    fn test_healthy_snapshot_raises_nothing() {
        let thresholds = AlertThresholds::default();
        let alerts = evaluate_thresholds(&snapshot(10, 0, 100, 0), None, &thresholds);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_connection_limit_alert() {
        let thresholds = AlertThresholds {
            max_connections: 5,
            ..AlertThresholds::default()
        };
        let alerts = evaluate_thresholds(&snapshot(6, 0, 0, 0), None, &thresholds);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ConnectionLimit);
    }

    #[test]
    fn test_user_fanout_alert() {
        let thresholds = AlertThresholds {
            max_connections_per_user: 2,
            ..AlertThresholds::default()
        };
        let alerts = evaluate_thresholds(
            &snapshot(3, 0, 0, 0),
            Some(("u-1".to_string(), 3)),
            &thresholds,
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::UserFanoutLimit);
        assert!(alerts[0].message.contains("u-1"));
    }

    #[test]
    fn test_stale_ratio_alert() {
        let thresholds = AlertThresholds {
            max_stale_ratio_percent: 25.0,
            ..AlertThresholds::default()
        };
        let alerts = evaluate_thresholds(&snapshot(4, 2, 0, 0), None, &thresholds);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::StaleConnections);
    }

    #[test]
    fn test_drop_rate_alert_needs_traffic() {
        let thresholds = AlertThresholds {
            max_drop_rate_percent: 5.0,
            ..AlertThresholds::default()
        };
        // No traffic at all: no division, no alert.
        assert!(evaluate_thresholds(&snapshot(1, 0, 0, 0), None, &thresholds).is_empty());
        let alerts = evaluate_thresholds(&snapshot(1, 0, 90, 10), None, &thresholds);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::DropRate);
    }

    fn test_monitor(thresholds: AlertThresholds) -> (Arc<GatewayMonitor>, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(SessionRegistry::default());
        let monitor_config = MonitorConfig {
            check_interval_secs: 1,
            thresholds,
        };
        let registry_config = RegistryConfig::default();
        let monitor = Arc::new(GatewayMonitor::new(
            &monitor_config,
            &registry_config,
            registry.clone(),
            sessions,
        ));
        (monitor, registry)
    }

    #[tokio::test]
    async fn test_alert_raised_once_until_cleared() {
        let (monitor, registry) = test_monitor(AlertThresholds {
            max_connections: 0,
            ..AlertThresholds::default()
        });
        let mut rx = monitor.subscribe();

        let (tx, _keep) = mpsc::channel(4);
        registry.register(Arc::new(Connection::new(
            "conn-1".to_string(),
            "u-1".to_string(),
            tx,
        )));

        assert!(matches!(
            monitor.tick().await,
            RegistryHealth::Degraded { .. }
        ));
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Alert { .. })));

        // Condition still true on the next tick: degraded, but no re-send.
        assert!(matches!(
            monitor.tick().await,
            RegistryHealth::Degraded { .. }
        ));
        assert!(rx.try_recv().is_err());

        // Clear the condition, then breach it again: alert re-arms.
        registry.unregister("conn-1");
        assert!(matches!(monitor.tick().await, RegistryHealth::Healthy));

        let (tx, _keep2) = mpsc::channel(4);
        registry.register(Arc::new(Connection::new(
            "conn-2".to_string(),
            "u-1".to_string(),
            tx,
        )));
        monitor.tick().await;
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Alert { .. })));
    }

    #[tokio::test]
    async fn test_tick_prunes_expired_connections() {
        let (monitor, registry) = test_monitor(AlertThresholds::default());
        let (tx, _keep) = mpsc::channel(4);
        let conn = Arc::new(Connection::new(
            "conn-1".to_string(),
            "u-1".to_string(),
            tx,
        ));
        registry.register(conn.clone());
        conn.backdate_last_seen(RegistryConfig::default().connection_ttl_seconds + 60);

        monitor.tick().await;
        assert_eq!(registry.connection_count(), 0);
    }
}
