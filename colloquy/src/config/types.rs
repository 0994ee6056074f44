use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Top-level configuration for the chat gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: String,
    /// Authentication seam configuration
    pub auth: AuthConfig,
    /// Connection registry tuning
    pub registry: RegistryConfig,
    /// Background monitor tuning
    pub monitor: MonitorConfig,
    /// External orchestrator seam configuration
    pub orchestrator: OrchestratorConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8710".to_string(),
            auth: AuthConfig::default(),
            registry: RegistryConfig::default(),
            monitor: MonitorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Names of the environment variables holding gateway secrets.
///
/// The auth service itself is external; the gateway only verifies the
/// shared secrets it is handed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Env var holding the secret expected from clients and connectors
    pub shared_secret_env: String,
    /// Env var holding the token gating admin endpoints
    pub admin_token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            shared_secret_env: "COLLOQUY_SHARED_SECRET".to_string(),
            admin_token_env: "COLLOQUY_ADMIN_TOKEN".to_string(),
        }
    }
}

/// Connection registry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Capacity of each connection's outbound event channel
    pub channel_capacity: usize,
    /// Seconds of inactivity before a connection is considered stale
    pub connection_ttl_seconds: u64,
    /// Seconds of inactivity before a chat session is pruned
    pub session_ttl_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            connection_ttl_seconds: 300,
            session_ttl_seconds: 1800,
        }
    }
}

/// Background monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often the monitor polls the registry (seconds)
    pub check_interval_secs: u64,
    /// Threshold values that raise alerts
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Threshold values evaluated against a registry snapshot on every monitor tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Maximum total connections before alerting
    pub max_connections: usize,
    /// Maximum connections a single user may hold before alerting
    pub max_connections_per_user: usize,
    /// Maximum percentage of stale connections before alerting
    pub max_stale_ratio_percent: f64,
    /// Maximum percentage of dropped outbound events before alerting
    pub max_drop_rate_percent: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_connections_per_user: 8,
            max_stale_ratio_percent: 25.0,
            max_drop_rate_percent: 5.0,
        }
    }
}

/// External orchestrator seam configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// URL agent execution requests are POSTed to; None selects the log-only
    /// orchestrator
    pub execute_url: Option<String>,
    /// Outbound request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Minimum interval between dispatches (milliseconds)
    pub min_dispatch_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execute_url: None,
            request_timeout_secs: 30,
            min_dispatch_interval_ms: 100,
        }
    }
}

impl GatewayConfig {
    /// Create a configuration from a TOML string
    pub fn from_toml_str(content: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration from a TOML file
    pub fn load_from_file(path: &std::path::Path) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Check structural invariants the rest of the gateway relies on
    pub fn validate(&self) -> GatewayResult<()> {
        self.bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| GatewayError::Config(format!("Invalid bind_addr: {}", self.bind_addr)))?;

        if self.registry.channel_capacity == 0 {
            return Err(GatewayError::Config(
                "registry.channel_capacity must be nonzero".to_string(),
            ));
        }
        if self.registry.connection_ttl_seconds == 0 {
            return Err(GatewayError::Config(
                "registry.connection_ttl_seconds must be nonzero".to_string(),
            ));
        }
        if self.monitor.check_interval_secs == 0 {
            return Err(GatewayError::Config(
                "monitor.check_interval_secs must be nonzero".to_string(),
            ));
        }
        let t = &self.monitor.thresholds;
        if t.max_connections == 0 || t.max_connections_per_user == 0 {
            return Err(GatewayError::Config(
                "monitor thresholds must be nonzero".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&t.max_stale_ratio_percent)
            || !(0.0..=100.0).contains(&t.max_drop_rate_percent)
        {
            return Err(GatewayError::Config(
                "monitor ratio thresholds must be percentages".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a secret through its configured env var name.
    /// Returns None when the variable is unset or empty.
    pub fn resolve_env_secret(var_name: &str) -> Option<String> {
        match std::env::var(var_name) {
            Ok(v) if !v.trim().is_empty() => Some(v),
            _ => None,
        }
    }
}
