//! Agent orchestration seam
//!
//! The gateway dispatches agent executions; it never runs them. Completion
//! comes back asynchronously through `complete_agent_execution` on the
//! gateway, so dispatch here is fire-and-forget.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::error::{GatewayError, GatewayResult};

use super::context::ExecutionContext;

/// One agent execution request handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub context: ExecutionContext,
    pub prompt: String,
}

/// Completion report the orchestrator posts back to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub run_id: String,
    pub success: bool,
    pub summary: Option<String>,
}

#[async_trait]
pub trait AgentOrchestrator: Send + Sync + std::fmt::Debug {
    /// Dispatch an agent execution for the given request.
    async fn execute_agent(&self, request: AgentRequest) -> GatewayResult<()>;
}

/// Log-only orchestrator for testing and secretless local runs.
#[derive(Debug, Clone, Default)]
pub struct LogOnlyOrchestrator;

impl LogOnlyOrchestrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentOrchestrator for LogOnlyOrchestrator {
    async fn execute_agent(&self, request: AgentRequest) -> GatewayResult<()> {
        log::info!(
            "[LogOnlyOrchestrator] WOULD EXECUTE agent for run {} (session {}, user {})",
            request.context.run_id, request.context.session_id, request.context.user_id
        );
        Ok(())
    }
}

/// Orchestrator seam over HTTP: POSTs the request JSON to the configured
/// execute URL, with a minimum interval between dispatches.
#[derive(Debug)]
pub struct HttpOrchestrator {
    execute_url: String,
    client: reqwest::Client,
    min_dispatch_interval: Duration,
    last_dispatch_at: StdMutex<Option<Instant>>,
}

impl HttpOrchestrator {
    pub fn new(config: &OrchestratorConfig) -> GatewayResult<Self> {
        let execute_url = config
            .execute_url
            .clone()
            .ok_or_else(|| GatewayError::Config("Orchestrator URL not configured".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            execute_url,
            client,
            min_dispatch_interval: Duration::from_millis(config.min_dispatch_interval_ms),
            last_dispatch_at: StdMutex::new(None),
        })
    }

    fn enforce_rate_limit(&self) -> GatewayResult<()> {
        let mut guard = self
            .last_dispatch_at
            .lock()
            .map_err(|_| GatewayError::Generic("Failed to lock rate limiter".to_string()))?;
        let now = Instant::now();
        if let Some(last) = *guard {
            if now.duration_since(last) < self.min_dispatch_interval {
                return Err(GatewayError::RateLimited);
            }
        }
        *guard = Some(now);
        Ok(())
    }
}

#[async_trait]
impl AgentOrchestrator for HttpOrchestrator {
    async fn execute_agent(&self, request: AgentRequest) -> GatewayResult<()> {
        self.enforce_rate_limit()?;

        let resp = self
            .client
            .post(&self.execute_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Network(format!("Agent dispatch failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Network(format!(
                "Orchestrator returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AgentRequest {
        AgentRequest {
            context: ExecutionContext::new("u-1", "general", None),
            prompt: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_only_orchestrator_resolves() {
        let orchestrator = LogOnlyOrchestrator::new();
        assert!(orchestrator.execute_agent(request()).await.is_ok());
    }

    #[test]
    fn test_http_orchestrator_requires_url() {
        let config = OrchestratorConfig::default();
        assert!(matches!(
            HttpOrchestrator::new(&config),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_rate_limit_gate() {
        let config = OrchestratorConfig {
            execute_url: Some("http://127.0.0.1:9/execute".to_string()),
            request_timeout_secs: 1,
            min_dispatch_interval_ms: 10_000,
        };
        let orchestrator = HttpOrchestrator::new(&config).unwrap();
        assert!(orchestrator.enforce_rate_limit().is_ok());
        assert_eq!(
            orchestrator.enforce_rate_limit(),
            Err(GatewayError::RateLimited)
        );
    }

    #[test]
    fn test_outcome_serde() {
        let outcome = AgentOutcome {
            run_id: "run-1".to_string(),
            success: true,
            summary: Some("done".to_string()),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: AgentOutcome = serde_json::from_str(&json).unwrap();
        assert!(back.success);
        assert_eq!(back.run_id, "run-1");
    }
}
