//! HTTP/WebSocket surface of the gateway
//!
//! One axum router carries the whole boundary: the client WebSocket, the
//! trusted HTTP ingestion path, the orchestrator completion callback and the
//! admin endpoints. Every inbound message funnels through `handle_inbound`
//! regardless of which surface carried it.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Json, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

use super::auth::{IdentityVerifier, UserIdentity};
use super::connection::Connection;
use super::context::ExecutionContext;
use super::events::ServerEvent;
use super::monitor::GatewayMonitor;
use super::orchestrator::{AgentOrchestrator, AgentOutcome, AgentRequest};
use super::registry::ConnectionRegistry;
use super::run::{new_shared_run_store, Run, RunState, SharedRunStore};
use super::session::SessionRegistry;
use super::{MessageDirection, MessageEnvelope};

const INGEST_SECRET_HEADER: &str = "x-colloquy-gateway-secret";
const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// The running gateway: shared state plus the router that serves it.
#[derive(Clone)]
pub struct ChatGateway {
    state: Arc<GatewayState>,
}

struct GatewayState {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionRegistry>,
    runs: SharedRunStore,
    monitor: Arc<GatewayMonitor>,
    orchestrator: Arc<dyn AgentOrchestrator>,
    verifier: Arc<dyn IdentityVerifier>,
    ingest_secret: Option<String>,
    admin_token: Option<String>,
}

impl GatewayState {
    fn ingest_authorized(&self, headers: &HeaderMap) -> bool {
        let presented = headers
            .get(INGEST_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match &self.ingest_secret {
            Some(secret) => presented == secret,
            None => false,
        }
    }

    fn admin_authorized(&self, presented: Option<&str>) -> bool {
        match (&self.admin_token, presented) {
            (Some(expected), Some(presented)) => expected == presented,
            _ => false,
        }
    }
}

/// What became of one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct InboundReceipt {
    pub accepted: bool,
    pub run_id: Option<String>,
    pub error: Option<String>,
}

impl ChatGateway {
    /// Assemble the gateway state without binding the listener.
    ///
    /// Secrets are resolved here, once, through the env var names the config
    /// carries. Missing secrets disable the surfaces that need them rather
    /// than failing startup.
    pub fn new(
        config: GatewayConfig,
        orchestrator: Arc<dyn AgentOrchestrator>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(SessionRegistry::default());
        let monitor = Arc::new(GatewayMonitor::new(
            &config.monitor,
            &config.registry,
            registry.clone(),
            sessions.clone(),
        ));

        let ingest_secret = GatewayConfig::resolve_env_secret(&config.auth.shared_secret_env);
        let admin_token = GatewayConfig::resolve_env_secret(&config.auth.admin_token_env);
        if ingest_secret.is_none() {
            warn!(
                "[Gateway] {} not set; HTTP ingestion and run completion are disabled",
                config.auth.shared_secret_env
            );
        }
        if admin_token.is_none() {
            warn!(
                "[Gateway] {} not set; admin endpoints are disabled",
                config.auth.admin_token_env
            );
        }

        Ok(Self {
            state: Arc::new(GatewayState {
                config,
                registry,
                sessions,
                runs: new_shared_run_store(),
                monitor,
                orchestrator,
                verifier,
                ingest_secret,
                admin_token,
            }),
        })
    }

    /// Build the gateway, spawn the monitor and serve until shutdown.
    pub async fn start(
        config: GatewayConfig,
        orchestrator: Arc<dyn AgentOrchestrator>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> GatewayResult<()> {
        let gateway = Self::new(config, orchestrator, verifier)?;
        gateway.serve().await
    }

    pub async fn serve(self) -> GatewayResult<()> {
        tokio::spawn(self.state.monitor.clone().run());

        let router = self.router();
        let listener = TcpListener::bind(self.state.config.bind_addr.as_str())
            .await
            .map_err(|e| GatewayError::Network(format!("Gateway bind error: {}", e)))?;
        info!("[Gateway] Listening on {}", self.state.config.bind_addr);
        axum::serve(listener, router.into_make_service())
            .await
            .map_err(|e| GatewayError::Network(format!("Gateway server error: {}", e)))?;

        Ok(())
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/chat/send", post(send_handler))
            .route("/chat/runs/complete", post(complete_handler))
            .route("/chat/health", get(health_handler))
            .route("/chat/sessions", get(sessions_handler))
            .route("/chat/metrics", get(metrics_handler))
            .route("/chat/alerts/ws", get(alerts_ws_handler))
            .with_state(self.state.clone())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.state.sessions
    }

    pub fn runs(&self) -> &SharedRunStore {
        &self.state.runs
    }

    pub fn monitor(&self) -> &Arc<GatewayMonitor> {
        &self.state.monitor
    }

    /// Run one inbound message through the whole pipeline: stamp correlation
    /// ids, record it, claim the session, create the run, fan out
    /// `AgentStarted` and dispatch to the orchestrator.
    pub async fn handle_inbound(
        &self,
        identity: &UserIdentity,
        channel_id: &str,
        content: &str,
        thread_id: Option<String>,
    ) -> GatewayResult<InboundReceipt> {
        let ctx = ExecutionContext::new(&identity.user_id, channel_id, thread_id);
        self.state
            .sessions
            .ensure_session(&ctx.session_id, &identity.user_id)
            .await;
        self.state
            .sessions
            .record_message(&ctx.session_id, MessageDirection::Inbound, content)
            .await?;

        // One run at a time per session; overlapping prompts are rejected,
        // not queued.
        if let Err(e) = self
            .state
            .sessions
            .set_active_run(&ctx.session_id, &ctx.run_id)
            .await
        {
            debug!("[Gateway] Rejecting inbound for busy session: {}", e);
            let _ = self.state.registry.send_to_user(
                &identity.user_id,
                &ServerEvent::Error {
                    message: format!("session {} is busy with another run", ctx.session_id),
                    timestamp: Utc::now().timestamp() as u64,
                },
            );
            return Ok(InboundReceipt {
                accepted: false,
                run_id: None,
                error: Some("session busy".to_string()),
            });
        }

        {
            let mut runs = self
                .state
                .runs
                .lock()
                .map_err(|_| GatewayError::Generic("Failed to lock run store".to_string()))?;
            runs.create_run(Run::with_id(
                ctx.run_id.clone(),
                ctx.session_id.clone(),
                channel_id.to_string(),
                identity.user_id.clone(),
                content.to_string(),
            ));
        }

        // Echo the stamped envelope to the user's other devices, then announce
        // the run.
        let envelope = MessageEnvelope::inbound(&ctx, channel_id, content.to_string());
        let _ = self
            .state
            .registry
            .send_to_user(&identity.user_id, &ServerEvent::Message { envelope });
        let started = ServerEvent::AgentStarted {
            run_id: ctx.run_id.clone(),
            session_id: ctx.session_id.clone(),
            timestamp: Utc::now().timestamp() as u64,
        };
        if let Err(e) = self.state.registry.send_to_user(&identity.user_id, &started) {
            warn!(
                "[Gateway] Fan-out incomplete for user {}: {}",
                identity.user_id, e
            );
        }

        let request = AgentRequest {
            context: ctx.clone(),
            prompt: content.to_string(),
        };
        if let Err(e) = self.state.orchestrator.execute_agent(request).await {
            warn!("[Gateway] Agent dispatch failed for run {}: {}", ctx.run_id, e);
            self.fail_run(&ctx.run_id, &ctx.session_id, &identity.user_id, &e.to_string())
                .await?;
            return Ok(InboundReceipt {
                accepted: false,
                run_id: Some(ctx.run_id),
                error: Some(e.to_string()),
            });
        }

        debug!(
            "[Gateway] Dispatched run {} for session {}",
            ctx.run_id, ctx.session_id
        );
        Ok(InboundReceipt {
            accepted: true,
            run_id: Some(ctx.run_id),
            error: None,
        })
    }

    async fn fail_run(
        &self,
        run_id: &str,
        session_id: &str,
        user_id: &str,
        error: &str,
    ) -> GatewayResult<()> {
        {
            let mut runs = self
                .state
                .runs
                .lock()
                .map_err(|_| GatewayError::Generic("Failed to lock run store".to_string()))?;
            runs.update_run_state(
                run_id,
                RunState::Failed {
                    error: error.to_string(),
                },
            );
        }
        self.state.sessions.clear_active_run(session_id).await;
        let _ = self.state.registry.send_to_user(
            user_id,
            &ServerEvent::AgentCompleted {
                run_id: run_id.to_string(),
                session_id: session_id.to_string(),
                success: false,
                summary: None,
                timestamp: Utc::now().timestamp() as u64,
            },
        );
        Ok(())
    }

    /// Accept a completion report from the orchestrator.
    ///
    /// Unknown runs error; already-terminal runs are an idempotent no-op
    /// (returns false). Otherwise the run transitions, the session is
    /// released and the outcome is fanned out to the user.
    pub async fn complete_agent_execution(&self, outcome: AgentOutcome) -> GatewayResult<bool> {
        let run = {
            let mut runs = self
                .state
                .runs
                .lock()
                .map_err(|_| GatewayError::Generic("Failed to lock run store".to_string()))?;
            let run = runs
                .get_run(&outcome.run_id)
                .cloned()
                .ok_or_else(|| GatewayError::RunNotFound(outcome.run_id.clone()))?;
            if run.state.is_terminal() {
                return Ok(false);
            }
            let new_state = if outcome.success {
                RunState::Done
            } else {
                RunState::Failed {
                    error: outcome
                        .summary
                        .clone()
                        .unwrap_or_else(|| "agent execution failed".to_string()),
                }
            };
            runs.update_run_state(&outcome.run_id, new_state);
            run
        };

        self.state.sessions.clear_active_run(&run.session_id).await;

        if outcome.success {
            if let Some(summary) = &outcome.summary {
                // Session may have been pruned while the run was in flight.
                let _ = self
                    .state
                    .sessions
                    .record_message(&run.session_id, MessageDirection::Outbound, summary)
                    .await;
            }
        }

        let timestamp = Utc::now().timestamp() as u64;
        let completed = ServerEvent::AgentCompleted {
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            success: outcome.success,
            summary: outcome.summary.clone(),
            timestamp,
        };
        if let Err(e) = self.state.registry.send_to_user(&run.user_id, &completed) {
            warn!(
                "[Gateway] Completion fan-out incomplete for run {}: {}",
                run.id, e
            );
        }
        if outcome.success {
            if let Some(summary) = outcome.summary {
                let envelope = MessageEnvelope::outbound_reply(
                    &run.session_id,
                    &run.id,
                    &run.channel_id,
                    summary,
                    None,
                );
                let _ = self
                    .state
                    .registry
                    .send_to_user(&run.user_id, &ServerEvent::Message { envelope });
            }
        }

        info!(
            "[Gateway] Run {} completed (success: {})",
            run.id, outcome.success
        );
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
    channel: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = match state.verifier.verify(&params.token).await {
        Ok(identity) => identity,
        Err(e) => {
            debug!("[Gateway] WebSocket auth rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    let channel_id = params.channel.unwrap_or_else(|| "general".to_string());
    ws.on_upgrade(move |socket| client_socket(socket, state, identity, channel_id))
}

async fn client_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    identity: UserIdentity,
    channel_id: String,
) {
    let gateway = ChatGateway {
        state: state.clone(),
    };
    let session_id = super::session_id_for(&channel_id, &identity.user_id);
    let session = state
        .sessions
        .ensure_session(&session_id, &identity.user_id)
        .await;

    let (tx, mut rx) = mpsc::channel(state.config.registry.channel_capacity);
    let conn_id = format!("conn-{}", uuid::Uuid::new_v4());
    let conn = Arc::new(Connection::new(
        conn_id.clone(),
        identity.user_id.clone(),
        tx,
    ));
    state.registry.register(conn.clone());
    info!(
        "[Gateway] WebSocket connected: {} (user {})",
        conn_id, identity.user_id
    );

    // Initial state so a reconnecting client knows where its session stands.
    let _ = conn.try_send(ServerEvent::StateUpdate {
        timestamp: Utc::now().timestamp() as u64,
        active_connections: state.registry.connections_for_user(&identity.user_id).len(),
        agent_busy: session.active_run_id.is_some(),
    });

    let (mut sender, mut receiver) = socket.split();
    let mut keepalive =
        tokio::time::interval(std::time::Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    keepalive.tick().await;

    // run a single select loop instead of spawning tasks to avoid join-handle
    // ownership/abort issues
    loop {
        tokio::select! {
            biased;
            maybe = rx.recv() => {
                match maybe {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("[Gateway] Failed to encode event: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn.touch();
                        state.sessions.touch(&session_id).await;
                        if let Err(e) = gateway
                            .handle_inbound(&identity, &channel_id, &text, None)
                            .await
                        {
                            warn!("[Gateway] Inbound message failed: {}", e);
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => conn.touch(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = keepalive.tick() => {
                let ping = ServerEvent::Ping {
                    timestamp: Utc::now().timestamp() as u64,
                };
                let json = match serde_json::to_string(&ping) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.unregister(&conn_id);
    info!("[Gateway] WebSocket closed: {}", conn_id);
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    user_id: String,
    channel_id: String,
    content: String,
    thread_id: Option<String>,
}

async fn send_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(payload): Json<SendRequest>,
) -> Result<Json<InboundReceipt>, StatusCode> {
    if !state.ingest_authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let identity = UserIdentity {
        user_id: payload.user_id,
        display_name: None,
    };
    let gateway = ChatGateway { state };
    let receipt = gateway
        .handle_inbound(
            &identity,
            &payload.channel_id,
            &payload.content,
            payload.thread_id,
        )
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(receipt))
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    applied: bool,
}

async fn complete_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(outcome): Json<AgentOutcome>,
) -> Result<Json<CompleteResponse>, StatusCode> {
    if !state.ingest_authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let gateway = ChatGateway { state };
    match gateway.complete_agent_execution(outcome).await {
        Ok(applied) => Ok(Json(CompleteResponse { applied })),
        Err(GatewayError::RunNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Serialize)]
struct HealthStatusResponse {
    ok: bool,
    connections: usize,
    sessions: usize,
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthStatusResponse> {
    Json(HealthStatusResponse {
        ok: true,
        connections: state.registry.connection_count(),
        sessions: state.sessions.session_count().await,
    })
}

#[derive(Debug, Deserialize)]
struct AdminQuery {
    token: Option<String>,
}

async fn sessions_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<AdminQuery>,
) -> impl IntoResponse {
    if !state.admin_authorized(params.token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let sessions = state.sessions.list_active_sessions().await;
    Json(sessions).into_response()
}

async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state
        .registry
        .snapshot(state.config.registry.connection_ttl_seconds);
    Json(snapshot)
}

async fn alerts_ws_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<AdminQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.admin_authorized(params.token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let rx = state.monitor.subscribe();
    ws.on_upgrade(move |socket| alerts_socket(socket, rx))
}

async fn alerts_socket(socket: WebSocket, mut rx: broadcast::Receiver<ServerEvent>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(_) => continue,
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // A slow admin client misses alerts rather than stalling
                    // the monitor.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}
