//! Run Lifecycle Bookkeeping
//!
//! A run correlates one agent execution dispatched to the external
//! orchestrator with the session that asked for it. The gateway only tracks
//! lifecycle; execution itself happens elsewhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunState {
    /// Dispatched to the orchestrator and awaiting completion
    Active,
    /// Completed successfully
    Done,
    /// Failed with error
    Failed { error: String },
    /// Cancelled before completion
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Done | RunState::Failed { .. } | RunState::Cancelled
        )
    }
}

/// One agent execution tracked by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub prompt: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Correlation ID for tracing
    pub correlation_id: String,
}

impl Run {
    pub fn new(session_id: String, channel_id: String, user_id: String, prompt: String) -> Self {
        let now = Utc::now();
        Self {
            id: format!("run-{}", uuid::Uuid::new_v4()),
            session_id,
            channel_id,
            user_id,
            prompt,
            state: RunState::Active,
            created_at: now,
            updated_at: now,
            correlation_id: format!("corr-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Create a run under an id minted elsewhere (the execution context).
    pub fn with_id(
        run_id: String,
        session_id: String,
        channel_id: String,
        user_id: String,
        prompt: String,
    ) -> Self {
        let mut run = Self::new(session_id, channel_id, user_id, prompt);
        run.id = run_id;
        run
    }

    pub fn transition(&mut self, new_state: RunState) {
        self.state = new_state;
        self.updated_at = Utc::now();
    }
}

/// In-memory run store with a per-session index
#[derive(Debug, Default)]
pub struct RunStore {
    runs: HashMap<String, Run>,
    runs_by_session: HashMap<String, Vec<String>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_run(&mut self, run: Run) -> String {
        let run_id = run.id.clone();
        let session_id = run.session_id.clone();

        self.runs_by_session
            .entry(session_id)
            .or_default()
            .push(run_id.clone());
        self.runs.insert(run_id.clone(), run);

        run_id
    }

    pub fn get_run(&self, run_id: &str) -> Option<&Run> {
        self.runs.get(run_id)
    }

    pub fn get_run_mut(&mut self, run_id: &str) -> Option<&mut Run> {
        self.runs.get_mut(run_id)
    }

    pub fn get_runs_for_session(&self, session_id: &str) -> Vec<&Run> {
        self.runs_by_session
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| self.runs.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_active_run_for_session(&self, session_id: &str) -> Option<&Run> {
        self.get_runs_for_session(session_id)
            .into_iter()
            .find(|r| matches!(r.state, RunState::Active))
    }

    /// Apply a state change. Terminal runs are left untouched; returns
    /// whether anything changed.
    pub fn update_run_state(&mut self, run_id: &str, new_state: RunState) -> bool {
        match self.runs.get_mut(run_id) {
            Some(run) if !run.state.is_terminal() => {
                run.transition(new_state);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_run(&mut self, run_id: &str) -> bool {
        self.update_run_state(run_id, RunState::Cancelled)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

/// Thread-safe run store wrapper
pub type SharedRunStore = Arc<Mutex<RunStore>>;

pub fn new_shared_run_store() -> SharedRunStore {
    Arc::new(Mutex::new(RunStore::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new(
            "chat:general:u-1".to_string(),
            "general".to_string(),
            "u-1".to_string(),
            "summarize the doc".to_string(),
        );
        assert!(matches!(run.state, RunState::Active));
        assert!(run.id.starts_with("run-"));
        assert!(run.correlation_id.starts_with("corr-"));

        run.transition(RunState::Done);
        assert!(run.state.is_terminal());
    }

    #[test]
    fn test_run_store_session_index() {
        let mut store = RunStore::new();
        let run = Run::new(
            "s-1".to_string(),
            "general".to_string(),
            "u-1".to_string(),
            "goal".to_string(),
        );
        let run_id = store.create_run(run);

        assert!(store.get_run(&run_id).is_some());
        assert_eq!(store.get_runs_for_session("s-1").len(), 1);
        assert!(store.get_active_run_for_session("s-1").is_some());

        store.cancel_run(&run_id);
        assert!(store.get_active_run_for_session("s-1").is_none());
    }

    #[test]
    fn test_terminal_runs_stay_terminal() {
        let mut store = RunStore::new();
        let run = Run::new(
            "s-1".to_string(),
            "general".to_string(),
            "u-1".to_string(),
            "goal".to_string(),
        );
        let run_id = store.create_run(run);

        assert!(store.update_run_state(&run_id, RunState::Done));
        assert!(
            !store.update_run_state(
                &run_id,
                RunState::Failed {
                    error: "late".to_string()
                }
            ),
            "completing a terminal run is a no-op"
        );
        assert_eq!(store.get_run(&run_id).unwrap().state, RunState::Done);
    }

    #[test]
    fn test_unknown_run_update_is_false() {
        let mut store = RunStore::new();
        assert!(!store.update_run_state("run-missing", RunState::Done));
    }

    #[test]
    fn test_with_id_keeps_context_run_id() {
        let run = Run::with_id(
            "run-abc".to_string(),
            "s-1".to_string(),
            "general".to_string(),
            "u-1".to_string(),
            "goal".to_string(),
        );
        assert_eq!(run.id, "run-abc");
        assert!(matches!(run.state, RunState::Active));
    }
}
