//! Individual managed session
//!
//! Wraps one agent process transport as a shareable resource: the set of
//! attached clients, the lifecycle state, the cached model capability, the
//! registry keys pointing at it, and the idle-reclaim timer.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::key::SessionKey;
use super::state::SessionState;
use crate::rpc::RpcProcess;

/// One supervised agent process and its bridge-side bookkeeping
///
/// All fields are mutated only by the [`SessionManager`](super::SessionManager)
/// under its lock, so no per-session synchronization is needed.
pub struct ManagedSession {
    /// Unique identifier for this session
    pub id: Uuid,
    /// Normalized working directory the agent is rooted at
    pub working_dir: PathBuf,
    /// Registry keys currently pointing at this session (one at creation,
    /// a second once a new session's file name is discovered)
    pub keys: Vec<SessionKey>,
    /// The live transport to the agent process
    pub transport: RpcProcess,
    /// Currently attached clients
    pub clients: HashSet<Uuid>,
    /// Lifecycle state
    pub state: SessionState,
    /// Whether the current model accepts image attachments
    /// (`None` until a model-describing event has been observed)
    pub supports_images: Option<bool>,
    /// Pending idle-reclaim timer, if armed
    pub idle_timer: Option<JoinHandle<()>>,
    /// Invalidates stale timer callbacks that lost the cancellation race
    pub idle_generation: u64,
}

impl ManagedSession {
    /// Create a managed session around a freshly spawned transport
    pub fn new(
        id: Uuid,
        working_dir: PathBuf,
        key: SessionKey,
        transport: RpcProcess,
    ) -> Self {
        Self {
            id,
            working_dir,
            keys: vec![key],
            transport,
            clients: HashSet::new(),
            state: SessionState::Starting,
            supports_images: None,
            idle_timer: None,
            idle_generation: 0,
        }
    }

    /// The single mutation point for lifecycle state
    pub fn transition(&mut self, next: SessionState) {
        let from = self.state;
        self.state = self.state.transition(next);
        if self.state != from {
            debug!("Session {} state: {:?} -> {:?}", self.id, from, self.state);
        }
    }

    /// Cancel a pending idle-reclaim timer, if any
    ///
    /// Bumping the generation invalidates a timer that already fired but has
    /// not taken the manager lock yet.
    pub fn cancel_idle_timer(&mut self) {
        self.idle_generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
            debug!("Session {} idle timer cancelled", self.id);
        }
    }

    /// Whether the session can still accept attachments
    pub fn is_closing(&self) -> bool {
        self.state.is_closing()
    }

    /// Whether idle reclamation may be armed right now
    pub fn is_reclaimable(&self) -> bool {
        self.clients.is_empty() && !self.state.is_running() && !self.is_closing()
    }

    /// Update the cached image capability from a model description
    ///
    /// A model without modality information leaves the flag unchanged rather
    /// than resetting it to unknown.
    pub fn update_capability(&mut self, model: &Value) {
        if let Some(supported) = model_accepts_images(model) {
            self.supports_images = Some(supported);
        }
    }
}

/// Inspect a model object's declared input modalities
///
/// Returns `None` when the model carries no modality list.
pub fn model_accepts_images(model: &Value) -> Option<bool> {
    let input = model.get("input")?.as_array()?;
    Some(input.iter().any(|m| m.as_str() == Some("image")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_accepts_images() {
        assert_eq!(
            model_accepts_images(&json!({"input": ["text", "image"]})),
            Some(true)
        );
        assert_eq!(model_accepts_images(&json!({"input": ["text"]})), Some(false));
        assert_eq!(model_accepts_images(&json!({"name": "opus"})), None);
        assert_eq!(model_accepts_images(&json!({"input": "text"})), None);
    }
}
