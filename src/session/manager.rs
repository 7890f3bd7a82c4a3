//! Session manager coordinating all managed sessions
//!
//! Owns the registry (key -> session), the client binding table, and the
//! fan-out of agent events to attached clients. All mutations go through one
//! lock, and transport events arrive on one queue, so per-session state is
//! never raced.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::key::{normalize_working_dir, SessionKey};
use super::managed::ManagedSession;
use super::state::SessionState;
use crate::logs;
use crate::rpc::{RpcProcess, TransportEvent};
use crate::server::ServerMessage;

/// Default idle time-to-live before a clientless session is reclaimed
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_millis(60_000);

/// Errors reported back to a client as recoverable error events
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active session; attach with start_session first")]
    NotAttached,

    #[error("Current model does not support image attachments")]
    ImagesUnsupported,

    #[error("Invalid working directory {0}: {1}")]
    InvalidWorkingDir(String, std::io::Error),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Configuration for the session manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Agent binary to spawn for each session
    pub agent_command: String,
    /// Arguments putting the agent into RPC mode
    pub agent_args: Vec<String>,
    /// How long a clientless, non-running session stays alive
    pub idle_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            agent_command: "pi".to_string(),
            agent_args: vec!["--mode".to_string(), "rpc".to_string()],
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }
}

/// Registry, binding table and broadcast state, guarded by one lock
#[derive(Default)]
struct Inner {
    /// key -> session; a session may be reachable under two keys once its
    /// real session-file name is discovered
    registry: HashMap<SessionKey, Uuid>,
    /// session id -> managed session
    sessions: HashMap<Uuid, ManagedSession>,
    /// client -> session it is attached to (at most one)
    bindings: HashMap<Uuid, Uuid>,
    /// client -> outbound message channel
    clients: HashMap<Uuid, mpsc::UnboundedSender<ServerMessage>>,
}

/// Central coordinator for all agent sessions
///
/// For a given key, at most one live, non-closing session ever exists.
pub struct SessionManager {
    config: ManagerConfig,
    inner: Mutex<Inner>,
    /// Shared sender handed to every spawned transport
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Self-reference for timer callbacks
    weak: Weak<SessionManager>,
}

impl SessionManager {
    /// Create a new session manager and start its event loop
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new_cyclic(|weak| Self {
            config,
            inner: Mutex::new(Inner::default()),
            events_tx,
            weak: weak.clone(),
        });

        tokio::spawn(Self::event_loop(Arc::downgrade(&manager), events_rx));
        manager
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Whether a client currently has an active binding
    pub async fn is_attached(&self, client: Uuid) -> bool {
        self.inner.lock().await.bindings.contains_key(&client)
    }

    /// Register a connected client's outbound channel
    pub async fn register_client(&self, client: Uuid, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.inner.lock().await.clients.insert(client, tx);
    }

    /// Attach a client to the session identified by (cwd, session file)
    ///
    /// Resolves an existing session for the key or spawns a new one. If the
    /// client is already attached to the session owning this exact key, the
    /// call is idempotent apart from cancelling a pending idle timer.
    pub async fn attach(
        &self,
        client: Uuid,
        cwd: &str,
        session_file: Option<&str>,
    ) -> SessionResult<()> {
        let working_dir = normalize_working_dir(cwd)
            .map_err(|e| SessionError::InvalidWorkingDir(cwd.to_string(), e))?;
        let key = SessionKey::new(&working_dir, session_file);

        let mut inner = self.inner.lock().await;

        if let Some(&bound) = inner.bindings.get(&client) {
            if inner.registry.get(&key) == Some(&bound) {
                if let Some(session) = inner.sessions.get_mut(&bound) {
                    session.cancel_idle_timer();
                }
                return Ok(());
            }
            self.detach_locked(&mut inner, client);
        }

        let session_id = match inner.registry.get(&key).copied() {
            Some(id) if inner.sessions.get(&id).is_some_and(|s| !s.is_closing()) => id,
            _ => self.create_session_locked(&mut inner, key.clone(), working_dir, session_file),
        };

        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.clients.insert(client);
            session.cancel_idle_timer();
            inner.bindings.insert(client, session_id);
            info!("Client {} attached to session {} ({})", client, session_id, key);
        }
        Ok(())
    }

    /// Detach a client from its session, if any
    pub async fn detach(&self, client: Uuid) {
        let mut inner = self.inner.lock().await;
        self.detach_locked(&mut inner, client);
    }

    /// Detach a client and forget its outbound channel
    pub async fn disconnect(&self, client: Uuid) {
        let mut inner = self.inner.lock().await;
        self.detach_locked(&mut inner, client);
        inner.clients.remove(&client);
    }

    /// Forward a client command to its session's agent
    ///
    /// Commands carrying image attachments are rejected locally when the
    /// current model is known not to accept them; with the capability still
    /// unknown they are forwarded. All other command semantics belong to the
    /// agent.
    pub async fn command(&self, client: Uuid, command: Value) -> SessionResult<()> {
        let inner = self.inner.lock().await;
        let session = inner
            .bindings
            .get(&client)
            .and_then(|id| inner.sessions.get(id))
            .ok_or(SessionError::NotAttached)?;

        if session.supports_images == Some(false) && command_carries_images(&command) {
            return Err(SessionError::ImagesUnsupported);
        }

        session.transport.send(command);
        Ok(())
    }

    /// Consume transport events sequentially, preserving emission order
    async fn event_loop(
        manager: Weak<SessionManager>,
        mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events_rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.handle_transport_event(event).await;
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Event { session, payload } => {
                self.handle_agent_event(session, payload).await;
            }
            TransportEvent::Stderr { session, line } => {
                let inner = self.inner.lock().await;
                broadcast_locked(&inner, session, &ServerMessage::error(line));
            }
            TransportEvent::Exited { session, code } => {
                self.handle_exit(session, code).await;
            }
        }
    }

    /// Ingest one agent event: update session state, then broadcast verbatim
    async fn handle_agent_event(&self, session_id: Uuid, payload: Value) {
        let mut inner = self.inner.lock().await;

        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut discovered_key = None;

        {
            let Some(session) = inner.sessions.get_mut(&session_id) else {
                return;
            };

            match event_type.as_str() {
                "agent_start" => {
                    session.transition(SessionState::Active);
                    session.cancel_idle_timer();
                }
                "agent_end" => {
                    session.transition(SessionState::Idle);
                }
                "model_changed" => {
                    if let Some(model) = payload.get("model") {
                        session.update_capability(model);
                    }
                }
                "response" => {
                    let command = payload.get("command").and_then(Value::as_str);
                    if matches!(command, Some("get_state") | Some("set_model")) {
                        if let Some(model) = payload.pointer("/data/model") {
                            session.update_capability(model);
                        }
                    }
                    if command == Some("get_state") {
                        if let Some(file) =
                            payload.pointer("/data/sessionFile").and_then(Value::as_str)
                        {
                            let key = SessionKey::new(&session.working_dir, Some(file));
                            if !session.keys.contains(&key) {
                                discovered_key = Some(key);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(key) = discovered_key {
            self.promote_locked(&mut inner, session_id, key);
        }

        broadcast_locked(&inner, session_id, &ServerMessage::rpc_event(payload));

        if event_type == "agent_end" {
            if let Some(session) = inner.sessions.get_mut(&session_id) {
                self.evaluate_idle(session);
            }
        }
    }

    /// Tear down a session whose process has exited
    async fn handle_exit(&self, session_id: Uuid, code: Option<i32>) {
        let mut inner = self.inner.lock().await;
        let Some(mut session) = inner.sessions.remove(&session_id) else {
            return;
        };
        session.cancel_idle_timer();
        session.transition(SessionState::Closing);
        info!("Session {} ended with code {:?}", session_id, code);

        for key in &session.keys {
            if inner.registry.get(key) == Some(&session_id) {
                inner.registry.remove(key);
            }
        }

        let ended = ServerMessage::session_ended(code);
        for client in &session.clients {
            if let Some(tx) = inner.clients.get(client) {
                let _ = tx.send(ended.clone());
            }
            inner.bindings.remove(client);
        }
    }

    /// Spawn a new session for a key with no live owner
    fn create_session_locked(
        &self,
        inner: &mut Inner,
        key: SessionKey,
        working_dir: PathBuf,
        session_file: Option<&str>,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        let session_path = session_file.map(|f| logs::session_log_path(&working_dir, f));

        info!(
            "Spawning agent for session {} in {}",
            session_id,
            working_dir.display()
        );
        let transport = RpcProcess::spawn(
            &self.config.agent_command,
            &self.config.agent_args,
            &working_dir,
            session_path,
            session_id,
            self.events_tx.clone(),
        );

        inner.registry.insert(key.clone(), session_id);
        inner.sessions.insert(
            session_id,
            ManagedSession::new(session_id, working_dir, key, transport),
        );
        session_id
    }

    /// Add a discovered key pointing at an existing session
    ///
    /// Best-effort cache population: a key already owned by a different live
    /// session is left alone, and the original key is never replaced.
    fn promote_locked(&self, inner: &mut Inner, session_id: Uuid, key: SessionKey) {
        // A late get_state from a session already being reclaimed must not
        // re-register its key
        if inner
            .sessions
            .get(&session_id)
            .is_none_or(|s| s.is_closing())
        {
            return;
        }

        match inner.registry.get(&key) {
            Some(&existing) if existing == session_id => return,
            Some(&existing)
                if inner.sessions.get(&existing).is_some_and(|s| !s.is_closing()) =>
            {
                warn!(
                    "Discovered key {} already owned by session {}, not promoting",
                    key, existing
                );
                return;
            }
            _ => {}
        }

        inner.registry.insert(key.clone(), session_id);
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            info!("Session {} now also reachable as {}", session_id, key);
            session.keys.push(key);
        }
    }

    fn detach_locked(&self, inner: &mut Inner, client: Uuid) {
        let Some(session_id) = inner.bindings.remove(&client) else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.clients.remove(&client);
            debug!(
                "Client {} detached from session {} ({} remaining)",
                client,
                session_id,
                session.clients.len()
            );
            self.evaluate_idle(session);
        }
    }

    /// Arm the idle-reclaim timer when the session is clientless and not
    /// mid-response; a no-op when a timer is already pending
    fn evaluate_idle(&self, session: &mut ManagedSession) {
        if !session.is_reclaimable() || session.idle_timer.is_some() {
            return;
        }

        session.idle_generation += 1;
        let generation = session.idle_generation;
        let session_id = session.id;
        let ttl = self.config.idle_ttl;
        let manager = self.weak.clone();

        debug!("Session {} idle, reclaim armed in {:?}", session_id, ttl);
        session.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(manager) = manager.upgrade() {
                manager.reclaim_idle(session_id, generation).await;
            }
        }));
    }

    /// Timer callback: kill the session if it is still idle
    async fn reclaim_idle(&self, session_id: Uuid, generation: u64) {
        let mut inner = self.inner.lock().await;
        let keys = {
            let Some(session) = inner.sessions.get_mut(&session_id) else {
                return;
            };
            // A bumped generation means an attach or activity won the race
            if session.idle_generation != generation {
                return;
            }
            session.idle_timer = None;
            if !session.is_reclaimable() {
                return;
            }

            info!("Reclaiming idle session {}", session_id);
            session.transition(SessionState::Closing);
            session.transport.kill();
            std::mem::take(&mut session.keys)
        };

        // The session entry itself is removed when the exit event arrives
        for key in keys {
            if inner.registry.get(&key) == Some(&session_id) {
                inner.registry.remove(&key);
            }
        }
    }
}

/// Send a message to every client attached to a session
fn broadcast_locked(inner: &Inner, session_id: Uuid, message: &ServerMessage) {
    let Some(session) = inner.sessions.get(&session_id) else {
        return;
    };
    for client in &session.clients {
        if let Some(tx) = inner.clients.get(client) {
            let _ = tx.send(message.clone());
        }
    }
}

/// Whether a command payload carries image attachments
fn command_carries_images(command: &Value) -> bool {
    command
        .get("images")
        .and_then(Value::as_array)
        .is_some_and(|images| !images.is_empty())
}
