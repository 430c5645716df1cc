//! Upstream session management.
//!
//! A session is created lazily on the first request carrying (or missing) a
//! session id and swept after an idle timeout. Each session owns its dedup
//! context, token tracker, and delta cache — single-owner state guarded by
//! one mutex per session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::config::GatewayLimits;
use crate::context::delta::DeltaResponseManager;
use crate::context::session::SessionContext;
use crate::context::tracker::ContextTracker;

/// Sweep cadence for idle sessions.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Mutable per-session state.
pub struct SessionState {
    pub last_activity: Instant,
    pub initialized: bool,
    pub client_info: Option<Value>,
    pub context: SessionContext,
    pub tracker: ContextTracker,
    pub deltas: DeltaResponseManager,
    /// Schema digests this client has already received.
    pub schemas_sent: HashSet<String>,
}

/// One upstream MCP session.
pub struct UpstreamSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl UpstreamSession {
    fn new(id: String, limits: &GatewayLimits) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                last_activity: Instant::now(),
                initialized: false,
                client_info: None,
                context: SessionContext::new(),
                tracker: ContextTracker::new(limits.context_tokens),
                deltas: DeltaResponseManager::new(),
                schemas_sent: HashSet::new(),
            }),
        }
    }

    /// Lock the session state. Callers touch `last_activity` through
    /// [`SessionManager::get_or_create`], which runs on every request.
    pub async fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    async fn is_stale(&self, max_age: Duration) -> bool {
        self.state.lock().await.last_activity.elapsed() > max_age
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Registry of upstream sessions keyed by id.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<UpstreamSession>>>,
    limits: GatewayLimits,
    max_age: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(limits: GatewayLimits) -> Self {
        let max_age = Duration::from_secs(limits.session_max_age_secs);
        Self { sessions: RwLock::new(HashMap::new()), limits, max_age }
    }

    /// Fetch the session for an id, creating one lazily. A request without
    /// an id gets a fresh session with a generated id.
    pub async fn get_or_create(&self, id: Option<&str>) -> Arc<UpstreamSession> {
        if let Some(id) = id {
            if let Some(session) = self.sessions.read().await.get(id).cloned() {
                session.state().await.last_activity = Instant::now();
                return session;
            }
        }

        let id = id.map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);
        let session = Arc::new(UpstreamSession::new(id.clone(), &self.limits));
        self.sessions.write().await.insert(id, Arc::clone(&session));
        tracing::debug!(session = %session.id, "Created upstream session");
        session
    }

    /// Look up an existing session.
    pub async fn get(&self, id: &str) -> Option<Arc<UpstreamSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove sessions idle past the max age; returns how many went.
    pub async fn sweep_idle(&self) -> usize {
        let mut stale = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.is_stale(self.max_age).await {
                    stale.push(id.clone());
                }
            }
        }

        let count = stale.len();
        if count > 0 {
            let mut sessions = self.sessions.write().await;
            for id in stale {
                sessions.remove(&id);
                tracing::info!(session = %id, "Swept idle session");
            }
        }
        count
    }

    /// Start the background idle sweep.
    pub fn start_gc_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                let swept = manager.sweep_idle().await;
                if swept > 0 {
                    tracing::debug!(count = swept, "Session sweep complete");
                }
            }
        });
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}
