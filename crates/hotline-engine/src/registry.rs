use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use hotline_proto::CloseReason;

use crate::config::EngineConfig;
use crate::session::Session;

/// Owned session store. Map operations are serialized per entry, so
/// create/get/delete are safe to call concurrently with each other and with
/// the expiry sweep.
pub(crate) struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    config: EngineConfig,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn create(&self) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), self.config.session_ttl));
        self.sessions.insert(id.clone(), session.clone());
        info!(
            session = %id,
            ttl_secs = self.config.session_ttl.as_secs(),
            "session created"
        );
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub async fn delete(&self, id: &str) -> bool {
        self.remove_with_reason(id, CloseReason::SessionClosed).await
    }

    pub(crate) async fn remove_with_reason(&self, id: &str, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        let closed = session.close_all(reason).await;
        info!(session = %id, connections = closed, %reason, "session removed");
        true
    }

    /// Reset the session's expiry to now + `ttl`, or the default TTL.
    pub async fn extend(&self, id: &str, ttl: Option<Duration>) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        session.extend(ttl.unwrap_or(self.config.session_ttl)).await;
        debug!(session = %id, "session extended");
        true
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Delete every session whose expiry passed, closing its connections
    /// with the expired reason first.
    pub async fn sweep_expired(&self) -> usize {
        // Snapshot first so no map guard is held across an await.
        let mut removed = 0;
        for session in self.snapshot() {
            if session.is_expired().await
                && self
                    .remove_with_reason(session.id(), CloseReason::SessionExpired)
                    .await
            {
                removed += 1;
            }
        }
        removed
    }

    /// Drain every session, closing all connections with `reason`.
    pub async fn clear(&self, reason: CloseReason) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.remove_with_reason(&id, reason).await;
        }
    }
}
