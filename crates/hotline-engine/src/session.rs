use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use hotline_proto::{AckPayload, CloseReason};
use hotline_tree::RenderTree;

use crate::connection::DeviceConnection;
use crate::distributor::FlushReceipt;

/// One logical update channel. Everything mutable lives behind a single
/// lock, so all operations on a session are serialized while different
/// sessions proceed independently.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    pub(crate) state: Mutex<SessionState>,
}

pub(crate) struct SessionState {
    pub expires_at: Instant,
    pub sequence_number: u64,
    pub current_tree: Option<RenderTree>,
    pub connections: HashMap<String, DeviceConnection>,
    pub pending: Option<PendingFlush>,
}

/// A staged tree waiting out the batching delay. The newest push wins;
/// superseded trees are discarded, never sent.
pub(crate) struct PendingFlush {
    pub tree: RenderTree,
    pub preserve_state: bool,
    pub timer: JoinHandle<()>,
    pub waiters: Vec<oneshot::Sender<FlushReceipt>>,
}

impl PendingFlush {
    /// Abort the batching timer and hand back the waiters so the caller can
    /// resolve them against whichever flush supersedes this one.
    pub(crate) fn cancel(self) -> Vec<oneshot::Sender<FlushReceipt>> {
        self.timer.abort();
        self.waiters
    }
}

impl Session {
    pub(crate) fn new(id: String, ttl: Duration) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                expires_at: Instant::now() + ttl,
                sequence_number: 0,
                current_tree: None,
                connections: HashMap::new(),
                pending: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn is_expired(&self) -> bool {
        self.state.lock().await.expires_at <= Instant::now()
    }

    pub(crate) async fn extend(&self, ttl: Duration) {
        self.state.lock().await.expires_at = Instant::now() + ttl;
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn sequence_number(&self) -> u64 {
        self.state.lock().await.sequence_number
    }

    /// Insert a freshly handshaken device and hand back the current tree
    /// snapshot for the `connected` reply.
    pub(crate) async fn register_device(
        &self,
        connection: DeviceConnection,
    ) -> Option<RenderTree> {
        let mut state = self.state.lock().await;
        let snapshot = state.current_tree.clone();
        state
            .connections
            .insert(connection.connection_id.clone(), connection);
        snapshot
    }

    pub(crate) async fn remove_device(&self, connection_id: &str) -> bool {
        self.state
            .lock()
            .await
            .connections
            .remove(connection_id)
            .is_some()
    }

    pub(crate) async fn record_heartbeat(&self, connection_id: &str) -> bool {
        match self.state.lock().await.connections.get_mut(connection_id) {
            Some(connection) => {
                connection.record_heartbeat();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn record_ack(&self, connection_id: &str, ack: &AckPayload) -> bool {
        match self.state.lock().await.connections.get_mut(connection_id) {
            Some(connection) => {
                // Acks can arrive out of order; the high-water mark stands.
                connection.last_acknowledged_sequence = connection
                    .last_acknowledged_sequence
                    .max(ack.sequence_number);
                if let Some(ms) = ack.apply_time_ms {
                    connection.last_apply_time_ms = Some(ms);
                }
                true
            }
            None => false,
        }
    }

    /// Close every connection with `reason` and cancel any pending flush.
    /// Waiters on the pending flush are dropped, which resolves their
    /// staged pushes as closed.
    pub(crate) async fn close_all(&self, reason: CloseReason) -> usize {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        let mut closed = 0;
        for connection in state.connections.values_mut() {
            connection.close(reason);
            closed += 1;
        }
        state.connections.clear();
        closed
    }

    /// Evict every connection that fails the liveness predicate. Returns
    /// the evicted connection ids.
    pub(crate) async fn evict_stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .connections
            .values()
            .filter(|connection| !connection.is_live(now, timeout))
            .map(|connection| connection.connection_id.clone())
            .collect();
        for connection_id in &stale {
            if let Some(mut connection) = state.connections.remove(connection_id) {
                connection.close(CloseReason::ConnectionTimeout);
            }
        }
        stale
    }
}
