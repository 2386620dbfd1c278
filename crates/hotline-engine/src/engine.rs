use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::debug;

use hotline_proto::CloseReason;
use hotline_tree::RenderTree;

use crate::config::EngineConfig;
use crate::connection::{drive_device, InboundReceiver, OutboundSender};
use crate::distributor::{self, FlushReceipt, StagedPush};
use crate::liveness;
use crate::registry::SessionRegistry;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session closed before the staged update flushed")]
    SessionClosed,
}

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub sessions_created: AtomicU64,
    pub updates_flushed: AtomicU64,
    pub full_updates: AtomicU64,
    pub incremental_updates: AtomicU64,
}

/// Shared state behind every engine handle, connection driver, and sweep.
pub(crate) struct EngineCtx {
    pub registry: SessionRegistry,
    pub config: EngineConfig,
    pub counters: EngineCounters,
}

/// Per-connection liveness and acknowledgement view, for the host UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub connection_id: String,
    pub device_id: String,
    pub platform: String,
    pub display_name: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub live: bool,
    pub last_acknowledged_sequence: u64,
    pub last_apply_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub sequence_number: u64,
    pub connections: Vec<ConnectionHealth>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub sessions: usize,
    pub connections: usize,
    pub sessions_created: u64,
    pub updates_flushed: u64,
    pub full_updates: u64,
    pub incremental_updates: u64,
}

/// Owned facade over the live-update engine: session lifecycle, pushes, and
/// the transport attachment point. Cheap to clone; `shutdown` cancels the
/// background sweeps and drains every session.
#[derive(Clone)]
pub struct LiveUpdateEngine {
    ctx: Arc<EngineCtx>,
    sweeps: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LiveUpdateEngine {
    pub fn new(config: EngineConfig) -> Self {
        let ctx = Arc::new(EngineCtx {
            registry: SessionRegistry::new(config.clone()),
            config,
            counters: EngineCounters::default(),
        });

        // Sweeps hold weak handles so a dropped engine winds down on its
        // own even without an explicit shutdown.
        let sweeps = vec![
            spawn_expiry_sweep(Arc::downgrade(&ctx)),
            spawn_liveness_sweep(Arc::downgrade(&ctx)),
        ];

        Self {
            ctx,
            sweeps: Arc::new(Mutex::new(sweeps)),
        }
    }

    pub fn create_session(&self) -> Arc<Session> {
        self.ctx
            .counters
            .sessions_created
            .fetch_add(1, Ordering::Relaxed);
        self.ctx.registry.create()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.ctx.registry.get(session_id)
    }

    /// Delete a session, closing all of its connections with the
    /// session-closed reason. Returns false for an unknown id.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        self.ctx.registry.delete(session_id).await
    }

    /// Reset the session's expiry to now + `ttl` (default TTL when omitted).
    pub async fn extend_session(&self, session_id: &str, ttl: Option<Duration>) -> bool {
        self.ctx.registry.extend(session_id, ttl).await
    }

    /// Stage a new tree for the session, coalesced behind the batching
    /// delay. The returned handle resolves once the update covering this
    /// tree actually flushes.
    pub async fn push(
        &self,
        session_id: &str,
        tree: RenderTree,
        preserve_state: bool,
    ) -> Result<StagedPush, EngineError> {
        let session = self.require(session_id)?;
        Ok(distributor::stage(&self.ctx, &session, tree, preserve_state).await)
    }

    /// Latency-sensitive path: cancel any staged flush for the session and
    /// flush this tree synchronously.
    pub async fn push_immediate(
        &self,
        session_id: &str,
        tree: RenderTree,
        preserve_state: bool,
    ) -> Result<FlushReceipt, EngineError> {
        let session = self.require(session_id)?;
        Ok(distributor::flush_now(&self.ctx, &session, tree, preserve_state).await)
    }

    /// Hand a raw transport connection to the handshake logic, together
    /// with the session id extracted from the connection request. The
    /// returned task runs until the transport's inbound side ends or the
    /// engine closes the connection.
    pub fn attach_device(
        &self,
        session_id: Option<String>,
        inbound: InboundReceiver,
        outbound: OutboundSender,
    ) -> JoinHandle<()> {
        tokio::spawn(drive_device(self.ctx.clone(), session_id, inbound, outbound))
    }

    pub async fn get_session_health(
        &self,
        session_id: &str,
    ) -> Result<SessionHealth, EngineError> {
        let session = self.require(session_id)?;
        let now = Instant::now();
        let timeout = self.ctx.config.heartbeat_timeout;
        let state = session.state.lock().await;
        let connections = state
            .connections
            .values()
            .map(|connection| ConnectionHealth {
                connection_id: connection.connection_id.clone(),
                device_id: connection.device_id.clone(),
                platform: connection.platform.clone(),
                display_name: connection.display_name.clone(),
                connected_at: connection.connected_at,
                live: connection.is_live(now, timeout),
                last_acknowledged_sequence: connection.last_acknowledged_sequence,
                last_apply_time_ms: connection.last_apply_time_ms,
            })
            .collect();
        Ok(SessionHealth {
            session_id: session.id().to_string(),
            created_at: session.created_at(),
            sequence_number: state.sequence_number,
            connections,
        })
    }

    pub async fn get_connected_devices(
        &self,
        session_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let session = self.require(session_id)?;
        let state = session.state.lock().await;
        Ok(state.connections.keys().cloned().collect())
    }

    /// Connections whose last acknowledged sequence lags behind `sequence`.
    pub async fn get_unacknowledged_devices(
        &self,
        session_id: &str,
        sequence: u64,
    ) -> Result<Vec<String>, EngineError> {
        let session = self.require(session_id)?;
        let state = session.state.lock().await;
        Ok(state
            .connections
            .values()
            .filter(|connection| connection.last_acknowledged_sequence < sequence)
            .map(|connection| connection.connection_id.clone())
            .collect())
    }

    pub async fn get_stats(&self) -> EngineStats {
        let mut connections = 0;
        for session in self.ctx.registry.snapshot() {
            connections += session.connection_count().await;
        }
        EngineStats {
            sessions: self.ctx.registry.len(),
            connections,
            sessions_created: self.ctx.counters.sessions_created.load(Ordering::Relaxed),
            updates_flushed: self.ctx.counters.updates_flushed.load(Ordering::Relaxed),
            full_updates: self.ctx.counters.full_updates.load(Ordering::Relaxed),
            incremental_updates: self
                .ctx
                .counters
                .incremental_updates
                .load(Ordering::Relaxed),
        }
    }

    /// Cancel the sweeps and close every session. Pending batch timers are
    /// aborted as their sessions drain.
    pub async fn shutdown(&self) {
        for sweep in self.sweeps.lock().await.drain(..) {
            sweep.abort();
        }
        self.ctx.registry.clear(CloseReason::SessionClosed).await;
        debug!("engine shut down");
    }

    fn require(&self, session_id: &str) -> Result<Arc<Session>, EngineError> {
        self.ctx
            .registry
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }
}

fn spawn_expiry_sweep(ctx: Weak<EngineCtx>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = match ctx.upgrade() {
            Some(ctx) => ctx.config.expiry_sweep_interval,
            None => return,
        };
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(ctx) = ctx.upgrade() else { break };
            let removed = ctx.registry.sweep_expired().await;
            if removed > 0 {
                debug!(removed, "expired sessions swept");
            }
        }
    })
}

fn spawn_liveness_sweep(ctx: Weak<EngineCtx>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = match ctx.upgrade() {
            Some(ctx) => ctx.config.liveness_sweep_interval,
            None => return,
        };
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(ctx) = ctx.upgrade() else { break };
            liveness::sweep_connections(&ctx).await;
        }
    })
}
