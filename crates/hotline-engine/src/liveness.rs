use std::sync::Arc;

use tokio::time::Instant;
use tracing::info;

use crate::engine::EngineCtx;

/// One liveness pass over every connection in every session. Connections
/// that missed their heartbeat window are closed with the timeout reason
/// and removed; eviction is silent at the protocol level and observable
/// only through session health.
pub(crate) async fn sweep_connections(ctx: &Arc<EngineCtx>) -> usize {
    let now = Instant::now();
    let timeout = ctx.config.heartbeat_timeout;
    let mut evicted = 0;
    for session in ctx.registry.snapshot() {
        let stale = session.evict_stale(now, timeout).await;
        for connection_id in &stale {
            info!(
                session = %session.id(),
                connection = %connection_id,
                "connection timed out"
            );
        }
        evicted += stale.len();
    }
    evicted
}
