use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use hotline_proto::{MessageBody, ProtocolMessage, UpdateKind, UpdatePayload};
use hotline_tree::{diff, RenderTree};

use crate::engine::{EngineCtx, EngineError};
use crate::session::{PendingFlush, Session, SessionState};

/// What a flush actually did, delivered to every waiter whose push the
/// flush covered.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReceipt {
    pub sequence_number: u64,
    pub update_kind: UpdateKind,
    pub devices_notified: usize,
}

/// Handle returned by a batched push. Resolves once the update that carried
/// (or superseded) the staged tree goes out.
#[derive(Debug)]
pub struct StagedPush {
    pub(crate) receipt: oneshot::Receiver<FlushReceipt>,
}

impl StagedPush {
    pub async fn resolved(self) -> Result<FlushReceipt, EngineError> {
        self.receipt.await.map_err(|_| EngineError::SessionClosed)
    }
}

/// Stage a tree in the session's pending-flush slot. A tree already staged
/// is replaced — discarded, never sent — and the batching delay restarts.
pub(crate) async fn stage(
    ctx: &Arc<EngineCtx>,
    session: &Arc<Session>,
    tree: RenderTree,
    preserve_state: bool,
) -> StagedPush {
    let (sender, receiver) = oneshot::channel();
    let delay = ctx.config.batch_delay;

    let mut state = session.state.lock().await;

    let mut waiters = match state.pending.take() {
        Some(pending) => pending.cancel(),
        None => Vec::new(),
    };
    waiters.push(sender);

    let timer_ctx = ctx.clone();
    let timer_session = session.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        flush_pending(&timer_ctx, &timer_session).await;
    });

    state.pending = Some(PendingFlush {
        tree,
        preserve_state,
        timer,
        waiters,
    });

    StagedPush { receipt: receiver }
}

/// Flush the staged slot if it is still pending. Invoked by the batching
/// timer once the delay elapses uninterrupted.
pub(crate) async fn flush_pending(ctx: &Arc<EngineCtx>, session: &Arc<Session>) {
    let mut state = session.state.lock().await;
    let Some(pending) = state.pending.take() else {
        return;
    };
    let receipt = flush_locked(
        ctx,
        session.id(),
        &mut state,
        pending.tree,
        pending.preserve_state,
    );
    for waiter in pending.waiters {
        let _ = waiter.send(receipt.clone());
    }
}

/// Bypass the staging slot entirely: cancel any pending flush and flush this
/// tree now. Waiters on the canceled slot resolve with this flush's receipt.
pub(crate) async fn flush_now(
    ctx: &Arc<EngineCtx>,
    session: &Arc<Session>,
    tree: RenderTree,
    preserve_state: bool,
) -> FlushReceipt {
    let mut state = session.state.lock().await;
    let waiters = match state.pending.take() {
        Some(pending) => pending.cancel(),
        None => Vec::new(),
    };
    let receipt = flush_locked(ctx, session.id(), &mut state, tree, preserve_state);
    for waiter in waiters {
        let _ = waiter.send(receipt.clone());
    }
    receipt
}

/// Decide full vs incremental, bump the sequence, record the new snapshot,
/// and fan the update out. Runs under the session lock, so every connection
/// observes the same gap-free sequence stream.
fn flush_locked(
    ctx: &EngineCtx,
    session_id: &str,
    state: &mut SessionState,
    tree: RenderTree,
    preserve_state: bool,
) -> FlushReceipt {
    let (update_kind, delta) = match state.current_tree.as_ref() {
        // Nothing to diff against: the first push is always full.
        None => (UpdateKind::Full, None),
        Some(current) => {
            let delta = diff(current, &tree);
            if delta.change_count() < ctx.config.incremental_threshold {
                (UpdateKind::Incremental, Some(delta))
            } else {
                // Large edit sets are riskier to apply piecewise than to
                // replace outright.
                (UpdateKind::Full, None)
            }
        }
    };

    state.sequence_number += 1;
    let sequence_number = state.sequence_number;

    let payload = UpdatePayload {
        update_type: update_kind,
        sequence_number,
        preserve_state,
        tree: (update_kind == UpdateKind::Full).then(|| tree.clone()),
        delta,
    };
    let message = ProtocolMessage::new(session_id, MessageBody::Update(payload));
    state.current_tree = Some(tree);

    let mut devices_notified = 0;
    for connection in state.connections.values() {
        if connection.send(message.clone()) {
            devices_notified += 1;
        }
    }

    ctx.counters.updates_flushed.fetch_add(1, Ordering::Relaxed);
    match update_kind {
        UpdateKind::Full => ctx.counters.full_updates.fetch_add(1, Ordering::Relaxed),
        UpdateKind::Incremental => ctx
            .counters
            .incremental_updates
            .fetch_add(1, Ordering::Relaxed),
    };

    debug!(
        session = %session_id,
        sequence = sequence_number,
        kind = ?update_kind,
        devices = devices_notified,
        "update flushed"
    );

    FlushReceipt {
        sequence_number,
        update_kind,
        devices_notified,
    }
}
