use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use hotline_proto::{
    check_version, decode_message, ensure_session, CloseReason, ConnectPayload,
    ConnectedPayload, ErrorPayload, ErrorSeverity, LogLevel, LogPayload, MessageBody,
    PongPayload, ProtocolMessage, VersionCompatibility, PROTOCOL_VERSION,
};

use crate::engine::EngineCtx;
use crate::session::Session;

/// Frames handed to the transport's writer pump. After a `Close` frame the
/// transport is expected to flush what it has queued and drop the socket,
/// surfacing the reason code to the client.
#[derive(Debug)]
pub enum OutboundFrame {
    Message(Box<ProtocolMessage>),
    Close(CloseReason),
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Registered,
    Closed,
}

/// One device's live attachment to a session. Created on a successful
/// handshake, owned exclusively by the session, destroyed on transport
/// close, heartbeat timeout, eviction, or session deletion.
#[derive(Debug)]
pub struct DeviceConnection {
    pub connection_id: String,
    pub device_id: String,
    pub platform: String,
    pub display_name: Option<String>,
    pub protocol_version: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: Instant,
    pub last_acknowledged_sequence: u64,
    pub last_apply_time_ms: Option<u64>,
    pub state: ConnectionState,
    outbound: OutboundSender,
}

impl DeviceConnection {
    pub(crate) fn new(connect: &ConnectPayload, outbound: OutboundSender) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            device_id: connect.device_id.clone(),
            platform: connect.platform.clone(),
            display_name: connect.device_name.clone(),
            protocol_version: connect.client_version.clone(),
            connected_at: Utc::now(),
            last_heartbeat_at: Instant::now(),
            last_acknowledged_sequence: 0,
            last_apply_time_ms: None,
            state: ConnectionState::Registered,
            outbound,
        }
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_at = Instant::now();
    }

    /// A connection is live while `now` is within `timeout` of its last
    /// client-originated heartbeat.
    pub fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_heartbeat_at) <= timeout
    }

    /// Queue a message for the device. Closed connections are skipped, not
    /// counted as failures.
    pub(crate) fn send(&self, message: ProtocolMessage) -> bool {
        self.state == ConnectionState::Registered
            && self
                .outbound
                .send(OutboundFrame::Message(Box::new(message)))
                .is_ok()
    }

    pub(crate) fn close(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        let _ = self.outbound.send(OutboundFrame::Close(reason));
    }
}

struct RegisteredDevice {
    connection_id: String,
    session: Arc<Session>,
}

/// Per-connection driver: Pending until a valid `connect`, Registered
/// afterwards, Closed when the loop returns. Runs until the transport's
/// inbound side ends or the engine closes the connection.
pub(crate) async fn drive_device(
    ctx: Arc<EngineCtx>,
    session_id: Option<String>,
    mut inbound: InboundReceiver,
    outbound: OutboundSender,
) {
    let session_id = match session_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            let _ = outbound.send(OutboundFrame::Close(CloseReason::SessionIdRequired));
            return;
        }
    };

    let mut registered: Option<RegisteredDevice> = None;

    while let Some(bytes) = inbound.recv().await {
        let message = match decode_message(&bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %session_id, error = %err, "undecodable frame");
                send_error(
                    &outbound,
                    &session_id,
                    ErrorPayload::new(
                        "malformed_message",
                        err.to_string(),
                        ErrorSeverity::Fatal,
                        false,
                    ),
                );
                let _ = outbound.send(OutboundFrame::Close(CloseReason::ProtocolError));
                break;
            }
        };

        if let Err(violation) = ensure_session(&message, &session_id) {
            warn!(session = %session_id, addressed = %violation.got, "session mismatch");
            let _ = outbound.send(OutboundFrame::Close(CloseReason::SessionMismatch));
            break;
        }

        match message.body {
            MessageBody::Connect(payload) if registered.is_none() => {
                match handshake(&ctx, &session_id, &payload, &outbound).await {
                    Ok(device) => registered = Some(device),
                    Err(reason) => {
                        let _ = outbound.send(OutboundFrame::Close(reason));
                        return;
                    }
                }
            }
            body => match registered.as_ref() {
                None => {
                    warn!(session = %session_id, kind = body.kind(), "message before handshake");
                    send_error(
                        &outbound,
                        &session_id,
                        ErrorPayload::new(
                            "not_authenticated",
                            "connect before sending other messages",
                            ErrorSeverity::Fatal,
                            false,
                        ),
                    );
                    let _ = outbound.send(OutboundFrame::Close(CloseReason::NotAuthenticated));
                    return;
                }
                Some(device) => {
                    if !handle_registered(device, body, &outbound).await {
                        break;
                    }
                }
            },
        }
    }

    // Transport gone, or the engine closed us. Either way the connection
    // leaves its session; other connections and any pending batch are
    // untouched.
    if let Some(device) = registered {
        if device.session.remove_device(&device.connection_id).await {
            debug!(
                session = %session_id,
                connection = %device.connection_id,
                "device disconnected"
            );
        }
    }
}

/// Pending → Registered, or Pending → Closed with a distinct reason.
async fn handshake(
    ctx: &Arc<EngineCtx>,
    session_id: &str,
    payload: &ConnectPayload,
    outbound: &OutboundSender,
) -> Result<RegisteredDevice, CloseReason> {
    let Some(session) = ctx.registry.get(session_id) else {
        info!(session = %session_id, device = %payload.device_id, "handshake for unknown session");
        send_error(
            outbound,
            session_id,
            ErrorPayload::new(
                "session_not_found",
                format!("session {session_id} not found"),
                ErrorSeverity::Fatal,
                false,
            ),
        );
        return Err(CloseReason::SessionNotFound);
    };

    if session.is_expired().await {
        ctx.registry
            .remove_with_reason(session_id, CloseReason::SessionExpired)
            .await;
        send_error(
            outbound,
            session_id,
            ErrorPayload::new(
                "session_expired",
                format!("session {session_id} expired"),
                ErrorSeverity::Fatal,
                false,
            ),
        );
        return Err(CloseReason::SessionExpired);
    }

    if let VersionCompatibility::Incompatible { reason } =
        check_version(&payload.client_version, PROTOCOL_VERSION)
    {
        warn!(
            session = %session_id,
            device = %payload.device_id,
            client_version = %payload.client_version,
            %reason,
            "rejecting incompatible client"
        );
        send_error(
            outbound,
            session_id,
            ErrorPayload::new("unsupported_version", reason, ErrorSeverity::Fatal, false),
        );
        return Err(CloseReason::UnsupportedVersion);
    }

    let connection = DeviceConnection::new(payload, outbound.clone());
    let connection_id = connection.connection_id.clone();
    let initial_tree = session.register_device(connection).await;

    let reply = ProtocolMessage::new(
        session_id,
        MessageBody::Connected(ConnectedPayload {
            connection_id: connection_id.clone(),
            initial_tree,
        }),
    );
    let _ = outbound.send(OutboundFrame::Message(Box::new(reply)));

    info!(
        session = %session_id,
        connection = %connection_id,
        device = %payload.device_id,
        platform = %payload.platform,
        "device registered"
    );

    Ok(RegisteredDevice {
        connection_id,
        session,
    })
}

/// Dispatch one message from a registered device. Returns false when the
/// driver loop should stop.
async fn handle_registered(
    device: &RegisteredDevice,
    body: MessageBody,
    outbound: &OutboundSender,
) -> bool {
    match body {
        MessageBody::Ping(_) => {
            if !device
                .session
                .record_heartbeat(&device.connection_id)
                .await
            {
                // Evicted between frames; the close frame is already queued.
                return false;
            }
            let pong = ProtocolMessage::new(
                device.session.id(),
                MessageBody::Pong(PongPayload {
                    server_time: Some(Utc::now()),
                }),
            );
            outbound
                .send(OutboundFrame::Message(Box::new(pong)))
                .is_ok()
        }
        MessageBody::Ack(ack) => {
            if !ack.success {
                warn!(
                    session = %device.session.id(),
                    connection = %device.connection_id,
                    sequence = ack.sequence_number,
                    error = ack.error.as_deref().unwrap_or("unspecified"),
                    "device failed to apply update"
                );
            }
            device.session.record_ack(&device.connection_id, &ack).await
        }
        MessageBody::Log(log) => {
            forward_device_log(device.session.id(), &device.connection_id, &log);
            true
        }
        MessageBody::Connect(_) => {
            send_error(
                outbound,
                device.session.id(),
                ErrorPayload::new(
                    "already_connected",
                    "connection already registered",
                    ErrorSeverity::Warning,
                    true,
                ),
            );
            true
        }
        MessageBody::Connected(_)
        | MessageBody::Update(_)
        | MessageBody::Pong(_)
        | MessageBody::Error(_) => {
            warn!(
                session = %device.session.id(),
                connection = %device.connection_id,
                kind = body.kind(),
                "server-bound message of a server-only type"
            );
            send_error(
                outbound,
                device.session.id(),
                ErrorPayload::new(
                    "unexpected_message",
                    format!("clients may not send {} messages", body.kind()),
                    ErrorSeverity::Fatal,
                    false,
                ),
            );
            let _ = outbound.send(OutboundFrame::Close(CloseReason::ProtocolError));
            false
        }
    }
}

fn send_error(outbound: &OutboundSender, session_id: &str, payload: ErrorPayload) {
    let message = ProtocolMessage::new(session_id, MessageBody::Error(payload));
    let _ = outbound.send(OutboundFrame::Message(Box::new(message)));
}

/// Client log lines land in the host's output; they are not part of the
/// protocol's control flow.
fn forward_device_log(session_id: &str, connection_id: &str, log: &LogPayload) {
    match log.level {
        LogLevel::Trace => {
            trace!(session = %session_id, connection = %connection_id, "{}", log.message)
        }
        LogLevel::Debug => {
            debug!(session = %session_id, connection = %connection_id, "{}", log.message)
        }
        LogLevel::Info => {
            info!(session = %session_id, connection = %connection_id, "{}", log.message)
        }
        LogLevel::Warn => {
            warn!(session = %session_id, connection = %connection_id, "{}", log.message)
        }
        LogLevel::Error => {
            error!(session = %session_id, connection = %connection_id, "{}", log.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotline_proto::PingPayload;

    fn connect_payload() -> ConnectPayload {
        ConnectPayload {
            device_id: "device-1".into(),
            platform: "android".into(),
            device_name: None,
            client_version: "1.0.0".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_window_is_inclusive() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connection = DeviceConnection::new(&connect_payload(), tx);
        let start = Instant::now();
        let timeout = Duration::from_secs(60);

        assert!(connection.is_live(start + timeout, timeout));
        assert!(!connection.is_live(start + timeout + Duration::from_secs(1), timeout));

        tokio::time::advance(Duration::from_secs(120)).await;
        connection.record_heartbeat();
        assert!(connection.is_live(Instant::now(), timeout));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_sends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = DeviceConnection::new(&connect_payload(), tx);

        connection.close(CloseReason::SessionClosed);
        connection.close(CloseReason::ConnectionTimeout);

        assert!(matches!(
            rx.recv().await,
            Some(OutboundFrame::Close(CloseReason::SessionClosed))
        ));
        assert!(rx.try_recv().is_err());

        let ping = ProtocolMessage::new("s", MessageBody::Ping(PingPayload::default()));
        assert!(!connection.send(ping));
    }
}
