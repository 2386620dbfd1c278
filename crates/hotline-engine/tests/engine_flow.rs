use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{advance, timeout};

use hotline_engine::{EngineConfig, EngineError, LiveUpdateEngine, OutboundFrame};
use hotline_proto::{
    encode_message, AckPayload, CloseReason, ConnectPayload, MessageBody, PingPayload,
    ProtocolMessage, UpdateKind, UpdatePayload,
};
use hotline_tree::{RenderNode, RenderTree};

fn engine_with(config: EngineConfig) -> LiveUpdateEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    LiveUpdateEngine::new(config)
}

fn test_config() -> EngineConfig {
    EngineConfig {
        session_ttl: Duration::from_secs(3600),
        expiry_sweep_interval: Duration::from_secs(60),
        liveness_sweep_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(60),
        batch_delay: Duration::from_millis(50),
        incremental_threshold: 10,
    }
}

fn root_tree() -> RenderTree {
    RenderTree::new(RenderNode::new("root", "page"))
}

fn colored_root(color: &str) -> RenderTree {
    RenderTree::new(RenderNode::new("root", "page").with_prop("color", color))
}

/// Root with `count` labeled children, each carrying the given text prop.
fn wide_tree(count: usize, text: &str) -> RenderTree {
    let mut root = RenderNode::new("root", "page");
    for index in 0..count {
        root = root.with_child(
            RenderNode::new(format!("child-{index}"), "label").with_prop("text", text),
        );
    }
    RenderTree::new(root)
}

struct TestDevice {
    session_id: String,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    #[allow(dead_code)]
    driver: JoinHandle<()>,
    connection_id: String,
}

impl TestDevice {
    fn open(engine: &LiveUpdateEngine, session_id: Option<&str>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let driver = engine.attach_device(
            session_id.map(str::to_string),
            inbound_rx,
            outbound_tx,
        );
        Self {
            session_id: session_id.unwrap_or_default().to_string(),
            inbound: inbound_tx,
            outbound: outbound_rx,
            driver,
            connection_id: String::new(),
        }
    }

    fn send(&self, body: MessageBody) {
        self.send_as(&self.session_id.clone(), body);
    }

    fn send_as(&self, session_id: &str, body: MessageBody) {
        let message = ProtocolMessage::new(session_id, body);
        let bytes = encode_message(&message).expect("encode");
        self.inbound.send(bytes).expect("inbound channel open");
    }

    fn connect(&self, client_version: &str) {
        self.send(MessageBody::Connect(ConnectPayload {
            device_id: "device-1".into(),
            platform: "android".into(),
            device_name: Some("Emulator".into()),
            client_version: client_version.into(),
        }));
    }

    async fn recv_frame(&mut self) -> OutboundFrame {
        timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    async fn recv_message(&mut self) -> ProtocolMessage {
        match self.recv_frame().await {
            OutboundFrame::Message(message) => *message,
            OutboundFrame::Close(reason) => panic!("unexpected close: {reason}"),
        }
    }

    async fn recv_update(&mut self) -> UpdatePayload {
        match self.recv_message().await.body {
            MessageBody::Update(payload) => payload,
            other => panic!("expected update, got {}", other.kind()),
        }
    }

    /// Next close frame, skipping any error messages sent ahead of it.
    async fn recv_close(&mut self) -> CloseReason {
        loop {
            match self.recv_frame().await {
                OutboundFrame::Close(reason) => return reason,
                OutboundFrame::Message(_) => continue,
            }
        }
    }

    /// Round-trip a ping so every previously sent frame is processed.
    async fn sync(&mut self) {
        self.send(MessageBody::Ping(PingPayload::default()));
        match self.recv_message().await.body {
            MessageBody::Pong(_) => {}
            other => panic!("expected pong, got {}", other.kind()),
        }
    }
}

async fn registered_device(engine: &LiveUpdateEngine, session_id: &str) -> TestDevice {
    let mut device = TestDevice::open(engine, Some(session_id));
    device.connect("1.0.0");
    match device.recv_message().await.body {
        MessageBody::Connected(payload) => device.connection_id = payload.connection_id,
        other => panic!("expected connected, got {}", other.kind()),
    }
    device
}

#[tokio::test]
async fn handshake_replies_with_connection_id_and_initial_tree() {
    let engine = engine_with(test_config());
    let session = engine.create_session();

    // Before the first push, a new device gets no initial tree.
    let mut early = TestDevice::open(&engine, Some(session.id()));
    early.connect("1.0.0");
    match early.recv_message().await.body {
        MessageBody::Connected(payload) => {
            assert!(!payload.connection_id.is_empty());
            assert!(payload.initial_tree.is_none());
        }
        other => panic!("expected connected, got {}", other.kind()),
    }

    let receipt = engine
        .push_immediate(session.id(), colored_root("red"), true)
        .await
        .unwrap();
    assert_eq!(receipt.sequence_number, 1);

    // A device joining mid-session renders from the handshake reply.
    let mut late = TestDevice::open(&engine, Some(session.id()));
    late.connect("1.0.0");
    match late.recv_message().await.body {
        MessageBody::Connected(payload) => {
            assert_eq!(payload.initial_tree, Some(colored_root("red")));
        }
        other => panic!("expected connected, got {}", other.kind()),
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn first_push_is_full_then_small_change_is_incremental() {
    let engine = engine_with(test_config());
    let session = engine.create_session();
    let mut device = registered_device(&engine, session.id()).await;

    let receipt = engine
        .push_immediate(session.id(), root_tree(), false)
        .await
        .unwrap();
    assert_eq!(receipt.sequence_number, 1);
    assert_eq!(receipt.update_kind, UpdateKind::Full);
    assert_eq!(receipt.devices_notified, 1);

    let update = device.recv_update().await;
    assert_eq!(update.sequence_number, 1);
    assert_eq!(update.update_type, UpdateKind::Full);
    assert_eq!(update.tree, Some(root_tree()));
    assert!(update.delta.is_none());

    let receipt = engine
        .push_immediate(session.id(), colored_root("red"), true)
        .await
        .unwrap();
    assert_eq!(receipt.sequence_number, 2);
    assert_eq!(receipt.update_kind, UpdateKind::Incremental);

    let update = device.recv_update().await;
    assert_eq!(update.sequence_number, 2);
    assert_eq!(update.update_type, UpdateKind::Incremental);
    assert!(update.preserve_state);
    assert!(update.tree.is_none());
    let delta = update.delta.expect("incremental update carries a delta");
    assert_eq!(delta.change_count(), 1);
    assert_eq!(delta.modified[0].id, "root");
    assert_eq!(delta.modified[0].changed_props, ["color"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn edit_sets_at_the_threshold_ship_as_full() {
    let engine = engine_with(test_config());
    let session = engine.create_session();

    let receipt = engine
        .push_immediate(session.id(), wide_tree(12, "old"), false)
        .await
        .unwrap();
    assert_eq!(receipt.update_kind, UpdateKind::Full);

    // 9 changed nodes stay under the threshold of 10.
    let mut tree = wide_tree(12, "old");
    for index in 0..9 {
        let child = &mut tree.root.children[index];
        child.props.insert("text".into(), "new".into());
    }
    let receipt = engine
        .push_immediate(session.id(), tree, false)
        .await
        .unwrap();
    assert_eq!(receipt.update_kind, UpdateKind::Incremental);

    // All 12 children change relative to the previous snapshot, which is
    // at the threshold and forces a full replacement.
    let receipt = engine
        .push_immediate(session.id(), wide_tree(12, "newest"), false)
        .await
        .unwrap();
    assert_eq!(receipt.update_kind, UpdateKind::Full);
    assert_eq!(receipt.sequence_number, 3);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_pushes_coalesces_into_one_flush() {
    let engine = engine_with(test_config());
    let session = engine.create_session();
    let mut device = registered_device(&engine, session.id()).await;

    let first = engine
        .push(session.id(), colored_root("red"), true)
        .await
        .unwrap();
    let second = engine
        .push(session.id(), colored_root("green"), true)
        .await
        .unwrap();
    let third = engine
        .push(session.id(), colored_root("blue"), true)
        .await
        .unwrap();

    let receipt = third.resolved().await.unwrap();
    assert_eq!(receipt.sequence_number, 1);
    assert_eq!(receipt.update_kind, UpdateKind::Full);
    assert_eq!(receipt.devices_notified, 1);

    // Superseded pushes resolve with the receipt of the flush that covered
    // them.
    let receipt = first.resolved().await.unwrap();
    assert_eq!(receipt.sequence_number, 1);
    let receipt = second.resolved().await.unwrap();
    assert_eq!(receipt.sequence_number, 1);

    // Exactly one update went out, carrying the last staged tree.
    let update = device.recv_update().await;
    assert_eq!(update.tree, Some(colored_root("blue")));
    device.sync().await;

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn immediate_push_cancels_the_staged_flush() {
    let engine = engine_with(test_config());
    let session = engine.create_session();
    let mut device = registered_device(&engine, session.id()).await;

    let staged = engine
        .push(session.id(), colored_root("red"), false)
        .await
        .unwrap();
    let receipt = engine
        .push_immediate(session.id(), colored_root("blue"), false)
        .await
        .unwrap();
    assert_eq!(receipt.sequence_number, 1);

    // The staged waiter resolves against the immediate flush; the staged
    // tree itself is discarded.
    let staged_receipt = staged.resolved().await.unwrap();
    assert_eq!(staged_receipt.sequence_number, 1);

    let update = device.recv_update().await;
    assert_eq!(update.tree, Some(colored_root("blue")));
    device.sync().await;

    // Waiting out the batch delay produces no second flush.
    advance(Duration::from_millis(200)).await;
    assert_eq!(session.sequence_number().await, 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn staged_push_resolves_as_closed_when_session_is_deleted() {
    let engine = engine_with(test_config());
    let session = engine.create_session();

    let staged = engine
        .push(session.id(), root_tree(), false)
        .await
        .unwrap();
    assert!(engine.delete_session(session.id()).await);

    assert!(matches!(
        staged.resolved().await,
        Err(EngineError::SessionClosed)
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn push_to_unknown_session_is_a_typed_failure() {
    let engine = engine_with(test_config());

    match engine.push("missing", root_tree(), false).await {
        Err(EngineError::SessionNotFound(id)) => assert_eq!(id, "missing"),
        other => panic!("expected SessionNotFound, got {other:?}"),
    }
    assert!(engine
        .push_immediate("missing", root_tree(), false)
        .await
        .is_err());

    engine.shutdown().await;
}

#[tokio::test]
async fn acks_drive_the_unacknowledged_report() {
    let engine = engine_with(test_config());
    let session = engine.create_session();
    let mut device = registered_device(&engine, session.id()).await;

    engine
        .push_immediate(session.id(), root_tree(), false)
        .await
        .unwrap();
    engine
        .push_immediate(session.id(), colored_root("red"), false)
        .await
        .unwrap();
    device.recv_update().await;
    device.recv_update().await;

    device.send(MessageBody::Ack(AckPayload {
        sequence_number: 1,
        success: true,
        error: None,
        apply_time_ms: Some(12),
    }));
    device.sync().await;

    let lagging = engine
        .get_unacknowledged_devices(session.id(), 2)
        .await
        .unwrap();
    assert_eq!(lagging, [device.connection_id.clone()]);

    let health = engine.get_session_health(session.id()).await.unwrap();
    assert_eq!(health.sequence_number, 2);
    assert_eq!(health.connections.len(), 1);
    assert!(health.connections[0].live);
    assert_eq!(health.connections[0].last_acknowledged_sequence, 1);
    assert_eq!(health.connections[0].last_apply_time_ms, Some(12));

    device.send(MessageBody::Ack(AckPayload {
        sequence_number: 2,
        success: false,
        error: Some("layout failed".into()),
        apply_time_ms: None,
    }));
    device.sync().await;

    // A failed apply keeps the connection open; the server does not retry.
    let lagging = engine
        .get_unacknowledged_devices(session.id(), 2)
        .await
        .unwrap();
    assert!(lagging.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn delete_session_closes_every_connection() {
    let engine = engine_with(test_config());
    let session = engine.create_session();

    let mut devices = Vec::new();
    for _ in 0..3 {
        devices.push(registered_device(&engine, session.id()).await);
    }
    assert_eq!(
        engine.get_connected_devices(session.id()).await.unwrap().len(),
        3
    );

    assert!(engine.delete_session(session.id()).await);
    for device in &mut devices {
        assert_eq!(device.recv_close().await, CloseReason::SessionClosed);
    }
    assert!(engine.get_session(session.id()).is_none());
    assert!(!engine.delete_session(session.id()).await);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_connection_is_evicted_by_the_liveness_sweep() {
    let engine = engine_with(test_config());
    let session = engine.create_session();
    let mut quiet = registered_device(&engine, session.id()).await;

    // Past the heartbeat timeout and at least one sweep tick.
    advance(Duration::from_secs(95)).await;

    assert_eq!(quiet.recv_close().await, CloseReason::ConnectionTimeout);
    assert!(engine
        .get_connected_devices(session.id())
        .await
        .unwrap()
        .is_empty());

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pings_keep_a_connection_alive_across_sweeps() {
    let engine = engine_with(test_config());
    let session = engine.create_session();
    let mut device = registered_device(&engine, session.id()).await;

    for _ in 0..4 {
        advance(Duration::from_secs(40)).await;
        device.sync().await;
    }

    assert_eq!(
        engine.get_connected_devices(session.id()).await.unwrap().len(),
        1
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn expired_session_is_swept_and_its_devices_told_why() {
    let config = EngineConfig {
        session_ttl: Duration::from_secs(100),
        heartbeat_timeout: Duration::from_secs(10_000),
        ..test_config()
    };
    let engine = engine_with(config);
    let session = engine.create_session();
    let mut device = registered_device(&engine, session.id()).await;

    advance(Duration::from_secs(200)).await;

    assert_eq!(device.recv_close().await, CloseReason::SessionExpired);
    assert!(engine.get_session(session.id()).is_none());

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn extended_session_survives_the_sweep_past_its_original_expiry() {
    let config = EngineConfig {
        session_ttl: Duration::from_secs(100),
        heartbeat_timeout: Duration::from_secs(10_000),
        ..test_config()
    };
    let engine = engine_with(config);
    let session = engine.create_session();

    advance(Duration::from_secs(90)).await;
    assert!(engine.extend_session(session.id(), None).await);

    // 150s after creation is past the original expiry but not the extended
    // one; the sweep must leave the session alone.
    advance(Duration::from_secs(60)).await;
    assert!(engine.get_session(session.id()).is_some());

    advance(Duration::from_secs(200)).await;
    assert!(engine.get_session(session.id()).is_none());

    assert!(!engine.extend_session("missing", None).await);
    engine.shutdown().await;
}

#[tokio::test]
async fn handshake_rejections_close_with_distinct_reasons() {
    let engine = engine_with(test_config());
    let session = engine.create_session();

    // No session id supplied by the transport.
    let mut device = TestDevice::open(&engine, None);
    assert_eq!(device.recv_close().await, CloseReason::SessionIdRequired);

    // Unknown session.
    let mut device = TestDevice::open(&engine, Some("nope"));
    device.connect("1.0.0");
    assert_eq!(device.recv_close().await, CloseReason::SessionNotFound);

    // Incompatible protocol major.
    let mut device = TestDevice::open(&engine, Some(session.id()));
    device.connect("2.0.0");
    assert_eq!(device.recv_close().await, CloseReason::UnsupportedVersion);

    // Anything but connect while pending.
    let mut device = TestDevice::open(&engine, Some(session.id()));
    device.send(MessageBody::Ping(PingPayload::default()));
    assert_eq!(device.recv_close().await, CloseReason::NotAuthenticated);

    engine.shutdown().await;
}

#[tokio::test]
async fn mismatched_and_malformed_frames_are_fatal_to_the_connection() {
    let engine = engine_with(test_config());
    let session = engine.create_session();

    let mut device = registered_device(&engine, session.id()).await;
    device.send_as("other-session", MessageBody::Ping(PingPayload::default()));
    assert_eq!(device.recv_close().await, CloseReason::SessionMismatch);

    let mut device = registered_device(&engine, session.id()).await;
    device.inbound.send(b"{not json".to_vec()).unwrap();
    assert_eq!(device.recv_close().await, CloseReason::ProtocolError);

    // The session and its other connections are unaffected.
    assert!(engine.get_session(session.id()).is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn stats_count_sessions_connections_and_update_kinds() {
    let engine = engine_with(test_config());
    let session = engine.create_session();
    let _other = engine.create_session();
    let mut device = registered_device(&engine, session.id()).await;

    engine
        .push_immediate(session.id(), root_tree(), false)
        .await
        .unwrap();
    engine
        .push_immediate(session.id(), colored_root("red"), false)
        .await
        .unwrap();
    device.recv_update().await;
    device.recv_update().await;

    let stats = engine.get_stats().await;
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.sessions_created, 2);
    assert_eq!(stats.updates_flushed, 2);
    assert_eq!(stats.full_updates, 1);
    assert_eq!(stats.incremental_updates, 1);

    engine.shutdown().await;
}
