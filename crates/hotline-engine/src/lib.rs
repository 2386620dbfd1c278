//! Live-update session engine.
//!
//! A development host pushes render-tree versions into sessions; connected
//! devices receive them as full or incremental updates over a persistent
//! transport. The engine owns session lifecycle, the device handshake state
//! machine, update batching and fan-out, heartbeat liveness, and session
//! expiry. The transport itself (WebSocket, IPC, ...) is a collaborator:
//! it hands the engine a session id plus an inbound/outbound frame channel
//! pair per connection and closes the socket when it sees a close frame.

pub mod config;
pub mod connection;
pub mod distributor;
pub mod engine;
mod liveness;
mod registry;
pub mod session;

pub use config::EngineConfig;
pub use connection::{
    ConnectionState, DeviceConnection, InboundReceiver, OutboundFrame, OutboundSender,
};
pub use distributor::{FlushReceipt, StagedPush};
pub use engine::{
    ConnectionHealth, EngineError, EngineStats, LiveUpdateEngine, SessionHealth,
};
pub use session::Session;
