//! DriftMQ - MQTT v3.1/v3.1.1/v5.0 client library
//!
//! A wire codec and an async client with full QoS 0/1/2 session state,
//! automatic reconnect, persistent in-flight storage and v5 topic
//! aliasing, over TCP, TLS or WebSocket transports.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{
    Client, ClientOptions, ConnectionStatus, Event, EventStream, Message, SessionPlugins,
};
pub use codec::{Decoder, Encoder};
pub use protocol::{ClientError, Packet, Properties, ProtocolVersion, QoS, ReasonCode};
pub use session::{MemoryStore, PacketIdProvider, PacketStore};
