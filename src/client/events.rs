//! Client event stream
//!
//! Everything the connection task wants the application to see arrives on
//! one channel, in the order it happened.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{Auth, ClientError, Properties, QoS, ReasonCode};

/// An application-delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// v5 only
    pub properties: Properties,
}

/// Notifications from the connection task.
#[derive(Debug)]
pub enum Event {
    /// CONNACK accepted; the session is usable.
    Connected {
        session_present: bool,
        reason_code: ReasonCode,
    },
    /// An inbound publish passed its QoS flow.
    Message(Message),
    /// Transport lost; reconnection pending or disabled.
    Offline,
    /// A reconnect attempt is starting.
    Reconnecting { attempt: u32 },
    /// v5 AUTH packet from the broker, surfaced as-is.
    Auth(Auth),
    /// Non-fatal or connection-fatal error, in order of occurrence.
    Error(ClientError),
    /// The client has shut down; no further events follow.
    Closed,
}

/// Receiving half of the event channel.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking variant for polling loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
