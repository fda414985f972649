//! Async MQTT client
//!
//! `Client::connect` spawns a connection task that owns the transport and
//! all session state; the returned handle is cheap to clone and safe to
//! share. Incoming messages and lifecycle notifications arrive on the
//! `EventStream` handed back alongside the client.

mod connection;
mod events;
mod options;

pub use connection::ConnectionStatus;
pub use events::{Event, EventStream, Message};
pub use options::{
    ClientOptions, IdStrategy, OptionsError, TransportProtocol, WillOptions,
};

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{
    ClientError, Properties, Publish, QoS, ReasonCode, Subscription, SubscriptionOptions,
};
use crate::session::{
    CyclicIdProvider, FjallStore, FreeListIdProvider, MemoryStore, PacketIdProvider, PacketStore,
};

use connection::{Command, ConnectionTask};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Overrides for the session machinery, for callers that bring their own
/// storage or id allocation.
#[derive(Default)]
pub struct SessionPlugins {
    pub outgoing: Option<Arc<dyn PacketStore>>,
    pub incoming: Option<Arc<dyn PacketStore>>,
    pub id_provider: Option<Box<dyn PacketIdProvider>>,
}

/// Handle to a running connection task.
#[derive(Clone)]
pub struct Client {
    command_tx: mpsc::Sender<Command>,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl Client {
    /// Connect with default session machinery derived from the options.
    pub async fn connect(options: ClientOptions) -> Result<(Self, EventStream), ClientError> {
        Self::connect_with(options, SessionPlugins::default()).await
    }

    /// Connect with caller-supplied stores or id allocation.
    pub async fn connect_with(
        options: ClientOptions,
        plugins: SessionPlugins,
    ) -> Result<(Self, EventStream), ClientError> {
        options
            .validate()
            .map_err(|e| ClientError::Options(e.to_string()))?;

        let client_id = if options.client_id.is_empty() {
            if !options.clean_start {
                return Err(ClientError::InvalidInput(
                    "a client id is required when clean_start is false",
                ));
            }
            options::generate_client_id()
        } else {
            options.client_id.clone()
        };

        let version = options.protocol_version();

        let outgoing = match plugins.outgoing {
            Some(store) => store,
            None => match &options.storage_path {
                Some(path) => Arc::new(FjallStore::open(path.join("outgoing"), version)?)
                    as Arc<dyn PacketStore>,
                None => Arc::new(MemoryStore::new()),
            },
        };
        let incoming = match plugins.incoming {
            Some(store) => store,
            None => match &options.storage_path {
                Some(path) => Arc::new(FjallStore::open(path.join("incoming"), version)?)
                    as Arc<dyn PacketStore>,
                None => Arc::new(MemoryStore::new()),
            },
        };
        let id_provider = match plugins.id_provider {
            Some(provider) => provider,
            None => match options.id_strategy {
                IdStrategy::Cyclic => Box::new(CyclicIdProvider::new()) as Box<dyn PacketIdProvider>,
                IdStrategy::FreeList => Box::new(FreeListIdProvider::new()),
            },
        };

        let status = Arc::new(RwLock::new(ConnectionStatus::Connecting));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let task = ConnectionTask::new(
            options,
            client_id,
            status.clone(),
            command_rx,
            event_tx,
            id_provider,
            outgoing,
            incoming,
        );
        tokio::spawn(task.run());

        Ok((Client { command_tx, status }, EventStream::new(event_rx)))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Publish a message and wait for QoS completion (immediate for QoS 0,
    /// PUBACK for QoS 1, PUBCOMP for QoS 2).
    pub async fn publish(
        &self,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.publish_with_properties(topic, payload, qos, retain, Properties::default())
            .await
    }

    pub async fn publish_with_properties(
        &self,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        properties: Properties,
    ) -> Result<(), ClientError> {
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
            properties,
        };
        let (done, rx) = oneshot::channel();
        self.send(Command::Publish { publish, done }).await?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Subscribe to a single filter at the given maximum QoS.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
    ) -> Result<Vec<ReasonCode>, ClientError> {
        self.subscribe_many(vec![Subscription {
            filter: filter.into(),
            options: SubscriptionOptions::at_qos(qos),
        }])
        .await
    }

    /// Subscribe to several filters in one SUBSCRIBE exchange.
    pub async fn subscribe_many(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<Vec<ReasonCode>, ClientError> {
        if subscriptions.is_empty() {
            return Err(ClientError::InvalidInput("no subscription filters"));
        }
        let (done, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            subscriptions,
            properties: Properties::default(),
            done,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    pub async fn unsubscribe(
        &self,
        filters: Vec<String>,
    ) -> Result<Vec<ReasonCode>, ClientError> {
        if filters.is_empty() {
            return Err(ClientError::InvalidInput("no unsubscribe filters"));
        }
        let (done, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            filters,
            properties: Properties::default(),
            done,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Graceful shutdown: sends DISCONNECT and stops the connection task.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.disconnect_with_reason(ReasonCode::Success).await
    }

    pub async fn disconnect_with_reason(
        &self,
        reason_code: ReasonCode,
    ) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Disconnect { reason_code, done }).await?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Immediate shutdown without a DISCONNECT packet.
    pub async fn disconnect_force(&self) -> Result<(), ClientError> {
        self.send(Command::DisconnectForce).await
    }

    async fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::Disconnected)
    }
}
