//! Connection task
//!
//! One tokio task owns everything mutable about a connection: transport,
//! codec, timers, packet id allocator, alias tables, in-flight stores and
//! waiter maps. The `Client` handle talks to it over a command channel, so
//! id allocation and store writes are naturally serialized and the QoS
//! state machine never races itself.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ClientError, ConnAck, Connect, Disconnect, Packet, Properties, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, ReasonCode, Subscribe, Subscription, UnsubAck, Unsubscribe,
};
use crate::session::{
    AliasAssignment, PacketIdProvider, PacketStore, SessionState, TopicAliasRecv, TopicAliasSend,
};
use crate::transport::{connect_tcp, tls_connector, Transport, TransportConfig, WsStream};

use super::events::{Event, Message};
use super::options::{ClientOptions, TransportProtocol};

/// Connection status visible through the `Client` handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Transport lost, reconnect pending
    Offline,
}

/// Request from the `Client` handle.
pub(crate) enum Command {
    Publish {
        publish: Publish,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Subscribe {
        subscriptions: Vec<Subscription>,
        properties: Properties,
        done: oneshot::Sender<Result<Vec<ReasonCode>, ClientError>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        properties: Properties,
        done: oneshot::Sender<Result<Vec<ReasonCode>, ClientError>>,
    },
    Disconnect {
        reason_code: ReasonCode,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    DisconnectForce,
}

/// Per-packet-id completion handles.
enum AckWaiter {
    /// QoS 1/2 publish awaiting PUBACK/PUBCOMP
    Publish(oneshot::Sender<Result<(), ClientError>>),
    /// SUBSCRIBE awaiting SUBACK
    Subscribe {
        subscriptions: Vec<Subscription>,
        done: oneshot::Sender<Result<Vec<ReasonCode>, ClientError>>,
    },
    /// UNSUBSCRIBE awaiting UNSUBACK
    Unsubscribe {
        filters: Vec<String>,
        done: oneshot::Sender<Result<Vec<ReasonCode>, ClientError>>,
    },
    /// Automatic resubscription after reconnect; nobody is waiting
    Resubscribe,
}

/// Why `connect_and_run` returned.
enum Exit {
    /// `disconnect()`/`disconnect_force()`; do not reconnect
    Shutdown,
    /// Connection failure; reconnect logic decides
    Failure(ClientError),
}

pub(crate) struct ConnectionTask {
    options: ClientOptions,
    client_id: String,
    status: Arc<RwLock<ConnectionStatus>>,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<Event>,

    id_provider: Box<dyn PacketIdProvider>,
    outgoing: Arc<dyn PacketStore>,
    incoming: Arc<dyn PacketStore>,
    session: SessionState,
    waiters: ahash::AHashMap<u16, AckWaiter>,
    /// QoS 1/2 publish ids that have been on the wire at least once. Only
    /// these replay with the DUP flag set.
    sent_ids: ahash::AHashSet<u16>,

    encoder: Encoder,
    decoder: Decoder,

    alias_send: Option<TopicAliasSend>,
    alias_recv: Option<TopicAliasRecv>,

    /// Effective keep-alive after any server override
    keepalive: Duration,
    /// PINGREQ sent, PINGRESP not yet seen
    pending_pong: bool,
    /// Last successful outbound write
    last_write: Instant,
    /// CONNACK deadline while the handshake is outstanding
    connack_deadline: Option<Instant>,
}

impl ConnectionTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        options: ClientOptions,
        client_id: String,
        status: Arc<RwLock<ConnectionStatus>>,
        command_rx: mpsc::Receiver<Command>,
        event_tx: mpsc::Sender<Event>,
        id_provider: Box<dyn PacketIdProvider>,
        outgoing: Arc<dyn PacketStore>,
        incoming: Arc<dyn PacketStore>,
    ) -> Self {
        let version = options.protocol_version();
        let keepalive = Duration::from_secs(options.keepalive as u64);
        Self {
            options,
            client_id,
            status,
            command_rx,
            event_tx,
            id_provider,
            outgoing,
            incoming,
            session: SessionState::new(),
            waiters: ahash::AHashMap::new(),
            sent_ids: ahash::AHashSet::new(),
            encoder: Encoder::new(version),
            decoder: Decoder::new(version),
            alias_send: None,
            alias_recv: None,
            keepalive,
            pending_pong: false,
            last_write: Instant::now(),
            connack_deadline: None,
        }
    }

    /// Outer connect/reconnect loop. Runs until shutdown.
    pub(crate) async fn run(mut self) {
        self.restore_in_flight_ids().await;

        let mut attempt: u32 = 0;

        loop {
            *self.status.write() = ConnectionStatus::Connecting;

            match self.connect_and_run().await {
                Exit::Shutdown => break,
                Exit::Failure(e) => {
                    warn!(error = %e, "connection lost");
                    self.emit(Event::Error(e)).await;
                    *self.status.write() = ConnectionStatus::Offline;
                    self.emit(Event::Offline).await;
                    self.fail_request_waiters();

                    if !self.options.reconnect_enabled() {
                        break;
                    }

                    attempt += 1;
                    self.emit(Event::Reconnecting { attempt }).await;
                    debug!(attempt, period = ?self.options.reconnect_period, "reconnecting");

                    // Stay responsive to commands while waiting out the
                    // reconnect period.
                    if self.wait_reconnect_period().await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Reserve the packet ids of publishes restored from a durable
    /// outgoing store so fresh allocations cannot collide with them. They
    /// were written by a previous run, so their replay carries DUP.
    async fn restore_in_flight_ids(&mut self) {
        match self.outgoing.iter().await {
            Ok(packets) => {
                for packet in packets {
                    let id = match &packet {
                        Packet::Publish(publish) => publish.packet_id,
                        Packet::PubRel(pubrel) => Some(pubrel.packet_id),
                        _ => None,
                    };
                    if let Some(id) = id {
                        self.id_provider.register(id);
                        self.sent_ids.insert(id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "outgoing store scan failed"),
        }
    }

    /// Sleep for `reconnect_period`, queuing commands that arrive in the
    /// meantime. Returns true when shutdown was requested.
    async fn wait_reconnect_period(&mut self) -> bool {
        let deadline = Instant::now() + self.options.reconnect_period;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_offline_command(cmd).await {
                            return true;
                        }
                    }
                    // All handles dropped
                    None => return true,
                },
            }
        }
    }

    /// Handle a command while no transport is up. Returns true on shutdown.
    async fn handle_offline_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Publish { publish, done } => {
                if publish.qos == QoS::AtMostOnce {
                    if self.options.queue_qos0 {
                        self.session.queue_offline(Packet::Publish(publish));
                        let _ = done.send(Ok(()));
                    } else {
                        let _ = done.send(Err(ClientError::Disconnected));
                    }
                    return false;
                }

                // QoS 1/2: allocate now so the publish survives in the
                // store and completes after the next CONNACK.
                let Some(id) = self.id_provider.allocate() else {
                    let _ = done.send(Err(ClientError::PacketIdExhausted));
                    return false;
                };
                let mut publish = publish;
                publish.packet_id = Some(id);
                if let Err(e) = self.outgoing.put(Packet::Publish(publish.clone())).await {
                    self.id_provider.deallocate(id);
                    let _ = done.send(Err(e.into()));
                    return false;
                }
                self.waiters.insert(id, AckWaiter::Publish(done));
                false
            }
            Command::Subscribe {
                subscriptions,
                properties,
                done,
            } => {
                let Some(id) = self.id_provider.allocate() else {
                    let _ = done.send(Err(ClientError::PacketIdExhausted));
                    return false;
                };
                self.session.queue_offline(Packet::Subscribe(Subscribe {
                    packet_id: id,
                    subscriptions: subscriptions.clone(),
                    properties,
                }));
                self.waiters
                    .insert(id, AckWaiter::Subscribe { subscriptions, done });
                false
            }
            Command::Unsubscribe {
                filters,
                properties,
                done,
            } => {
                let Some(id) = self.id_provider.allocate() else {
                    let _ = done.send(Err(ClientError::PacketIdExhausted));
                    return false;
                };
                self.session.queue_offline(Packet::Unsubscribe(Unsubscribe {
                    packet_id: id,
                    filters: filters.clone(),
                    properties,
                }));
                self.waiters
                    .insert(id, AckWaiter::Unsubscribe { filters, done });
                false
            }
            Command::Disconnect { done, .. } => {
                let _ = done.send(Ok(()));
                true
            }
            Command::DisconnectForce => true,
        }
    }

    /// Dial, handshake and run the packet loop for one connection.
    async fn connect_and_run(&mut self) -> Exit {
        let transport = match timeout(self.options.connect_timeout, self.dial()).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => return Exit::Failure(e),
            Err(_) => return Exit::Failure(ClientError::ConnectTimeout),
        };

        let (mut read_half, mut write_half) = tokio::io::split(transport);

        // Fresh codec and timer state per connection
        self.decoder.reset();
        self.decoder.set_protocol_version(self.options.protocol_version());
        if let Some(size) = self.options.max_packet_size {
            self.decoder.set_max_packet_size(size as usize);
        }
        self.encoder.set_protocol_version(self.options.protocol_version());
        self.pending_pong = false;
        self.keepalive = Duration::from_secs(self.options.keepalive as u64);
        self.alias_send = None;
        self.alias_recv = None;

        let connect = self.build_connect();
        if let Err(e) = self.write_packet(&mut write_half, &connect).await {
            return Exit::Failure(e);
        }
        debug!(client_id = %self.client_id, "CONNECT sent");
        self.connack_deadline = Some(Instant::now() + self.options.connect_timeout);

        let mut chunk = [0u8; 4096];
        // Base of the ping schedule; also the retransmission reference when
        // `reschedule_pings` is off
        let mut last_ping = Instant::now();

        loop {
            let far_future = Instant::now() + Duration::from_secs(86_400);
            let connack_deadline = self.connack_deadline.unwrap_or(far_future);

            // Recomputed every pass so a CONNACK server_keep_alive override
            // takes effect immediately
            let ping_deadline = if self.keepalive.is_zero() || self.connack_deadline.is_some() {
                far_future
            } else if self.options.reschedule_pings {
                self.last_write.max(last_ping) + self.keepalive
            } else {
                last_ping + self.keepalive
            };

            tokio::select! {
                result = read_half.read(&mut chunk) => {
                    let n = match result {
                        Ok(0) => return Exit::Failure(ClientError::Disconnected),
                        Ok(n) => n,
                        Err(e) => return Exit::Failure(e.into()),
                    };
                    self.decoder.feed(&chunk[..n]);
                    loop {
                        match self.decoder.next() {
                            Ok(Some(packet)) => {
                                match self.handle_packet(packet, &mut write_half).await {
                                    Ok(true) => {}
                                    Ok(false) => return Exit::Shutdown,
                                    Err(e) => return Exit::Failure(e),
                                }
                            }
                            Ok(None) => break,
                            Err(e) => return Exit::Failure(e.into()),
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        // Nothing goes on the wire before CONNACK; queue
                        // until the handshake settles
                        Some(cmd) if self.connack_deadline.is_some() => {
                            if self.handle_offline_command(cmd).await {
                                return Exit::Shutdown;
                            }
                        }
                        Some(cmd) => match self.handle_command(cmd, &mut write_half).await {
                            Ok(true) => {}
                            Ok(false) => return Exit::Shutdown,
                            Err(e) => return Exit::Failure(e),
                        },
                        None => return Exit::Shutdown,
                    }
                }

                _ = tokio::time::sleep_until(ping_deadline) => {
                    if self.pending_pong {
                        // A full keep-alive interval passed with no PINGRESP
                        return Exit::Failure(ClientError::KeepAliveTimeout);
                    }
                    if let Err(e) = self.write_packet(&mut write_half, &Packet::PingReq).await {
                        return Exit::Failure(e);
                    }
                    self.pending_pong = true;
                    last_ping = Instant::now();
                    debug!("PINGREQ sent");
                }

                _ = tokio::time::sleep_until(connack_deadline),
                        if self.connack_deadline.is_some() => {
                    return Exit::Failure(ClientError::ConnectTimeout);
                }
            }
        }
    }

    /// Establish the configured transport.
    async fn dial(&self) -> Result<Box<dyn Transport>, ClientError> {
        let (host, port) = self.options.endpoint();
        let address = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let tcp = connect_tcp(&address, &TransportConfig::default()).await?;

        let transport: Box<dyn Transport> = match self.options.protocol {
            TransportProtocol::Mqtt => Box::new(tcp),
            TransportProtocol::Mqtts => {
                let connector = tls_connector(&self.options.tls)
                    .map_err(|e| ClientError::Options(e.to_string()))?;
                let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(host)
                    .map_err(|_| ClientError::InvalidInput("invalid TLS server name"))?;
                Box::new(connector.connect(server_name, tcp).await?)
            }
            TransportProtocol::Ws => {
                Box::new(WsStream::connect(&self.options.ws_url(), tcp).await?)
            }
            TransportProtocol::Wss => {
                let connector = tls_connector(&self.options.tls)
                    .map_err(|e| ClientError::Options(e.to_string()))?;
                let server_name =
                    tokio_rustls::rustls::pki_types::ServerName::try_from(host.clone())
                        .map_err(|_| ClientError::InvalidInput("invalid TLS server name"))?;
                let tls = connector.connect(server_name, tcp).await?;
                Box::new(WsStream::connect(&self.options.ws_url(), tls).await?)
            }
        };

        Ok(transport)
    }

    fn build_connect(&self) -> Packet {
        let version = self.options.protocol_version();
        let mut properties = Properties::default();
        if version.is_v5() {
            if self.options.topic_alias_maximum > 0 {
                properties.topic_alias_maximum = Some(self.options.topic_alias_maximum);
            }
            properties.receive_maximum = self.options.receive_maximum;
            properties.maximum_packet_size = self.options.max_packet_size;
            properties.session_expiry_interval = self.options.session_expiry_interval;
        }

        Packet::Connect(Box::new(Connect {
            protocol_version: version,
            client_id: self.client_id.clone(),
            clean_start: self.options.clean_start,
            keep_alive: self.options.keepalive,
            username: self.options.username.clone(),
            password: self
                .options
                .password
                .as_ref()
                .map(|p| bytes::Bytes::from(p.clone().into_bytes())),
            will: self.options.will.as_ref().map(|w| w.to_will()),
            properties,
        }))
    }

    /// Inbound packet dispatch. `Ok(true)` continues the loop, `Ok(false)`
    /// is a broker-side clean shutdown, `Err` tears the connection down.
    async fn handle_packet<W>(
        &mut self,
        packet: Packet,
        write_half: &mut W,
    ) -> Result<bool, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        match packet {
            Packet::ConnAck(connack) => self.handle_connack(connack, write_half).await?,
            Packet::Publish(publish) => self.handle_publish(publish, write_half).await?,
            Packet::PubAck(PubAck {
                packet_id,
                reason_code,
                ..
            }) => {
                self.complete_publish(packet_id, reason_code).await?;
            }
            Packet::PubRec(PubRec {
                packet_id,
                reason_code,
                ..
            }) => {
                if reason_code.is_error() {
                    // The broker refused the publish; the flow ends here
                    self.complete_publish(packet_id, reason_code).await?;
                } else if self.outgoing.get(packet_id).await?.is_some() {
                    // The store also covers replayed flows with no waiter
                    self.outgoing.put(Packet::PubRel(PubRel::new(packet_id))).await?;
                    self.write_packet(write_half, &Packet::PubRel(PubRel::new(packet_id)))
                        .await?;
                } else {
                    debug!(packet_id, "PUBREC for unknown packet id");
                }
            }
            Packet::PubComp(PubComp {
                packet_id,
                reason_code,
                ..
            }) => {
                self.complete_publish(packet_id, reason_code).await?;
            }
            Packet::PubRel(PubRel { packet_id, .. }) => {
                // Exactly-once delivery happens here, not at PUBLISH time
                if let Some(Packet::Publish(publish)) = self.incoming.del(packet_id).await? {
                    self.deliver(publish).await;
                }
                self.write_packet(write_half, &Packet::PubComp(PubComp::new(packet_id)))
                    .await?;
            }
            Packet::SubAck(suback) => self.handle_suback(suback),
            Packet::UnsubAck(unsuback) => self.handle_unsuback(unsuback),
            Packet::PingResp => {
                self.pending_pong = false;
                debug!("PINGRESP received");
            }
            Packet::Disconnect(Disconnect { reason_code, .. }) => {
                warn!(code = %reason_code, "broker sent DISCONNECT");
                return Err(ClientError::Reason(reason_code));
            }
            Packet::Auth(auth) => {
                self.emit(Event::Auth(auth)).await;
            }
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq => {
                return Err(ClientError::Decode(
                    crate::protocol::DecodeError::MalformedPacket(
                        "client-to-server packet from broker",
                    ),
                ));
            }
        }
        Ok(true)
    }

    async fn handle_connack<W>(
        &mut self,
        connack: ConnAck,
        write_half: &mut W,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.connack_deadline.take().is_none() {
            return Err(ClientError::Decode(
                crate::protocol::DecodeError::MalformedPacket("CONNACK outside handshake"),
            ));
        }

        if connack.reason_code.is_error() {
            error!(code = %connack.reason_code, "connection refused");
            return Err(ClientError::ConnectionRefused(connack.reason_code));
        }

        // Server-side session limits
        if let Some(server_keep_alive) = connack.properties.server_keep_alive {
            self.keepalive = Duration::from_secs(server_keep_alive as u64);
        }
        if let Some(size) = connack.properties.maximum_packet_size {
            self.encoder.set_max_packet_size(size as usize);
        }
        if self.options.protocol_version().is_v5() {
            if let Some(max) = connack.properties.topic_alias_maximum {
                if max > 0 && self.options.auto_topic_alias {
                    self.alias_send = Some(TopicAliasSend::new(max));
                }
            }
            if self.options.topic_alias_maximum > 0 {
                self.alias_recv = Some(TopicAliasRecv::new(self.options.topic_alias_maximum));
            }
        }

        *self.status.write() = ConnectionStatus::Connected;
        info!(
            session_present = connack.session_present,
            client_id = %self.client_id,
            "connected"
        );
        self.emit(Event::Connected {
            session_present: connack.session_present,
            reason_code: connack.reason_code,
        })
        .await;

        // Replay unacknowledged QoS 1/2 state in original order. DUP marks
        // retransmissions only; a publish stored while offline goes out
        // here for the first time with DUP clear.
        for packet in self.outgoing.iter().await? {
            let replay = match packet {
                Packet::Publish(mut publish) => {
                    if let Some(id) = publish.packet_id {
                        publish.dup = self.sent_ids.contains(&id);
                        self.sent_ids.insert(id);
                    }
                    Packet::Publish(publish)
                }
                other => other,
            };
            self.write_packet(write_half, &replay).await?;
        }

        // Restore subscriptions the broker forgot
        if !connack.session_present
            && self.options.resubscribe
            && !self.session.subscriptions().is_empty()
        {
            if let Some(id) = self.id_provider.allocate() {
                let subscribe = Packet::Subscribe(Subscribe {
                    packet_id: id,
                    subscriptions: self.session.subscriptions().to_vec(),
                    properties: Properties::default(),
                });
                self.waiters.insert(id, AckWaiter::Resubscribe);
                self.write_packet(write_half, &subscribe).await?;
                debug!(count = self.session.subscriptions().len(), "resubscribed");
            }
        }

        // Flush operations issued while offline
        let queued: Vec<Packet> = self.session.drain_offline().collect();
        for mut packet in queued {
            if let Packet::Publish(ref mut publish) = packet {
                self.apply_send_alias(publish);
            }
            self.write_packet(write_half, &packet).await?;
        }

        Ok(())
    }

    async fn handle_publish<W>(
        &mut self,
        mut publish: Publish,
        write_half: &mut W,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        // Resolve / record the broker's topic alias
        if let Some(alias) = publish.properties.topic_alias {
            let table = self.alias_recv.as_mut().ok_or(ClientError::Reason(
                ReasonCode::TopicAliasInvalid,
            ))?;
            if publish.topic.is_empty() {
                publish.topic = table
                    .resolve(alias)
                    .ok_or(ClientError::Reason(ReasonCode::TopicAliasInvalid))?;
            } else if !table.register(alias, publish.topic.clone()) {
                return Err(ClientError::Reason(ReasonCode::TopicAliasInvalid));
            }
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish).await;
            }
            QoS::AtLeastOnce => {
                // Decoder guarantees the id is present for QoS > 0
                let Some(id) = publish.packet_id else {
                    return Err(ClientError::Decode(
                        crate::protocol::DecodeError::MalformedPacket("QoS 1 without packet id"),
                    ));
                };
                self.deliver(publish).await;
                self.write_packet(write_half, &Packet::PubAck(PubAck::new(id)))
                    .await?;
            }
            QoS::ExactlyOnce => {
                let Some(id) = publish.packet_id else {
                    return Err(ClientError::Decode(
                        crate::protocol::DecodeError::MalformedPacket("QoS 2 without packet id"),
                    ));
                };
                // A duplicate before PUBREL replaces the stored copy; the
                // single delivery happens on PUBREL either way
                self.incoming.put(Packet::Publish(publish)).await?;
                self.write_packet(write_half, &Packet::PubRec(PubRec::new(id)))
                    .await?;
            }
        }

        Ok(())
    }

    /// Resolve the waiter for a finished QoS 1/2 publish.
    async fn complete_publish(
        &mut self,
        packet_id: u16,
        reason_code: ReasonCode,
    ) -> Result<(), ClientError> {
        let stored = self.outgoing.del(packet_id).await?;
        match self.waiters.remove(&packet_id) {
            Some(AckWaiter::Publish(done)) => {
                self.id_provider.deallocate(packet_id);
                self.sent_ids.remove(&packet_id);
                let result = if reason_code.is_error() {
                    Err(ClientError::Reason(reason_code))
                } else {
                    Ok(())
                };
                let _ = done.send(result);
            }
            Some(other) => {
                // Wrong ack kind for this id; put it back and complain
                self.waiters.insert(packet_id, other);
                warn!(packet_id, "publish ack for non-publish operation");
            }
            None if stored.is_some() => {
                // Restored in-flight publish finishing with nobody waiting
                self.id_provider.deallocate(packet_id);
                self.sent_ids.remove(&packet_id);
            }
            None => debug!(packet_id, "ack for unknown packet id"),
        }
        Ok(())
    }

    fn handle_suback(&mut self, suback: crate::protocol::SubAck) {
        match self.waiters.remove(&suback.packet_id) {
            Some(AckWaiter::Subscribe { subscriptions, done }) => {
                self.id_provider.deallocate(suback.packet_id);
                // Remember only the granted filters
                let granted: Vec<Subscription> = subscriptions
                    .into_iter()
                    .zip(suback.reason_codes.iter())
                    .filter(|(_, code)| code.is_success())
                    .map(|(sub, _)| sub)
                    .collect();
                self.session.record_subscriptions(&granted);
                let _ = done.send(Ok(suback.reason_codes));
            }
            Some(AckWaiter::Resubscribe) => {
                self.id_provider.deallocate(suback.packet_id);
                if suback.reason_codes.iter().any(|c| c.is_error()) {
                    warn!(codes = ?suback.reason_codes, "resubscribe partially refused");
                }
            }
            Some(other) => {
                self.waiters.insert(suback.packet_id, other);
                warn!(packet_id = suback.packet_id, "SUBACK for non-subscribe operation");
            }
            None => debug!(packet_id = suback.packet_id, "SUBACK for unknown packet id"),
        }
    }

    fn handle_unsuback(&mut self, unsuback: UnsubAck) {
        match self.waiters.remove(&unsuback.packet_id) {
            Some(AckWaiter::Unsubscribe { filters, done }) => {
                self.id_provider.deallocate(unsuback.packet_id);
                self.session.remove_subscriptions(&filters);
                let _ = done.send(Ok(unsuback.reason_codes));
            }
            Some(other) => {
                self.waiters.insert(unsuback.packet_id, other);
                warn!(
                    packet_id = unsuback.packet_id,
                    "UNSUBACK for non-unsubscribe operation"
                );
            }
            None => debug!(
                packet_id = unsuback.packet_id,
                "UNSUBACK for unknown packet id"
            ),
        }
    }

    /// Command dispatch while connected. `Ok(false)` requests shutdown.
    async fn handle_command<W>(
        &mut self,
        cmd: Command,
        write_half: &mut W,
    ) -> Result<bool, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        match cmd {
            Command::Publish { publish, done } => {
                self.send_publish(publish, done, write_half).await?;
            }
            Command::Subscribe {
                subscriptions,
                properties,
                done,
            } => {
                let Some(id) = self.id_provider.allocate() else {
                    let _ = done.send(Err(ClientError::PacketIdExhausted));
                    return Ok(true);
                };
                let packet = Packet::Subscribe(Subscribe {
                    packet_id: id,
                    subscriptions: subscriptions.clone(),
                    properties,
                });
                match self.write_packet(write_half, &packet).await {
                    Ok(()) => {
                        self.waiters
                            .insert(id, AckWaiter::Subscribe { subscriptions, done });
                    }
                    Err(ClientError::Encode(e)) => {
                        self.id_provider.deallocate(id);
                        let _ = done.send(Err(ClientError::Encode(e)));
                    }
                    Err(e) => {
                        self.id_provider.deallocate(id);
                        let _ = done.send(Err(ClientError::Disconnected));
                        return Err(e);
                    }
                }
            }
            Command::Unsubscribe {
                filters,
                properties,
                done,
            } => {
                let Some(id) = self.id_provider.allocate() else {
                    let _ = done.send(Err(ClientError::PacketIdExhausted));
                    return Ok(true);
                };
                let packet = Packet::Unsubscribe(Unsubscribe {
                    packet_id: id,
                    filters: filters.clone(),
                    properties,
                });
                match self.write_packet(write_half, &packet).await {
                    Ok(()) => {
                        self.waiters
                            .insert(id, AckWaiter::Unsubscribe { filters, done });
                    }
                    Err(ClientError::Encode(e)) => {
                        self.id_provider.deallocate(id);
                        let _ = done.send(Err(ClientError::Encode(e)));
                    }
                    Err(e) => {
                        self.id_provider.deallocate(id);
                        let _ = done.send(Err(ClientError::Disconnected));
                        return Err(e);
                    }
                }
            }
            Command::Disconnect { reason_code, done } => {
                let disconnect = Packet::Disconnect(Disconnect::with_reason(reason_code));
                let result = self.write_packet(write_half, &disconnect).await;
                let _ = write_half.shutdown().await;
                let _ = done.send(result);
                return Ok(false);
            }
            Command::DisconnectForce => {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// QoS-aware outbound publish.
    async fn send_publish<W>(
        &mut self,
        mut publish: Publish,
        done: oneshot::Sender<Result<(), ClientError>>,
        write_half: &mut W,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        if publish.qos == QoS::AtMostOnce {
            self.apply_send_alias(&mut publish);
            match self.write_packet(write_half, &Packet::Publish(publish)).await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                    Ok(())
                }
                Err(ClientError::Encode(e)) => {
                    let _ = done.send(Err(ClientError::Encode(e)));
                    Ok(())
                }
                Err(e) => {
                    let _ = done.send(Err(ClientError::Disconnected));
                    Err(e)
                }
            }
        } else {
            let Some(id) = self.id_provider.allocate() else {
                let _ = done.send(Err(ClientError::PacketIdExhausted));
                return Ok(());
            };
            publish.packet_id = Some(id);

            // The stored copy keeps the full topic; alias tables do not
            // survive a reconnect
            if let Err(e) = self.outgoing.put(Packet::Publish(publish.clone())).await {
                self.id_provider.deallocate(id);
                let _ = done.send(Err(e.into()));
                return Ok(());
            }

            self.apply_send_alias(&mut publish);
            match self.write_packet(write_half, &Packet::Publish(publish)).await {
                Ok(()) => {
                    self.sent_ids.insert(id);
                    self.waiters.insert(id, AckWaiter::Publish(done));
                    Ok(())
                }
                Err(ClientError::Encode(e)) => {
                    self.outgoing.del(id).await?;
                    self.id_provider.deallocate(id);
                    let _ = done.send(Err(ClientError::Encode(e)));
                    Ok(())
                }
                Err(e) => {
                    // Transport failure: the stored publish replays after
                    // reconnect, so the waiter stays registered. Bytes may
                    // have reached the broker, so the replay is a DUP.
                    self.sent_ids.insert(id);
                    self.waiters.insert(id, AckWaiter::Publish(done));
                    Err(e)
                }
            }
        }
    }

    /// Substitute an outbound topic alias when enabled.
    fn apply_send_alias(&mut self, publish: &mut Publish) {
        let Some(table) = self.alias_send.as_mut() else {
            return;
        };
        if publish.topic.is_empty() {
            return;
        }
        match table.alias_for(&publish.topic) {
            AliasAssignment::Existing(alias) => {
                publish.properties.topic_alias = Some(alias);
                publish.topic = Arc::from("");
            }
            AliasAssignment::New(alias) => {
                publish.properties.topic_alias = Some(alias);
            }
        }
    }

    async fn deliver(&mut self, publish: Publish) {
        self.emit(Event::Message(Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            properties: publish.properties,
        }))
        .await;
    }

    async fn write_packet<W>(&mut self, write_half: &mut W, packet: &Packet) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;
        write_half.write_all(&buf).await?;
        write_half.flush().await?;
        self.last_write = Instant::now();
        Ok(())
    }

    async fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event).await;
    }

    /// Fail subscribe/unsubscribe waiters after transport loss. Publish
    /// waiters survive: their packets replay from the store.
    fn fail_request_waiters(&mut self) {
        let ids: Vec<u16> = self
            .waiters
            .iter()
            .filter(|(_, w)| !matches!(w, AckWaiter::Publish(_)))
            .map(|(&id, _)| id)
            .collect();
        for &id in &ids {
            if let Some(waiter) = self.waiters.remove(&id) {
                self.id_provider.deallocate(id);
                match waiter {
                    AckWaiter::Subscribe { done, .. } => {
                        let _ = done.send(Err(ClientError::Disconnected));
                    }
                    AckWaiter::Unsubscribe { done, .. } => {
                        let _ = done.send(Err(ClientError::Disconnected));
                    }
                    AckWaiter::Publish(_) | AckWaiter::Resubscribe => {}
                }
            }
        }

        // Queued requests whose waiters just failed must not replay
        self.session.retain_offline(|packet| match packet {
            Packet::Subscribe(s) => !ids.contains(&s.packet_id),
            Packet::Unsubscribe(u) => !ids.contains(&u.packet_id),
            _ => true,
        });
    }

    /// Final teardown: flush every waiter, close stores, emit `Closed`.
    async fn shutdown(mut self) {
        for (_, waiter) in self.waiters.drain() {
            match waiter {
                AckWaiter::Publish(done) => {
                    let _ = done.send(Err(ClientError::Disconnected));
                }
                AckWaiter::Subscribe { done, .. } => {
                    let _ = done.send(Err(ClientError::Disconnected));
                }
                AckWaiter::Unsubscribe { done, .. } => {
                    let _ = done.send(Err(ClientError::Disconnected));
                }
                AckWaiter::Resubscribe => {}
            }
        }

        if let Err(e) = self.outgoing.close().await {
            warn!(error = %e, "outgoing store close failed");
        }
        if let Err(e) = self.incoming.close().await {
            warn!(error = %e, "incoming store close failed");
        }

        *self.status.write() = ConnectionStatus::Disconnected;
        self.emit(Event::Closed).await;
        info!(client_id = %self.client_id, "client stopped");
    }
}
