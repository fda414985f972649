//! Client Integration Tests
//!
//! These tests run the client against a scripted broker on a loopback
//! socket and validate the protocol flows the client is responsible for:
//! the CONNECT handshake, QoS 1/2 acknowledgement state, reconnect
//! replay, topic aliasing and keep alive.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use driftmq::client::{Client, ClientOptions, Event};
use driftmq::codec::{Decoder, Encoder};
use driftmq::protocol::{
    ClientError, ConnAck, Packet, Properties, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, ReasonCode, SubAck,
};

/// Broker side of one accepted connection.
struct ScriptedBroker {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
}

impl ScriptedBroker {
    async fn accept(listener: &TcpListener, version: ProtocolVersion) -> Self {
        let (stream, _) = listener.accept().await.expect("accept failed");
        Self {
            stream,
            encoder: Encoder::new(version),
            decoder: Decoder::new(version),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("broker encode failed");
        self.stream
            .write_all(&buf)
            .await
            .expect("broker write failed");
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if let Some(packet) = self.decoder.next().expect("broker decode failed") {
                return packet;
            }
            let mut buf = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("broker read timed out")
                .expect("broker read failed");
            assert!(n > 0, "client closed the connection unexpectedly");
            self.decoder.feed(&buf[..n]);
        }
    }

    /// Expect CONNECT and answer with a plain successful CONNACK.
    async fn handshake(&mut self, session_present: bool) -> String {
        self.handshake_with(session_present, Properties::default())
            .await
    }

    async fn handshake_with(&mut self, session_present: bool, properties: Properties) -> String {
        let connect = match self.recv().await {
            Packet::Connect(c) => c,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(&Packet::ConnAck(ConnAck {
            session_present,
            reason_code: ReasonCode::Success,
            properties,
        }))
        .await;
        connect.client_id
    }
}

fn test_options(port: u16) -> ClientOptions {
    ClientOptions {
        address: format!("127.0.0.1:{}", port),
        client_id: "test-client".to_string(),
        reconnect_period: Duration::ZERO,
        connect_timeout: Duration::from_secs(5),
        ..ClientOptions::default()
    }
}

async fn expect_connected(events: &mut driftmq::client::EventStream) -> bool {
    loop {
        match timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event before timeout")
        {
            Some(Event::Connected {
                session_present, ..
            }) => return session_present,
            Some(Event::Reconnecting { .. }) | Some(Event::Offline) | Some(Event::Error(_)) => {}
            other => panic!("expected Connected, got {:?}", other.map(describe)),
        }
    }
}

fn describe(event: Event) -> &'static str {
    match event {
        Event::Connected { .. } => "Connected",
        Event::Message(_) => "Message",
        Event::Offline => "Offline",
        Event::Reconnecting { .. } => "Reconnecting",
        Event::Auth(_) => "Auth",
        Event::Error(_) => "Error",
        Event::Closed => "Closed",
    }
}

// ============================================================================
// CONNECT handshake
// ============================================================================

#[tokio::test]
async fn connect_sends_client_id_and_waits_for_connack() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await
    });

    let (client, mut events) = Client::connect(test_options(port)).await.unwrap();
    assert!(!expect_connected(&mut events).await);
    let client_id = broker.await.unwrap();
    assert_eq!(client_id, "test-client");

    let _ = client.disconnect_force().await;
}

#[tokio::test]
async fn connect_timeout_without_connack() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Accept and then stay silent
    let broker = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let mut options = test_options(port);
    options.connect_timeout = Duration::from_millis(200);

    let (_client, mut events) = Client::connect(options).await.unwrap();
    match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
        Some(Event::Error(ClientError::ConnectTimeout)) => {}
        other => panic!("expected ConnectTimeout, got {:?}", other.map(describe)),
    }

    broker.abort();
}

#[tokio::test]
async fn connection_refused_surfaces_reason_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        let _ = broker.recv().await;
        broker
            .send(&Packet::ConnAck(ConnAck {
                session_present: false,
                reason_code: ReasonCode::NotAuthorized,
                properties: Properties::default(),
            }))
            .await;
    });

    let (_client, mut events) = Client::connect(test_options(port)).await.unwrap();
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(Event::Error(ClientError::ConnectionRefused(code))) => {
                assert_eq!(code, ReasonCode::NotAuthorized);
                break;
            }
            Some(_) => {}
            None => panic!("event stream ended without a refusal"),
        }
    }

    broker.await.unwrap();
}

// ============================================================================
// QoS 1 / QoS 2 outbound flows
// ============================================================================

#[tokio::test]
async fn qos1_publish_completes_on_puback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;

        let publish = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        };
        assert_eq!(&*publish.topic, "sensors/temp");
        assert_eq!(publish.payload, Bytes::from_static(b"21.5"));
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        let id = publish.packet_id.expect("QoS 1 publish without packet id");
        broker.send(&Packet::PubAck(PubAck::new(id))).await;
    });

    let (client, mut events) = Client::connect(test_options(port)).await.unwrap();
    expect_connected(&mut events).await;

    client
        .publish("sensors/temp", &b"21.5"[..], QoS::AtLeastOnce, false)
        .await
        .unwrap();

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

#[tokio::test]
async fn qos2_publish_runs_pubrec_pubrel_pubcomp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;

        let publish = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        };
        let id = publish.packet_id.unwrap();
        broker.send(&Packet::PubRec(PubRec::new(id))).await;

        match broker.recv().await {
            Packet::PubRel(rel) => assert_eq!(rel.packet_id, id),
            other => panic!("expected PUBREL, got {:?}", other),
        }
        broker.send(&Packet::PubComp(PubComp::new(id))).await;
    });

    let (client, mut events) = Client::connect(test_options(port)).await.unwrap();
    expect_connected(&mut events).await;

    client
        .publish("exact/once", &b"x"[..], QoS::ExactlyOnce, false)
        .await
        .unwrap();

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

#[tokio::test]
async fn qos1_publish_survives_reconnect_and_replays_with_dup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        // First connection: take the PUBLISH and drop without acking
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;
        let first = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        };
        assert!(!first.dup);
        let id = first.packet_id.unwrap();
        drop(broker);

        // Second connection: the unacked publish replays as a duplicate
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(true).await;
        let replayed = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected replayed PUBLISH, got {:?}", other),
        };
        assert!(replayed.dup);
        assert_eq!(replayed.packet_id, Some(id));
        assert_eq!(&*replayed.topic, "durable/data");
        broker.send(&Packet::PubAck(PubAck::new(id))).await;
    });

    let mut options = test_options(port);
    options.reconnect_period = Duration::from_millis(50);

    let (client, mut events) = Client::connect(options).await.unwrap();
    expect_connected(&mut events).await;

    // Resolves only after the second connection acknowledges
    client
        .publish("durable/data", &b"payload"[..], QoS::AtLeastOnce, false)
        .await
        .unwrap();

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

#[tokio::test]
async fn restored_store_keeps_replay_ids_reserved() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(true).await;

        // The publish carried over from the previous process replays first
        let replayed = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected replayed PUBLISH, got {:?}", other),
        };
        assert_eq!(replayed.packet_id, Some(1));
        assert!(replayed.dup);
        assert_eq!(&*replayed.topic, "carried/over");

        // A fresh publish must not collide with the restored id
        let fresh = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected fresh PUBLISH, got {:?}", other),
        };
        assert_eq!(&*fresh.topic, "brand/new");
        assert_eq!(fresh.packet_id, Some(2));

        broker.send(&Packet::PubAck(PubAck::new(2))).await;
        broker.send(&Packet::PubAck(PubAck::new(1))).await;
    });

    use driftmq::client::SessionPlugins;
    use driftmq::session::{FreeListIdProvider, MemoryStore, PacketStore};

    let outgoing: Arc<dyn PacketStore> = Arc::new(MemoryStore::new());
    outgoing
        .put(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Arc::from("carried/over"),
            packet_id: Some(1),
            payload: Bytes::from_static(b"old"),
            properties: Properties::default(),
        }))
        .await
        .unwrap();

    let plugins = SessionPlugins {
        outgoing: Some(outgoing),
        incoming: None,
        id_provider: Some(Box::new(FreeListIdProvider::new())),
    };

    let (client, mut events) = Client::connect_with(test_options(port), plugins)
        .await
        .unwrap();
    expect_connected(&mut events).await;

    client
        .publish("brand/new", &b"fresh"[..], QoS::AtLeastOnce, false)
        .await
        .unwrap();

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

#[tokio::test]
async fn queued_publish_first_transmission_has_dup_clear() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let broker = tokio::spawn(async move {
        // First connection: handshake and drop so the client goes offline
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;
        drop(broker);

        // Hold the CONNACK back until the publish has been queued
        release_rx.await.unwrap();

        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(true).await;

        // A publish that never reached the wire goes out without DUP
        let publish = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        };
        assert_eq!(&*publish.topic, "queued/offline");
        assert!(!publish.dup);
        broker
            .send(&Packet::PubAck(PubAck::new(publish.packet_id.unwrap())))
            .await;
    });

    let mut options = test_options(port);
    options.reconnect_period = Duration::from_millis(50);

    let (client, mut events) = Client::connect(options).await.unwrap();
    expect_connected(&mut events).await;

    loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(Event::Offline) => break,
            Some(_) => {}
            None => panic!("event stream ended before Offline"),
        }
    }

    let publisher = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .publish("queued/offline", &b"held"[..], QoS::AtLeastOnce, false)
                .await
        })
    };

    // Let the command reach the connection task before the broker answers
    tokio::time::sleep(Duration::from_millis(100)).await;
    release_tx.send(()).unwrap();

    publisher.await.unwrap().unwrap();
    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

// ============================================================================
// Inbound delivery
// ============================================================================

#[tokio::test]
async fn inbound_qos2_duplicate_delivers_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;

        let publish = Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: Arc::from("inbound/exact"),
            packet_id: Some(7),
            payload: Bytes::from_static(b"once"),
            properties: Properties::default(),
        };
        broker.send(&Packet::Publish(publish.clone())).await;
        match broker.recv().await {
            Packet::PubRec(rec) => assert_eq!(rec.packet_id, 7),
            other => panic!("expected PUBREC, got {:?}", other),
        }

        // Retransmission before PUBREL must not double-deliver
        let mut dup = publish;
        dup.dup = true;
        broker.send(&Packet::Publish(dup)).await;
        match broker.recv().await {
            Packet::PubRec(rec) => assert_eq!(rec.packet_id, 7),
            other => panic!("expected second PUBREC, got {:?}", other),
        }

        broker.send(&Packet::PubRel(PubRel::new(7))).await;
        match broker.recv().await {
            Packet::PubComp(comp) => assert_eq!(comp.packet_id, 7),
            other => panic!("expected PUBCOMP, got {:?}", other),
        }
    });

    let (client, mut events) = Client::connect(test_options(port)).await.unwrap();
    expect_connected(&mut events).await;

    let message = loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(Event::Message(msg)) => break msg,
            Some(_) => {}
            None => panic!("event stream ended before delivery"),
        }
    };
    assert_eq!(&*message.topic, "inbound/exact");
    assert_eq!(message.payload, Bytes::from_static(b"once"));

    broker.await.unwrap();

    // No second delivery
    match timeout(Duration::from_millis(200), events.recv()).await {
        Err(_) => {}
        Ok(Some(Event::Message(_))) => panic!("duplicate delivered twice"),
        Ok(_) => {}
    }

    let _ = client.disconnect_force().await;
}

// ============================================================================
// Subscribe / Unsubscribe
// ============================================================================

#[tokio::test]
async fn subscribe_two_filters_in_one_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;

        let subscribe = match broker.recv().await {
            Packet::Subscribe(s) => s,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        assert_eq!(subscribe.subscriptions.len(), 2);
        assert_eq!(subscribe.subscriptions[0].filter, "a/+");
        assert_eq!(subscribe.subscriptions[1].filter, "b/#");
        broker
            .send(&Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                reason_codes: vec![ReasonCode::Success, ReasonCode::GrantedQoS1],
                properties: Properties::default(),
            }))
            .await;
    });

    let (client, mut events) = Client::connect(test_options(port)).await.unwrap();
    expect_connected(&mut events).await;

    use driftmq::protocol::{Subscription, SubscriptionOptions};
    let codes = client
        .subscribe_many(vec![
            Subscription {
                filter: "a/+".to_string(),
                options: SubscriptionOptions::at_qos(QoS::AtMostOnce),
            },
            Subscription {
                filter: "b/#".to_string(),
                options: SubscriptionOptions::at_qos(QoS::AtLeastOnce),
            },
        ])
        .await
        .unwrap();
    assert_eq!(codes, vec![ReasonCode::Success, ReasonCode::GrantedQoS1]);

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

#[tokio::test]
async fn resubscribes_when_session_not_present() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;

        let subscribe = match broker.recv().await {
            Packet::Subscribe(s) => s,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        broker
            .send(&Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                reason_codes: vec![ReasonCode::Success],
                properties: Properties::default(),
            }))
            .await;
        drop(broker);

        // Clean session on reconnect: the client restores the filter
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;
        let resubscribe = match broker.recv().await {
            Packet::Subscribe(s) => s,
            other => panic!("expected resubscribe, got {:?}", other),
        };
        assert_eq!(resubscribe.subscriptions.len(), 1);
        assert_eq!(resubscribe.subscriptions[0].filter, "restore/me");
        broker
            .send(&Packet::SubAck(SubAck {
                packet_id: resubscribe.packet_id,
                reason_codes: vec![ReasonCode::Success],
                properties: Properties::default(),
            }))
            .await;
    });

    let mut options = test_options(port);
    options.reconnect_period = Duration::from_millis(50);

    let (client, mut events) = Client::connect(options).await.unwrap();
    expect_connected(&mut events).await;
    client
        .subscribe("restore/me", QoS::AtMostOnce)
        .await
        .unwrap();

    // The broker task drives the drop and reconnect; it panics on mismatch
    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

// ============================================================================
// v5 topic aliasing
// ============================================================================

#[tokio::test]
async fn v5_auto_alias_elides_repeated_topic() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V5).await;
        let mut connack_props = Properties::default();
        connack_props.topic_alias_maximum = Some(5);
        broker.handshake_with(false, connack_props).await;

        let first = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        };
        assert_eq!(&*first.topic, "alias/me");
        assert_eq!(first.properties.topic_alias, Some(1));

        let second = match broker.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected second PUBLISH, got {:?}", other),
        };
        assert_eq!(&*second.topic, "");
        assert_eq!(second.properties.topic_alias, Some(1));
    });

    let mut options = test_options(port);
    options.protocol_version = 5;
    options.auto_topic_alias = true;

    let (client, mut events) = Client::connect(options).await.unwrap();
    expect_connected(&mut events).await;

    client
        .publish("alias/me", &b"1"[..], QoS::AtMostOnce, false)
        .await
        .unwrap();
    client
        .publish("alias/me", &b"2"[..], QoS::AtMostOnce, false)
        .await
        .unwrap();

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

#[tokio::test]
async fn v5_resolves_broker_topic_alias() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V5).await;
        broker.handshake(false).await;

        // Establish alias 3, then publish through it with an empty topic
        let mut props = Properties::default();
        props.topic_alias = Some(3);
        broker
            .send(&Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: Arc::from("aliased/topic"),
                packet_id: None,
                payload: Bytes::from_static(b"first"),
                properties: props.clone(),
            }))
            .await;
        broker
            .send(&Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: Arc::from(""),
                packet_id: None,
                payload: Bytes::from_static(b"second"),
                properties: props,
            }))
            .await;
    });

    let mut options = test_options(port);
    options.protocol_version = 5;
    options.topic_alias_maximum = 8;

    let (client, mut events) = Client::connect(options).await.unwrap();
    expect_connected(&mut events).await;

    for expected in [&b"first"[..], &b"second"[..]] {
        let message = loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(Event::Message(msg)) => break msg,
                Some(_) => {}
                None => panic!("event stream ended before delivery"),
            }
        };
        assert_eq!(&*message.topic, "aliased/topic");
        assert_eq!(message.payload, Bytes::copy_from_slice(expected));
    }

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

// ============================================================================
// Keep alive
// ============================================================================

#[tokio::test]
async fn pings_on_idle_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;

        match broker.recv().await {
            Packet::PingReq => {}
            other => panic!("expected PINGREQ, got {:?}", other),
        }
        broker.send(&Packet::PingResp).await;

        // A second round proves PINGRESP cleared the pending state
        match broker.recv().await {
            Packet::PingReq => {}
            other => panic!("expected second PINGREQ, got {:?}", other),
        }
        broker.send(&Packet::PingResp).await;
    });

    let mut options = test_options(port);
    options.keepalive = 1;

    let (client, mut events) = Client::connect(options).await.unwrap();
    expect_connected(&mut events).await;

    broker.await.unwrap();
    let _ = client.disconnect_force().await;
}

// ============================================================================
// Graceful disconnect
// ============================================================================

#[tokio::test]
async fn disconnect_sends_packet_and_emits_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener, ProtocolVersion::V311).await;
        broker.handshake(false).await;
        match broker.recv().await {
            Packet::Disconnect(_) => {}
            other => panic!("expected DISCONNECT, got {:?}", other),
        }
    });

    let (client, mut events) = Client::connect(test_options(port)).await.unwrap();
    expect_connected(&mut events).await;
    client.disconnect().await.unwrap();

    loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(Event::Closed) | None => break,
            Some(_) => {}
        }
    }

    broker.await.unwrap();
}
