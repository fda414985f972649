use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use driftmq::codec::{Decoder, Encoder};
use driftmq::protocol::{Packet, Properties, ProtocolVersion, PubAck, Publish, QoS};

fn publish_packet(payload_len: usize) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: Arc::from("bench/sensors/device-42/temperature"),
        packet_id: Some(1234),
        payload: Bytes::from(vec![0x42u8; payload_len]),
        properties: Properties::default(),
    })
}

fn bench_encode(c: &mut Criterion) {
    let encoder = Encoder::new(ProtocolVersion::V311);
    let mut group = c.benchmark_group("encode");

    for payload_len in [16usize, 256, 4096] {
        let packet = publish_packet(payload_len);
        group.throughput(Throughput::Bytes(payload_len as u64));
        group.bench_with_input(
            BenchmarkId::new("publish", payload_len),
            &packet,
            |b, packet| {
                let mut buf = BytesMut::with_capacity(8192);
                b.iter(|| {
                    buf.clear();
                    encoder.encode(packet, &mut buf).unwrap();
                });
            },
        );
    }

    let puback = Packet::PubAck(PubAck::new(1234));
    group.bench_function("puback", |b| {
        let mut buf = BytesMut::with_capacity(16);
        b.iter(|| {
            buf.clear();
            encoder.encode(&puback, &mut buf).unwrap();
        });
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let encoder = Encoder::new(ProtocolVersion::V311);
    let mut group = c.benchmark_group("decode");

    for payload_len in [16usize, 256, 4096] {
        let wire = encoder.encode_to_bytes(&publish_packet(payload_len)).unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("publish", payload_len),
            &wire,
            |b, wire| {
                let mut decoder = Decoder::new(ProtocolVersion::V311);
                b.iter(|| {
                    decoder.feed(wire);
                    decoder.next().unwrap().unwrap()
                });
            },
        );
    }

    // v5 publish with a property block on the hot path
    let v5_encoder = Encoder::new(ProtocolVersion::V5);
    let mut properties = Properties::default();
    properties.message_expiry_interval = Some(300);
    properties.content_type = Some("application/json".to_string());
    properties.user_properties.push(("origin".to_string(), "bench".to_string()));
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: Arc::from("bench/v5"),
        packet_id: Some(99),
        payload: Bytes::from_static(b"{\"t\":21.5}"),
        properties,
    });
    let wire = v5_encoder.encode_to_bytes(&packet).unwrap();
    group.bench_function("publish_v5_properties", |b| {
        let mut decoder = Decoder::new(ProtocolVersion::V5);
        b.iter(|| {
            decoder.feed(&wire);
            decoder.next().unwrap().unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
