//! Streaming MQTT packet decoder
//!
//! Input bytes arrive in arbitrary fragments; the decoder accumulates them
//! in an internal buffer and yields complete packets as they become
//! available. A decode error poisons the decoder until `reset` is called,
//! since a malformed stream has no recoverable framing.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::{read_binary, read_string, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, PacketType, Properties,
    ProtocolVersion, PubAck, PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe,
    Subscription, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

/// Incremental MQTT packet decoder.
pub struct Decoder {
    /// Accumulated, not-yet-decoded input
    buf: BytesMut,
    /// Packets larger than this are rejected
    max_packet_size: usize,
    /// Version negotiated for this stream; picks v3/v5 payload shapes
    protocol_version: ProtocolVersion,
    /// First fatal error; sticky until `reset`
    poisoned: Option<DecodeError>,
}

impl Decoder {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            protocol_version,
            poisoned: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.set_max_packet_size(size);
        self
    }

    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Discard buffered input and clear any sticky error.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.poisoned = None;
    }

    /// Try to decode the next complete packet from the buffer.
    ///
    /// `Ok(None)` means more bytes are needed; call `feed` and retry. After
    /// one `feed` several packets may be drained by repeated `next` calls.
    pub fn next(&mut self) -> Result<Option<Packet>, DecodeError> {
        if let Some(ref e) = self.poisoned {
            return Err(e.clone());
        }
        match self.try_next() {
            Ok(packet) => Ok(packet),
            Err(e) => {
                self.poisoned = Some(e.clone());
                Err(e)
            }
        }
    }

    fn try_next(&mut self) -> Result<Option<Packet>, DecodeError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = self.buf[0];
        let flags = first_byte & 0x0F;
        let packet_type = PacketType::from_u8(first_byte >> 4)
            .ok_or(DecodeError::InvalidPacketType(first_byte >> 4))?;

        let (remaining_length, len_bytes) = match read_variable_int(&self.buf[1..]) {
            Ok(r) => r,
            // Mid-varint; wait for the next fragment
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if self.buf.len() < total_len {
            self.buf.reserve(total_len - self.buf.len());
            return Ok(None);
        }

        // Detach the complete packet so payload parsing cannot alias `buf`.
        let mut frame = self.buf.split_to(total_len);
        frame.advance(1 + len_bytes);
        let payload = frame.freeze();

        // Everything but PUBLISH has a fixed required flag nibble.
        if packet_type != PacketType::Publish && flags != packet_type.required_flags() {
            return Err(DecodeError::InvalidFlags);
        }

        let packet = match packet_type {
            PacketType::Connect => self.decode_connect(&payload)?,
            PacketType::ConnAck => self.decode_connack(&payload)?,
            PacketType::Publish => self.decode_publish(flags, &payload)?,
            PacketType::PubAck => {
                let (id, code, props) = self.decode_ack_body(&payload)?;
                Packet::PubAck(PubAck {
                    packet_id: id,
                    reason_code: code,
                    properties: props,
                })
            }
            PacketType::PubRec => {
                let (id, code, props) = self.decode_ack_body(&payload)?;
                Packet::PubRec(PubRec {
                    packet_id: id,
                    reason_code: code,
                    properties: props,
                })
            }
            PacketType::PubRel => {
                let (id, code, props) = self.decode_ack_body(&payload)?;
                Packet::PubRel(PubRel {
                    packet_id: id,
                    reason_code: code,
                    properties: props,
                })
            }
            PacketType::PubComp => {
                let (id, code, props) = self.decode_ack_body(&payload)?;
                Packet::PubComp(PubComp {
                    packet_id: id,
                    reason_code: code,
                    properties: props,
                })
            }
            PacketType::Subscribe => self.decode_subscribe(&payload)?,
            PacketType::SubAck => self.decode_suback(&payload)?,
            PacketType::Unsubscribe => self.decode_unsubscribe(&payload)?,
            PacketType::UnsubAck => self.decode_unsuback(&payload)?,
            PacketType::PingReq => {
                if !payload.is_empty() {
                    return Err(DecodeError::MalformedPacket("PINGREQ has no payload"));
                }
                Packet::PingReq
            }
            PacketType::PingResp => {
                if !payload.is_empty() {
                    return Err(DecodeError::MalformedPacket("PINGRESP has no payload"));
                }
                Packet::PingResp
            }
            PacketType::Disconnect => self.decode_disconnect(&payload)?,
            PacketType::Auth => self.decode_auth(&payload)?,
        };

        Ok(Some(packet))
    }

    fn is_v5(&self) -> bool {
        self.protocol_version.is_v5()
    }

    fn decode_connect(&mut self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (protocol_name, len) = read_string(&payload[pos..])?;
        pos += len;

        if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
            return Err(DecodeError::InvalidProtocolName);
        }

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let version_byte = payload[pos];
        pos += 1;

        let protocol_version = ProtocolVersion::from_u8(version_byte)
            .ok_or(DecodeError::InvalidProtocolVersion(version_byte))?;
        // "MQIsdp" is v3.1 only, "MQTT" is level 4/5 only
        let name_matches = matches!(
            (protocol_name, protocol_version),
            ("MQIsdp", ProtocolVersion::V31)
                | ("MQTT", ProtocolVersion::V311)
                | ("MQTT", ProtocolVersion::V5)
        );
        if !name_matches {
            return Err(DecodeError::InvalidProtocolName);
        }

        // The rest of this stream speaks whatever the CONNECT declared.
        self.protocol_version = protocol_version;

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let connect_flags = payload[pos];
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_start = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // [MQTT-3.1.2-22] password requires username
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        if pos + 2 > payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;

        let properties = if protocol_version.is_v5() {
            let (props, len) = Properties::decode(&payload[pos..])?;
            pos += len;
            props
        } else {
            Properties::default()
        };

        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;
        let client_id = client_id.to_string();

        let will = if will_flag {
            let will_properties = if protocol_version.is_v5() {
                let (props, len) = Properties::decode(&payload[pos..])?;
                pos += len;
                props
            } else {
                Properties::default()
            };

            let (will_topic, len) = read_string(&payload[pos..])?;
            pos += len;
            if will_topic.is_empty() {
                return Err(DecodeError::MalformedPacket("will topic cannot be empty"));
            }
            let will_topic = will_topic.to_string();

            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            Some(Will {
                topic: will_topic,
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, _len) = read_binary(&payload[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let acknowledge_flags = payload[0];
        // Only bit 0 (session present) may be set
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let session_present = (acknowledge_flags & 0x01) != 0;
        let reason_byte = payload[1];

        let (reason_code, properties) = if self.is_v5() {
            let reason_code = ReasonCode::from_u8(reason_byte)
                .ok_or(DecodeError::InvalidReasonCode(reason_byte))?;
            let properties = if payload.len() > 2 {
                let (props, _) = Properties::decode(&payload[2..])?;
                props
            } else {
                Properties::default()
            };
            (reason_code, properties)
        } else {
            (
                ReasonCode::from_v3_connack_code(reason_byte),
                Properties::default(),
            )
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        // [MQTT-3.3.1-2] DUP must be 0 for QoS 0
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;

        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }
        // An empty topic is only legal on v5 where a topic alias substitutes
        // for it; the alias itself is validated by the session layer.
        if topic.is_empty() && !self.is_v5() {
            return Err(DecodeError::MalformedPacket("topic cannot be empty"));
        }
        let topic: Arc<str> = Arc::from(topic);

        let packet_id = if qos != QoS::AtMostOnce {
            if pos + 2 > payload.len() {
                return Err(DecodeError::InsufficientData);
            }
            let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let properties = if self.is_v5() {
            let (props, len) = Properties::decode(&payload[pos..])?;
            pos += len;
            props
        } else {
            Properties::default()
        };

        if topic.is_empty() && properties.topic_alias.is_none() {
            return Err(DecodeError::MalformedPacket(
                "empty topic without topic alias",
            ));
        }

        let message_payload = Bytes::copy_from_slice(&payload[pos..]);

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload: message_payload,
            properties,
        }))
    }

    /// Shared body of PUBACK/PUBREC/PUBREL/PUBCOMP: packet id, then for v5
    /// an optional reason code and optional properties.
    fn decode_ack_body(
        &self,
        payload: &[u8],
    ) -> Result<(u16, ReasonCode, Properties), DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        if !self.is_v5() || payload.len() == 2 {
            return Ok((packet_id, ReasonCode::Success, Properties::default()));
        }

        let reason_code =
            ReasonCode::from_u8(payload[2]).ok_or(DecodeError::InvalidReasonCode(payload[2]))?;
        let properties = if payload.len() > 3 {
            let (props, _) = Properties::decode(&payload[3..])?;
            props
        } else {
            Properties::default()
        };

        Ok((packet_id, reason_code, properties))
    }

    fn decode_subscribe(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        let mut pos = 2;

        let properties = if self.is_v5() {
            let (props, len) = Properties::decode(&payload[pos..])?;
            pos += len;
            props
        } else {
            Properties::default()
        };

        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            // [MQTT-4.7.0-1]
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            if pos >= payload.len() {
                return Err(DecodeError::InsufficientData);
            }

            let options_byte = payload[pos];
            pos += 1;

            let options = if self.is_v5() {
                SubscriptionOptions::from_byte(options_byte)
                    .ok_or(DecodeError::InvalidSubscriptionOptions)?
            } else {
                let qos = QoS::from_u8(options_byte & 0x03)
                    .ok_or(DecodeError::InvalidQoS(options_byte & 0x03))?;
                SubscriptionOptions::at_qos(qos)
            };

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                options,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
            properties,
        }))
    }

    fn decode_suback(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() < 3 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        let mut pos = 2;

        let properties = if self.is_v5() {
            let (props, len) = Properties::decode(&payload[pos..])?;
            pos += len;
            props
        } else {
            Properties::default()
        };

        let mut reason_codes = Vec::new();
        while pos < payload.len() {
            let code = payload[pos];
            pos += 1;

            let reason_code = if self.is_v5() {
                ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
            } else {
                ReasonCode::from_v3_suback_code(code).ok_or(DecodeError::InvalidReasonCode(code))?
            };
            reason_codes.push(reason_code);
        }

        if reason_codes.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBACK must carry at least one return code",
            ));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        let mut pos = 2;

        let properties = if self.is_v5() {
            let (props, len) = Properties::decode(&payload[pos..])?;
            pos += len;
            props
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);

        let (properties, reason_codes) = if self.is_v5() {
            let mut pos = 2;
            let (props, len) = Properties::decode(&payload[pos..])?;
            pos += len;

            let mut codes = Vec::new();
            while pos < payload.len() {
                let code = ReasonCode::from_u8(payload[pos])
                    .ok_or(DecodeError::InvalidReasonCode(payload[pos]))?;
                codes.push(code);
                pos += 1;
            }
            (props, codes)
        } else {
            if payload.len() != 2 {
                return Err(DecodeError::MalformedPacket("v3 UNSUBACK has no payload"));
            }
            (Properties::default(), Vec::new())
        };

        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if !self.is_v5() {
            if !payload.is_empty() {
                return Err(DecodeError::MalformedPacket("v3 DISCONNECT has no payload"));
            }
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        if payload.is_empty() {
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let reason_code =
            ReasonCode::from_u8(payload[0]).ok_or(DecodeError::InvalidReasonCode(payload[0]))?;

        let properties = if payload.len() > 1 {
            let (props, _) = Properties::decode(&payload[1..])?;
            props
        } else {
            Properties::default()
        };

        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }

    fn decode_auth(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if !self.is_v5() {
            return Err(DecodeError::InvalidPacketType(15));
        }

        if payload.is_empty() {
            return Ok(Packet::Auth(Auth::default()));
        }

        let reason_code =
            ReasonCode::from_u8(payload[0]).ok_or(DecodeError::InvalidReasonCode(payload[0]))?;

        let properties = if payload.len() > 1 {
            let (props, _) = Properties::decode(&payload[1..])?;
            props
        } else {
            Properties::default()
        };

        Ok(Packet::Auth(Auth {
            reason_code,
            properties,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V5)
    }
}
