//! MQTT packet encoder
//!
//! Each packet is encoded in two passes: a sizing pass computes the
//! remaining length so the fixed header can be written first, then the
//! body is appended. Validation happens before any byte is written, so a
//! failed encode never leaves a partial packet in the output buffer.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Auth, ConnAck, Connect, Disconnect, EncodeError, Packet, Properties, ProtocolVersion, Publish,
    QoS, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// MQTT packet encoder.
#[derive(Debug, Clone)]
pub struct Encoder {
    /// Version negotiated for this stream; picks v3/v5 payload shapes
    protocol_version: ProtocolVersion,
    /// Upper bound on the full encoded packet, including the fixed header.
    /// Lowered when the server advertises a Maximum Packet Size.
    max_packet_size: usize,
}

impl Encoder {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
    }

    fn is_v5(&self) -> bool {
        self.protocol_version.is_v5()
    }

    /// Encode `packet` and append it to `buf`.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => {
                self.encode_ack(0x40, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::PubRec(p) => {
                self.encode_ack(0x50, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::PubRel(p) => {
                self.encode_ack(0x62, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::PubComp(p) => {
                self.encode_ack(0x70, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_unsuback(p, buf),
            Packet::PingReq => self.encode_empty(0xC0, buf),
            Packet::PingResp => self.encode_empty(0xD0, buf),
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
            Packet::Auth(p) => self.encode_auth(p, buf),
        }
    }

    /// Encode into a fresh buffer. Used when a packet is persisted in its
    /// wire form.
    pub fn encode_to_bytes(&self, packet: &Packet) -> Result<bytes::Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    fn write_header(
        &self,
        first_byte: u8,
        remaining_length: usize,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if remaining_length > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }
        let total = 1 + variable_int_len(remaining_length as u32) + remaining_length;
        if total > self.max_packet_size {
            return Err(EncodeError::PacketTooLarge);
        }
        buf.reserve(total);
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;
        Ok(())
    }

    fn encode_empty(&self, first_byte: u8, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.write_header(first_byte, 0, buf)
    }

    fn encode_connect(&self, p: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let v5 = p.protocol_version.is_v5();

        if p.password.is_some() && p.username.is_none() && !v5 {
            return Err(EncodeError::PasswordWithoutUsername);
        }
        if p.will.as_ref().is_some_and(|w| w.topic.is_empty()) {
            return Err(EncodeError::InvalidTopicName);
        }

        let protocol_name = p.protocol_version.protocol_name();

        let mut len = 2 + protocol_name.len() + 1 + 1 + 2;
        if v5 {
            len += props_len(&p.properties);
        }
        len += 2 + p.client_id.len();
        if let Some(ref will) = p.will {
            if v5 {
                len += props_len(&will.properties);
            }
            len += 2 + will.topic.len() + 2 + will.payload.len();
        }
        if let Some(ref username) = p.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = p.password {
            len += 2 + password.len();
        }

        self.write_header(0x10, len, buf)?;

        write_string(buf, protocol_name)?;
        buf.put_u8(p.protocol_version as u8);

        let mut connect_flags = 0u8;
        if p.clean_start {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = p.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if p.password.is_some() {
            connect_flags |= 0x40;
        }
        if p.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);

        buf.put_u16(p.keep_alive);

        if v5 {
            p.properties.encode(buf)?;
        }

        write_string(buf, &p.client_id)?;

        if let Some(ref will) = p.will {
            if v5 {
                will.properties.encode(buf)?;
            }
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }

        if let Some(ref username) = p.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = p.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, p: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut len = 2;
        if self.is_v5() {
            len += props_len(&p.properties);
        }

        self.write_header(0x20, len, buf)?;

        buf.put_u8(if p.session_present { 0x01 } else { 0x00 });
        if self.is_v5() {
            buf.put_u8(p.reason_code as u8);
            p.properties.encode(buf)?;
        } else {
            buf.put_u8(p.reason_code.to_v3_connack_code());
        }

        Ok(())
    }

    fn encode_publish(&self, p: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if p.topic.contains('+') || p.topic.contains('#') {
            return Err(EncodeError::InvalidTopicName);
        }
        // An empty topic is only valid on v5 when an alias stands in for it
        if p.topic.is_empty() && !(self.is_v5() && p.properties.topic_alias.is_some()) {
            return Err(EncodeError::InvalidTopicName);
        }

        match (p.qos, p.packet_id) {
            (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::UnexpectedPacketId),
            (QoS::AtMostOnce, None) => {}
            (_, None) | (_, Some(0)) => return Err(EncodeError::InvalidPacketId),
            (_, Some(_)) => {}
        }

        let mut len = 2 + p.topic.len();
        if p.packet_id.is_some() {
            len += 2;
        }
        if self.is_v5() {
            len += props_len(&p.properties);
        }
        len += p.payload.len();

        let mut first_byte = 0x30;
        if p.dup {
            first_byte |= 0x08;
        }
        first_byte |= (p.qos as u8) << 1;
        if p.retain {
            first_byte |= 0x01;
        }

        self.write_header(first_byte, len, buf)?;

        write_string(buf, &p.topic)?;
        if let Some(id) = p.packet_id {
            buf.put_u16(id);
        }
        if self.is_v5() {
            p.properties.encode(buf)?;
        }
        buf.put_slice(&p.payload);

        Ok(())
    }

    /// PUBACK/PUBREC/PUBREL/PUBCOMP share one layout. On v5 the reason code
    /// and properties are omitted when they carry no information, the
    /// shortest form the protocol allows.
    fn encode_ack(
        &self,
        first_byte: u8,
        packet_id: u16,
        reason_code: ReasonCode,
        properties: &Properties,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if packet_id == 0 {
            return Err(EncodeError::InvalidPacketId);
        }

        let extended = self.is_v5() && (reason_code != ReasonCode::Success || !properties.is_empty());

        let mut len = 2;
        if extended {
            len += 1;
            if !properties.is_empty() {
                len += props_len(properties);
            }
        }

        self.write_header(first_byte, len, buf)?;

        buf.put_u16(packet_id);
        if extended {
            buf.put_u8(reason_code as u8);
            if !properties.is_empty() {
                properties.encode(buf)?;
            }
        }

        Ok(())
    }

    fn encode_subscribe(&self, p: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if p.packet_id == 0 {
            return Err(EncodeError::InvalidPacketId);
        }
        if p.subscriptions.is_empty() {
            return Err(EncodeError::EmptyFilterList);
        }
        if p.subscriptions.iter().any(|s| s.filter.is_empty()) {
            return Err(EncodeError::InvalidTopicName);
        }

        let mut len = 2;
        if self.is_v5() {
            len += props_len(&p.properties);
        }
        for sub in &p.subscriptions {
            len += 2 + sub.filter.len() + 1;
        }

        self.write_header(0x82, len, buf)?;

        buf.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(buf)?;
        }
        for sub in &p.subscriptions {
            write_string(buf, &sub.filter)?;
            if self.is_v5() {
                buf.put_u8(sub.options.to_byte());
            } else {
                buf.put_u8(sub.options.qos as u8);
            }
        }

        Ok(())
    }

    fn encode_suback(&self, p: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if p.reason_codes.is_empty() {
            return Err(EncodeError::EmptyFilterList);
        }

        let mut len = 2;
        if self.is_v5() {
            len += props_len(&p.properties);
        }
        len += p.reason_codes.len();

        self.write_header(0x90, len, buf)?;

        buf.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(buf)?;
        }
        for code in &p.reason_codes {
            if self.is_v5() {
                buf.put_u8(*code as u8);
            } else {
                buf.put_u8(code.to_v3_suback_code());
            }
        }

        Ok(())
    }

    fn encode_unsubscribe(&self, p: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if p.packet_id == 0 {
            return Err(EncodeError::InvalidPacketId);
        }
        if p.filters.is_empty() {
            return Err(EncodeError::EmptyFilterList);
        }
        if p.filters.iter().any(|f| f.is_empty()) {
            return Err(EncodeError::InvalidTopicName);
        }

        let mut len = 2;
        if self.is_v5() {
            len += props_len(&p.properties);
        }
        for filter in &p.filters {
            len += 2 + filter.len();
        }

        self.write_header(0xA2, len, buf)?;

        buf.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(buf)?;
        }
        for filter in &p.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }

    fn encode_unsuback(&self, p: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut len = 2;
        if self.is_v5() {
            len += props_len(&p.properties) + p.reason_codes.len();
        }

        self.write_header(0xB0, len, buf)?;

        buf.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(buf)?;
            for code in &p.reason_codes {
                buf.put_u8(*code as u8);
            }
        }

        Ok(())
    }

    fn encode_disconnect(&self, p: &Disconnect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if !self.is_v5() {
            return self.encode_empty(0xE0, buf);
        }

        if p.reason_code == ReasonCode::Success && p.properties.is_empty() {
            return self.encode_empty(0xE0, buf);
        }

        let mut len = 1;
        if !p.properties.is_empty() {
            len += props_len(&p.properties);
        }

        self.write_header(0xE0, len, buf)?;
        buf.put_u8(p.reason_code as u8);
        if !p.properties.is_empty() {
            p.properties.encode(buf)?;
        }

        Ok(())
    }

    fn encode_auth(&self, p: &Auth, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if !self.is_v5() {
            return Err(EncodeError::UnsupportedFeature("AUTH requires MQTT 5"));
        }

        if p.reason_code == ReasonCode::Success && p.properties.is_empty() {
            return self.encode_empty(0xF0, buf);
        }

        let mut len = 1;
        if !p.properties.is_empty() {
            len += props_len(&p.properties);
        }

        self.write_header(0xF0, len, buf)?;
        buf.put_u8(p.reason_code as u8);
        if !p.properties.is_empty() {
            p.properties.encode(buf)?;
        }

        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V5)
    }
}

/// Size of an encoded property block including its own length prefix.
fn props_len(p: &Properties) -> usize {
    let body = p.encoded_size();
    variable_int_len(body as u32) + body
}
