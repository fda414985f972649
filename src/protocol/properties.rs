//! MQTT v5.0 properties
//!
//! The property block is a variable-byte-integer length followed by
//! `{id, typed value}` entries. Ids, wire types and multiplicity come from
//! Table 2-4 of the v5.0 specification.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_variable_int, variable_int_len, write_binary, write_string,
    write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers (Table 2-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(PropertyId::PayloadFormatIndicator),
            0x02 => Some(PropertyId::MessageExpiryInterval),
            0x03 => Some(PropertyId::ContentType),
            0x08 => Some(PropertyId::ResponseTopic),
            0x09 => Some(PropertyId::CorrelationData),
            0x0B => Some(PropertyId::SubscriptionIdentifier),
            0x11 => Some(PropertyId::SessionExpiryInterval),
            0x12 => Some(PropertyId::AssignedClientIdentifier),
            0x13 => Some(PropertyId::ServerKeepAlive),
            0x15 => Some(PropertyId::AuthenticationMethod),
            0x16 => Some(PropertyId::AuthenticationData),
            0x17 => Some(PropertyId::RequestProblemInformation),
            0x18 => Some(PropertyId::WillDelayInterval),
            0x19 => Some(PropertyId::RequestResponseInformation),
            0x1A => Some(PropertyId::ResponseInformation),
            0x1C => Some(PropertyId::ServerReference),
            0x1F => Some(PropertyId::ReasonString),
            0x21 => Some(PropertyId::ReceiveMaximum),
            0x22 => Some(PropertyId::TopicAliasMaximum),
            0x23 => Some(PropertyId::TopicAlias),
            0x24 => Some(PropertyId::MaximumQoS),
            0x25 => Some(PropertyId::RetainAvailable),
            0x26 => Some(PropertyId::UserProperty),
            0x27 => Some(PropertyId::MaximumPacketSize),
            0x28 => Some(PropertyId::WildcardSubscriptionAvailable),
            0x29 => Some(PropertyId::SubscriptionIdentifierAvailable),
            0x2A => Some(PropertyId::SharedSubscriptionAvailable),
            _ => None,
        }
    }
}

/// Decoded v5.0 property block.
///
/// Single-valued properties are `Option`s; user properties and subscription
/// identifiers may repeat and collect into `Vec`s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

/// Cursor over a property block body, with bounds-checked typed reads.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= self.end {
            return Err(DecodeError::InsufficientData);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        if self.pos + 2 > self.end {
            return Err(DecodeError::InsufficientData);
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        if self.pos + 4 > self.end {
            return Err(DecodeError::InsufficientData);
        }
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn varint(&mut self) -> Result<u32, DecodeError> {
        let (v, n) = read_variable_int(&self.buf[self.pos..self.end])?;
        self.pos += n;
        Ok(v)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let (s, n) = read_string(&self.buf[self.pos..self.end])?;
        self.pos += n;
        Ok(s.to_string())
    }

    fn binary(&mut self) -> Result<Bytes, DecodeError> {
        let (data, n) = read_binary(&self.buf[self.pos..self.end])?;
        self.pos += n;
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Reject re-assignment of a single-valued property.
macro_rules! set_once {
    ($slot:expr, $id:expr, $value:expr) => {{
        if $slot.is_some() {
            return Err(DecodeError::DuplicateProperty($id as u8));
        }
        $slot = Some($value);
    }};
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    /// Decode a property block (length prefix included).
    /// Returns the properties and the total bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::InsufficientData);
        }

        let (body_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + body_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut p = Properties::new();
        let mut r = Reader {
            buf,
            pos: len_bytes,
            end,
        };

        while r.pos < r.end {
            let raw_id = r.varint()?;
            let id = PropertyId::from_u8(raw_id as u8)
                .filter(|_| raw_id <= 0xFF)
                .ok_or(DecodeError::InvalidPropertyId(raw_id as u8))?;

            match id {
                PropertyId::PayloadFormatIndicator => {
                    set_once!(p.payload_format_indicator, id, r.u8()?)
                }
                PropertyId::MessageExpiryInterval => {
                    set_once!(p.message_expiry_interval, id, r.u32()?)
                }
                PropertyId::ContentType => set_once!(p.content_type, id, r.string()?),
                PropertyId::ResponseTopic => set_once!(p.response_topic, id, r.string()?),
                PropertyId::CorrelationData => set_once!(p.correlation_data, id, r.binary()?),
                PropertyId::SubscriptionIdentifier => {
                    let v = r.varint()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "subscription identifier cannot be 0",
                        ));
                    }
                    p.subscription_identifiers.push(v);
                }
                PropertyId::SessionExpiryInterval => {
                    set_once!(p.session_expiry_interval, id, r.u32()?)
                }
                PropertyId::AssignedClientIdentifier => {
                    set_once!(p.assigned_client_identifier, id, r.string()?)
                }
                PropertyId::ServerKeepAlive => set_once!(p.server_keep_alive, id, r.u16()?),
                PropertyId::AuthenticationMethod => {
                    set_once!(p.authentication_method, id, r.string()?)
                }
                PropertyId::AuthenticationData => {
                    set_once!(p.authentication_data, id, r.binary()?)
                }
                PropertyId::RequestProblemInformation => {
                    set_once!(p.request_problem_information, id, r.u8()?)
                }
                PropertyId::WillDelayInterval => set_once!(p.will_delay_interval, id, r.u32()?),
                PropertyId::RequestResponseInformation => {
                    set_once!(p.request_response_information, id, r.u8()?)
                }
                PropertyId::ResponseInformation => {
                    set_once!(p.response_information, id, r.string()?)
                }
                PropertyId::ServerReference => set_once!(p.server_reference, id, r.string()?),
                PropertyId::ReasonString => set_once!(p.reason_string, id, r.string()?),
                PropertyId::ReceiveMaximum => {
                    let v = r.u16()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                    }
                    set_once!(p.receive_maximum, id, v)
                }
                PropertyId::TopicAliasMaximum => set_once!(p.topic_alias_maximum, id, r.u16()?),
                PropertyId::TopicAlias => {
                    let v = r.u16()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket("topic alias cannot be 0"));
                    }
                    set_once!(p.topic_alias, id, v)
                }
                PropertyId::MaximumQoS => set_once!(p.maximum_qos, id, r.u8()?),
                PropertyId::RetainAvailable => set_once!(p.retain_available, id, r.u8()?),
                PropertyId::UserProperty => {
                    let key = r.string()?;
                    let value = r.string()?;
                    p.user_properties.push((key, value));
                }
                PropertyId::MaximumPacketSize => {
                    let v = r.u32()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "maximum packet size cannot be 0",
                        ));
                    }
                    set_once!(p.maximum_packet_size, id, v)
                }
                PropertyId::WildcardSubscriptionAvailable => {
                    set_once!(p.wildcard_subscription_available, id, r.u8()?)
                }
                PropertyId::SubscriptionIdentifierAvailable => {
                    set_once!(p.subscription_identifier_available, id, r.u8()?)
                }
                PropertyId::SharedSubscriptionAvailable => {
                    set_once!(p.shared_subscription_available, id, r.u8()?)
                }
            }
        }

        Ok((p, end))
    }

    /// Encoded size of the block body (excluding its length prefix).
    pub fn encoded_size(&self) -> usize {
        fn opt_fixed<T>(v: &Option<T>, width: usize) -> usize {
            if v.is_some() {
                1 + width
            } else {
                0
            }
        }
        fn opt_str(v: &Option<String>) -> usize {
            v.as_ref().map_or(0, |s| 1 + 2 + s.len())
        }
        fn opt_bin(v: &Option<Bytes>) -> usize {
            v.as_ref().map_or(0, |d| 1 + 2 + d.len())
        }

        let mut size = 0;
        size += opt_fixed(&self.payload_format_indicator, 1);
        size += opt_fixed(&self.message_expiry_interval, 4);
        size += opt_str(&self.content_type);
        size += opt_str(&self.response_topic);
        size += opt_bin(&self.correlation_data);
        for id in &self.subscription_identifiers {
            size += 1 + variable_int_len(*id);
        }
        size += opt_fixed(&self.session_expiry_interval, 4);
        size += opt_str(&self.assigned_client_identifier);
        size += opt_fixed(&self.server_keep_alive, 2);
        size += opt_str(&self.authentication_method);
        size += opt_bin(&self.authentication_data);
        size += opt_fixed(&self.request_problem_information, 1);
        size += opt_fixed(&self.will_delay_interval, 4);
        size += opt_fixed(&self.request_response_information, 1);
        size += opt_str(&self.response_information);
        size += opt_str(&self.server_reference);
        size += opt_str(&self.reason_string);
        size += opt_fixed(&self.receive_maximum, 2);
        size += opt_fixed(&self.topic_alias_maximum, 2);
        size += opt_fixed(&self.topic_alias, 2);
        size += opt_fixed(&self.maximum_qos, 1);
        size += opt_fixed(&self.retain_available, 1);
        for (k, v) in &self.user_properties {
            size += 1 + 2 + k.len() + 2 + v.len();
        }
        size += opt_fixed(&self.maximum_packet_size, 4);
        size += opt_fixed(&self.wildcard_subscription_available, 1);
        size += opt_fixed(&self.subscription_identifier_available, 1);
        size += opt_fixed(&self.shared_subscription_available, 1);
        size
    }

    /// Encode the full block (length prefix + entries).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(PropertyId::PayloadFormatIndicator as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(PropertyId::MessageExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(PropertyId::ContentType as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(PropertyId::ResponseTopic as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(PropertyId::CorrelationData as u8);
            write_binary(buf, d)?;
        }
        for id in &self.subscription_identifiers {
            buf.put_u8(PropertyId::SubscriptionIdentifier as u8);
            write_variable_int(buf, *id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(PropertyId::SessionExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(PropertyId::AssignedClientIdentifier as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(PropertyId::ServerKeepAlive as u8);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.authentication_method {
            buf.put_u8(PropertyId::AuthenticationMethod as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.authentication_data {
            buf.put_u8(PropertyId::AuthenticationData as u8);
            write_binary(buf, d)?;
        }
        if let Some(v) = self.request_problem_information {
            buf.put_u8(PropertyId::RequestProblemInformation as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            buf.put_u8(PropertyId::WillDelayInterval as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            buf.put_u8(PropertyId::RequestResponseInformation as u8);
            buf.put_u8(v);
        }
        if let Some(ref s) = self.response_information {
            buf.put_u8(PropertyId::ResponseInformation as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.server_reference {
            buf.put_u8(PropertyId::ServerReference as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(PropertyId::ReasonString as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(PropertyId::ReceiveMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(PropertyId::TopicAliasMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            buf.put_u8(PropertyId::TopicAlias as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(PropertyId::MaximumQoS as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(PropertyId::RetainAvailable as u8);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(PropertyId::MaximumPacketSize as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            buf.put_u8(PropertyId::WildcardSubscriptionAvailable as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            buf.put_u8(PropertyId::SubscriptionIdentifierAvailable as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            buf.put_u8(PropertyId::SharedSubscriptionAvailable as u8);
            buf.put_u8(v);
        }

        Ok(())
    }
}
