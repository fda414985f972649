//! Protocol and client error types

use std::fmt;

use super::ReasonCode;

/// Errors raised while decoding inbound bytes.
///
/// Every variant except `InsufficientData` is fatal to the connection: the
/// decoder stays poisoned until it is reset with a fresh byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data buffered yet (not an error at the connection level)
    InsufficientData,
    /// Unknown packet type nibble
    InvalidPacketType(u8),
    /// Variable byte integer ran past 4 bytes
    InvalidRemainingLength,
    /// Invalid protocol name in CONNECT
    InvalidProtocolName,
    /// Invalid protocol level byte
    InvalidProtocolVersion(u8),
    /// QoS bits outside 0..=2
    InvalidQoS(u8),
    /// String payload is not UTF-8 or contains a null character
    InvalidUtf8,
    /// Unknown property identifier
    InvalidPropertyId(u8),
    /// Property appeared twice where at most one is allowed
    DuplicateProperty(u8),
    /// Flag nibble does not match the packet type's required flags
    InvalidFlags,
    /// Structurally invalid packet
    MalformedPacket(&'static str),
    /// Remaining length exceeds the configured maximum packet size
    PacketTooLarge,
    /// Unknown reason code byte
    InvalidReasonCode(u8),
    /// Reserved bits set in subscription options
    InvalidSubscriptionOptions,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property identifier: {}", id),
            Self::DuplicateProperty(id) => write!(f, "duplicate property: {}", id),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: {}", r),
            Self::InvalidSubscriptionOptions => write!(f, "invalid subscription options"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised while encoding an outbound packet.
///
/// Encoding validates before writing: on error the output buffer is
/// untouched and no bytes reach the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length would exceed 268,435,455
    PacketTooLarge,
    /// String or binary field exceeds 65,535 bytes
    StringTooLong,
    /// Empty topic without a topic alias substitute
    InvalidTopicName,
    /// Packet id 0, or missing where QoS requires one
    InvalidPacketId,
    /// QoS 0 publish carrying a packet id
    UnexpectedPacketId,
    /// Password set without username (v3.1/v3.1.1 rule)
    PasswordWithoutUsername,
    /// SUBSCRIBE/UNSUBSCRIBE with no filters
    EmptyFilterList,
    /// AUTH on a pre-v5 connection
    UnsupportedFeature(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::InvalidTopicName => write!(f, "invalid topic name"),
            Self::InvalidPacketId => write!(f, "invalid packet identifier"),
            Self::UnexpectedPacketId => write!(f, "packet identifier not allowed at QoS 0"),
            Self::PasswordWithoutUsername => write!(f, "password supplied without username"),
            Self::EmptyFilterList => write!(f, "at least one topic filter is required"),
            Self::UnsupportedFeature(what) => write!(f, "{} requires MQTT v5", what),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors surfaced to users of the client.
#[derive(Debug)]
pub enum ClientError {
    /// Malformed inbound packet; connection is torn down
    Decode(DecodeError),
    /// Outbound packet failed validation; nothing was sent
    Encode(EncodeError),
    /// Broker rejected an operation with an MQTT reason code
    Reason(ReasonCode),
    /// Broker refused the connection attempt
    ConnectionRefused(ReasonCode),
    /// Transport-level failure
    Io(std::io::Error),
    /// CONNACK did not arrive within the connect timeout
    ConnectTimeout,
    /// No PINGRESP since the last keep-alive check
    KeepAliveTimeout,
    /// The connection dropped while the operation was in flight
    Disconnected,
    /// All 65,535 packet ids are in flight
    PacketIdExhausted,
    /// Invalid argument to a public API call
    InvalidInput(&'static str),
    /// Rejected configuration
    Options(String),
    /// Persistent store failure
    Store(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Reason(code) => write!(f, "{} (reason code {})", code, *code as u8),
            Self::ConnectionRefused(code) => {
                write!(f, "connection refused: {} (reason code {})", code, *code as u8)
            }
            Self::Io(e) => write!(f, "transport error: {}", e),
            Self::ConnectTimeout => write!(f, "timed out waiting for CONNACK"),
            Self::KeepAliveTimeout => write!(f, "keep-alive timed out"),
            Self::Disconnected => write!(f, "connection closed"),
            Self::PacketIdExhausted => write!(f, "no free packet identifier"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Self::Options(msg) => write!(f, "invalid options: {}", msg),
            Self::Store(msg) => write!(f, "store error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Decode(e)
    }
}

impl From<EncodeError> for ClientError {
    fn from(e: EncodeError) -> Self {
        ClientError::Encode(e)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e)
    }
}
