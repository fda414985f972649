//! MQTT v5.0 reason codes
//!
//! One table drives the enum, the byte conversion and the human-readable
//! text the client wraps into errors.

use std::fmt;

macro_rules! reason_codes {
    ($($name:ident = $value:literal => $text:literal,)+) => {
        /// MQTT v5.0 reason code
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $($name = $value,)+
        }

        impl ReasonCode {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($value => Some(ReasonCode::$name),)+
                    _ => None,
                }
            }

            /// Human-readable text for this code.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(ReasonCode::$name => $text,)+
                }
            }
        }

        impl fmt::Display for ReasonCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

reason_codes! {
    Success = 0x00 => "Success",
    GrantedQoS1 = 0x01 => "Granted QoS 1",
    GrantedQoS2 = 0x02 => "Granted QoS 2",
    DisconnectWithWill = 0x04 => "Disconnect with Will Message",
    NoMatchingSubscribers = 0x10 => "No matching subscribers",
    NoSubscriptionExisted = 0x11 => "No subscription existed",
    ContinueAuthentication = 0x18 => "Continue authentication",
    ReAuthenticate = 0x19 => "Re-authenticate",
    UnspecifiedError = 0x80 => "Unspecified error",
    MalformedPacket = 0x81 => "Malformed Packet",
    ProtocolError = 0x82 => "Protocol Error",
    ImplementationError = 0x83 => "Implementation specific error",
    UnsupportedProtocolVersion = 0x84 => "Unsupported Protocol Version",
    ClientIdNotValid = 0x85 => "Client Identifier not valid",
    BadUserNameOrPassword = 0x86 => "Bad User Name or Password",
    NotAuthorized = 0x87 => "Not authorized",
    ServerUnavailable = 0x88 => "Server unavailable",
    ServerBusy = 0x89 => "Server busy",
    Banned = 0x8A => "Banned",
    ServerShuttingDown = 0x8B => "Server shutting down",
    BadAuthenticationMethod = 0x8C => "Bad authentication method",
    KeepAliveTimeout = 0x8D => "Keep Alive timeout",
    SessionTakenOver = 0x8E => "Session taken over",
    TopicFilterInvalid = 0x8F => "Topic Filter invalid",
    TopicNameInvalid = 0x90 => "Topic Name invalid",
    PacketIdInUse = 0x91 => "Packet Identifier in use",
    PacketIdNotFound = 0x92 => "Packet Identifier not found",
    ReceiveMaxExceeded = 0x93 => "Receive Maximum exceeded",
    TopicAliasInvalid = 0x94 => "Topic Alias invalid",
    PacketTooLarge = 0x95 => "Packet too large",
    MessageRateTooHigh = 0x96 => "Message rate too high",
    QuotaExceeded = 0x97 => "Quota exceeded",
    AdministrativeAction = 0x98 => "Administrative action",
    PayloadFormatInvalid = 0x99 => "Payload format invalid",
    RetainNotSupported = 0x9A => "Retain not supported",
    QoSNotSupported = 0x9B => "QoS not supported",
    UseAnotherServer = 0x9C => "Use another server",
    ServerMoved = 0x9D => "Server moved",
    SharedSubsNotSupported = 0x9E => "Shared Subscriptions not supported",
    ConnectionRateExceeded = 0x9F => "Connection rate exceeded",
    MaximumConnectTime = 0xA0 => "Maximum connect time",
    SubIdNotSupported = 0xA1 => "Subscription Identifiers not supported",
    WildcardSubsNotSupported = 0xA2 => "Wildcard Subscriptions not supported",
}

impl ReasonCode {
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }

    /// Map to the 5-value v3.x CONNACK return code space.
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::UnsupportedProtocolVersion => 0x01,
            ReasonCode::ClientIdNotValid => 0x02,
            ReasonCode::ServerUnavailable => 0x03,
            ReasonCode::BadUserNameOrPassword => 0x04,
            _ => 0x05,
        }
    }

    /// Lift a v3.x CONNACK return code into the v5 code space.
    pub fn from_v3_connack_code(code: u8) -> Self {
        match code {
            0x00 => ReasonCode::Success,
            0x01 => ReasonCode::UnsupportedProtocolVersion,
            0x02 => ReasonCode::ClientIdNotValid,
            0x03 => ReasonCode::ServerUnavailable,
            0x04 => ReasonCode::BadUserNameOrPassword,
            0x05 => ReasonCode::NotAuthorized,
            _ => ReasonCode::UnspecifiedError,
        }
    }

    /// Granted QoS carried in a v3.x SUBACK return code, if any.
    pub fn from_v3_suback_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x80 => Some(ReasonCode::UnspecifiedError),
            _ => None,
        }
    }

    pub fn to_v3_suback_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::GrantedQoS1 => 0x01,
            ReasonCode::GrantedQoS2 => 0x02,
            _ => 0x80,
        }
    }
}
