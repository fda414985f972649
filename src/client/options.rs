//! Client configuration
//!
//! Options are plain data: deserializable from TOML (with `${VAR}` /
//! `${VAR:-default}` substitution and `DRIFTMQ__` env overrides) or built
//! in code via struct update syntax. Validation happens once, up front.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use config::{Environment, File, FileFormat};
use fnv::FnvHasher;
use regex::Regex;
use serde::Deserialize;

use crate::protocol::{ProtocolVersion, QoS, Will};
use crate::transport::TlsOptions;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum OptionsError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for OptionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionsError::Io(e) => write!(f, "IO error: {}", e),
            OptionsError::Parse(e) => write!(f, "Parse error: {}", e),
            OptionsError::Config(e) => write!(f, "Config error: {}", e),
            OptionsError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for OptionsError {}

impl From<std::io::Error> for OptionsError {
    fn from(e: std::io::Error) -> Self {
        OptionsError::Io(e)
    }
}

impl From<toml::de::Error> for OptionsError {
    fn from(e: toml::de::Error) -> Self {
        OptionsError::Parse(e)
    }
}

impl From<config::ConfigError> for OptionsError {
    fn from(e: config::ConfigError) -> Self {
        OptionsError::Config(e)
    }
}

/// Connection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// Plain MQTT over TCP
    #[default]
    Mqtt,
    /// MQTT over TLS
    Mqtts,
    /// MQTT over WebSocket
    Ws,
    /// MQTT over WebSocket with TLS
    Wss,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProtocol::Mqtt => write!(f, "mqtt"),
            TransportProtocol::Mqtts => write!(f, "mqtts"),
            TransportProtocol::Ws => write!(f, "ws"),
            TransportProtocol::Wss => write!(f, "wss"),
        }
    }
}

impl TransportProtocol {
    /// Get default port for this protocol
    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Mqtt => 1883,
            TransportProtocol::Mqtts => 8883,
            TransportProtocol::Ws => 80,
            TransportProtocol::Wss => 443,
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, TransportProtocol::Mqtts | TransportProtocol::Wss)
    }

    pub fn uses_websocket(&self) -> bool {
        matches!(self, TransportProtocol::Ws | TransportProtocol::Wss)
    }
}

/// Packet id allocation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// Wrapping counter, no reuse until wraparound
    #[default]
    Cyclic,
    /// Lowest free id, immediate reuse
    FreeList,
}

/// Will message settings
#[derive(Debug, Clone, Deserialize)]
pub struct WillOptions {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

impl WillOptions {
    pub(crate) fn to_will(&self) -> Will {
        Will {
            topic: self.topic.clone(),
            payload: Bytes::from(self.payload.clone().into_bytes()),
            qos: QoS::from_u8(self.qos).unwrap_or(QoS::AtMostOnce),
            retain: self.retain,
            properties: Default::default(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Broker address, `host` or `host:port`
    pub address: String,

    /// Transport protocol (mqtt, mqtts, ws, wss)
    pub protocol: TransportProtocol,

    /// Protocol level: 3 (v3.1), 4 (v3.1.1) or 5 (v5.0)
    pub protocol_version: u8,

    /// Client identifier; auto-generated when empty and `clean_start`
    pub client_id: String,

    /// Clean session (v3) / clean start (v5)
    pub clean_start: bool,

    /// Keep alive interval in seconds, 0 disables
    pub keepalive: u16,

    pub username: Option<String>,
    pub password: Option<String>,

    pub will: Option<WillOptions>,

    /// Delay between reconnect attempts; 0 disables reconnection
    #[serde(with = "humantime_serde")]
    pub reconnect_period: Duration,

    /// CONNACK deadline per connection attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Queue QoS 0 publishes while offline
    pub queue_qos0: bool,

    /// Restore subscriptions after a reconnect without session resumption
    pub resubscribe: bool,

    /// Push the keep-alive deadline on every outbound write
    pub reschedule_pings: bool,

    /// Topic Alias Maximum we advertise to the broker (v5)
    pub topic_alias_maximum: u16,

    /// Assign outbound topic aliases automatically (v5)
    pub auto_topic_alias: bool,

    /// Receive Maximum we advertise (v5)
    pub receive_maximum: Option<u16>,

    /// Maximum Packet Size we advertise and enforce on decode
    pub max_packet_size: Option<u32>,

    /// Session Expiry Interval we request (v5)
    pub session_expiry_interval: Option<u32>,

    /// Directory for the durable packet stores; volatile stores when unset
    pub storage_path: Option<PathBuf>,

    /// Packet id allocation strategy
    pub id_strategy: IdStrategy,

    /// WebSocket request path
    pub ws_path: String,

    /// TLS settings for mqtts/wss
    pub tls: TlsOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            protocol: TransportProtocol::Mqtt,
            protocol_version: 4,
            client_id: String::new(),
            clean_start: true,
            keepalive: 60,
            username: None,
            password: None,
            will: None,
            reconnect_period: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            queue_qos0: true,
            resubscribe: true,
            reschedule_pings: true,
            topic_alias_maximum: 0,
            auto_topic_alias: false,
            receive_maximum: None,
            max_packet_size: None,
            session_expiry_interval: None,
            storage_path: None,
            id_strategy: IdStrategy::Cyclic,
            ws_path: "/mqtt".to_string(),
            tls: TlsOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Load options from a TOML file with environment variable overrides.
    ///
    /// Supports `${VAR}` / `${VAR:-default}` substitution inside the file
    /// and `DRIFTMQ__` prefixed environment variables, double underscore
    /// separating nested keys (`DRIFTMQ__TLS__CA_PATH=...`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, OptionsError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(OptionsError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("DRIFTMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let options: ClientOptions = cfg.try_deserialize()?;
        options.validate()?;
        Ok(options)
    }

    /// Parse options from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, OptionsError> {
        let options: ClientOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.address.is_empty() {
            return Err(OptionsError::Validation("address is empty".to_string()));
        }
        if ProtocolVersion::from_u8(self.protocol_version).is_none() {
            return Err(OptionsError::Validation(format!(
                "protocol_version must be 3, 4 or 5, got {}",
                self.protocol_version
            )));
        }
        if let Some(ref will) = self.will {
            if will.topic.is_empty() {
                return Err(OptionsError::Validation("will.topic is empty".to_string()));
            }
            if will.qos > 2 {
                return Err(OptionsError::Validation(format!(
                    "will.qos must be 0, 1 or 2, got {}",
                    will.qos
                )));
            }
        }
        if self.password.is_some() && self.username.is_none() && self.protocol_version != 5 {
            return Err(OptionsError::Validation(
                "password requires username before v5".to_string(),
            ));
        }
        Ok(())
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        // Checked by validate
        ProtocolVersion::from_u8(self.protocol_version).unwrap_or(ProtocolVersion::V311)
    }

    /// Host and port, falling back to the protocol's default port.
    ///
    /// IPv6 literals follow the usual bracket convention: `[::1]:1883`
    /// carries a port, a bare `::1` does not.
    pub fn endpoint(&self) -> (String, u16) {
        if let Some(rest) = self.address.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_else(|| self.protocol.default_port());
                return (host.to_string(), port);
            }
        }
        // More than one colon without brackets is a bare IPv6 literal
        if self.address.matches(':').count() > 1 {
            return (self.address.clone(), self.protocol.default_port());
        }
        match self.address.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.address.clone(), self.protocol.default_port()),
            },
            None => (self.address.clone(), self.protocol.default_port()),
        }
    }

    /// WebSocket URL for ws/wss transports.
    pub fn ws_url(&self) -> String {
        let (host, port) = self.endpoint();
        let scheme = if self.protocol.uses_tls() { "wss" } else { "ws" };
        if host.contains(':') {
            format!("{}://[{}]:{}{}", scheme, host, port, self.ws_path)
        } else {
            format!("{}://{}:{}{}", scheme, host, port, self.ws_path)
        }
    }

    /// Whether reconnection after transport loss is enabled.
    pub fn reconnect_enabled(&self) -> bool {
        !self.reconnect_period.is_zero()
    }
}

/// Generate a client id in the `driftmq-XXXXXXXX` form the broker logs
/// can correlate.
pub(crate) fn generate_client_id() -> String {
    let mut hasher = FnvHasher::default();
    std::process::id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
        .hash(&mut hasher);
    format!("driftmq-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let options = ClientOptions::default();
        assert_eq!(options.keepalive, 60);
        assert_eq!(options.reconnect_period, Duration::from_secs(1));
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert!(options.queue_qos0);
        assert!(options.resubscribe);
        assert!(options.reschedule_pings);
    }

    #[test]
    fn parse_toml() {
        let options = ClientOptions::parse(
            r#"
            address = "broker.example:1884"
            protocol = "mqtts"
            protocol_version = 5
            keepalive = 30
            reconnect_period = "5s"
            connect_timeout = "10s"
            topic_alias_maximum = 16
            auto_topic_alias = true

            [tls]
            ca_path = "/etc/driftmq/ca.pem"

            [will]
            topic = "status/c1"
            payload = "offline"
            qos = 1
            retain = true
            "#,
        )
        .unwrap();

        assert_eq!(options.endpoint(), ("broker.example".to_string(), 1884));
        assert_eq!(options.protocol, TransportProtocol::Mqtts);
        assert_eq!(options.protocol_version(), ProtocolVersion::V5);
        assert_eq!(options.reconnect_period, Duration::from_secs(5));
        assert_eq!(options.will.as_ref().unwrap().qos, 1);
        assert_eq!(options.tls.ca_path.as_deref(), Some("/etc/driftmq/ca.pem"));
    }

    #[test]
    fn env_substitution() {
        std::env::set_var("DRIFTMQ_TEST_ADDR", "envhost");
        let content = substitute_env_vars("address = \"${DRIFTMQ_TEST_ADDR}:${NOPE:-2883}\"");
        assert_eq!(content, "address = \"envhost:2883\"");
    }

    #[test]
    fn invalid_protocol_version_rejected() {
        let result = ClientOptions::parse("address = \"x\"\nprotocol_version = 6");
        assert!(matches!(result, Err(OptionsError::Validation(_))));
    }

    #[test]
    fn default_port_follows_protocol() {
        let options = ClientOptions {
            address: "host".to_string(),
            protocol: TransportProtocol::Wss,
            ..Default::default()
        };
        assert_eq!(options.endpoint(), ("host".to_string(), 443));
        assert_eq!(options.ws_url(), "wss://host:443/mqtt");
    }

    #[test]
    fn endpoint_handles_ipv6_literals() {
        let mut options = ClientOptions {
            address: "[::1]:1884".to_string(),
            ..Default::default()
        };
        assert_eq!(options.endpoint(), ("::1".to_string(), 1884));

        options.address = "[2001:db8::2]".to_string();
        assert_eq!(options.endpoint(), ("2001:db8::2".to_string(), 1883));

        options.address = "::1".to_string();
        assert_eq!(options.endpoint(), ("::1".to_string(), 1883));
        assert_eq!(options.ws_url(), "ws://[::1]:1883/mqtt");
    }

    #[test]
    fn generated_ids_have_prefix() {
        let id = generate_client_id();
        assert!(id.starts_with("driftmq-"));
        assert_eq!(id.len(), "driftmq-".len() + 8);
    }
}
