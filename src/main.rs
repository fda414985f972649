//! DriftMQ - MQTT v3.1/v3.1.1/v5.0 client
//!
//! Usage:
//!   driftmq pub [OPTIONS] --topic <TOPIC> [MESSAGE]
//!   driftmq sub [OPTIONS] --topic <FILTER>
//!
//! Common options:
//!   -c, --config <FILE>    Configuration file path
//!   -a, --address <ADDR>   Broker address (default: localhost:1883)
//!   -V, --mqtt-version <N> Protocol version: 3, 4 or 5 (default: 4)
//!   -q, --qos <N>          QoS level 0, 1 or 2 (default: 0)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use driftmq::client::{Client, ClientOptions, Event, TransportProtocol};
use driftmq::protocol::QoS;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// DriftMQ - MQTT client
#[derive(Parser, Debug)]
#[command(name = "driftmq")]
#[command(author = "DriftMQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "MQTT v3.1/v3.1.1/v5.0 client")]
struct Args {
    #[command(subcommand)]
    command: Mode,

    /// Configuration file path (TOML format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Broker address as host:port
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Transport protocol (mqtt, mqtts, ws, wss)
    #[arg(long, global = true)]
    protocol: Option<TransportProtocol>,

    /// MQTT protocol version: 3 (v3.1), 4 (v3.1.1) or 5 (v5.0)
    #[arg(short = 'V', long, global = true)]
    mqtt_version: Option<u8>,

    /// Client identifier (generated when omitted)
    #[arg(short = 'i', long, global = true)]
    client_id: Option<String>,

    /// Username for authentication
    #[arg(short, long, global = true)]
    username: Option<String>,

    /// Password for authentication
    #[arg(short = 'P', long, global = true)]
    password: Option<String>,

    /// Keep alive in seconds
    #[arg(short, long, global = true)]
    keepalive: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Publish a message and exit
    Pub {
        /// Topic to publish to
        #[arg(short, long)]
        topic: String,

        /// QoS level (0, 1 or 2)
        #[arg(short, long, default_value_t = 0)]
        qos: u8,

        /// Set the retain flag
        #[arg(short, long)]
        retain: bool,

        /// Message payload (empty when omitted)
        message: Option<String>,
    },
    /// Subscribe and print messages until interrupted
    Sub {
        /// Topic filter to subscribe to
        #[arg(short, long)]
        topic: String,

        /// Maximum QoS level (0, 1 or 2)
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
    },
}

fn parse_qos(value: u8) -> QoS {
    match QoS::from_u8(value) {
        Some(qos) => qos,
        None => {
            eprintln!("Invalid qos value: {}. Must be 0, 1, or 2.", value);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut options = if let Some(config_path) = &args.config {
        match ClientOptions::load(config_path) {
            Ok(opts) => opts,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        ClientOptions::default()
    };

    let log_level = args.log_level.unwrap_or_default();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(address) = args.address {
        options.address = address;
    }
    if let Some(protocol) = args.protocol {
        options.protocol = protocol;
    }
    if let Some(version) = args.mqtt_version {
        options.protocol_version = version;
    }
    if let Some(client_id) = args.client_id {
        options.client_id = client_id;
    }
    if let Some(username) = args.username {
        options.username = Some(username);
    }
    if let Some(password) = args.password {
        options.password = Some(password);
    }
    if let Some(keepalive) = args.keepalive {
        options.keepalive = keepalive;
    }

    match args.command {
        Mode::Pub {
            topic,
            qos,
            retain,
            message,
        } => {
            let qos = parse_qos(qos);
            let (client, mut events) = Client::connect(options).await?;
            wait_connected(&mut events).await?;
            client
                .publish(topic, message.unwrap_or_default(), qos, retain)
                .await?;
            client.disconnect().await?;
        }
        Mode::Sub { topic, qos } => {
            let qos = parse_qos(qos);
            let (client, mut events) = Client::connect(options).await?;
            wait_connected(&mut events).await?;
            client.subscribe(topic, qos).await?;

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(Event::Message(msg)) => {
                            println!("{} {}", msg.topic, String::from_utf8_lossy(&msg.payload));
                        }
                        Some(Event::Closed) | None => break,
                        Some(_) => {}
                    },
                    _ = tokio::signal::ctrl_c() => {
                        client.disconnect().await?;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn wait_connected(
    events: &mut driftmq::client::EventStream,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match events.recv().await {
            Some(Event::Connected { .. }) => return Ok(()),
            Some(Event::Error(e)) => return Err(Box::new(e)),
            Some(_) => {}
            None => return Err("connection task stopped".into()),
        }
    }
}
