//! Transport layer
//!
//! The connection task only needs a byte-stream duplex; TCP, TLS and
//! WebSocket all funnel into the same `Transport` object.

mod tls;
mod websocket;

pub use tls::{tls_connector, TlsError, TlsOptions};
pub use websocket::WsStream;

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte-stream duplex the client runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Socket tuning applied to the underlying TCP stream.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
    /// TCP keepalive probe interval
    pub tcp_keepalive: Option<Duration>,
    /// Socket receive buffer size
    pub recv_buffer_size: Option<usize>,
    /// Socket send buffer size
    pub send_buffer_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

/// Dial a TCP connection and apply socket tuning.
pub async fn connect_tcp(address: &str, config: &TransportConfig) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    configure_stream(&stream, config)?;
    debug!(address, "tcp connected");
    Ok(stream)
}

/// Apply `TransportConfig` to an established TCP stream.
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let sock = SockRef::from(stream);
    if let Some(interval) = config.tcp_keepalive {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))?;
    }
    if let Some(size) = config.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }

    Ok(())
}
