//! Network receivers: one file per transport.

mod backoff;
mod tcp;
mod udp;

use std::{fmt, io, net::SocketAddr, str::FromStr, time::Duration};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub use backoff::Backoff;
pub use tcp::{TcpClientOptions, TcpClientReceiver, TcpServerReceiver};
pub use udp::UdpReceiver;

use crate::{
    config::ReceiverConfig,
    error::{ConfigError, ReceiverError},
    handler::PacketHandler,
};

const RECEIVER_PROTOCOLS: &str = "UDP, TCP_client, TCP_server";

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ReceiverProtocol {
    #[default]
    Udp,
    TcpClient,
    TcpServer,
}

impl FromStr for ReceiverProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(ReceiverProtocol::Udp),
            "tcp_client" => Ok(ReceiverProtocol::TcpClient),
            "tcp_server" => Ok(ReceiverProtocol::TcpServer),
            _ => Err(ConfigError::UnknownProtocol(s.to_string(), RECEIVER_PROTOCOLS)),
        }
    }
}

impl TryFrom<String> for ReceiverProtocol {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ReceiverProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverProtocol::Udp => f.write_str("UDP"),
            ReceiverProtocol::TcpClient => f.write_str("TCP_client"),
            ReceiverProtocol::TcpServer => f.write_str("TCP_server"),
        }
    }
}

/// A configured receiver of any protocol.
pub enum Receiver {
    Udp(UdpReceiver),
    TcpClient(TcpClientReceiver),
    TcpServer(TcpServerReceiver),
}

impl Receiver {
    /// Validates `config` and acquires the receiver's socket. Client receivers connect in `start`.
    pub async fn create(
        config: &ReceiverConfig,
        handler: PacketHandler,
        shutdown_token: CancellationToken,
    ) -> Result<Self, ReceiverError> {
        config.validate()?;
        let handler = handler
            .with_delimiter(config.delimiter.as_str())
            .with_source_name(config.source_name.clone());
        let addr = config.address();

        Ok(match config.protocol {
            ReceiverProtocol::Udp => Receiver::Udp(
                UdpReceiver::bind(&addr, handler, config.max_packet_size, shutdown_token).await?,
            ),
            ReceiverProtocol::TcpClient => Receiver::TcpClient(TcpClientReceiver::new(
                addr,
                handler,
                config.tcp_client_options()?,
                shutdown_token,
            )),
            ReceiverProtocol::TcpServer => Receiver::TcpServer(
                TcpServerReceiver::bind(&addr, handler, config.max_packet_size, shutdown_token)
                    .await?,
            ),
        })
    }

    pub fn protocol(&self) -> ReceiverProtocol {
        match self {
            Receiver::Udp(_) => ReceiverProtocol::Udp,
            Receiver::TcpClient(_) => ReceiverProtocol::TcpClient,
            Receiver::TcpServer(_) => ReceiverProtocol::TcpServer,
        }
    }

    /// Bound address for listening receivers, the remote address for clients.
    pub fn address(&self) -> String {
        let local = match self {
            Receiver::Udp(r) => r.local_addr(),
            Receiver::TcpServer(r) => r.local_addr(),
            Receiver::TcpClient(r) => return r.addr().to_string(),
        };
        local.map(|a| a.to_string()).unwrap_or_else(|e| e.to_string())
    }

    /// Runs until `shutdown` is called or a fatal error occurs.
    pub async fn start(&self) -> Result<(), ReceiverError> {
        match self {
            Receiver::Udp(r) => r.start().await,
            Receiver::TcpClient(r) => r.start().await,
            Receiver::TcpServer(r) => r.start().await,
        }
    }

    pub fn shutdown(&self) {
        match self {
            Receiver::Udp(r) => r.shutdown(),
            Receiver::TcpClient(r) => r.shutdown(),
            Receiver::TcpServer(r) => r.shutdown(),
        }
    }
}

/// First address `addr` resolves to.
pub(crate) async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{addr} did not resolve to any address"),
        )
    })
}

/// Backs off after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin. Returns `false` when shut down while waiting.
pub(crate) async fn pause_after_accept_error(shutdown_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown_token.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => true,
    }
}
