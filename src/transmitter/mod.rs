//! Replays recorded sentence files onto the network.

mod source;
mod tcp;
mod udp;

use std::{fmt, io, path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use source::{list_files, open_lines, spawn_chunk_reader, SourceEvent, SourceSettings};
pub use tcp::TcpServerTransmitter;
pub use udp::UdpTransmitter;

use crate::{
    config::TransmitterConfig,
    error::{ConfigError, TransmitterError},
};

const TRANSMITTER_PROTOCOLS: &str = "UDP, TCP_server";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum TransmitterProtocol {
    #[default]
    Udp,
    TcpServer,
}

impl FromStr for TransmitterProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransmitterProtocol::Udp),
            "tcp_server" => Ok(TransmitterProtocol::TcpServer),
            "tcp_client" => Err(ConfigError::UnsupportedProtocol {
                protocol: s.to_string(),
                role: "transmitter",
            }),
            _ => Err(ConfigError::UnknownProtocol(s.to_string(), TRANSMITTER_PROTOCOLS)),
        }
    }
}

impl TryFrom<String> for TransmitterProtocol {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for TransmitterProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitterProtocol::Udp => f.write_str("UDP"),
            TransmitterProtocol::TcpServer => f.write_str("TCP_server"),
        }
    }
}

/// What one `start` call sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitStats {
    pub files: usize,
    pub chunks: usize,
    pub lines: usize,
}

/// Settings shared by every transmitter protocol.
#[derive(Debug, Clone)]
pub struct TransmitOptions {
    pub source: SourceSettings,
    pub delay: Duration,
    pub repeat: bool,
    pub delimiter: String,
}

impl TransmitOptions {
    pub fn from_config(config: &TransmitterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(TransmitOptions {
            source: SourceSettings {
                chunker: config.chunker,
                chunk_size: config.chunk_size,
                mode: config.chunk_mode(),
                first_n: config.first_n,
            },
            delay: config.delay()?,
            repeat: config.repeat,
            delimiter: config.delimiter.clone(),
        })
    }
}

pub enum Transmitter {
    Udp(UdpTransmitter),
    TcpServer(TcpServerTransmitter),
}

impl Transmitter {
    /// Validates `config` and sets up the socket: resolves the target for UDP, binds for TCP.
    pub async fn create(
        config: &TransmitterConfig,
        shutdown_token: CancellationToken,
    ) -> Result<Self, TransmitterError> {
        let options = TransmitOptions::from_config(config)?;
        let addr = config.address();
        Ok(match config.protocol {
            TransmitterProtocol::Udp => {
                Transmitter::Udp(UdpTransmitter::connect(&addr, options, shutdown_token).await?)
            }
            TransmitterProtocol::TcpServer => Transmitter::TcpServer(
                TcpServerTransmitter::bind(&addr, options, shutdown_token).await?,
            ),
        })
    }

    pub fn protocol(&self) -> TransmitterProtocol {
        match self {
            Transmitter::Udp(_) => TransmitterProtocol::Udp,
            Transmitter::TcpServer(_) => TransmitterProtocol::TcpServer,
        }
    }

    /// Sends everything under `path`; returns early, without error, on shutdown.
    pub async fn start(&self, path: &Path) -> Result<TransmitStats, TransmitterError> {
        let stats = match self {
            Transmitter::Udp(t) => t.start(path).await,
            Transmitter::TcpServer(t) => t.start(path).await,
        }?;
        info!(
            "{} transmitter done: {} files, {} chunks, {} lines",
            self.protocol(),
            stats.files,
            stats.chunks,
            stats.lines
        );
        Ok(stats)
    }

    pub fn shutdown(&self) {
        match self {
            Transmitter::Udp(t) => t.shutdown(),
            Transmitter::TcpServer(t) => t.shutdown(),
        }
    }
}

/// Puts one chunk on the wire.
#[async_trait]
trait ChunkWriter: Send {
    async fn write_chunk(&mut self, lines: &[String]) -> io::Result<()>;
}

enum PassEnd {
    Finished,
    Shutdown,
    WriteFailed(io::Error),
}

/// Sends one full pass over the files under `path`, pacing chunks by `options.delay`.
async fn send_pass(
    path: &Path,
    options: &TransmitOptions,
    writer: &mut dyn ChunkWriter,
    stats: &mut TransmitStats,
    shutdown_token: &CancellationToken,
) -> Result<PassEnd, TransmitterError> {
    let mut events = spawn_chunk_reader(list_files(path)?, options.source);
    let mut sent_any = false;

    loop {
        let event = tokio::select! {
            _ = shutdown_token.cancelled() => return Ok(PassEnd::Shutdown),
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return Ok(PassEnd::Finished);
        };

        match event? {
            SourceEvent::File(file) => {
                info!("sending {}", file.display());
                stats.files += 1;
            }
            SourceEvent::Chunk(lines) => {
                if sent_any {
                    tokio::select! {
                        _ = shutdown_token.cancelled() => return Ok(PassEnd::Shutdown),
                        _ = tokio::time::sleep(options.delay) => {}
                    }
                }
                if let Err(e) = writer.write_chunk(&lines).await {
                    return Ok(PassEnd::WriteFailed(e));
                }
                sent_any = true;
                stats.chunks += 1;
                stats.lines += lines.len();
            }
        }
    }
}
