use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::Path,
};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{send_pass, ChunkWriter, PassEnd, TransmitOptions, TransmitStats};
use crate::{error::TransmitterError, listener::resolve};

/// Sends every chunk as one datagram, its lines joined by the delimiter.
pub struct UdpTransmitter {
    socket: UdpSocket,
    target: SocketAddr,
    options: TransmitOptions,
    shutdown_token: CancellationToken,
}

impl UdpTransmitter {
    pub async fn connect(
        addr: &str,
        options: TransmitOptions,
        shutdown_token: CancellationToken,
    ) -> Result<Self, TransmitterError> {
        let target = resolve(addr)
            .await
            .map_err(|source| TransmitterError::Resolve {
                addr: addr.to_string(),
                source,
            })?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransmitterError::Bind {
                addr: local.to_string(),
                source,
            })?;
        info!("UDP transmitter sending to {target}");

        Ok(UdpTransmitter {
            socket,
            target,
            options,
            shutdown_token,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub async fn start(&self, path: &Path) -> Result<TransmitStats, TransmitterError> {
        let mut stats = TransmitStats::default();
        let mut writer = DatagramWriter {
            socket: &self.socket,
            target: self.target,
            delimiter: &self.options.delimiter,
        };

        loop {
            let chunks_before = stats.chunks;
            match send_pass(path, &self.options, &mut writer, &mut stats, &self.shutdown_token)
                .await?
            {
                PassEnd::Shutdown => return Ok(stats),
                PassEnd::WriteFailed(source) => {
                    return Err(TransmitterError::Send {
                        addr: self.target,
                        source,
                    })
                }
                PassEnd::Finished => {}
            }

            if !self.options.repeat {
                return Ok(stats);
            }
            if stats.chunks == chunks_before {
                warn!("nothing to send under {}, not repeating", path.display());
                return Ok(stats);
            }
            info!("UDP: replaying {}", path.display());
        }
    }
}

struct DatagramWriter<'a> {
    socket: &'a UdpSocket,
    target: SocketAddr,
    delimiter: &'a str,
}

#[async_trait]
impl<'a> ChunkWriter for DatagramWriter<'a> {
    async fn write_chunk(&mut self, lines: &[String]) -> io::Result<()> {
        let payload = lines.join(self.delimiter);
        match self.socket.send_to(payload.as_bytes(), self.target).await {
            Ok(_) => Ok(()),
            // Nobody listening yet; UDP is fire and forget.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!("UDP: {} refused a datagram", self.target);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
