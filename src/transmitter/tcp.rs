use std::{io, net::SocketAddr, path::Path};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{send_pass, ChunkWriter, PassEnd, TransmitOptions, TransmitStats};
use crate::{error::TransmitterError, listener::pause_after_accept_error};

/// Listens for one client at a time and streams the source to it, one `line\n` per line.
///
/// A client that goes away mid-stream is replaced by the next one to connect, which
/// gets the source from the beginning.
pub struct TcpServerTransmitter {
    listener: TcpListener,
    options: TransmitOptions,
    shutdown_token: CancellationToken,
}

impl TcpServerTransmitter {
    pub async fn bind(
        addr: &str,
        options: TransmitOptions,
        shutdown_token: CancellationToken,
    ) -> Result<Self, TransmitterError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransmitterError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        if let Ok(local) = listener.local_addr() {
            info!("TCP transmitter listening on {local}");
        }

        Ok(TcpServerTransmitter {
            listener,
            options,
            shutdown_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub async fn start(&self, path: &Path) -> Result<TransmitStats, TransmitterError> {
        let mut stats = TransmitStats::default();

        loop {
            let (mut conn, peer_addr) = tokio::select! {
                _ = self.shutdown_token.cancelled() => return Ok(stats),
                accept_res = self.listener.accept() => match accept_res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("TCP: accept failed: {e}");
                        if pause_after_accept_error(&self.shutdown_token).await {
                            continue;
                        }
                        return Ok(stats);
                    }
                },
            };
            info!("accepted TCP connection for peer {peer_addr}");

            loop {
                let chunks_before = stats.chunks;
                let mut writer = LineWriter { conn: &mut conn };
                match send_pass(path, &self.options, &mut writer, &mut stats, &self.shutdown_token)
                    .await?
                {
                    PassEnd::Shutdown => {
                        _ = conn.shutdown().await;
                        return Ok(stats);
                    }
                    PassEnd::WriteFailed(e) if is_disconnect(&e) => {
                        warn!("TCP: peer {peer_addr} disconnected: {e}");
                        break;
                    }
                    PassEnd::WriteFailed(source) => {
                        return Err(TransmitterError::Send {
                            addr: peer_addr,
                            source,
                        })
                    }
                    PassEnd::Finished => {}
                }

                if !self.options.repeat || stats.chunks == chunks_before {
                    _ = conn.shutdown().await;
                    return Ok(stats);
                }
                info!("TCP: replaying {} to {peer_addr}", path.display());
            }
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

struct LineWriter<'a> {
    conn: &'a mut TcpStream,
}

#[async_trait]
impl<'a> ChunkWriter for LineWriter<'a> {
    async fn write_chunk(&mut self, lines: &[String]) -> io::Result<()> {
        let mut data = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            data.extend_from_slice(line.as_bytes());
            data.push(b'\n');
        }
        self.conn.write_all(&data).await
    }
}
