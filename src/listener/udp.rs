use std::{io, net::SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{error::ReceiverError, handler::PacketHandler, packet::Protocol};

const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Binds a local port and handles every inbound datagram as one Packet.
pub struct UdpReceiver {
    socket: UdpSocket,
    handler: PacketHandler,
    max_packet_size: usize,
    shutdown_token: CancellationToken,
}

impl UdpReceiver {
    pub async fn bind(
        addr: &str,
        handler: PacketHandler,
        max_packet_size: usize,
        shutdown_token: CancellationToken,
    ) -> Result<Self, ReceiverError> {
        let bind_err = |source| ReceiverError::Bind {
            addr: addr.to_string(),
            source,
        };
        let local = super::resolve(addr).await.map_err(bind_err)?;
        let socket = bind_socket(local).map_err(bind_err)?;
        info!("listening on UDP addr {}", local_addr_string(&socket, addr));

        Ok(UdpReceiver {
            socket,
            handler,
            max_packet_size,
            shutdown_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub async fn start(&self) -> Result<(), ReceiverError> {
        let mut buf = vec![0u8; self.max_packet_size].into_boxed_slice();
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    break;
                },
                recv_res = self.socket.recv_from(&mut buf) => {
                    match recv_res {
                        Ok((num_bytes, peer)) => {
                            let packet = self.handler.make_packet(
                                &buf[..num_bytes],
                                Protocol::Udp,
                                &peer.ip().to_string(),
                                Some(peer.port()),
                            );
                            self.handler.handle(packet).await;
                        }
                        // ICMP errors from earlier sends surface here on some platforms.
                        Err(e) => warn!("UDP: receive failed: {e}"),
                    }
                }
            }
        }

        info!("UDP receiver on {} stopped", local_addr_string(&self.socket, "?"));
        Ok(())
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(socket2::Protocol::UDP))?;
    // Bursty feeds overflow the default receive buffer.
    socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn local_addr_string(socket: &UdpSocket, fallback: &str) -> String {
    socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| fallback.to_string())
}
