use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use socket2::SockRef;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use super::{backoff::Backoff, pause_after_accept_error};
use crate::{
    ais_reformatter::LineFramer,
    error::{is_transient, ReceiverError},
    handler::PacketHandler,
    packet::{Packet, Protocol},
};

/// Connection tuning for [`TcpClientReceiver`].
#[derive(Debug, Clone)]
pub struct TcpClientOptions {
    pub max_packet_size: usize,
    pub connect_string: Option<String>,
    /// Reconnect attempts after the first failure; `None` retries forever.
    pub max_retries: Option<u32>,
    pub init_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub queue_capacity: usize,
}

enum ReadOutcome {
    Shutdown,
    Disconnected(io::Error),
}

/// Connects out to a feed and keeps reconnecting with exponential backoff.
///
/// Reading and handling run in separate tasks joined by a bounded channel. When the
/// channel is full the reader stops reading, which pushes back on the feed over TCP.
pub struct TcpClientReceiver {
    addr: String,
    handler: PacketHandler,
    options: TcpClientOptions,
    shutdown_token: CancellationToken,
    attempts: AtomicU32,
}

impl TcpClientReceiver {
    pub fn new(
        addr: String,
        handler: PacketHandler,
        options: TcpClientOptions,
        shutdown_token: CancellationToken,
    ) -> Self {
        TcpClientReceiver {
            addr,
            handler,
            options,
            shutdown_token,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connection attempts made so far, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub async fn start(&self) -> Result<(), ReceiverError> {
        let (packet_tx, mut packet_rx) =
            mpsc::channel::<Packet>(self.options.queue_capacity.max(1));

        let handler = self.handler.clone();
        let consumer = tokio::task::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                handler.handle(packet).await;
            }
        });

        let res = self.run_reader(packet_tx).await;

        if let Err(e) = consumer.await {
            error!("TCP: consumer for {} failed: {e}", self.addr);
        }
        info!("TCP client receiver for {} stopped", self.addr);
        res
    }

    async fn run_reader(&self, packet_tx: mpsc::Sender<Packet>) -> Result<(), ReceiverError> {
        let mut backoff = Backoff::new(self.options.init_retry_delay, self.options.max_retry_delay);
        let mut failures: u32 = 0;

        loop {
            let connect_res = tokio::select! {
                _ = self.shutdown_token.cancelled() => return Ok(()),
                res = self.connect() => res,
            };
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let delay = match connect_res {
                Ok(stream) => {
                    failures = 0;
                    backoff.reset();
                    info!("TCP: connected to {}", self.addr);
                    match self.read_stream(stream, &packet_tx).await {
                        ReadOutcome::Shutdown => return Ok(()),
                        ReadOutcome::Disconnected(e) => {
                            warn!("TCP: connection to {} lost: {e}", self.addr);
                        }
                    }
                    backoff.next_delay()
                }
                Err(e) if !is_transient(&e) => {
                    error!("TCP: cannot connect to {}: {e}", self.addr);
                    return Err(ReceiverError::Fatal {
                        addr: self.addr.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    failures += 1;
                    if self.options.max_retries.is_some_and(|max| failures > max) {
                        error!("TCP: giving up on {} after {failures} attempts: {e}", self.addr);
                        return Err(ReceiverError::RetriesExhausted {
                            addr: self.addr.clone(),
                            attempts: failures,
                            source: e,
                        });
                    }
                    let delay = backoff.next_delay();
                    warn!("TCP: connecting to {} failed: {e}; retrying in {delay:?}", self.addr);
                    delay
                }
            };

            tokio::select! {
                _ = self.shutdown_token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let connecting = TcpStream::connect(self.addr.as_str());
        let mut stream = timeout(self.options.connect_timeout, connecting)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        SockRef::from(&stream).set_keepalive(true)?;
        stream.set_nodelay(true)?;

        if let Some(connect_string) = &self.options.connect_string {
            debug!("TCP: sending connect string to {}", self.addr);
            stream.write_all(connect_string.as_bytes()).await?;
        }
        Ok(stream)
    }

    async fn read_stream(
        &self,
        mut stream: TcpStream,
        packet_tx: &mpsc::Sender<Packet>,
    ) -> ReadOutcome {
        let (host, port) = peer_parts(stream.peer_addr().ok(), &self.addr);
        let mut framer = LineFramer::new(self.options.max_packet_size, self.handler.delimiter());

        loop {
            let read_res = tokio::select! {
                _ = self.shutdown_token.cancelled() => return ReadOutcome::Shutdown,
                res = timeout(self.options.read_timeout, stream.read(framer.free_space())) => res,
            };

            let (data, outcome) = match read_res {
                Err(_) => (
                    None,
                    Some(io::Error::new(io::ErrorKind::TimedOut, "no data within read timeout")),
                ),
                Ok(Err(e)) => (None, Some(e)),
                Ok(Ok(0)) => (
                    framer.flush(),
                    Some(io::Error::new(io::ErrorKind::UnexpectedEof, "closed by peer")),
                ),
                Ok(Ok(bytes_read)) => (framer.commit(bytes_read), None),
            };

            if let Some(data) = data {
                let packet = self.handler.make_packet(data, Protocol::Tcp, &host, port);
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => return ReadOutcome::Shutdown,
                    res = packet_tx.send(packet) => {
                        if res.is_err() {
                            return ReadOutcome::Shutdown;
                        }
                    }
                }
            }

            if let Some(e) = outcome {
                return ReadOutcome::Disconnected(e);
            }
        }
    }
}

/// Accepts inbound feeds and serves each connection in its own task.
pub struct TcpServerReceiver {
    listener: TcpListener,
    handler: PacketHandler,
    max_packet_size: usize,
    shutdown_token: CancellationToken,
}

impl TcpServerReceiver {
    pub async fn bind(
        addr: &str,
        handler: PacketHandler,
        max_packet_size: usize,
        shutdown_token: CancellationToken,
    ) -> Result<Self, ReceiverError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ReceiverError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        if let Ok(local) = listener.local_addr() {
            info!("listening on TCP addr {local}");
        }

        Ok(TcpServerReceiver {
            listener,
            handler,
            max_packet_size,
            shutdown_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Accepts until shutdown, then waits for every connection task to finish.
    pub async fn start(&self) -> Result<(), ReceiverError> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    break;
                },
                accept_res = self.listener.accept() => {
                    let (conn, peer_addr) = match accept_res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("TCP: accept failed: {e}");
                            if pause_after_accept_error(&self.shutdown_token).await {
                                continue;
                            }
                            break;
                        }
                    };
                    info!("accepted TCP connection for peer {peer_addr}");
                    let shutdown_token = self.shutdown_token.clone();
                    let handler = self.handler.clone();
                    let max_packet_size = self.max_packet_size;
                    tracker.spawn(async move {
                        let stream = process_tcp_stream(conn, peer_addr, handler, max_packet_size);
                        let res = shutdown_token.run_until_cancelled(stream).await;
                        info!("connection to peer {peer_addr} terminated with result {res:?}");
                    });
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("TCP server receiver stopped");
        Ok(())
    }
}

async fn process_tcp_stream(
    mut conn: TcpStream,
    peer_addr: SocketAddr,
    handler: PacketHandler,
    max_packet_size: usize,
) -> io::Result<()> {
    let host = peer_addr.ip().to_string();
    let port = Some(peer_addr.port());
    let mut framer = LineFramer::new(max_packet_size, handler.delimiter());

    loop {
        let bytes_read = conn.read(framer.free_space()).await?;
        if bytes_read == 0 {
            if let Some(tail) = framer.flush() {
                let packet = handler.make_packet(tail, Protocol::Tcp, &host, port);
                handler.handle(packet).await;
            }
            return Ok(());
        }

        if let Some(data) = framer.commit(bytes_read) {
            let packet = handler.make_packet(data, Protocol::Tcp, &host, port);
            handler.handle(packet).await;
        }
    }
}

fn peer_parts(peer: Option<SocketAddr>, fallback: &str) -> (String, Option<u16>) {
    match peer {
        Some(peer) => (peer.ip().to_string(), Some(peer.port())),
        None => (fallback.to_string(), None),
    }
}
