use std::{
    convert::Infallible,
    pin::pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Body, Client, Method, Request, RequestBuilder, StatusCode, Url};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{format_packet, DataFormat, Sink};
use crate::{
    error::{SinkError, SinkErrorKind},
    packet::Packet,
};

const SINK_NAME: &str = "http";
const RETRY_WAIT: Duration = Duration::from_secs(15);
const REQUEST_GRACE: Duration = Duration::from_secs(35);

/// Streams formatted packets to an HTTP endpoint.
///
/// A background task keeps a single chunked `POST` open and periodically replaces it,
/// so `publish` only has to enqueue bytes.
pub struct HttpSink {
    data_format: DataFormat,
    queue: mpsc::Sender<Vec<u8>>,
    failure: Arc<Mutex<Option<SinkError>>>,
}

impl HttpSink {
    pub fn spawn(
        url: Url,
        auth_token: Option<Arc<str>>,
        data_format: DataFormat,
        queue_capacity: usize,
        recycle_interval: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        let (queue, message_rx) = mpsc::channel(queue_capacity);
        let failure = Arc::new(Mutex::new(None));

        let uploader = Uploader {
            client: Client::new(),
            url,
            auth_token,
            recycle_interval,
            failure: failure.clone(),
        };
        tokio::task::spawn(async move {
            uploader.run(shutdown_token, message_rx).await;
            info!("http uploader stopped");
        });

        HttpSink {
            data_format,
            queue,
            failure,
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn publish(&self, packet: &Packet) -> Result<(), SinkError> {
        if let Some(err) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }

        let data = format_packet(packet, self.data_format);
        if data.is_empty() {
            return Ok(());
        }

        self.queue.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => {
                SinkError::new(SINK_NAME, SinkErrorKind::Unavailable, "upload queue is full")
            }
            TrySendError::Closed(_) => {
                SinkError::new(SINK_NAME, SinkErrorKind::Closed, "uploader has stopped")
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum UploadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request deadline expired")]
    Deadline,
}

impl UploadError {
    fn status(&self) -> Option<StatusCode> {
        match self {
            UploadError::Request(e) => e.status(),
            UploadError::Deadline => None,
        }
    }
}

struct Uploader {
    client: Client,
    url: Url,
    auth_token: Option<Arc<str>>,
    recycle_interval: Duration,
    failure: Arc<Mutex<Option<SinkError>>>,
}

impl Uploader {
    async fn run(self, shutdown_token: CancellationToken, mut message_rx: mpsc::Receiver<Vec<u8>>) {
        let mut recovered_msg = None;

        loop {
            let (upload_tx, upload_rx) = mpsc::channel(1);
            let mut upload_task = pin!(self.run_single_request(upload_rx));
            let upload_start_instant = Instant::now();

            let mut recycle_timeout = pin!(tokio::time::sleep(self.recycle_interval));

            if let Some(msg) = recovered_msg.take() {
                if let Err(er) = upload_tx.send(msg).await {
                    recovered_msg = Some(er.0);
                }
            }

            loop {
                tokio::select! {
                    msg_result = message_rx.recv() => {
                        let Some(msg) = msg_result else {
                            info!("upload stream source shut down, stopping upload");
                            drop(upload_tx);
                            self.finish(upload_task.await);
                            return;
                        };
                        if let Err(er) = upload_tx.send(Ok(msg)).await {
                            recovered_msg = Some(er.0);
                            break;
                        }
                    },
                    _ = shutdown_token.cancelled() => {
                        info!("shutdown requested, finishing upload");
                        drop(upload_tx);
                        self.finish(upload_task.await);
                        return;
                    },
                    _ = &mut recycle_timeout => {
                        info!("recycling connection");
                        drop(upload_tx);
                        if self.finish(upload_task.await) {
                            return;
                        }
                        break;
                    }
                    upload_result = &mut upload_task => {
                        let failed = upload_result.is_err();
                        if self.finish(upload_result) {
                            return;
                        }
                        let wait_deadline = upload_start_instant + RETRY_WAIT;
                        if failed && wait_deadline > Instant::now() {
                            info!("waiting until {wait_deadline:?} before retrying");
                            tokio::select! {
                                _ = tokio::time::sleep_until(wait_deadline) => {},
                                _ = shutdown_token.cancelled() => {
                                    return;
                                }
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Logs the outcome of one request. Returns true when uploading must stop for good.
    fn finish(&self, result: Result<(), UploadError>) -> bool {
        let Err(e) = result else {
            return false;
        };

        match e.status() {
            Some(status)
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                error!("upload rejected with {status}, disabling http sink");
                *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(SinkError::new(
                    SINK_NAME,
                    SinkErrorKind::PermissionDenied,
                    format!("endpoint answered {status}"),
                ));
                true
            }
            _ => {
                error!("error uploading: {e}");
                false
            }
        }
    }

    async fn run_single_request(
        &self,
        message_rx: mpsc::Receiver<Result<Vec<u8>, Infallible>>,
    ) -> Result<(), UploadError> {
        let request = Request::new(Method::POST, self.url.clone());
        let mut builder = RequestBuilder::from_parts(self.client.clone(), request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let (client, req_r) = builder
            .body(Body::wrap_stream(ReceiverStream::new(message_rx)))
            .build_split();
        let req = req_r?;

        info!("launching upload connection to {}", self.url);

        let deadline = self.recycle_interval + REQUEST_GRACE;
        let res = tokio::time::timeout(deadline, client.execute(req))
            .await
            .map_err(|_| {
                warn!("Request deadline expired!");
                UploadError::Deadline
            })??
            .error_for_status()?;

        info!("upload finished cleanly with status {}", res.status());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::packet::Protocol;

    const UNAUTHORIZED: &[u8] =
        b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

    fn sink_for(addr: SocketAddr, queue_capacity: usize, token: CancellationToken) -> HttpSink {
        HttpSink::spawn(
            Url::parse(&format!("http://{addr}/ais")).unwrap(),
            Some(Arc::from("token")),
            DataFormat::Raw,
            queue_capacity,
            Duration::from_secs(55),
            token,
        )
    }

    fn packet(data: Vec<u8>) -> Packet {
        Packet::new(data, Protocol::Tcp, "127.0.0.1")
    }

    /// Publishes until an error comes back or `attempts` runs out.
    async fn first_error(sink: &HttpSink, data: &[u8], attempts: usize) -> Option<SinkError> {
        for _ in 0..attempts {
            if let Err(e) = sink.publish(&packet(data.to_vec())).await {
                return Some(e);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_permission_denied() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = server.accept().await else {
                    return;
                };
                let mut request = [0u8; 4096];
                _ = conn.read(&mut request).await;
                _ = conn.write_all(UNAUTHORIZED).await;
            }
        });

        let sink = sink_for(addr, 16, CancellationToken::new());
        let err = first_error(&sink, b"!AIVDM,1,1,,A,x,0\n", 100).await.unwrap();

        assert_eq!(err.kind, SinkErrorKind::PermissionDenied);
        assert!(err.is_fatal());
        // Remembered for every later publish.
        let again = sink.publish(&packet(b"!AIVDM,1,1,,A,y,0\n".to_vec())).await;
        assert_eq!(again.unwrap_err().kind, SinkErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_full_queue_is_unavailable() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept, then never read.
            let mut held = Vec::new();
            while let Ok((conn, _)) = server.accept().await {
                held.push(conn);
            }
        });

        let sink = sink_for(addr, 2, CancellationToken::new());
        let err = first_error(&sink, &vec![b'x'; 1 << 20], 64).await.unwrap();

        assert_eq!(err.kind, SinkErrorKind::Unavailable);
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_closed() {
        let unused = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let token = CancellationToken::new();
        let sink = sink_for(unused, 16, token.clone());

        token.cancel();
        let mut last = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            last = sink.publish(&packet(b"!AIVDM,1,1,,A,x,0\n".to_vec())).await.err();
            if last.as_ref().is_some_and(|e| e.kind == SinkErrorKind::Closed) {
                break;
            }
        }

        assert_eq!(last.map(|e| e.kind), Some(SinkErrorKind::Closed));
    }

    #[test]
    fn test_upload_error_status() {
        assert_eq!(UploadError::Deadline.status(), None);
    }
}
