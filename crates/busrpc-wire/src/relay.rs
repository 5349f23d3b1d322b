//! TCP relay: a broker reachable over the network.
//!
//! A [`RelayServer`] binds a TCP listener and gives every accepted socket its
//! own [`LocalConnection`] on a shared [`LocalBroker`]. Clients speak
//! [`RelayFrame`]s: `subscribe`, `unsubscribe` and `publish` go up, `message`
//! comes down. Frames on one socket are handled in order, so a client that
//! subscribes and then publishes is guaranteed to be subscribed first.
//!
//! [`RelayClient`] is the client half and implements [`Broker`].

use crate::broker::{Broker, BrokerMessage, MessageSink, WireError};
use crate::local::{LocalBroker, LocalConnection};
use crate::message::*;

use async_trait::async_trait;
use busrpc_types::config::{RelayConfig, DEFAULT_MAX_FRAME_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    hub: LocalBroker,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Bind the configured address and start accepting clients.
    pub async fn start(config: RelayConfig) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(config.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;

        info!("relay: listening on {}", local_addr);

        let server = Arc::new(Self {
            config,
            hub: LocalBroker::new(),
            local_addr,
        });

        let server_clone = Arc::clone(&server);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, server_clone).await;
        });

        Ok((server, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The subscription table all clients share.
    pub fn hub(&self) -> &LocalBroker {
        &self.hub
    }

    async fn accept_loop(listener: TcpListener, server: Arc<RelayServer>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("relay: accepted connection from {}", addr);
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream).await {
                            debug!("relay: client {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("relay: accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Serve one client until its socket closes.
    ///
    /// Messages for the client wait in a queue of at most
    /// `max_pending_messages`; a client that lets it fill up is dropped.
    async fn handle_client(&self, stream: TcpStream) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();
        let connection = self.hub.connection();
        let (sink, mut inbound) = mpsc::unbounded_channel::<BrokerMessage>();
        let max = self.config.max_pending_messages.max(1);
        let (queue, mut outbound) = mpsc::channel::<BrokerMessage>(max);

        // Drains the hub sink without waiting on the socket.
        let mut forwarder = tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                match queue.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => return WireError::Lagged { max },
                    Err(TrySendError::Closed(_)) => return WireError::ConnectionClosed,
                }
            }
            WireError::ConnectionClosed
        });

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let frame = RelayFrame::message(&msg.channel, &msg.payload);
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("relay: write to client failed: {}", e);
                    break;
                }
            }
        });

        let result = tokio::select! {
            result = self.client_loop(&mut reader, &connection, sink) => result,
            stopped = &mut forwarder => {
                let e = stopped.unwrap_or(WireError::ConnectionClosed);
                warn!("relay: dropping client: {}", e);
                Err(e)
            }
        };

        let _ = connection.close().await;
        forwarder.abort();
        writer_task.abort();
        result
    }

    async fn client_loop<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        connection: &LocalConnection,
        sink: MessageSink,
    ) -> Result<(), WireError> {
        loop {
            let frame = match read_frame(reader, self.config.max_frame_size).await {
                Ok(f) => f,
                Err(WireError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match frame {
                RelayFrame::Subscribe { channels } => {
                    debug!(count = channels.len(), "relay: subscribe");
                    connection.subscribe(&channels, sink.clone()).await?;
                }
                RelayFrame::Unsubscribe { channels } => {
                    debug!(count = channels.len(), "relay: unsubscribe");
                    connection.unsubscribe(&channels).await?;
                }
                RelayFrame::Publish { channel, payload } => match decode_payload(&payload) {
                    Ok(bytes) => connection.publish(&channel, bytes).await?,
                    Err(e) => warn!(channel = %channel, "relay: dropping undecodable payload: {}", e),
                },
                RelayFrame::Message { channel, .. } => {
                    warn!(channel = %channel, "relay: unexpected message frame from client");
                }
            }
        }
    }
}

/// Broker connection to a [`RelayServer`].
pub struct RelayClient {
    writer: Mutex<OwnedWriteHalf>,
    sinks: Arc<RwLock<HashMap<String, MessageSink>>>,
    reader_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl RelayClient {
    /// Connect to the relay at `addr`.
    pub async fn connect(addr: &str) -> Result<Self, WireError> {
        Self::connect_with_limit(addr, DEFAULT_MAX_FRAME_SIZE).await
    }

    /// Connect, rejecting inbound frames larger than `max_frame_size`.
    pub async fn connect_with_limit(addr: &str, max_frame_size: u32) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, writer) = stream.into_split();
        let sinks: Arc<RwLock<HashMap<String, MessageSink>>> = Arc::default();

        let routes = Arc::clone(&sinks);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut reader, max_frame_size).await {
                    Ok(f) => f,
                    Err(WireError::ConnectionClosed) => {
                        debug!("relay client: connection closed by relay");
                        return;
                    }
                    Err(e) => {
                        warn!("relay client: read failed: {}", e);
                        return;
                    }
                };
                match frame {
                    RelayFrame::Message { channel, payload } => {
                        let payload = match decode_payload(&payload) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(channel = %channel, "relay client: undecodable payload: {}", e);
                                continue;
                            }
                        };
                        let sink = routes
                            .read()
                            .unwrap_or_else(|e| e.into_inner())
                            .get(&channel)
                            .cloned();
                        if let Some(sink) = sink {
                            let _ = sink.send(BrokerMessage { channel, payload });
                        }
                    }
                    other => warn!("relay client: unexpected frame {:?}", other),
                }
            }
        });

        info!("relay client: connected to {}", addr);
        Ok(Self {
            writer: Mutex::new(writer),
            sinks,
            reader_task,
            closed: AtomicBool::new(false),
        })
    }

    async fn send(&self, frame: &RelayFrame) -> Result<(), WireError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }
}

#[async_trait]
impl Broker for RelayClient {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), WireError> {
        self.send(&RelayFrame::publish(channel, &payload)).await
    }

    async fn subscribe(&self, channels: &[String], sink: MessageSink) -> Result<(), WireError> {
        {
            let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
            for channel in channels {
                sinks.insert(channel.clone(), sink.clone());
            }
        }
        self.send(&RelayFrame::Subscribe {
            channels: channels.to_vec(),
        })
        .await
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), WireError> {
        let result = self
            .send(&RelayFrame::Unsubscribe {
                channels: channels.to_vec(),
            })
            .await;
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        for channel in channels {
            sinks.remove(channel);
        }
        result
    }

    async fn close(&self) -> Result<(), WireError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.reader_task.abort();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &RelayFrame,
) -> Result<(), WireError> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<RelayFrame, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_frame_size {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let frame = decode_frame(&body)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> RelayConfig {
        RelayConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..RelayConfig::default()
        }
    }

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_relay_publish_subscribe() {
        let (server, _task) = RelayServer::start(test_config()).await.unwrap();
        let addr = server.local_addr().to_string();

        let subscriber = RelayClient::connect(&addr).await.unwrap();
        let publisher = RelayClient::connect(&addr).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe(&channels(&["rp:message:p1"]), tx)
            .await
            .unwrap();

        // Give the relay a moment to apply the subscription
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.hub().subscriber_count("rp:message:p1"), 1);

        publisher
            .publish("rp:message:p1", b"hello".to_vec())
            .await
            .unwrap();

        let msg = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, "rp:message:p1");
        assert_eq!(msg.payload, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_relay_releases_subscriptions_on_disconnect() {
        let (server, _task) = RelayServer::start(test_config()).await.unwrap();
        let addr = server.local_addr().to_string();

        let client = RelayClient::connect(&addr).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        client.subscribe(&channels(&["a", "b"]), tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.hub().subscriber_count("a"), 1);

        client.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.hub().subscriber_count("a"), 0);
        assert_eq!(server.hub().subscriber_count("b"), 0);
        assert!(matches!(
            client.publish("a", vec![]).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_relay_drops_client_that_falls_behind() {
        let config = RelayConfig {
            max_pending_messages: 4,
            ..test_config()
        };
        let (server, _task) = RelayServer::start(config).await.unwrap();

        // A raw client that subscribes and never reads.
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(
            &mut stream,
            &RelayFrame::Subscribe {
                channels: channels(&["rp:message:slow"]),
            },
        )
        .await
        .unwrap();
        timeout(Duration::from_secs(2), async {
            while server.hub().subscriber_count("rp:message:slow") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let publisher = server.hub().connection();
        for i in 0..64u8 {
            publisher
                .publish("rp:message:slow", vec![i; 1024])
                .await
                .unwrap();
        }

        timeout(Duration::from_secs(2), async {
            while server.hub().subscriber_count("rp:message:slow") != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut bytes = (DEFAULT_MAX_FRAME_SIZE + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let mut reader = bytes.as_slice();
        match read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, DEFAULT_MAX_FRAME_SIZE + 1);
                assert_eq!(max, DEFAULT_MAX_FRAME_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_stream_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &RelayFrame::publish("x", b"1"))
            .await
            .unwrap();
        write_frame(
            &mut buf,
            &RelayFrame::Unsubscribe {
                channels: channels(&["x"]),
            },
        )
        .await
        .unwrap();

        let mut reader = buf.as_slice();
        assert!(matches!(
            read_frame(&mut reader, 1024).await.unwrap(),
            RelayFrame::Publish { .. }
        ));
        assert!(matches!(
            read_frame(&mut reader, 1024).await.unwrap(),
            RelayFrame::Unsubscribe { .. }
        ));
        assert!(matches!(
            read_frame(&mut reader, 1024).await,
            Err(WireError::ConnectionClosed)
        ));
    }
}
