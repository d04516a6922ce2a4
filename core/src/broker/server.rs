use crate::broker::router::{MessageRouter, RouterEvent};
use crate::config::BrokerConfig;
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::protocol::{
    ChannelName, ErrorCode, FrameCodec, Payload, RequestMessage, ResponseMessage, TopicName,
};
use crate::registry::PeerId;
use crate::{RelayError, Result};
use bytes::Bytes;
use futures::SinkExt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// The broker server: owns the listener, spawns one connection task per
/// peer, and runs the routing core as a single background task.
pub struct BrokerServer {
    config: BrokerConfig,
    router: MessageRouter,
    events_tx: mpsc::UnboundedSender<RouterEvent>,
    events_rx: mpsc::UnboundedReceiver<RouterEvent>,
    shutdown_tx: broadcast::Sender<()>,
    metrics: Arc<BrokerMetrics>,
}

impl BrokerServer {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate().map_err(RelayError::Config)?;

        let metrics = Arc::new(BrokerMetrics::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(16);
        let router = MessageRouter::new(config.name.clone(), Arc::clone(&metrics));

        Ok(Self {
            config,
            router,
            events_tx,
            events_rx,
            shutdown_tx,
            metrics,
        })
    }

    /// Cloneable handle for embedders: broker-originated requests, local
    /// response handlers, shutdown, and metrics.
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            events: self.events_tx.clone(),
            shutdown: self.shutdown_tx.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run the broker until shutdown is signalled.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            router,
            events_tx,
            events_rx,
            shutdown_tx,
            metrics,
        } = self;

        tokio::spawn(router.run(events_rx));

        let next_peer = Arc::new(AtomicU64::new(1));
        let active = Arc::new(AtomicUsize::new(0));

        #[cfg(unix)]
        if let Some(path) = config.socket_path.clone() {
            let listener = Self::bind_unix(&path).await?;
            info!("relaymq broker '{}' listening on {}", config.name, path);
            return Self::accept_unix(
                listener, &config, shutdown_tx, events_tx, metrics, next_peer, active,
            )
            .await;
        }
        #[cfg(not(unix))]
        if config.socket_path.is_some() {
            return Err(RelayError::Config(
                "socket_path requires a unix platform".to_string(),
            ));
        }

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("relaymq broker '{}' listening on {}", config.name, addr);
        Self::accept_tcp(
            listener, &config, shutdown_tx, events_tx, metrics, next_peer, active,
        )
        .await
    }

    async fn accept_tcp(
        listener: TcpListener,
        config: &BrokerConfig,
        shutdown_tx: broadcast::Sender<()>,
        events_tx: mpsc::UnboundedSender<RouterEvent>,
        metrics: Arc<BrokerMetrics>,
        next_peer: Arc<AtomicU64>,
        active: Arc<AtomicUsize>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if active.load(Ordering::Relaxed) >= config.max_connections {
                            warn!("connection limit reached; dropping peer {}", peer_addr);
                            continue;
                        }
                        if let Err(err) = Self::tune_socket(&stream) {
                            warn!("failed to tune socket for {}: {}", peer_addr, err);
                        }
                        let peer = next_peer.fetch_add(1, Ordering::Relaxed);
                        info!("peer {} connected from {}", peer, peer_addr);
                        Self::spawn_connection(
                            stream,
                            peer,
                            config.max_frame_size,
                            events_tx.clone(),
                            Arc::clone(&metrics),
                            Arc::clone(&active),
                        );
                    }
                    Err(err) => error!("failed to accept connection: {}", err),
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received; closing listener");
                    break;
                }
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn accept_unix(
        listener: UnixListener,
        config: &BrokerConfig,
        shutdown_tx: broadcast::Sender<()>,
        events_tx: mpsc::UnboundedSender<RouterEvent>,
        metrics: Arc<BrokerMetrics>,
        next_peer: Arc<AtomicU64>,
        active: Arc<AtomicUsize>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if active.load(Ordering::Relaxed) >= config.max_connections {
                            warn!("connection limit reached; dropping local peer");
                            continue;
                        }
                        let peer = next_peer.fetch_add(1, Ordering::Relaxed);
                        info!("peer {} connected on local socket", peer);
                        Self::spawn_connection(
                            stream,
                            peer,
                            config.max_frame_size,
                            events_tx.clone(),
                            Arc::clone(&metrics),
                            Arc::clone(&active),
                        );
                    }
                    Err(err) => error!("failed to accept local connection: {}", err),
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received; closing listener");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Bind a unix listener; a stale socket file left by a dead broker is
    /// unlinked and the bind retried after a short delay.
    #[cfg(unix)]
    async fn bind_unix(path: &str) -> Result<UnixListener> {
        match UnixListener::bind(path) {
            Ok(listener) => Ok(listener),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                warn!("socket path {} in use; unlinking stale socket", path);
                tokio::fs::remove_file(path).await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(UnixListener::bind(path)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn tune_socket(stream: &TcpStream) -> io::Result<()> {
        use socket2::SockRef;

        let sock = SockRef::from(stream);
        sock.set_nodelay(true)?;
        sock.set_keepalive(true)?;
        Ok(())
    }

    fn spawn_connection<S>(
        stream: S,
        peer: PeerId,
        max_frame_size: usize,
        events_tx: mpsc::UnboundedSender<RouterEvent>,
        metrics: Arc<BrokerMetrics>,
        active: Arc<AtomicUsize>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        if events_tx
            .send(RouterEvent::Connected {
                peer,
                sender: outbound_tx,
            })
            .is_err()
        {
            return;
        }
        active.fetch_add(1, Ordering::Relaxed);
        metrics.connection_opened();

        tokio::spawn(async move {
            Self::drive_connection(stream, peer, max_frame_size, &events_tx, outbound_rx).await;
            let _ = events_tx.send(RouterEvent::Disconnected { peer });
            metrics.connection_closed();
            active.fetch_sub(1, Ordering::Relaxed);
            debug!("peer {} disconnected", peer);
        });
    }

    /// One task per peer: reads reassembled frames into the router and
    /// writes router output back to the socket. Sequential by design, so
    /// per-peer inbound order is preserved end to end. The task ends when
    /// the stream closes, a framing violation occurs, or the router drops
    /// the peer's outbound queue.
    async fn drive_connection<S>(
        stream: S,
        peer: PeerId,
        max_frame_size: usize,
        events: &mpsc::UnboundedSender<RouterEvent>,
        mut outbound: mpsc::UnboundedReceiver<Bytes>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, FrameCodec::with_max_frame_size(max_frame_size));
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = framed.send(frame).await {
                            debug!("write to peer {} failed: {}", peer, err);
                            break;
                        }
                    }
                    None => break,
                },
                inbound = tokio_stream::StreamExt::next(&mut framed) => match inbound {
                    Some(Ok(frame)) => {
                        if events.send(RouterEvent::Frame { peer, frame }).is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("closing peer {}: {}", peer, err);
                        break;
                    }
                    None => break,
                },
            }
        }
    }
}

/// Cloneable embedder-facing handle to a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    events: mpsc::UnboundedSender<RouterEvent>,
    shutdown: broadcast::Sender<()>,
    metrics: Arc<BrokerMetrics>,
}

impl BrokerHandle {
    /// Send a broker-originated `req` to a registered channel and await the
    /// correlated `res`. Fails fast when the channel does not exist and
    /// when the channel dies before responding.
    pub async fn request(
        &self,
        target: impl Into<ChannelName>,
        topic: impl Into<TopicName>,
        payload: Payload,
    ) -> Result<ResponseMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(RouterEvent::LocalRequest {
                target: target.into(),
                topic: topic.into(),
                payload,
                reply: reply_tx,
            })
            .map_err(|_| RelayError::Unavailable("router is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| RelayError::Unavailable("router dropped the request".to_string()))?
    }

    /// Install an in-process handler serving `topic` on the broker's own
    /// channel. The handler runs on the routing task and must not block.
    pub fn add_response_handler<F>(&self, topic: impl Into<TopicName>, handler: F) -> Result<()>
    where
        F: Fn(&RequestMessage) -> std::result::Result<Payload, ErrorCode> + Send + 'static,
    {
        self.events
            .send(RouterEvent::AddLocalHandler {
                topic: topic.into(),
                handler: Box::new(handler),
            })
            .map_err(|_| RelayError::Unavailable("router is not running".to_string()))
    }

    /// Signal the accept loop to stop taking new connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
