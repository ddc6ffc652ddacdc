use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get};
use gid_wire::{Frame, FrameReader, FrameWriter, LengthCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::directory::ConnectionHandle;
use crate::metrics::RelayMetrics;
use crate::router::{Dispatch, Router, RouterError, RouterSettings};

pub struct RelayServer {
    config: ServerConfig,
    router: Arc<Router>,
    metrics: Arc<RelayMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(RelayMetrics::new()?);
        let router = Arc::new(Router::new(RouterSettings::from(&config), Arc::clone(&metrics)));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            router,
            metrics,
            shutdown_tx,
        })
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address, serve until Ctrl-C/SIGTERM.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("gid-relay listening on {}", listener.local_addr()?);

        if let Some(addr) = self.config.metrics_addr {
            self.spawn_metrics_endpoint(addr).await?;
        }

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            Self::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is requested.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let limits = ConnectionLimits::from(&self.config);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let router = Arc::clone(&self.router);
                            let metrics = Arc::clone(&self.metrics);
                            let shutdown = self.shutdown_tx.subscribe();
                            connections.spawn(async move {
                                handle_connection(stream, peer, router, metrics, limits, shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks as we go
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutting down, waiting for {} connections", connections.len());
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_timeout(), drain).await.is_err() {
            warn!("Shutdown timeout elapsed, aborting remaining connections");
            connections.abort_all();
        }
        info!("gid-relay stopped");
        Ok(())
    }

    async fn spawn_metrics_endpoint(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let app = axum::Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::clone(&self.metrics))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        let listener = TcpListener::bind(addr).await?;
        info!("HTTP server for health/metrics listening on {}", addr);

        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let stop = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                error!("HTTP server error: {}", e);
            }
        });
        Ok(())
    }

    async fn shutdown_signal() {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Per-connection framing and outbound queue limits.
#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    codec: LengthCodec,
    queue_capacity: usize,
    max_overflows: usize,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            codec: LengthCodec::new(config.max_frame_size),
            queue_capacity: config.outbound_queue_capacity,
            max_overflows: config.max_outbound_overflows,
        }
    }
}

/// One agent connection: registration, then a read loop feeding the router.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    metrics: Arc<RelayMetrics>,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("New connection from {}", peer);
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, limits.codec);
    let mut writer = FrameWriter::new(write_half, limits.codec);

    let (tx, mut rx) = mpsc::channel::<Frame>(limits.queue_capacity);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_frame(&frame).await {
                debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let first = tokio::select! {
        frame = reader.read_frame() => frame,
        _ = shutdown.changed() => Ok(None),
    };
    let (agent_id, public_key_hex) = match first {
        Ok(Some(Frame::Register { agent_id, public_key_hex })) => (agent_id, public_key_hex),
        Ok(Some(other)) => {
            warn!("{} sent {} before registering, closing", peer, other.tag());
            metrics.registrations_rejected.inc();
            return;
        }
        Ok(None) => {
            debug!("{} closed before registering", peer);
            return;
        }
        Err(e) => {
            warn!("{} sent an unreadable first frame: {}", peer, e);
            metrics.registrations_rejected.inc();
            return;
        }
    };

    let serial = router.next_connection_serial();
    let handle = ConnectionHandle::new(serial, tx.clone(), limits.max_overflows);
    if let Err(e) = router.register(&agent_id, &public_key_hex, handle.clone()) {
        warn!("{} ({}): {}", agent_id, peer, e);
        metrics.registrations_rejected.inc();
        return;
    }
    info!("Agent {} registered from {}", agent_id, peer);

    loop {
        let next = tokio::select! {
            frame = reader.read_frame() => frame,
            _ = handle.evicted() => {
                warn!("{} ({}) is not draining its queue, closing", agent_id, peer);
                metrics.connections_evicted.inc();
                break;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match next {
            Ok(Some(frame)) => match router.handle(&agent_id, frame) {
                Ok(Dispatch::Reply(reply)) => {
                    // Replies wait for room rather than overflow
                    let sent = tokio::select! {
                        sent = tx.send(reply) => sent.is_ok(),
                        _ = handle.evicted() => {
                            warn!("{} ({}) is not draining its queue, closing", agent_id, peer);
                            metrics.connections_evicted.inc();
                            false
                        }
                    };
                    if !sent {
                        break;
                    }
                }
                Ok(Dispatch::Routed(_)) | Ok(Dispatch::Signal { .. }) => {}
                Err(RouterError::Malformed(reason)) => {
                    warn!("Dropping frame from {}: {}", agent_id, reason);
                    metrics.malformed_frames.inc();
                }
                Err(e) => {
                    warn!("Routing error for {}: {}", agent_id, e);
                    metrics.malformed_frames.inc();
                }
            },
            Ok(None) => break,
            Err(e) if e.is_recoverable() => {
                warn!("Dropping frame from {}: {}", agent_id, e);
                metrics.malformed_frames.inc();
            }
            Err(e) => {
                debug!("Connection {} for {} failed: {}", serial, agent_id, e);
                break;
            }
        }
    }

    router.disconnect(&agent_id, serial);
    drop(tx);
    let _ = writer_task.await;
    info!("Agent {} disconnected ({})", agent_id, peer);
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(metrics): State<Arc<RelayMetrics>>) -> axum::response::Response {
    match metrics.export_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
