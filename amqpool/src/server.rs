//! Implements the client-facing server
//!
//! The server accepts downstream connections, runs one session task per
//! client, and choreographs the two-phase shutdown: stop accepting first,
//! forcibly disconnect later. Session tasks are tracked so the binary can
//! block until the last client is gone.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use amqpool_frames::method::REPLY_CONNECTION_FORCED;
use amqpool_frames::{Close, Frame, Method};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::client::{ClientSession, ClientWriter};
use crate::config::Config;
use crate::metrics::MetricsSink;
use crate::pool::UpstreamPool;

#[derive(Debug, Clone)]
struct SessionHandle {
    writer: Arc<ClientWriter>,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct SessionRegistry {
    sessions: parking_lot::Mutex<HashMap<u64, SessionHandle>>,
}

impl SessionRegistry {
    fn insert(&self, id: u64, writer: Arc<ClientWriter>, token: CancellationToken) {
        self.sessions
            .lock()
            .insert(id, SessionHandle { writer, token });
    }

    fn remove(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    fn drain(&self) -> Vec<SessionHandle> {
        self.sessions.lock().drain().map(|(_, h)| h).collect()
    }
}

/// The proxy server
#[derive(Debug)]
pub struct Server {
    config: Config,
    pool: Arc<UpstreamPool>,
    metrics: Arc<dyn MetricsSink>,
    registry: Arc<SessionRegistry>,
    tracker: TaskTracker,
    accept_token: CancellationToken,
    next_session: AtomicU64,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a server; nothing is bound until [`listen`](Self::listen)
    pub fn new(config: Config, pool: Arc<UpstreamPool>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            pool,
            metrics,
            registry: Arc::new(SessionRegistry::default()),
            tracker: TaskTracker::new(),
            accept_token: CancellationToken::new(),
            next_session: AtomicU64::new(0),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and accepts clients until
    /// [`stop_accepting_clients`](Self::stop_accepting_clients) is called.
    /// Existing sessions keep running after this returns.
    pub async fn listen(&self) -> Result<(), io::Error> {
        let listener = TcpListener::bind((
            self.config.listen_address.as_str(),
            self.config.listen_port,
        ))
        .await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(%local, "listening for client connections");

        loop {
            tokio::select! {
                _ = self.accept_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(err) => warn!(?err, "accept failed"),
                },
            }
        }
        info!("stopped accepting client connections");
        Ok(())
    }

    /// The address the listener actually bound, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of live client sessions
    pub fn client_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Closes the listener; existing sessions are untouched
    pub fn stop_accepting_clients(&self) {
        self.accept_token.cancel();
    }

    /// Sends a Connection.Close to every live client and tears their
    /// sessions down
    pub async fn disconnect_clients(&self) {
        let handles = self.registry.drain();
        info!(count = handles.len(), "disconnecting clients");
        for handle in handles {
            let close = Close::new(
                REPLY_CONNECTION_FORCED,
                "CONNECTION_FORCED - proxy is shutting down",
            );
            let _ = handle
                .writer
                .write_frame(Frame::method(0, Method::Close(close)))
                .await;
            handle.token.cancel();
        }
    }

    /// Waits until every session task has finished
    pub async fn wait_for_clients(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(&self.pool);
        let metrics = Arc::clone(&self.metrics);
        let registry = Arc::clone(&self.registry);

        self.tracker.spawn(async move {
            metrics.incr("client.connected");
            match ClientSession::accept(stream, id, pool, Arc::clone(&metrics)).await {
                Ok(session) => {
                    let token = CancellationToken::new();
                    registry.insert(id, session.writer(), token.clone());
                    session.run(token).await;
                    registry.remove(id);
                }
                Err(err) => {
                    metrics.incr("client.handshake_failed");
                    debug!(?err, %peer, "client handshake failed");
                }
            }
            metrics.incr("client.disconnected");
        });
    }
}
