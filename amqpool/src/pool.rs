//! Implements the upstream connection pool
//!
//! Broker connections are grouped by the credentials a client presented.
//! Concurrent clients with the same credentials share one connection, each
//! on its own set of wire channels; a connection whose last channel closed
//! stays pooled, stamped idle, until the reaper closes it after the
//! configured timeout. The pool mutex only ever guards map manipulation;
//! dialing and closing happen outside it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::metrics::MetricsSink;
use crate::upstream::Upstream;

const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// The pool key. Clients presenting the same vhost, user, and password share
/// one upstream connection; anything else gets its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    /// Virtual host from Connection.Open
    pub vhost: String,
    /// User from the SASL response
    pub user: String,
    /// Password from the SASL response
    pub password: String,
}

/// Pool of upstream connections, keyed by credentials
pub struct UpstreamPool {
    upstreams: parking_lot::Mutex<HashMap<Credentials, Vec<Upstream>>>,
    config: UpstreamConfig,
    tls: Option<TlsConnector>,
    idle_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamPool")
            .field("config", &self.config)
            .field("idle_timeout", &self.idle_timeout)
            .field("connections", &self.connections())
            .finish()
    }
}

impl UpstreamPool {
    /// Creates a pool dialing the given broker
    pub fn new(
        config: UpstreamConfig,
        idle_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let tls = config.tls.then(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(tls_config))
        });
        Self {
            upstreams: parking_lot::Mutex::new(HashMap::new()),
            config,
            tls,
            idle_timeout,
            metrics,
        }
    }

    /// Number of live pooled connections
    pub fn connections(&self) -> usize {
        self.upstreams
            .lock()
            .values()
            .flat_map(|list| list.iter())
            .filter(|upstream| !upstream.is_closed())
            .count()
    }

    /// Hands out an upstream for the credentials: the most recent live
    /// connection with a free channel if there is one, a freshly dialed one
    /// otherwise. Dead connections found along the way are dropped.
    pub(crate) async fn borrow(&self, credentials: &Credentials) -> Result<Upstream, UpstreamError> {
        let existing = {
            let mut upstreams = self.upstreams.lock();
            if let Some(list) = upstreams.get_mut(credentials) {
                list.retain(|upstream| !upstream.is_closed());
                list.iter().rev().find(|u| u.has_capacity()).cloned()
            } else {
                None
            }
        };
        if let Some(upstream) = existing {
            trace!("reusing pooled upstream connection");
            self.metrics.incr("upstream.reused");
            upstream.touch();
            return Ok(upstream);
        }

        // dial outside the pool mutex so slow connects do not serialize
        let upstream = Upstream::connect(
            &self.config,
            self.tls.as_ref(),
            credentials,
            Arc::clone(&self.metrics),
        )
        .await?;
        self.metrics.incr("upstream.created");

        let mut upstreams = self.upstreams.lock();
        upstreams
            .entry(credentials.clone())
            .or_default()
            .push(upstream.clone());
        self.metrics.gauge(
            "pool.connections",
            upstreams.values().map(Vec::len).sum::<usize>() as u64,
        );
        Ok(upstream)
    }

    /// Called when a session is done with its upstream. The connection never
    /// left the pool; this stamps the idle clock once no channels remain
    /// bound, which is what the reaper's timeout runs against.
    pub(crate) fn release(&self, upstream: Upstream) {
        if upstream.is_closed() {
            return;
        }
        if upstream.bound_channels() == 0 {
            upstream.touch();
        }
    }

    /// Spawns the background task that prunes dead connections and closes
    /// ones that have been idle past the timeout
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => pool.reap().await,
                }
            }
        })
    }

    async fn reap(&self) {
        let expired: Vec<Upstream> = {
            let mut upstreams = self.upstreams.lock();
            let mut expired = Vec::new();
            for list in upstreams.values_mut() {
                let mut kept = Vec::with_capacity(list.len());
                for upstream in list.drain(..) {
                    if upstream.is_closed() {
                        continue;
                    }
                    if upstream.bound_channels() == 0 && upstream.idle_age() > self.idle_timeout {
                        expired.push(upstream);
                    } else {
                        kept.push(upstream);
                    }
                }
                *list = kept;
            }
            upstreams.retain(|_, list| !list.is_empty());
            expired
        };

        for upstream in expired {
            debug!("closing idle-timed-out upstream connection");
            self.metrics.incr("upstream.idle_closed");
            upstream.close().await;
        }
    }

    /// Drains the pool, closing every connection gracefully
    pub async fn close_all(&self) {
        let all: Vec<Upstream> = {
            let mut upstreams = self.upstreams.lock();
            upstreams.drain().flat_map(|(_, list)| list).collect()
        };
        for upstream in all {
            upstream.close().await;
        }
    }
}
