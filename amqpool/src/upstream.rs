//! Implements the broker-facing side of the proxy
//!
//! One [`Upstream`] owns one TCP (optionally TLS) connection to the broker.
//! It allocates wire channel numbers out of `[1, channel_max]`, keeps the
//! binding table from wire channel to client session, and runs the single
//! read task that dispatches broker frames back to whichever client each
//! channel is bound to. All writes go through one mutex so a frame is never
//! interleaved with another.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use amqpool_frames::method::{REPLY_CONNECTION_FORCED, REPLY_SUCCESS};
use amqpool_frames::{
    Close, Frame, FrameBody, FrameCodec, Method, Open, ProtocolHeader, StartOk, Tune,
    DEFAULT_FRAME_MAX,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace};

use crate::client::ClientWriter;
use crate::config::UpstreamConfig;
use crate::error::{NegotiationError, UpstreamError};
use crate::metrics::MetricsSink;
use crate::pool::Credentials;
use crate::util::expect_method;

const CLOSE_WAIT: Duration = Duration::from_secs(1);

pub(crate) trait Io: AsyncRead + AsyncWrite + fmt::Debug + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + fmt::Debug + Send + Unpin {}

type UpstreamRead = FramedRead<ReadHalf<Box<dyn Io>>, FrameCodec>;
type UpstreamWrite = FramedWrite<WriteHalf<Box<dyn Io>>, FrameCodec>;

/// Which side started closing a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseOrigin {
    Client,
    Broker,
}

/// What a disconnecting session still owes the broker for one channel
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReleaseAction {
    SendClose,
    SendCloseOk,
}

/// The association between a client's logical channel and the wire channel
/// actually used on the broker connection
#[derive(Debug)]
pub(crate) struct Binding {
    pub(crate) client_channel: u16,
    pub(crate) session: u64,
    pub(crate) writer: Weak<ClientWriter>,
    pub(crate) closing: Option<CloseOrigin>,
    pub(crate) opened: bool,
}

#[derive(Debug)]
struct ChannelTable {
    free: Vec<u16>,
    bound: HashMap<u16, Binding>,
}

impl ChannelTable {
    fn new(channel_max: u16) -> Self {
        Self {
            // popping yields the lowest numbers first
            free: (1..=channel_max).rev().collect(),
            bound: HashMap::new(),
        }
    }

    fn allocate(&mut self, binding: Binding) -> Option<u16> {
        let channel = self.free.pop()?;
        self.bound.insert(channel, binding);
        Some(channel)
    }

    fn free(&mut self, channel: u16) -> Option<Binding> {
        let binding = self.bound.remove(&channel)?;
        self.free.push(channel);
        Some(binding)
    }
}

#[derive(Debug)]
struct UpstreamInner {
    writer: tokio::sync::Mutex<UpstreamWrite>,
    channels: parking_lot::Mutex<ChannelTable>,
    credentials: Credentials,
    closed: AtomicBool,
    last_used: parking_lot::Mutex<Instant>,
    freed: Notify,
    metrics: Arc<dyn MetricsSink>,
}

impl UpstreamInner {
    async fn write_frame(&self, frame: Frame) -> Result<(), amqpool_frames::Error> {
        self.writer.lock().await.send(frame).await
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.freed.notify_waiters();
    }

    /// Returns the channel number to the free list; the idle clock starts
    /// once the last bound channel is gone
    fn free_channel(&self, channel: u16) -> Option<Binding> {
        let (binding, now_idle) = {
            let mut table = self.channels.lock();
            let binding = table.free(channel);
            (binding, table.bound.is_empty())
        };
        if let Some(binding) = &binding {
            trace!(channel, opened = binding.opened, "upstream channel released");
            if now_idle {
                *self.last_used.lock() = Instant::now();
            }
            self.freed.notify_waiters();
        }
        binding
    }
}

/// One pooled connection to the broker
#[derive(Debug, Clone)]
pub struct Upstream {
    inner: Arc<UpstreamInner>,
}

impl Upstream {
    /// Dials the broker and runs the client-role handshake with the given
    /// credentials, then spawns the read task
    pub(crate) async fn connect(
        config: &UpstreamConfig,
        tls: Option<&TlsConnector>,
        credentials: &Credentials,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, UpstreamError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        let io: Box<dyn Io> = match tls {
            Some(connector) => {
                let domain = rustls::pki_types::ServerName::try_from(config.host.clone())
                    .map_err(|_| UpstreamError::InvalidDomain)?;
                Box::new(connector.connect(domain, tcp).await?)
            }
            None => Box::new(tcp),
        };

        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = FramedRead::new(read_half, FrameCodec::default());
        let mut writer = FramedWrite::new(write_half, FrameCodec::default());

        // framing starts only after the protocol header
        let header: [u8; 8] = ProtocolHeader::amqp_0_9_1().into();
        writer.get_mut().write_all(&header).await?;

        let tune = handshake(&mut reader, &mut writer, credentials).await?;
        let channel_max = match tune.channel_max {
            0 => u16::MAX,
            n => n,
        };
        let frame_max = match tune.frame_max {
            0 => DEFAULT_FRAME_MAX,
            n => n,
        };
        reader.decoder_mut().set_max_frame_size(frame_max as usize);
        debug!(
            host = %config.host,
            channel_max,
            frame_max,
            heartbeat = tune.heartbeat,
            "upstream connection established"
        );

        let inner = Arc::new(UpstreamInner {
            writer: tokio::sync::Mutex::new(writer),
            channels: parking_lot::Mutex::new(ChannelTable::new(channel_max)),
            credentials: credentials.clone(),
            closed: AtomicBool::new(false),
            last_used: parking_lot::Mutex::new(Instant::now()),
            freed: Notify::new(),
            metrics,
        });
        tokio::spawn(read_loop(Arc::clone(&inner), reader));
        Ok(Self { inner })
    }

    pub(crate) fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_used.lock() = Instant::now();
    }

    pub(crate) fn idle_age(&self) -> Duration {
        self.inner.last_used.lock().elapsed()
    }

    pub(crate) fn bound_channels(&self) -> usize {
        self.inner.channels.lock().bound.len()
    }

    /// Whether the connection is alive with at least one unallocated channel
    pub(crate) fn has_capacity(&self) -> bool {
        !self.is_closed() && !self.inner.channels.lock().free.is_empty()
    }

    /// Whether every surviving binding belongs to the given session
    pub(crate) fn sole_user(&self, session: u64) -> bool {
        self.inner
            .channels
            .lock()
            .bound
            .values()
            .all(|binding| binding.session == session)
    }

    pub(crate) fn has_bindings_for(&self, session: u64) -> bool {
        self.inner
            .channels
            .lock()
            .bound
            .values()
            .any(|binding| binding.session == session)
    }

    /// Takes a wire channel number for a client's logical channel
    pub(crate) fn allocate_channel(
        &self,
        session: u64,
        client_channel: u16,
        writer: &Arc<ClientWriter>,
    ) -> Option<u16> {
        if self.is_closed() {
            return None;
        }
        self.inner.channels.lock().allocate(Binding {
            client_channel,
            session,
            writer: Arc::downgrade(writer),
            closing: None,
            opened: false,
        })
    }

    /// Flags a channel as closing; returns false if it already was
    pub(crate) fn mark_closing(&self, channel: u16, origin: CloseOrigin) -> bool {
        let mut table = self.inner.channels.lock();
        match table.bound.get_mut(&channel) {
            Some(binding) if binding.closing.is_none() => {
                binding.closing = Some(origin);
                true
            }
            _ => false,
        }
    }

    /// Returns the channel number to the free list
    pub(crate) fn free_channel(&self, channel: u16) -> Option<Binding> {
        self.inner.free_channel(channel)
    }

    /// Works out what a disconnecting session still has to send for each of
    /// its surviving bindings, flagging them as closing in the same pass
    pub(crate) fn begin_release(&self, session: u64) -> Vec<(u16, ReleaseAction)> {
        let mut table = self.inner.channels.lock();
        let mut actions = Vec::new();
        for (channel, binding) in table
            .bound
            .iter_mut()
            .filter(|(_, binding)| binding.session == session)
        {
            match binding.closing {
                None => {
                    binding.closing = Some(CloseOrigin::Client);
                    actions.push((*channel, ReleaseAction::SendClose));
                }
                Some(CloseOrigin::Client) => {}
                Some(CloseOrigin::Broker) => actions.push((*channel, ReleaseAction::SendCloseOk)),
            }
        }
        actions
    }

    /// Waits until the broker's CloseOk frames have drained every binding of
    /// the session, bounded; true means the connection is clean and poolable
    pub(crate) async fn await_session_drained(&self, session: u64, bound: Duration) -> bool {
        let drained = tokio::time::timeout(bound, async {
            loop {
                let notified = self.inner.freed.notified();
                if self.is_closed() || !self.has_bindings_for(session) {
                    break;
                }
                notified.await;
            }
        })
        .await;
        drained.is_ok() && !self.is_closed() && !self.has_bindings_for(session)
    }

    /// Writes one complete frame to the broker
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Closed);
        }
        match self.inner.write_frame(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.mark_closed();
                Err(err.into())
            }
        }
    }

    /// Closes the connection gracefully: Connection.Close, then a bounded
    /// wait for the CloseOk that makes the read task exit
    pub(crate) async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let close = Close::new(REPLY_SUCCESS, "connection closed by proxy");
        if self
            .write_frame(Frame::method(0, Method::Close(close)))
            .await
            .is_err()
        {
            return;
        }
        let _ = tokio::time::timeout(CLOSE_WAIT, async {
            loop {
                let notified = self.inner.freed.notified();
                if self.is_closed() {
                    break;
                }
                notified.await;
            }
        })
        .await;
        self.inner.mark_closed();
    }
}

/// Client-role handshake against the broker, mirroring what the proxy
/// accepts from its own clients
async fn handshake(
    reader: &mut UpstreamRead,
    writer: &mut UpstreamWrite,
    credentials: &Credentials,
) -> Result<Tune, NegotiationError> {
    let start = match expect_method(reader, "Connection.Start").await? {
        Method::Start(start) => start,
        _ => {
            return Err(NegotiationError::UnexpectedFrame {
                expecting: "Connection.Start",
            })
        }
    };
    if !start.mechanism_list().any(|m| m == b"PLAIN") {
        return Err(NegotiationError::UnsupportedMechanism("PLAIN".to_string()));
    }

    let start_ok = StartOk {
        client_properties: crate::util::proxy_properties(),
        mechanism: "PLAIN".to_string(),
        response: plain_response(&credentials.user, &credentials.password),
        locale: "en_US".to_string(),
    };
    writer
        .send(Frame::method(0, Method::StartOk(start_ok)))
        .await?;

    let tune = match expect_method(reader, "Connection.Tune").await? {
        Method::Tune(tune) => tune,
        _ => {
            return Err(NegotiationError::UnexpectedFrame {
                expecting: "Connection.Tune",
            })
        }
    };
    writer.send(Frame::method(0, Method::TuneOk(tune))).await?;

    writer
        .send(Frame::method(
            0,
            Method::Open(Open::new(credentials.vhost.clone())),
        ))
        .await?;
    match expect_method(reader, "Connection.OpenOk").await? {
        Method::OpenOk(_) => Ok(tune),
        _ => Err(NegotiationError::UnexpectedFrame {
            expecting: "Connection.OpenOk",
        }),
    }
}

/// `\0 user \0 password`
fn plain_response(user: &str, password: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(user.len() + password.len() + 2);
    buf.put_u8(0);
    buf.put_slice(user.as_bytes());
    buf.put_u8(0);
    buf.put_slice(password.as_bytes());
    buf.freeze()
}

/// The single reader of a broker connection
async fn read_loop(inner: Arc<UpstreamInner>, mut reader: UpstreamRead) {
    let deliberate = loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                error!(?err, "upstream read failed");
                break false;
            }
            None => {
                debug!("upstream closed the connection");
                break false;
            }
        };

        match (frame.channel, frame.body) {
            // heartbeats are hop-by-hop: answer the broker, never a client
            (_, FrameBody::Heartbeat) => {
                if inner.write_frame(Frame::heartbeat()).await.is_err() {
                    break false;
                }
            }
            (0, FrameBody::Method(Method::Close(close))) => {
                debug!(
                    reply_code = close.reply_code,
                    reply_text = %close.reply_text,
                    "broker closed the connection"
                );
                let _ = inner.write_frame(Frame::method(0, Method::CloseOk)).await;
                fan_out_close(&inner, close).await;
                break true;
            }
            (0, FrameBody::Method(Method::CloseOk)) => break true,
            (0, _) => trace!("discarding connection-level frame from broker"),
            (channel, FrameBody::Method(Method::ChannelCloseOk)) => {
                match inner.free_channel(channel) {
                    Some(binding) => {
                        if let Some(writer) = binding.writer.upgrade() {
                            let _ = writer
                                .write_frame(Frame::method(
                                    binding.client_channel,
                                    Method::ChannelCloseOk,
                                ))
                                .await;
                        }
                    }
                    None => trace!(channel, "CloseOk for a channel that is not bound"),
                }
            }
            (channel, body) => {
                let target = {
                    let mut table = inner.channels.lock();
                    match table.bound.get_mut(&channel) {
                        Some(binding) => {
                            match &body {
                                FrameBody::Method(Method::ChannelClose(_)) => {
                                    binding.closing.get_or_insert(CloseOrigin::Broker);
                                }
                                FrameBody::Method(Method::ChannelOpenOk) => binding.opened = true,
                                _ => {}
                            }
                            Some((binding.client_channel, binding.writer.clone()))
                        }
                        None => None,
                    }
                };
                match target {
                    Some((client_channel, writer)) => {
                        if let Some(writer) = writer.upgrade() {
                            if let Err(err) =
                                writer.write_frame(Frame::new(client_channel, body)).await
                            {
                                debug!(?err, client_channel, "dropping frame for dead client");
                            }
                        }
                    }
                    // a race with client disconnect; the channel is gone
                    None => trace!(channel, "discarding frame for unbound channel"),
                }
            }
        }
    };

    inner.mark_closed();
    if !deliberate {
        let close = Close::new(
            REPLY_CONNECTION_FORCED,
            "UPSTREAM_ERROR - upstream connection failed",
        );
        fan_out_close(&inner, close).await;
    }
    inner.metrics.incr("upstream.closed");
}

/// Propagates a Connection.Close to every client bound to this connection
async fn fan_out_close(inner: &UpstreamInner, close: Close) {
    let bindings: Vec<Binding> = {
        let mut table = inner.channels.lock();
        let channels: Vec<u16> = table.bound.keys().copied().collect();
        channels
            .into_iter()
            .filter_map(|channel| table.free(channel))
            .collect()
    };
    inner.freed.notify_waiters();

    let mut notified: Vec<Arc<ClientWriter>> = Vec::new();
    for binding in bindings {
        let Some(writer) = binding.writer.upgrade() else {
            continue;
        };
        if notified.iter().any(|seen| Arc::ptr_eq(seen, &writer)) {
            continue;
        }
        let _ = writer
            .write_frame(Frame::method(0, Method::Close(close.clone())))
            .await;
        notified.push(writer);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::{Binding, ChannelTable, CloseOrigin};

    fn binding(session: u64, client_channel: u16) -> Binding {
        Binding {
            client_channel,
            session,
            writer: Weak::new(),
            closing: None,
            opened: false,
        }
    }

    #[test]
    fn allocates_lowest_numbers_first() {
        let mut table = ChannelTable::new(2047);
        assert_eq!(table.allocate(binding(1, 1)), Some(1));
        assert_eq!(table.allocate(binding(1, 2)), Some(2));
        assert_eq!(table.allocate(binding(2, 1)), Some(3));
    }

    #[test]
    fn freed_numbers_are_reused() {
        let mut table = ChannelTable::new(2047);
        let first = table.allocate(binding(1, 1)).unwrap();
        table.allocate(binding(1, 2)).unwrap();
        assert!(table.free(first).is_some());
        assert_eq!(table.allocate(binding(2, 1)), Some(first));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut table = ChannelTable::new(2);
        assert!(table.allocate(binding(1, 1)).is_some());
        assert!(table.allocate(binding(1, 2)).is_some());
        assert!(table.allocate(binding(1, 3)).is_none());
    }

    #[test]
    fn sessions_never_share_a_channel_number() {
        let mut table = ChannelTable::new(2047);
        let a = table.allocate(binding(1, 1)).unwrap();
        let b = table.allocate(binding(2, 1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.bound.get(&a).unwrap().session, 1);
        assert_eq!(table.bound.get(&b).unwrap().session, 2);
    }

    #[test]
    fn close_origin_is_sticky() {
        let mut table = ChannelTable::new(2047);
        let channel = table.allocate(binding(1, 1)).unwrap();
        let entry = table.bound.get_mut(&channel).unwrap();
        entry.closing.get_or_insert(CloseOrigin::Broker);
        entry.closing.get_or_insert(CloseOrigin::Client);
        assert_eq!(entry.closing, Some(CloseOrigin::Broker));
    }
}
