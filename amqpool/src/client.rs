//! Implements the client-facing session
//!
//! A session owns one downstream TCP connection. It plays the server role of
//! the AMQP handshake to learn `(vhost, user, password)`, then pumps frames:
//! anything on an open channel is rewritten to the wire channel number the
//! borrowed upstream allocated and forwarded; responses come back through the
//! upstream's read task via the shared [`ClientWriter`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use amqpool_frames::method::{
    REPLY_CHANNEL_ERROR, REPLY_COMMAND_INVALID, REPLY_CONNECTION_FORCED, REPLY_NOT_ALLOWED,
    REPLY_SUCCESS,
};
use amqpool_frames::{
    Close, FieldTable, Frame, FrameBody, FrameCodec, Method, OpenOk, ProtocolHeader, Start,
    StartOk, Tune, DEFAULT_FRAME_MAX,
};
use bytes::Bytes;
use futures_util::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, NegotiationError, UpstreamError};
use crate::metrics::MetricsSink;
use crate::pool::{Credentials, UpstreamPool};
use crate::upstream::{CloseOrigin, ReleaseAction, Upstream};
use crate::util::{expect_method, proxy_properties};

/// How long a disconnecting session waits for the broker to acknowledge the
/// channel closes it fired off, before giving the connection up as unclean
const RELEASE_WAIT: Duration = Duration::from_secs(1);

/// The write half of a client socket, shared with the upstream read task.
///
/// The mutex wraps a complete frame encode and flush, so writes from the
/// session and from the upstream dispatcher never interleave mid-frame.
#[derive(Debug)]
pub(crate) struct ClientWriter {
    framed: tokio::sync::Mutex<FramedWrite<WriteHalf<TcpStream>, FrameCodec>>,
}

impl ClientWriter {
    fn new(framed: FramedWrite<WriteHalf<TcpStream>, FrameCodec>) -> Self {
        Self {
            framed: tokio::sync::Mutex::new(framed),
        }
    }

    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), amqpool_frames::Error> {
        self.framed.lock().await.send(frame).await
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.framed.lock().await.get_mut().shutdown().await;
    }
}

/// One live downstream connection
#[derive(Debug)]
pub(crate) struct ClientSession {
    id: u64,
    reader: FramedRead<ReadHalf<TcpStream>, FrameCodec>,
    writer: Arc<ClientWriter>,
    credentials: Credentials,
    upstream: Option<Upstream>,
    /// client channel -> upstream wire channel
    channels: HashMap<u16, u16>,
    pool: Arc<UpstreamPool>,
    metrics: Arc<dyn MetricsSink>,
}

impl ClientSession {
    /// Performs the server-role handshake on a freshly accepted socket.
    ///
    /// No upstream is touched here; one is borrowed lazily when the client
    /// opens its first channel.
    pub(crate) async fn accept(
        mut stream: TcpStream,
        id: u64,
        pool: Arc<UpstreamPool>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, NegotiationError> {
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await?;
        let supported = ProtocolHeader::try_from(buf)
            .map(|header| header.is_supported())
            .unwrap_or(false);
        if !supported {
            // the AMQP error convention: answer with the version we do speak
            let canonical: [u8; 8] = ProtocolHeader::amqp_0_9_1().into();
            let _ = stream.write_all(&canonical).await;
            return Err(NegotiationError::ProtocolHeaderMismatch(buf));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, FrameCodec::default());
        let mut writer = FramedWrite::new(write_half, FrameCodec::default());

        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties: proxy_properties(),
            mechanisms: Bytes::from_static(b"PLAIN AMQPLAIN"),
            locales: Bytes::from_static(b"en_US"),
        };
        writer.send(Frame::method(0, Method::Start(start))).await?;

        let start_ok = match expect_method(&mut reader, "Connection.StartOk").await? {
            Method::StartOk(start_ok) => start_ok,
            _ => {
                return Err(NegotiationError::UnexpectedFrame {
                    expecting: "Connection.StartOk",
                })
            }
        };
        let (user, password) = parse_sasl_response(&start_ok)?;

        // channel_max 0 and heartbeat 0: no limit imposed downstream and no
        // heartbeating required of the client. The upstream tuning values are
        // deliberately not propagated.
        let tune = Tune {
            channel_max: 0,
            frame_max: DEFAULT_FRAME_MAX,
            heartbeat: 0,
        };
        writer.send(Frame::method(0, Method::Tune(tune))).await?;
        match expect_method(&mut reader, "Connection.TuneOk").await? {
            Method::TuneOk(_) => {}
            _ => {
                return Err(NegotiationError::UnexpectedFrame {
                    expecting: "Connection.TuneOk",
                })
            }
        }

        let vhost = match expect_method(&mut reader, "Connection.Open").await? {
            Method::Open(open) => open.virtual_host,
            _ => {
                return Err(NegotiationError::UnexpectedFrame {
                    expecting: "Connection.Open",
                })
            }
        };
        writer
            .send(Frame::method(0, Method::OpenOk(OpenOk::default())))
            .await?;

        debug!(id, %vhost, %user, "client connected");
        Ok(Self {
            id,
            reader,
            writer: Arc::new(ClientWriter::new(writer)),
            credentials: Credentials {
                vhost,
                user,
                password,
            },
            upstream: None,
            channels: HashMap::new(),
            pool,
            metrics,
        })
    }

    pub(crate) fn writer(&self) -> Arc<ClientWriter> {
        Arc::clone(&self.writer)
    }

    /// Pumps frames until the client closes, errors, or the token fires,
    /// then hands the upstream back to the pool
    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        match self.pump(&shutdown).await {
            Ok(()) => debug!(id = self.id, "client session ended"),
            Err(err) => {
                self.metrics.incr("client.errored");
                debug!(id = self.id, ?err, "client session failed");
            }
        }
        self.release_upstream().await;
        self.writer.shutdown().await;
    }

    async fn pump(&mut self, shutdown: &CancellationToken) -> Result<(), ClientError> {
        use futures_util::StreamExt;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = self.reader.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            };

            match (frame.channel, frame.body) {
                // heartbeats are hop-by-hop: echo, never forward
                (_, FrameBody::Heartbeat) => {
                    self.writer.write_frame(Frame::heartbeat()).await?;
                }
                (0, FrameBody::Method(Method::Close(close))) => {
                    trace!(id = self.id, reply_code = close.reply_code, "client closing");
                    let _ = self
                        .writer
                        .write_frame(Frame::method(0, Method::CloseOk))
                        .await;
                    return Ok(());
                }
                (0, FrameBody::Method(Method::CloseOk)) => return Ok(()),
                (0, _) => {
                    self.protocol_error(
                        REPLY_COMMAND_INVALID,
                        "COMMAND_INVALID - unexpected frame on channel 0",
                    )
                    .await;
                    return Err(ClientError::IllegalConnectionFrame);
                }
                (channel, FrameBody::Method(Method::ChannelOpen)) => {
                    self.on_channel_open(channel).await?;
                }
                (channel, FrameBody::Method(Method::ChannelClose(close))) => {
                    let (upstream, wire) = self.bound(channel).await?;
                    self.channels.remove(&channel);
                    upstream.mark_closing(wire, CloseOrigin::Client);
                    if let Err(err) = upstream
                        .write_frame(Frame::method(wire, Method::ChannelClose(close)))
                        .await
                    {
                        return Err(self.upstream_failed(err.into()).await);
                    }
                }
                (channel, FrameBody::Method(Method::ChannelCloseOk)) => {
                    // answer to a broker-initiated close; the binding is done
                    let (upstream, wire) = self.bound(channel).await?;
                    self.channels.remove(&channel);
                    let result = upstream
                        .write_frame(Frame::method(wire, Method::ChannelCloseOk))
                        .await;
                    upstream.free_channel(wire);
                    if let Err(err) = result {
                        return Err(self.upstream_failed(err.into()).await);
                    }
                }
                (channel, body) => {
                    let (upstream, wire) = self.bound(channel).await?;
                    if let Err(err) = upstream.write_frame(Frame::new(wire, body)).await {
                        return Err(self.upstream_failed(err.into()).await);
                    }
                }
            }
        }
    }

    async fn on_channel_open(&mut self, channel: u16) -> Result<(), ClientError> {
        if self.channels.contains_key(&channel) {
            self.protocol_error(
                REPLY_CHANNEL_ERROR,
                "CHANNEL_ERROR - channel is already open",
            )
            .await;
            return Err(ClientError::ChannelAlreadyOpen(channel));
        }

        let upstream = match self.upstream.clone() {
            Some(upstream) if !upstream.is_closed() => upstream,
            Some(_) if !self.channels.is_empty() => {
                // it died with channels still bound; the synthetic close from
                // its read task is already on the way to this client
                return Err(self.upstream_failed(UpstreamError::Closed.into()).await);
            }
            _ => {
                // first channel of the session, or the previous connection
                // was reaped after its channels were all closed
                self.upstream = None;
                let upstream = match self.pool.borrow(&self.credentials).await {
                    Ok(upstream) => upstream,
                    Err(err) => {
                        warn!(id = self.id, ?err, "could not reach the upstream broker");
                        return Err(self.upstream_failed(err.into()).await);
                    }
                };
                self.upstream = Some(upstream.clone());
                upstream
            }
        };

        let Some(wire) = upstream.allocate_channel(self.id, channel, &self.writer) else {
            self.protocol_error(
                REPLY_NOT_ALLOWED,
                "NOT_ALLOWED - no free channel on the upstream connection",
            )
            .await;
            return Err(ClientError::ChannelsExhausted);
        };
        self.channels.insert(channel, wire);
        trace!(id = self.id, channel, wire, "channel bound");

        if let Err(err) = upstream
            .write_frame(Frame::method(wire, Method::ChannelOpen))
            .await
        {
            return Err(self.upstream_failed(err.into()).await);
        }
        Ok(())
    }

    /// Looks up the wire channel for a client channel, closing the session
    /// on a violation
    async fn bound(&mut self, channel: u16) -> Result<(Upstream, u16), ClientError> {
        match (self.upstream.clone(), self.channels.get(&channel)) {
            (Some(upstream), Some(wire)) => Ok((upstream, *wire)),
            _ => {
                self.protocol_error(
                    REPLY_CHANNEL_ERROR,
                    "CHANNEL_ERROR - frame on a channel that is not open",
                )
                .await;
                Err(ClientError::UnboundChannel(channel))
            }
        }
    }

    async fn protocol_error(&self, reply_code: u16, reply_text: &str) {
        let close = Close::new(reply_code, reply_text);
        let _ = self
            .writer
            .write_frame(Frame::method(0, Method::Close(close)))
            .await;
    }

    /// Tells the client its connection is gone because the broker side failed
    async fn upstream_failed(&self, err: ClientError) -> ClientError {
        let close = Close::new(
            REPLY_CONNECTION_FORCED,
            "UPSTREAM_ERROR - lost connection to the upstream broker",
        );
        let _ = self
            .writer
            .write_frame(Frame::method(0, Method::Close(close)))
            .await;
        err
    }

    /// Returns the borrowed upstream to the pool once its channels are clean,
    /// or discards it if they cannot be drained in time
    async fn release_upstream(&mut self) {
        let Some(upstream) = self.upstream.take() else {
            return;
        };
        self.channels.clear();

        for (wire, action) in upstream.begin_release(self.id) {
            let frame = match action {
                ReleaseAction::SendClose => Frame::method(
                    wire,
                    Method::ChannelClose(Close::new(REPLY_SUCCESS, "client went away")),
                ),
                ReleaseAction::SendCloseOk => Frame::method(wire, Method::ChannelCloseOk),
            };
            if upstream.write_frame(frame).await.is_err() {
                break;
            }
            if matches!(action, ReleaseAction::SendCloseOk) {
                upstream.free_channel(wire);
            }
        }

        if upstream.await_session_drained(self.id, RELEASE_WAIT).await {
            trace!(id = self.id, "channels drained; upstream stays pooled");
            self.pool.release(upstream);
        } else {
            self.metrics.incr("upstream.unclean_release");
            if upstream.sole_user(self.id) {
                // nobody else is on it and its channels are wedged
                debug!(id = self.id, "upstream did not drain cleanly; discarding");
                upstream.close().await;
            } else {
                // other sessions are live; let the stragglers drain through
                // the read task as the broker acknowledges the closes
                debug!(id = self.id, "leaving undrained channels to the read task");
            }
        }
    }
}

/// Extracts `(user, password)` from the SASL response of a StartOk
fn parse_sasl_response(start_ok: &StartOk) -> Result<(String, String), NegotiationError> {
    match start_ok.mechanism.as_str() {
        "PLAIN" => {
            // `authzid \0 user \0 password`; the leading identity is ignored
            let malformed = || NegotiationError::MalformedCredentials("PLAIN");
            let bytes = start_ok.response.as_ref();
            let first = bytes.iter().position(|b| *b == 0).ok_or_else(malformed)?;
            let rest = &bytes[first + 1..];
            let second = rest.iter().position(|b| *b == 0).ok_or_else(malformed)?;
            let user = std::str::from_utf8(&rest[..second]).map_err(|_| malformed())?;
            let password = std::str::from_utf8(&rest[second + 1..]).map_err(|_| malformed())?;
            Ok((user.to_string(), password.to_string()))
        }
        "AMQPLAIN" => {
            let malformed = || NegotiationError::MalformedCredentials("AMQPLAIN");
            let mut raw = start_ok.response.clone();
            let table = FieldTable::decode_inline(&mut raw).map_err(|_| malformed())?;
            let user = table
                .get("LOGIN")
                .and_then(|value| value.as_str())
                .ok_or_else(malformed)?;
            let password = table
                .get("PASSWORD")
                .and_then(|value| value.as_str())
                .ok_or_else(malformed)?;
            Ok((user.to_string(), password.to_string()))
        }
        other => Err(NegotiationError::UnsupportedMechanism(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use amqpool_frames::{FieldTable, FieldValue, StartOk};
    use bytes::{BufMut, Bytes, BytesMut};

    use super::parse_sasl_response;
    use crate::error::NegotiationError;

    fn start_ok(mechanism: &str, response: Bytes) -> StartOk {
        StartOk {
            client_properties: FieldTable::new(),
            mechanism: mechanism.to_string(),
            response,
            locale: "en_US".to_string(),
        }
    }

    #[test]
    fn plain_credentials() {
        let response = Bytes::from_static(b"\0guest\0secret");
        let (user, password) = parse_sasl_response(&start_ok("PLAIN", response)).unwrap();
        assert_eq!(user, "guest");
        assert_eq!(password, "secret");
    }

    #[test]
    fn plain_with_authzid() {
        let response = Bytes::from_static(b"admin\0guest\0secret");
        let (user, password) = parse_sasl_response(&start_ok("PLAIN", response)).unwrap();
        assert_eq!(user, "guest");
        assert_eq!(password, "secret");
    }

    #[test]
    fn plain_without_separators_is_malformed() {
        let response = Bytes::from_static(b"guest");
        assert!(matches!(
            parse_sasl_response(&start_ok("PLAIN", response)),
            Err(NegotiationError::MalformedCredentials("PLAIN"))
        ));
    }

    #[test]
    fn amqplain_credentials() {
        let mut table = FieldTable::new();
        table.insert("LOGIN", FieldValue::long_string("guest"));
        table.insert("PASSWORD", FieldValue::long_string("secret"));
        let mut encoded = BytesMut::new();
        table.encode(&mut encoded).unwrap();
        // AMQPLAIN carries the pairs without the outer length prefix
        let response = encoded.freeze().slice(4..);

        let (user, password) = parse_sasl_response(&start_ok("AMQPLAIN", response)).unwrap();
        assert_eq!(user, "guest");
        assert_eq!(password, "secret");
    }

    #[test]
    fn amqplain_without_password_is_malformed() {
        let mut table = FieldTable::new();
        table.insert("LOGIN", FieldValue::long_string("guest"));
        let mut encoded = BytesMut::new();
        table.encode(&mut encoded).unwrap();
        let response = encoded.freeze().slice(4..);

        assert!(parse_sasl_response(&start_ok("AMQPLAIN", response)).is_err());
    }

    #[test]
    fn external_mechanism_is_rejected() {
        let mut response = BytesMut::new();
        response.put_slice(b"cert");
        assert!(matches!(
            parse_sasl_response(&start_ok("EXTERNAL", response.freeze())),
            Err(NegotiationError::UnsupportedMechanism(_))
        ));
    }
}
