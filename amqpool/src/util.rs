//! Common helpers shared by both hops of the proxy

use amqpool_frames::{FieldTable, FieldValue, Frame, FrameBody, Method};
use futures_util::{Stream, StreamExt};

use crate::error::NegotiationError;

/// Reads the next method frame on channel 0 during a handshake.
///
/// Anything else at this point, a heartbeat included, is a negotiation error;
/// both Tune exchanges disable heartbeats until the handshake is over.
pub(crate) async fn expect_method<S>(
    reader: &mut S,
    expecting: &'static str,
) -> Result<Method, NegotiationError>
where
    S: Stream<Item = Result<Frame, amqpool_frames::Error>> + Unpin,
{
    let frame = reader.next().await.ok_or(NegotiationError::RemoteClosed)??;
    match frame.body {
        FrameBody::Method(method) if frame.channel == 0 => Ok(method),
        _ => Err(NegotiationError::UnexpectedFrame { expecting }),
    }
}

/// The properties the proxy advertises on both hops: server-properties in its
/// Connection.Start downstream, client-properties in its StartOk upstream.
pub(crate) fn proxy_properties() -> FieldTable {
    let mut capabilities = FieldTable::new();
    for name in [
        "consumer_priorities",
        "exchange_exchange_bindings",
        "connection.blocked",
        "authentication_failure_close",
        "per_consumer_qos",
        "basic.nack",
        "direct_reply_to",
        "publisher_confirms",
        "consumer_cancel_notify",
    ] {
        capabilities.insert(name, FieldValue::Boolean(true));
    }

    let mut properties = FieldTable::new();
    properties.insert("product", FieldValue::long_string("amqpool"));
    properties.insert(
        "version",
        FieldValue::long_string(env!("CARGO_PKG_VERSION")),
    );
    properties.insert("capabilities", FieldValue::Table(capabilities));
    properties
}
