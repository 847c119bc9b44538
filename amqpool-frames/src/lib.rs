#![deny(missing_docs, missing_debug_implementations)]

//! AMQP 0-9-1 frame model and codec for the `amqpool` proxy.
//!
//! The proxy only ever interprets the connection and channel classes; every
//! other method, along with content header and body frames, is carried as an
//! opaque payload so it can be forwarded verbatim with the channel number
//! rewritten. Frame decoding is incremental and intended to be driven through
//! [`tokio_util::codec::FramedRead`]/[`FramedWrite`](tokio_util::codec::FramedWrite)
//! with [`FrameCodec`].

pub mod frame;
pub mod method;
pub mod protocol_header;
pub mod table;

mod error;
pub use error::Error;

pub use frame::{Frame, FrameBody, FrameCodec};
pub use method::{
    Close, Method, Open, OpenOk, Start, StartOk, Tune, TuneOk,
};
pub use protocol_header::ProtocolHeader;
pub use table::{FieldTable, FieldValue};

/// Default frame-max advertised by the proxy, in octets. This is the value
/// RabbitMQ ships with and the value written into the downstream Tune.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;
