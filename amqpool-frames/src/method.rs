//! Implements the connection and channel class methods
//!
//! Only the methods the proxy itself takes part in are parsed into structs;
//! everything else (basic, exchange, queue, tx, confirm, ...) is carried as
//! an opaque [`Method::Other`] and forwarded byte-for-byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::table::{
    put_longstr, put_shortstr, take_longstr, take_shortstr, take_u16, take_u32, take_u8,
    FieldTable,
};

/// Class id of the connection class
pub const CLASS_CONNECTION: u16 = 10;

/// Class id of the channel class
pub const CLASS_CHANNEL: u16 = 20;

const CONNECTION_START: u16 = 10;
const CONNECTION_START_OK: u16 = 11;
const CONNECTION_TUNE: u16 = 30;
const CONNECTION_TUNE_OK: u16 = 31;
const CONNECTION_OPEN: u16 = 40;
const CONNECTION_OPEN_OK: u16 = 41;
const CONNECTION_CLOSE: u16 = 50;
const CONNECTION_CLOSE_OK: u16 = 51;

const CHANNEL_OPEN: u16 = 10;
const CHANNEL_OPEN_OK: u16 = 11;
const CHANNEL_CLOSE: u16 = 40;
const CHANNEL_CLOSE_OK: u16 = 41;

/// Reply code for a successful, deliberate close
pub const REPLY_SUCCESS: u16 = 200;

/// Reply code for a connection forced closed by an operator or intermediary
pub const REPLY_CONNECTION_FORCED: u16 = 320;

/// Reply code for a method the peer sent in an invalid context
pub const REPLY_COMMAND_INVALID: u16 = 503;

/// Reply code for a frame on a channel that is not open
pub const REPLY_CHANNEL_ERROR: u16 = 504;

/// Reply code for an operation the server refuses on policy grounds
pub const REPLY_NOT_ALLOWED: u16 = 530;

/// Connection.Start arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    /// Protocol major version
    pub version_major: u8,
    /// Protocol minor version
    pub version_minor: u8,
    /// Server properties, including the capability table
    pub server_properties: FieldTable,
    /// Space-separated SASL mechanisms
    pub mechanisms: Bytes,
    /// Space-separated message locales
    pub locales: Bytes,
}

impl Start {
    /// The mechanisms long-string split on spaces
    pub fn mechanism_list(&self) -> impl Iterator<Item = &[u8]> {
        self.mechanisms.split(|b| *b == b' ').filter(|m| !m.is_empty())
    }
}

/// Connection.StartOk arguments
#[derive(Debug, Clone, PartialEq)]
pub struct StartOk {
    /// Client properties
    pub client_properties: FieldTable,
    /// Selected SASL mechanism
    pub mechanism: String,
    /// Opaque SASL response; layout depends on the mechanism
    pub response: Bytes,
    /// Selected locale
    pub locale: String,
}

/// Connection.Tune / Connection.TuneOk arguments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tune {
    /// Highest channel number the peer accepts; 0 means no limit
    pub channel_max: u16,
    /// Largest frame size the peer accepts; 0 means no limit
    pub frame_max: u32,
    /// Desired heartbeat delay in seconds; 0 disables heartbeats
    pub heartbeat: u16,
}

/// Connection.TuneOk shares the Tune argument layout
pub type TuneOk = Tune;

/// Connection.Open arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    /// Virtual host to open
    pub virtual_host: String,
    /// Reserved (capabilities in 0-9)
    pub capabilities: String,
    /// Reserved (insist in 0-9)
    pub insist: bool,
}

impl Open {
    /// Creates an Open for a virtual host with the reserved fields zeroed
    pub fn new(virtual_host: impl Into<String>) -> Self {
        Self {
            virtual_host: virtual_host.into(),
            capabilities: String::new(),
            insist: false,
        }
    }
}

/// Connection.OpenOk arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOk {
    /// Reserved (known-hosts in 0-9)
    pub known_hosts: String,
}

/// Connection.Close and Channel.Close arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    /// Reply code
    pub reply_code: u16,
    /// Human-readable reason
    pub reply_text: String,
    /// Class of the method that caused the close, or 0
    pub class_id: u16,
    /// Method that caused the close, or 0
    pub method_id: u16,
}

impl Close {
    /// Creates a close with no failing method attributed
    pub fn new(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.into(),
            class_id: 0,
            method_id: 0,
        }
    }
}

/// A decoded method frame payload
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// Connection.Start
    Start(Start),
    /// Connection.StartOk
    StartOk(StartOk),
    /// Connection.Tune
    Tune(Tune),
    /// Connection.TuneOk
    TuneOk(TuneOk),
    /// Connection.Open
    Open(Open),
    /// Connection.OpenOk
    OpenOk(OpenOk),
    /// Connection.Close
    Close(Close),
    /// Connection.CloseOk
    CloseOk,
    /// Channel.Open; the only argument is reserved
    ChannelOpen,
    /// Channel.OpenOk; the only argument is reserved
    ChannelOpenOk,
    /// Channel.Close
    ChannelClose(Close),
    /// Channel.CloseOk
    ChannelCloseOk,
    /// Any other method, kept as raw argument octets for pass-through
    Other {
        /// Class id on the wire
        class_id: u16,
        /// Method id on the wire
        method_id: u16,
        /// Raw argument octets
        arguments: Bytes,
    },
}

impl Method {
    /// Decodes a METHOD frame payload
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let class_id = take_u16(&mut buf)?;
        let method_id = take_u16(&mut buf)?;

        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, CONNECTION_START) => Self::Start(Start {
                version_major: take_u8(&mut buf)?,
                version_minor: take_u8(&mut buf)?,
                server_properties: FieldTable::decode(&mut buf)?,
                mechanisms: take_longstr(&mut buf)?,
                locales: take_longstr(&mut buf)?,
            }),
            (CLASS_CONNECTION, CONNECTION_START_OK) => Self::StartOk(StartOk {
                client_properties: FieldTable::decode(&mut buf)?,
                mechanism: take_shortstr(&mut buf)?,
                response: take_longstr(&mut buf)?,
                locale: take_shortstr(&mut buf)?,
            }),
            (CLASS_CONNECTION, CONNECTION_TUNE) => Self::Tune(decode_tune(&mut buf)?),
            (CLASS_CONNECTION, CONNECTION_TUNE_OK) => Self::TuneOk(decode_tune(&mut buf)?),
            (CLASS_CONNECTION, CONNECTION_OPEN) => {
                let virtual_host = take_shortstr(&mut buf)?;
                // the reserved trailing fields are absent in some 0-9-0 clients
                let capabilities = if buf.has_remaining() {
                    take_shortstr(&mut buf)?
                } else {
                    String::new()
                };
                let insist = if buf.has_remaining() {
                    take_u8(&mut buf)? & 0x01 != 0
                } else {
                    false
                };
                Self::Open(Open {
                    virtual_host,
                    capabilities,
                    insist,
                })
            }
            (CLASS_CONNECTION, CONNECTION_OPEN_OK) => {
                let known_hosts = if buf.has_remaining() {
                    take_shortstr(&mut buf)?
                } else {
                    String::new()
                };
                Self::OpenOk(OpenOk { known_hosts })
            }
            (CLASS_CONNECTION, CONNECTION_CLOSE) => Self::Close(decode_close(&mut buf)?),
            (CLASS_CONNECTION, CONNECTION_CLOSE_OK) => Self::CloseOk,
            (CLASS_CHANNEL, CHANNEL_OPEN) => {
                if buf.has_remaining() {
                    take_shortstr(&mut buf)?;
                }
                Self::ChannelOpen
            }
            (CLASS_CHANNEL, CHANNEL_OPEN_OK) => {
                if buf.has_remaining() {
                    take_longstr(&mut buf)?;
                }
                Self::ChannelOpenOk
            }
            (CLASS_CHANNEL, CHANNEL_CLOSE) => Self::ChannelClose(decode_close(&mut buf)?),
            (CLASS_CHANNEL, CHANNEL_CLOSE_OK) => Self::ChannelCloseOk,
            _ => Self::Other {
                class_id,
                method_id,
                arguments: buf,
            },
        };
        Ok(method)
    }

    /// Encodes the method as a METHOD frame payload
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Start(start) => {
                put_method_ids(dst, CLASS_CONNECTION, CONNECTION_START);
                dst.put_u8(start.version_major);
                dst.put_u8(start.version_minor);
                start.server_properties.encode(dst)?;
                put_longstr(dst, &start.mechanisms);
                put_longstr(dst, &start.locales);
            }
            Self::StartOk(start_ok) => {
                put_method_ids(dst, CLASS_CONNECTION, CONNECTION_START_OK);
                start_ok.client_properties.encode(dst)?;
                put_shortstr(dst, &start_ok.mechanism)?;
                put_longstr(dst, &start_ok.response);
                put_shortstr(dst, &start_ok.locale)?;
            }
            Self::Tune(tune) => {
                put_method_ids(dst, CLASS_CONNECTION, CONNECTION_TUNE);
                encode_tune(tune, dst);
            }
            Self::TuneOk(tune_ok) => {
                put_method_ids(dst, CLASS_CONNECTION, CONNECTION_TUNE_OK);
                encode_tune(tune_ok, dst);
            }
            Self::Open(open) => {
                put_method_ids(dst, CLASS_CONNECTION, CONNECTION_OPEN);
                put_shortstr(dst, &open.virtual_host)?;
                put_shortstr(dst, &open.capabilities)?;
                dst.put_u8(open.insist as u8);
            }
            Self::OpenOk(open_ok) => {
                put_method_ids(dst, CLASS_CONNECTION, CONNECTION_OPEN_OK);
                put_shortstr(dst, &open_ok.known_hosts)?;
            }
            Self::Close(close) => {
                put_method_ids(dst, CLASS_CONNECTION, CONNECTION_CLOSE);
                encode_close(close, dst)?;
            }
            Self::CloseOk => put_method_ids(dst, CLASS_CONNECTION, CONNECTION_CLOSE_OK),
            Self::ChannelOpen => {
                put_method_ids(dst, CLASS_CHANNEL, CHANNEL_OPEN);
                put_shortstr(dst, "")?;
            }
            Self::ChannelOpenOk => {
                put_method_ids(dst, CLASS_CHANNEL, CHANNEL_OPEN_OK);
                put_longstr(dst, b"");
            }
            Self::ChannelClose(close) => {
                put_method_ids(dst, CLASS_CHANNEL, CHANNEL_CLOSE);
                encode_close(close, dst)?;
            }
            Self::ChannelCloseOk => put_method_ids(dst, CLASS_CHANNEL, CHANNEL_CLOSE_OK),
            Self::Other {
                class_id,
                method_id,
                arguments,
            } => {
                put_method_ids(dst, *class_id, *method_id);
                dst.put_slice(arguments);
            }
        }
        Ok(())
    }

    /// The wire class id of this method
    pub fn class_id(&self) -> u16 {
        match self {
            Self::Start(_)
            | Self::StartOk(_)
            | Self::Tune(_)
            | Self::TuneOk(_)
            | Self::Open(_)
            | Self::OpenOk(_)
            | Self::Close(_)
            | Self::CloseOk => CLASS_CONNECTION,
            Self::ChannelOpen
            | Self::ChannelOpenOk
            | Self::ChannelClose(_)
            | Self::ChannelCloseOk => CLASS_CHANNEL,
            Self::Other { class_id, .. } => *class_id,
        }
    }
}

fn put_method_ids(dst: &mut BytesMut, class_id: u16, method_id: u16) {
    dst.put_u16(class_id);
    dst.put_u16(method_id);
}

fn decode_tune(buf: &mut Bytes) -> Result<Tune, Error> {
    Ok(Tune {
        channel_max: take_u16(buf)?,
        frame_max: take_u32(buf)?,
        heartbeat: take_u16(buf)?,
    })
}

fn encode_tune(tune: &Tune, dst: &mut BytesMut) {
    dst.put_u16(tune.channel_max);
    dst.put_u32(tune.frame_max);
    dst.put_u16(tune.heartbeat);
}

fn decode_close(buf: &mut Bytes) -> Result<Close, Error> {
    Ok(Close {
        reply_code: take_u16(buf)?,
        reply_text: take_shortstr(buf)?,
        class_id: take_u16(buf)?,
        method_id: take_u16(buf)?,
    })
}

fn encode_close(close: &Close, dst: &mut BytesMut) -> Result<(), Error> {
    dst.put_u16(close.reply_code);
    put_shortstr(dst, &close.reply_text)?;
    dst.put_u16(close.class_id);
    dst.put_u16(close.method_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{Close, Method, Start, Tune};
    use crate::table::{FieldTable, FieldValue};

    fn round_trip(method: Method) -> Method {
        let mut dst = BytesMut::new();
        method.encode(&mut dst).unwrap();
        Method::decode(dst.freeze()).unwrap()
    }

    #[test]
    fn start_round_trip() {
        let mut server_properties = FieldTable::new();
        server_properties.insert("product", FieldValue::long_string("amqpool"));
        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: Bytes::from_static(b"PLAIN AMQPLAIN"),
            locales: Bytes::from_static(b"en_US"),
        };
        assert_eq!(round_trip(Method::Start(start.clone())), Method::Start(start));
    }

    #[test]
    fn mechanism_list_splits_on_spaces() {
        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: Bytes::from_static(b"PLAIN AMQPLAIN"),
            locales: Bytes::from_static(b"en_US"),
        };
        let list: Vec<_> = start.mechanism_list().collect();
        assert_eq!(list, vec![b"PLAIN".as_slice(), b"AMQPLAIN".as_slice()]);
    }

    #[test]
    fn tune_round_trip() {
        let tune = Tune {
            channel_max: 2047,
            frame_max: 131072,
            heartbeat: 60,
        };
        assert_eq!(round_trip(Method::Tune(tune)), Method::Tune(tune));
    }

    #[test]
    fn close_round_trip() {
        let close = Close::new(320, "CONNECTION_FORCED - shutting down");
        assert_eq!(
            round_trip(Method::ChannelClose(close.clone())),
            Method::ChannelClose(close)
        );
    }

    #[test]
    fn unknown_method_keeps_raw_arguments() {
        // basic.publish (60, 40) with a few argument octets
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&60u16.to_be_bytes());
        payload.extend_from_slice(&40u16.to_be_bytes());
        payload.extend_from_slice(&[0, 0, 0, 5, b'q', 1]);
        let raw = payload.freeze();

        let method = Method::decode(raw.clone()).unwrap();
        match &method {
            Method::Other {
                class_id,
                method_id,
                arguments,
            } => {
                assert_eq!((*class_id, *method_id), (60, 40));
                assert_eq!(arguments.as_ref(), &raw[4..]);
            }
            other => panic!("expected Other, got {:?}", other),
        }

        let mut encoded = BytesMut::new();
        method.encode(&mut encoded).unwrap();
        assert_eq!(encoded.freeze(), raw);
    }

    #[test]
    fn truncated_close_is_an_error() {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&10u16.to_be_bytes());
        payload.extend_from_slice(&50u16.to_be_bytes());
        payload.extend_from_slice(&[0x01]); // half a reply code
        assert!(Method::decode(payload.freeze()).is_err());
    }
}
