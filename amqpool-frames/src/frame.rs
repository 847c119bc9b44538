//! Implements the general frame format and its encoder/decoder

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::method::Method;
use crate::DEFAULT_FRAME_MAX;

/// Type octet of a method frame
pub const FRAME_TYPE_METHOD: u8 = 1;

/// Type octet of a content header frame
pub const FRAME_TYPE_HEADER: u8 = 2;

/// Type octet of a content body frame
pub const FRAME_TYPE_BODY: u8 = 3;

/// Type octet of a heartbeat frame
pub const FRAME_TYPE_HEARTBEAT: u8 = 8;

/// The octet closing every frame
pub const FRAME_END: u8 = 0xCE;

// type + channel + size, and the trailing end octet
const FRAME_HEADER_SIZE: usize = 7;
const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// One AMQP 0-9-1 frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel the frame belongs to; 0 is the connection channel
    pub channel: u16,

    /// Frame body
    pub body: FrameBody,
}

impl Frame {
    /// Creates a new frame
    pub fn new(channel: u16, body: FrameBody) -> Self {
        Self { channel, body }
    }

    /// Creates a method frame
    pub fn method(channel: u16, method: Method) -> Self {
        Self::new(channel, FrameBody::Method(method))
    }

    /// Creates a heartbeat frame on the connection channel
    pub fn heartbeat() -> Self {
        Self::new(0, FrameBody::Heartbeat)
    }
}

/// Frame body, tagged by the frame type octet
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// A method frame; parsed for the connection and channel classes,
    /// otherwise held raw inside [`Method::Other`]
    Method(Method),

    /// A content header frame, carried verbatim
    Header(Bytes),

    /// A content body frame, carried verbatim
    Body(Bytes),

    /// A heartbeat frame
    Heartbeat,
}

/// Encoder and decoder of AMQP 0-9-1 frames
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_FRAME_MAX as usize,
        }
    }
}

impl FrameCodec {
    /// Creates a codec enforcing the given frame-max (total frame octets,
    /// framing included, matching the Tune semantics)
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Updates the enforced frame-max after tuning
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (frame_type, payload) = match item.body {
            FrameBody::Method(method) => {
                let mut buf = BytesMut::new();
                method.encode(&mut buf)?;
                (FRAME_TYPE_METHOD, buf.freeze())
            }
            FrameBody::Header(payload) => (FRAME_TYPE_HEADER, payload),
            FrameBody::Body(payload) => (FRAME_TYPE_BODY, payload),
            FrameBody::Heartbeat => (FRAME_TYPE_HEARTBEAT, Bytes::new()),
        };

        dst.reserve(FRAME_OVERHEAD + payload.len());
        dst.put_u8(frame_type);
        dst.put_u16(item.channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_size =
            u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        let total = FRAME_OVERHEAD + payload_size;
        if total > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame_type = src.get_u8();
        let channel = src.get_u16();
        let _size = src.get_u32();
        let payload = src.split_to(payload_size).freeze();
        let end = src.get_u8();
        if end != FRAME_END {
            return Err(Error::FrameEndMismatch(end));
        }

        let body = match frame_type {
            FRAME_TYPE_METHOD => FrameBody::Method(Method::decode(payload)?),
            FRAME_TYPE_HEADER => FrameBody::Header(payload),
            FRAME_TYPE_BODY => FrameBody::Body(payload),
            FRAME_TYPE_HEARTBEAT => FrameBody::Heartbeat,
            other => return Err(Error::UnknownFrameType(other)),
        };
        Ok(Some(Frame { channel, body }))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{Frame, FrameBody, FrameCodec, FRAME_END};
    use crate::method::Method;

    #[test]
    fn heartbeat_on_the_wire() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Frame::heartbeat(), &mut dst).unwrap();
        assert_eq!(&dst[..], &[8, 0, 0, 0, 0, 0, 0, FRAME_END]);
    }

    #[test]
    fn decode_is_incremental() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(Frame::method(1, Method::ChannelCloseOk), &mut dst)
            .unwrap();

        let mut src = BytesMut::new();
        for byte in &dst[..dst.len() - 1] {
            src.extend_from_slice(&[*byte]);
            assert!(codec.decode(&mut src).unwrap().is_none());
        }
        src.extend_from_slice(&[dst[dst.len() - 1]]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame, Frame::method(1, Method::ChannelCloseOk));
    }

    #[test]
    fn body_frames_pass_through_untouched() {
        let mut codec = FrameCodec::default();
        let payload = Bytes::from_static(b"opaque message body");
        let mut dst = BytesMut::new();
        codec
            .encode(Frame::new(7, FrameBody::Body(payload.clone())), &mut dst)
            .unwrap();

        let frame = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(frame, Frame::new(7, FrameBody::Body(payload)));
    }

    #[test]
    fn bad_frame_end_is_an_error() {
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&[8, 0, 0, 0, 0, 0, 0, 0xAB]);
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut codec = FrameCodec::new(16);
        let mut src = BytesMut::new();
        src.extend_from_slice(&[3, 0, 1, 0, 0, 1, 0]);
        assert!(codec.decode(&mut src).is_err());
    }
}
