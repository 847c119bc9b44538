use std::io;

/// Error raised while encoding or decoding AMQP 0-9-1 frames
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Ran out of bytes in the middle of a method or field table
    #[error("Unexpected end of frame payload")]
    UnexpectedEnd,

    /// The octet after the frame payload was not the frame-end marker
    #[error("Expected frame-end octet 0xCE, found {0:#04x}")]
    FrameEndMismatch(u8),

    /// Frame exceeds the negotiated frame-max
    #[error("Frame of {size} octets exceeds frame-max {max}")]
    FrameTooLarge {
        /// Total frame size on the wire
        size: usize,
        /// Configured frame-max
        max: usize,
    },

    /// Frame type octet is not METHOD, HEADER, BODY, or HEARTBEAT
    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    /// Field value tag is not part of the 0-9-1 field table grammar
    #[error("Unknown field value type {0:#04x}")]
    UnknownFieldType(u8),

    /// A short or long string was not valid UTF-8
    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    /// Short strings are limited to 255 octets
    #[error("Short string of {0} octets exceeds 255")]
    ShortStringTooLong(usize),
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidUtf8
    }
}
