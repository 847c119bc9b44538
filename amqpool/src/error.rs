//! Implements the error types of the proxy

use std::io;

/// Error during the initial handshake on either hop
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Frame-level error
    #[error(transparent)]
    Frame(#[from] amqpool_frames::Error),

    /// The first 8 octets were not an AMQP protocol header the proxy speaks
    #[error("Protocol header mismatch. Found {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// SASL mechanism is not PLAIN or AMQPLAIN
    #[error("SASL mechanism {0:?} is not supported")]
    UnsupportedMechanism(String),

    /// The SASL response did not have the layout its mechanism requires
    #[error("Malformed SASL response for mechanism {0:?}")]
    MalformedCredentials(&'static str),

    /// The peer sent a method out of handshake order
    #[error("Expecting {expecting}")]
    UnexpectedFrame {
        /// The method the handshake state machine was waiting for
        expecting: &'static str,
    },

    /// The peer hung up mid-handshake
    #[error("Remote peer closed")]
    RemoteClosed,
}

/// Error on an established client session
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Frame-level error on the downstream socket, IO included
    #[error(transparent)]
    Frame(#[from] amqpool_frames::Error),

    /// The borrowed upstream connection failed
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The client sent a frame on a channel it never opened
    #[error("Frame received on channel {0} which is not open")]
    UnboundChannel(u16),

    /// The client opened a channel twice without closing it
    #[error("Channel {0} is already open")]
    ChannelAlreadyOpen(u16),

    /// Every upstream channel number is in use
    #[error("No free channel on the upstream connection")]
    ChannelsExhausted,

    /// The client sent a non-connection frame on channel 0
    #[error("Unexpected frame on channel 0")]
    IllegalConnectionFrame,
}

/// Error on the broker-facing side
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// IO error while dialing or writing
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Frame-level error on the broker socket
    #[error(transparent)]
    Frame(#[from] amqpool_frames::Error),

    /// The client-role handshake with the broker failed
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The upstream host is not a valid TLS server name
    #[error("Invalid domain")]
    InvalidDomain,

    /// The connection was already marked dead
    #[error("Upstream connection is closed")]
    Closed,
}

/// Error building the proxy configuration; fatal at startup only
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The upstream URL did not parse
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// The upstream URL scheme is not amqp or amqps
    #[error(r#"Invalid scheme. Only "amqp" and "amqps" are supported."#)]
    InvalidScheme,

    /// The upstream URL has no host
    #[error("Upstream URL is missing a host")]
    MissingHost,

    /// Credentials belong to clients, not to the proxy configuration
    #[error("Upstream URL must not carry credentials; clients authenticate per connection")]
    UnexpectedCredentials,
}
