#![deny(missing_docs, missing_debug_implementations)]

//! An AMQP 0-9-1 connection-pooling proxy based on tokio.
//!
//! amqpool sits between many short-lived client applications and an upstream
//! AMQP broker. It keeps a small pool of long-lived broker connections, keyed
//! by the credentials each client presents during its handshake, and
//! multiplexes client sessions onto them by rewriting AMQP channel numbers.
//! The point is to amortize connection establishment (TCP, TLS, handshake,
//! authentication) for workloads that open and close logical connections all
//! the time.
//!
//! The pieces:
//!
//! - [`server::Server`] listens for clients, drives their handshakes, and
//!   coordinates the two-phase graceful shutdown.
//! - A client session pumps frames between its socket and the upstream it
//!   borrowed, translating channel numbers in both directions.
//! - [`pool::UpstreamPool`] vends idle broker connections per credential key
//!   and reaps the ones that sit idle past the configured timeout.
//! - The frame model and codec live in the `amqpool-frames` crate.
//!
//! The proxy caches nothing, routes nothing, and never reconnects on a
//! client's behalf; AMQP clients already know how to do that themselves.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod server;

pub(crate) mod client;
pub(crate) mod upstream;
pub(crate) mod util;
