//! Implements the metrics sink
//!
//! Emission is strictly fire-and-forget; a metrics failure must never touch
//! the data path.

use std::fmt;
use std::io;
use std::net::UdpSocket;

/// Counter and gauge emission for the proxy
pub trait MetricsSink: fmt::Debug + Send + Sync {
    /// Increments a counter
    fn incr(&self, name: &str);

    /// Decrements a counter
    fn decr(&self, name: &str);

    /// Sets a gauge
    fn gauge(&self, name: &str, value: u64);
}

/// Sink that drops every measurement
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn incr(&self, _name: &str) {}
    fn decr(&self, _name: &str) {}
    fn gauge(&self, _name: &str, _value: u64) {}
}

/// StatsD plaintext sink over UDP
#[derive(Debug)]
pub struct StatsdSink {
    socket: UdpSocket,
}

impl StatsdSink {
    const PREFIX: &'static str = "amqpool";

    /// Binds an ephemeral UDP socket pointed at the StatsD daemon
    pub fn new(host: &str, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((host, port))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    fn emit(&self, line: String) {
        let _ = self.socket.send(line.as_bytes());
    }
}

impl MetricsSink for StatsdSink {
    fn incr(&self, name: &str) {
        self.emit(format!("{}.{}:1|c", Self::PREFIX, name));
    }

    fn decr(&self, name: &str) {
        self.emit(format!("{}.{}:-1|c", Self::PREFIX, name));
    }

    fn gauge(&self, name: &str, value: u64) {
        self.emit(format!("{}.{}:{}|g", Self::PREFIX, name, value));
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::{MetricsSink, StatsdSink};

    #[test]
    fn statsd_lines_are_well_formed() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();
        let sink = StatsdSink::new("127.0.0.1", addr.port()).unwrap();

        sink.incr("client.connected");
        sink.gauge("pool.idle", 3);

        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"amqpool.client.connected:1|c");
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"amqpool.pool.idle:3|g");
    }
}
