// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # mqtt-quic - MQTT-over-QUIC client stream transport
//!
//! The per-stream plumbing between a QUIC implementation and an MQTT
//! protocol engine. The engine submits and consumes whole MQTT control
//! packets; QUIC delivers opaque byte chunks on one ordered, reliable
//! bidirectional stream. Everything in between lives here:
//!
//! - incremental MQTT fixed-header framing from arbitrary chunk splits,
//! - a per-stream receive ring and a bounded overflow queue,
//! - FIFO send/receive request queues with cancellation,
//! - connection lifecycle: connect, graceful shutdown, 0-RTT resumption
//!   via session ticket, automatic reconnect.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     MQTT protocol engine                     |
//! |        ProtocolEngine::create_pipe / Pipe lifecycle          |
//! +------------------------------+-------------------------------+
//!                                | submit_send / submit_recv
//! +------------------------------v-------------------------------+
//! |                            Stream                            |
//! |  send_queue | recv_queue | overflow | ring | frame decoder   |
//! |             (one mutex, decoder pump on a task)              |
//! +------------------------------+-------------------------------+
//!                                | ConnectionIo / StreamIo
//!                                | ConnectionEvent / StreamEvent
//! +------------------------------v-------------------------------+
//! |              QUIC provider (quinn-backed driver)             |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mqtt_quic::{Connector, QuicConfig};
//!
//! let connector = Connector::new(QuicConfig::default());
//! let stream = connector.connect("broker.example.com", 14567, engine)?;
//!
//! stream.send(connect_packet).await?;
//! let connack = stream.recv().await?;
//! ```
//!
//! One bidirectional stream per connection; the transport is a client
//! only. Congestion control and retransmission are QUIC's business.

pub mod config;
pub mod connect;
pub mod decode;
pub mod packet;
pub mod pipe;
pub mod provider;
pub mod queue;
pub mod quic;
pub mod ring;
pub mod stream;

pub use config::{QuicConfig, QuicConfigBuilder};
pub use connect::Connector;
pub use packet::Packet;
pub use pipe::{Pipe, ProtocolEngine, StreamHandle};
pub use provider::{
    ConnState, ConnectionEvent, ConnectionIo, EventSink, QuicProvider, StreamEvent, StreamIo,
};
pub use stream::{RecvHandle, SendHandle, Stream};

/// Transport error types.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The stream is shut down; no further requests are accepted.
    Closed,
    /// The request was cancelled before dispatch.
    Cancelled,
    /// Frame decoding failure (malformed remaining length or
    /// fixed-header inconsistency).
    Protocol(String),
    /// The QUIC provider returned a failing status.
    Transport(String),
    /// The overflow queue is at its ceiling and cannot grow.
    ResourceExhausted,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Closed => write!(f, "stream closed"),
            TransportError::Cancelled => write!(f, "request cancelled"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransportError::Transport(msg) => write!(f, "transport error: {}", msg),
            TransportError::ResourceExhausted => write!(f, "overflow queue exhausted"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "stream closed");
        assert_eq!(TransportError::Cancelled.to_string(), "request cancelled");

        let err = TransportError::Protocol("bad remaining length".to_string());
        assert!(err.to_string().contains("bad remaining length"));

        let err = TransportError::Transport("handshake failed".to_string());
        assert!(err.to_string().contains("handshake failed"));

        assert!(TransportError::ResourceExhausted.to_string().contains("overflow"));
    }
}
