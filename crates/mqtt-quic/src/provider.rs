// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QUIC provider contract.
//!
//! The transport consumes a QUIC implementation through these traits
//! and event enums so the core state machine is independent of any
//! particular stack. The production provider lives in [`crate::quic`];
//! tests drive the same surface with a mock.
//!
//! Calls flow downward through [`ConnectionIo`]/[`StreamIo`]; events
//! flow upward through [`EventSink`], which the per-stream state
//! implements. Sink methods are invoked from provider-owned tasks and
//! must not block: they do bookkeeping under the stream lock and
//! schedule the heavy lifting elsewhere.

use std::sync::Arc;

use crate::TransportResult;

/// Connection-level events delivered to the sink.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The handshake has completed.
    Connected,
    /// The connection has been shut down by the transport
    /// (idle timeout, handshake failure, transport error).
    ShutdownByTransport {
        /// Provider-specific status code.
        status: u64,
    },
    /// The connection was explicitly shut down by the peer.
    ShutdownByPeer {
        /// Application error code from the peer.
        error_code: u64,
    },
    /// The connection has completed the shutdown process and is ready
    /// to be safely cleaned up.
    ShutdownComplete {
        /// True when the application already released the handle.
        app_close_in_progress: bool,
    },
    /// A session resumption ticket was received from the server.
    ResumptionTicket {
        /// Opaque ticket bytes (may be empty when the provider keeps
        /// the ticket internally and only signals its arrival).
        ticket: Vec<u8>,
    },
}

/// Stream-level events delivered to the sink.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Data was received from the peer on the stream. Delivery stays
    /// paused afterwards until the sink re-enables it.
    Receive {
        /// The received bytes.
        chunk: Vec<u8>,
    },
    /// A previous send submission has completed.
    SendComplete {
        /// False when the send was aborted by connection teardown.
        ok: bool,
    },
}

/// Event-receiving face of the per-stream state, handed to the
/// provider as callback context.
pub trait EventSink: Send + Sync {
    /// Handle a connection-level event.
    fn on_connection_event(&self, event: ConnectionEvent);

    /// Handle a stream-level event.
    fn on_stream_event(&self, event: StreamEvent);
}

/// Handle to one QUIC connection.
pub trait ConnectionIo: Send + Sync {
    /// Install a resumption ticket before `start` (0-RTT/1-RTT resume).
    fn set_resumption_ticket(&self, ticket: &[u8]) -> TransportResult<()>;

    /// Begin connecting to `(host, port)`. Returns immediately;
    /// handshake completion arrives as [`ConnectionEvent::Connected`].
    fn start(&self, host: &str, port: u16) -> TransportResult<()>;

    /// Open and start the bidirectional stream, with automatic receive
    /// delivery disabled (explicit pull model).
    fn open_stream(&self, sink: Arc<dyn EventSink>) -> TransportResult<Arc<dyn StreamIo>>;

    /// Gracefully shut the connection down (no flags, error code 0).
    fn shutdown(&self);

    /// Release the connection handle.
    fn close(&self);
}

/// Handle to the bidirectional stream of a connection.
pub trait StreamIo: Send + Sync {
    /// Submit a send as up to two buffers (fixed header, body).
    /// Completion arrives as [`StreamEvent::SendComplete`].
    fn start_send(&self, header: Vec<u8>, body: Vec<u8>) -> TransportResult<()>;

    /// Enable or pause receive delivery. Idempotent.
    fn set_receive_enabled(&self, enabled: bool);

    /// Acknowledge `consumed` bytes of a delivered chunk so the
    /// provider stops buffering them.
    fn receive_complete(&self, consumed: usize);

    /// Release the stream handle.
    fn close(&self);
}

/// Factory for QUIC connections.
pub trait QuicProvider: Send + Sync {
    /// Allocate a connection bound to the given event sink. The
    /// connection does nothing until [`ConnectionIo::start`].
    fn open_connection(&self, sink: Arc<dyn EventSink>) -> TransportResult<Arc<dyn ConnectionIo>>;
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No connection attempt yet, or awaiting a reconnect.
    Idle,
    /// Connection started, handshake in flight.
    Connecting,
    /// Handshake complete, stream open, pipe running.
    Ready,
    /// Teardown signalled, shutdown-complete pending.
    Draining,
    /// Shutdown finished; reconnect decision pending.
    ShutdownComplete,
    /// Stream is finished and will not reconnect.
    Destroyed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Idle => write!(f, "Idle"),
            ConnState::Connecting => write!(f, "Connecting"),
            ConnState::Ready => write!(f, "Ready"),
            ConnState::Draining => write!(f, "Draining"),
            ConnState::ShutdownComplete => write!(f, "ShutdownComplete"),
            ConnState::Destroyed => write!(f, "Destroyed"),
        }
    }
}
