// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol engine contract.
//!
//! The MQTT protocol engine sits above this transport. It never sees
//! QUIC; it gets a [`Pipe`] per connection generation and a
//! [`StreamHandle`] to submit whole control packets through.
//!
//! Lifecycle, driven by the transport:
//!
//! - handshake complete -> `create_pipe` + `start`
//! - peer shutdown      -> `close` + `stop` (pipe kept for teardown)
//! - shutdown complete  -> `close` + `stop` + drop
//!
//! A pipe may be closed and stopped more than once across that
//! sequence; implementations must tolerate repeats.

use std::sync::{Arc, Weak};

use crate::stream::{RecvHandle, SendHandle, Stream};
use crate::{Packet, TransportError, TransportResult};

/// Factory for per-connection protocol state.
pub trait ProtocolEngine: Send + Sync {
    /// Allocate and initialize pipe state for a freshly connected
    /// stream. Failure is fatal to the connection.
    fn create_pipe(&self, stream: StreamHandle) -> TransportResult<Box<dyn Pipe>>;
}

/// Per-connection protocol state, owned by the transport.
pub trait Pipe: Send {
    /// The stream is ready; the engine may begin submitting I/O.
    fn start(&mut self);

    /// The connection is going away; stop initiating new work.
    fn close(&mut self);

    /// Outstanding engine activity for this pipe must wind down.
    fn stop(&mut self);
}

/// Non-owning handle from a pipe back to its stream.
///
/// Holds a weak reference so the pipe cannot keep a dead stream
/// alive; submissions after the stream is gone fail with `Closed`.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Weak<Stream>,
}

impl StreamHandle {
    pub(crate) fn new(inner: Weak<Stream>) -> Self {
        Self { inner }
    }

    fn stream(&self) -> TransportResult<Arc<Stream>> {
        self.inner.upgrade().ok_or(TransportError::Closed)
    }

    /// Queue a packet for transmission.
    pub fn submit_send(&self, packet: Packet) -> TransportResult<SendHandle> {
        self.stream()?.submit_send(packet)
    }

    /// Queue a request for the next decoded packet.
    pub fn submit_recv(&self) -> TransportResult<RecvHandle> {
        self.stream()?.submit_recv()
    }

    /// Cancel a queued send; in-flight sends run to completion.
    pub fn cancel_send(&self, id: u64) -> bool {
        self.stream().map(|s| s.cancel_send(id)).unwrap_or(false)
    }

    /// Cancel a queued receive.
    pub fn cancel_recv(&self, id: u64) -> bool {
        self.stream().map(|s| s.cancel_recv(id)).unwrap_or(false)
    }

    /// Send a packet and wait for transmission to complete.
    pub async fn send(&self, packet: Packet) -> TransportResult<()> {
        self.stream()?.send(packet).await
    }

    /// Wait for the next decoded packet.
    pub async fn recv(&self) -> TransportResult<Packet> {
        self.stream()?.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_on_dead_stream() {
        let handle = StreamHandle::new(Weak::new());
        assert!(matches!(
            handle.submit_recv(),
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            handle.submit_send(Packet::new(vec![0xC0, 0x00], Vec::new())),
            Err(TransportError::Closed)
        ));
        assert!(!handle.cancel_send(1));
        assert!(!handle.cancel_recv(1));
    }
}
