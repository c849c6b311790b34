// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection lifecycle: connect, resume, reconnect, teardown.
//!
//! State machine per connection generation:
//!
//! ```text
//! Idle -> Connecting -> Ready -> Draining -> ShutdownComplete
//!                                                  |
//!                      +---------------------------+
//!                      v
//!            ticket active and not closed?
//!              yes: sleep, Connecting again
//!              no:  Destroyed
//! ```
//!
//! The reconnect wait runs on a runtime task, never on a provider
//! callback thread. An explicit [`Stream::close`] is terminal and
//! wins over an active resumption ticket.

use std::sync::Arc;

use crate::config::{QuicConfig, MAX_TICKET_LEN};
use crate::pipe::{ProtocolEngine, StreamHandle};
use crate::provider::{ConnState, EventSink, QuicProvider};
use crate::quic::QuinnProvider;
use crate::stream::Stream;
use crate::{TransportError, TransportResult};

/// Entry point: opens streams against a QUIC provider.
pub struct Connector {
    provider: Arc<dyn QuicProvider>,
    config: QuicConfig,
}

impl Connector {
    /// Create a connector backed by the quinn provider.
    pub fn new(config: QuicConfig) -> Self {
        let provider = Arc::new(QuinnProvider::new(config.clone()));
        Self { provider, config }
    }

    /// Create a connector with a custom provider (testing, alternate
    /// QUIC stacks).
    pub fn with_provider(config: QuicConfig, provider: Arc<dyn QuicProvider>) -> Self {
        Self { provider, config }
    }

    /// Open a stream to `(host, port)` for the given protocol engine.
    ///
    /// Returns as soon as the connection attempt is dispatched;
    /// handshake completion is asynchronous. Must be called within a
    /// tokio runtime, which the stream captures for its tasks.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        engine: Arc<dyn ProtocolEngine>,
    ) -> TransportResult<Arc<Stream>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::Transport("no tokio runtime".to_string()))?;

        let stream = Stream::new(
            self.provider.clone(),
            engine,
            self.config.clone(),
            runtime,
            host.to_string(),
            port,
        );
        stream.begin_connect()?;
        Ok(stream)
    }
}

impl Stream {
    /// Open (or re-open) the QUIC connection for this stream,
    /// installing the resumption ticket when one is captured.
    ///
    /// Failure before dispatch closes the connection handle and is
    /// returned to the caller.
    pub(crate) fn begin_connect(&self) -> TransportResult<()> {
        let sink: Arc<dyn EventSink> = self.arc().ok_or(TransportError::Closed)?;
        let conn = self.provider.open_connection(sink)?;

        let (ticket, host, port) = {
            let mut st = self.state.lock();
            st.conn_state = ConnState::Connecting;
            st.conn = Some(conn.clone());
            let ticket = if st.resumption.active {
                st.resumption.ticket.clone()
            } else {
                Vec::new()
            };
            (ticket, st.host.clone(), st.port)
        };

        if !ticket.is_empty() {
            if let Err(err) = conn.set_resumption_ticket(&ticket) {
                conn.close();
                return Err(err);
            }
        }

        log::info!("[MQTT-QUIC] connecting to {}:{}", host, port);
        if let Err(err) = conn.start(&host, port) {
            conn.close();
            return Err(err);
        }
        Ok(())
    }

    /// Handshake complete: open the bidirectional stream in pull mode,
    /// flush anything queued while connecting, then bring up the pipe.
    pub(crate) fn on_connected(&self) {
        let conn = {
            let st = self.state.lock();
            if st.closed {
                return;
            }
            st.conn.clone()
        };
        let Some(conn) = conn else {
            return;
        };
        let Some(sink) = self.arc() else {
            return;
        };

        let io = match conn.open_stream(sink) {
            Ok(io) => io,
            Err(err) => {
                log::warn!("[MQTT-QUIC] stream open failed: {}", err);
                conn.shutdown();
                return;
            }
        };
        io.set_receive_enabled(false);

        let (failed, need_enable) = {
            let mut st = self.state.lock();
            st.io = Some(io.clone());
            st.conn_state = ConnState::Ready;
            let failed = Self::kick_sender(&mut st);
            (failed, !st.recv_queue.is_empty())
        };
        Self::fail_sends(failed);
        if need_enable {
            io.set_receive_enabled(true);
        }

        match self.engine.create_pipe(StreamHandle::new(self.this.clone())) {
            Ok(mut pipe) => {
                pipe.start();
                self.state.lock().pipe = Some(pipe);
                log::info!("[MQTT-QUIC] connected, pipe started");
            }
            Err(err) => {
                // No pipe means nobody above can drive this stream.
                log::warn!("[MQTT-QUIC] pipe allocation failed: {}", err);
                conn.shutdown();
            }
        }
    }

    /// Transport-initiated teardown (idle timeout, transport error).
    /// Informational; the shutdown-complete event does the work.
    pub(crate) fn on_shutdown_by_transport(&self, status: u64) {
        log::info!("[MQTT-QUIC] shut down by transport, status {:#x}", status);
        let mut st = self.state.lock();
        if matches!(st.conn_state, ConnState::Connecting | ConnState::Ready) {
            st.conn_state = ConnState::Draining;
        }
    }

    /// Peer-initiated teardown: notify the pipe but keep it until
    /// shutdown completes.
    pub(crate) fn on_shutdown_by_peer(&self, error_code: u64) {
        log::info!("[MQTT-QUIC] shut down by peer, code {}", error_code);
        let pipe = {
            let mut st = self.state.lock();
            st.conn_state = ConnState::Draining;
            st.pipe.take()
        };
        // Hooks run without the lock; they may re-enter submits.
        if let Some(mut pipe) = pipe {
            pipe.close();
            pipe.stop();
            self.state.lock().pipe = Some(pipe);
        }
    }

    /// Shutdown process finished: release the pipe and either
    /// reconnect on the captured ticket or destroy the stream.
    pub(crate) fn on_shutdown_complete(&self, app_close_in_progress: bool) {
        let (conn, pipe, reconnect) = {
            let mut st = self.state.lock();
            st.conn_state = ConnState::ShutdownComplete;
            let conn = st.conn.take();
            st.io = None;
            let pipe = st.pipe.take();
            let reconnect = st.resumption.active && !st.fatal && !st.closed;
            (conn, pipe, reconnect)
        };

        if let Some(conn) = conn {
            if !app_close_in_progress {
                conn.close();
            }
        }
        if let Some(mut pipe) = pipe {
            pipe.close();
            pipe.stop();
        }

        if reconnect {
            let Some(this) = self.arc() else {
                return;
            };
            let delay = self.config.reconnect_delay;
            log::info!(
                "[MQTT-QUIC] resuming by session ticket in {:?}",
                delay
            );
            self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if this.is_closed() {
                    return;
                }
                if let Err(err) = this.begin_connect() {
                    log::warn!("[MQTT-QUIC] reconnect failed: {}", err);
                    this.destroy();
                }
            });
        } else {
            self.destroy();
        }
    }

    /// Capture a session ticket; once set, teardown triggers reconnect.
    pub(crate) fn on_resumption_ticket(&self, ticket: Vec<u8>) {
        if ticket.len() > MAX_TICKET_LEN {
            log::warn!(
                "[MQTT-QUIC] resumption ticket of {} bytes exceeds cap {}, ignored",
                ticket.len(),
                MAX_TICKET_LEN
            );
            return;
        }
        log::debug!(
            "[MQTT-QUIC] resumption ticket received ({} bytes)",
            ticket.len()
        );
        let mut st = self.state.lock();
        st.resumption.ticket = ticket;
        st.resumption.active = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::pipe::Pipe;
    use crate::provider::{ConnectionEvent, ConnectionIo, StreamIo};
    use crate::{Packet, TransportResult};

    #[derive(Default)]
    struct MockIo {
        enabled: AtomicBool,
        sent: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    }

    impl StreamIo for MockIo {
        fn start_send(&self, header: Vec<u8>, body: Vec<u8>) -> TransportResult<()> {
            self.sent.lock().push((header, body));
            Ok(())
        }
        fn set_receive_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::Relaxed);
        }
        fn receive_complete(&self, _consumed: usize) {}
        fn close(&self) {}
    }

    struct MockConn {
        sink: Arc<dyn EventSink>,
        io: Arc<MockIo>,
        started: Mutex<Option<(String, u16)>>,
        ticket: Mutex<Option<Vec<u8>>>,
        shutdowns: AtomicU64,
    }

    impl ConnectionIo for MockConn {
        fn set_resumption_ticket(&self, ticket: &[u8]) -> TransportResult<()> {
            *self.ticket.lock() = Some(ticket.to_vec());
            Ok(())
        }
        fn start(&self, host: &str, port: u16) -> TransportResult<()> {
            *self.started.lock() = Some((host.to_string(), port));
            Ok(())
        }
        fn open_stream(&self, _sink: Arc<dyn EventSink>) -> TransportResult<Arc<dyn StreamIo>> {
            Ok(self.io.clone())
        }
        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::Relaxed);
        }
        fn close(&self) {}
    }

    #[derive(Default)]
    struct MockProvider {
        conns: Mutex<Vec<Arc<MockConn>>>,
    }

    impl QuicProvider for MockProvider {
        fn open_connection(
            &self,
            sink: Arc<dyn EventSink>,
        ) -> TransportResult<Arc<dyn ConnectionIo>> {
            let conn = Arc::new(MockConn {
                sink,
                io: Arc::new(MockIo::default()),
                started: Mutex::new(None),
                ticket: Mutex::new(None),
                shutdowns: AtomicU64::new(0),
            });
            self.conns.lock().push(conn.clone());
            Ok(conn)
        }
    }

    #[derive(Default)]
    struct Counters {
        starts: AtomicU64,
        closes: AtomicU64,
        stops: AtomicU64,
        drops: AtomicU64,
    }

    struct CountingPipe {
        counters: Arc<Counters>,
    }

    impl Pipe for CountingPipe {
        fn start(&mut self) {
            self.counters.starts.fetch_add(1, Ordering::Relaxed);
        }
        fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::Relaxed);
        }
        fn stop(&mut self) {
            self.counters.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl Drop for CountingPipe {
        fn drop(&mut self) {
            self.counters.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct CountingEngine {
        counters: Arc<Counters>,
        fail: AtomicBool,
    }

    impl ProtocolEngine for CountingEngine {
        fn create_pipe(&self, _stream: StreamHandle) -> TransportResult<Box<dyn Pipe>> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(TransportError::Transport("pipe refused".to_string()));
            }
            Ok(Box::new(CountingPipe {
                counters: self.counters.clone(),
            }))
        }
    }

    struct Harness {
        provider: Arc<MockProvider>,
        counters: Arc<Counters>,
        stream: Arc<Stream>,
    }

    fn connect_harness(config: QuicConfig) -> Harness {
        let provider = Arc::new(MockProvider::default());
        let counters = Arc::new(Counters::default());
        let engine = Arc::new(CountingEngine {
            counters: counters.clone(),
            fail: AtomicBool::new(false),
        });
        let connector = Connector::with_provider(config, provider.clone());
        let stream = connector.connect("broker.local", 14567, engine).unwrap();
        Harness {
            provider,
            counters,
            stream,
        }
    }

    fn last_conn(provider: &MockProvider) -> Arc<MockConn> {
        provider.conns.lock().last().unwrap().clone()
    }

    #[tokio::test]
    async fn test_connect_dispatches_start() {
        let h = connect_harness(QuicConfig::default());
        assert_eq!(h.stream.conn_state(), ConnState::Connecting);

        let conn = last_conn(&h.provider);
        assert_eq!(
            conn.started.lock().clone(),
            Some(("broker.local".to_string(), 14567))
        );
        assert!(conn.ticket.lock().is_none(), "no ticket on first connect");
    }

    #[tokio::test]
    async fn test_connected_starts_pipe() {
        let h = connect_harness(QuicConfig::default());
        let conn = last_conn(&h.provider);

        conn.sink.on_connection_event(ConnectionEvent::Connected);

        assert_eq!(h.stream.conn_state(), ConnState::Ready);
        assert_eq!(h.counters.starts.load(Ordering::Relaxed), 1);
        assert!(
            !conn.io.enabled.load(Ordering::Relaxed),
            "receive delivery stays disabled until a waiter arrives"
        );
    }

    #[tokio::test]
    async fn test_pipe_failure_is_fatal() {
        let provider = Arc::new(MockProvider::default());
        let counters = Arc::new(Counters::default());
        let engine = Arc::new(CountingEngine {
            counters: counters.clone(),
            fail: AtomicBool::new(true),
        });
        let connector = Connector::with_provider(QuicConfig::default(), provider.clone());
        let stream = connector.connect("broker.local", 14567, engine).unwrap();

        let conn = last_conn(&provider);
        conn.sink.on_connection_event(ConnectionEvent::Connected);

        assert_eq!(conn.shutdowns.load(Ordering::Relaxed), 1);
        assert_eq!(counters.starts.load(Ordering::Relaxed), 0);
        drop(stream);
    }

    #[tokio::test]
    async fn test_peer_shutdown_closes_pipe_but_keeps_it() {
        let h = connect_harness(QuicConfig::default());
        let conn = last_conn(&h.provider);
        conn.sink.on_connection_event(ConnectionEvent::Connected);

        conn.sink
            .on_connection_event(ConnectionEvent::ShutdownByPeer { error_code: 0 });

        assert_eq!(h.stream.conn_state(), ConnState::Draining);
        assert_eq!(h.counters.closes.load(Ordering::Relaxed), 1);
        assert_eq!(h.counters.stops.load(Ordering::Relaxed), 1);
        assert_eq!(h.counters.drops.load(Ordering::Relaxed), 0, "pipe kept");
    }

    #[tokio::test]
    async fn test_shutdown_complete_without_ticket_destroys() {
        let h = connect_harness(QuicConfig::default());
        let conn = last_conn(&h.provider);
        conn.sink.on_connection_event(ConnectionEvent::Connected);

        conn.sink.on_connection_event(ConnectionEvent::ShutdownComplete {
            app_close_in_progress: false,
        });

        assert_eq!(h.stream.conn_state(), ConnState::Destroyed);
        assert!(h.stream.is_closed());
        assert_eq!(h.counters.drops.load(Ordering::Relaxed), 1, "pipe released");
        assert!(matches!(
            h.stream.submit_recv(),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_ticket_gated_reconnect() {
        let config = QuicConfig::builder()
            .reconnect_delay(Duration::from_millis(20))
            .build();
        let h = connect_harness(config);
        let conn = last_conn(&h.provider);
        conn.sink.on_connection_event(ConnectionEvent::Connected);

        conn.sink.on_connection_event(ConnectionEvent::ResumptionTicket {
            ticket: vec![0xAB; 32],
        });
        assert!(h.stream.resumption_active());

        conn.sink.on_connection_event(ConnectionEvent::ShutdownComplete {
            app_close_in_progress: false,
        });
        assert_eq!(h.stream.conn_state(), ConnState::ShutdownComplete);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let conns = h.provider.conns.lock().clone();
        assert_eq!(conns.len(), 2, "a second connection was opened");
        let reconnected = conns[1].clone();
        assert_eq!(
            reconnected.ticket.lock().clone(),
            Some(vec![0xAB; 32]),
            "ticket installed before start"
        );
        assert!(reconnected.started.lock().is_some());
        assert_eq!(h.stream.conn_state(), ConnState::Connecting);
    }

    #[tokio::test]
    async fn test_explicit_close_suppresses_reconnect() {
        let config = QuicConfig::builder()
            .reconnect_delay(Duration::from_millis(10))
            .build();
        let h = connect_harness(config);
        let conn = last_conn(&h.provider);
        conn.sink.on_connection_event(ConnectionEvent::Connected);
        conn.sink.on_connection_event(ConnectionEvent::ResumptionTicket {
            ticket: vec![1, 2, 3],
        });

        h.stream.close();
        assert_eq!(conn.shutdowns.load(Ordering::Relaxed), 1);

        conn.sink.on_connection_event(ConnectionEvent::ShutdownComplete {
            app_close_in_progress: false,
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.provider.conns.lock().len(), 1, "no reconnect after close");
        assert_eq!(h.stream.conn_state(), ConnState::Destroyed);
    }

    #[tokio::test]
    async fn test_oversized_ticket_ignored() {
        let h = connect_harness(QuicConfig::default());
        let conn = last_conn(&h.provider);

        conn.sink.on_connection_event(ConnectionEvent::ResumptionTicket {
            ticket: vec![0u8; MAX_TICKET_LEN + 1],
        });
        assert!(!h.stream.resumption_active());
    }

    #[tokio::test]
    async fn test_queued_send_flushed_on_connected() {
        let h = connect_harness(QuicConfig::default());
        let conn = last_conn(&h.provider);

        let packet = Packet::compose(0x10, &[0x00, 0x04]).unwrap();
        let _handle = h.stream.submit_send(packet).unwrap();
        assert!(conn.io.sent.lock().is_empty());

        conn.sink.on_connection_event(ConnectionEvent::Connected);
        assert_eq!(conn.io.sent.lock().len(), 1, "queued send kicked");
    }
}
