// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-session stream: request queues, receive ring, decoder pump.
//!
//! One `Stream` per logical MQTT session. A single mutex serializes
//! every field; provider callbacks only do bookkeeping under it, and
//! waiter completions always fire after the lock is released. The
//! decoder runs on a runtime task (the pump), never inside a provider
//! callback.
//!
//! Ordering guarantees:
//!
//! - packets are delivered to receivers in QUIC delivery order,
//! - sends are transmitted in submission order, one in flight at a
//!   time,
//! - a request not at the head of its queue can be cancelled; an
//!   in-flight send cannot.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::QuicConfig;
use crate::decode::{DecodeStep, Decoder};
use crate::pipe::{Pipe, ProtocolEngine};
use crate::provider::{
    ConnState, ConnectionEvent, ConnectionIo, EventSink, QuicProvider, StreamEvent, StreamIo,
};
use crate::queue::PacketQueue;
use crate::ring::RecvRing;
use crate::{Packet, TransportError, TransportResult};

/// A queued send request.
pub(crate) struct SendWaiter {
    pub(crate) id: u64,
    pub(crate) packet: Packet,
    pub(crate) done: oneshot::Sender<TransportResult<()>>,
}

/// A queued receive request.
pub(crate) struct RecvWaiter {
    pub(crate) id: u64,
    pub(crate) done: oneshot::Sender<TransportResult<Packet>>,
}

/// Completion handle for a queued send. Resolves when the packet has
/// been handed to QUIC and the send completed.
#[derive(Debug)]
pub struct SendHandle {
    id: u64,
    rx: oneshot::Receiver<TransportResult<()>>,
}

impl SendHandle {
    /// Request id, usable with [`Stream::cancel_send`].
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for SendHandle {
    type Output = TransportResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Closed),
        })
    }
}

/// Completion handle for a queued receive. Resolves with the next
/// decoded packet in delivery order.
#[derive(Debug)]
pub struct RecvHandle {
    id: u64,
    rx: oneshot::Receiver<TransportResult<Packet>>,
}

impl RecvHandle {
    /// Request id, usable with [`Stream::cancel_recv`].
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for RecvHandle {
    type Output = TransportResult<Packet>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Closed),
        })
    }
}

/// Captured session resumption state.
#[derive(Debug, Default)]
pub(crate) struct Resumption {
    /// Opaque ticket bytes, never cleared once captured.
    pub(crate) ticket: Vec<u8>,
    /// Set when the first ticket arrives; gates reconnect.
    pub(crate) active: bool,
}

/// Everything the stream mutex guards.
pub(crate) struct StreamState {
    pub(crate) conn: Option<Arc<dyn ConnectionIo>>,
    pub(crate) io: Option<Arc<dyn StreamIo>>,
    pub(crate) pipe: Option<Box<dyn Pipe>>,
    pub(crate) conn_state: ConnState,
    pub(crate) closed: bool,
    /// Suppresses reconnect even with an active ticket (protocol
    /// errors, explicit close).
    pub(crate) fatal: bool,
    pub(crate) pump_scheduled: bool,
    pub(crate) send_queue: VecDeque<SendWaiter>,
    pub(crate) recv_queue: VecDeque<RecvWaiter>,
    pub(crate) overflow: PacketQueue,
    pub(crate) ring: RecvRing,
    pub(crate) decoder: Decoder,
    pub(crate) resumption: Resumption,
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// One MQTT-over-QUIC session stream.
pub struct Stream {
    pub(crate) state: Mutex<StreamState>,
    pub(crate) provider: Arc<dyn QuicProvider>,
    pub(crate) engine: Arc<dyn ProtocolEngine>,
    pub(crate) config: QuicConfig,
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) this: Weak<Stream>,
    next_id: AtomicU64,
}

impl Stream {
    pub(crate) fn new(
        provider: Arc<dyn QuicProvider>,
        engine: Arc<dyn ProtocolEngine>,
        config: QuicConfig,
        runtime: tokio::runtime::Handle,
        host: String,
        port: u16,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Stream {
            state: Mutex::new(StreamState {
                conn: None,
                io: None,
                pipe: None,
                conn_state: ConnState::Idle,
                closed: false,
                fatal: false,
                pump_scheduled: false,
                send_queue: VecDeque::new(),
                recv_queue: VecDeque::new(),
                overflow: PacketQueue::new(
                    config.overflow_capacity,
                    config.overflow_max_capacity,
                ),
                ring: RecvRing::with_capacity(config.ring_capacity),
                decoder: Decoder::new(),
                resumption: Resumption::default(),
                host,
                port,
            }),
            provider,
            engine,
            config,
            runtime,
            this: this.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn arc(&self) -> Option<Arc<Stream>> {
        self.this.upgrade()
    }

    /// Current lifecycle state.
    pub fn conn_state(&self) -> ConnState {
        self.state.lock().conn_state
    }

    /// True once the stream has been closed or destroyed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True once a resumption ticket has been captured.
    pub fn resumption_active(&self) -> bool {
        self.state.lock().resumption.active
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Queue a packet for transmission. Fails immediately with
    /// `Closed` on a closed stream; completes asynchronously through
    /// the returned handle.
    pub fn submit_send(&self, packet: Packet) -> TransportResult<SendHandle> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        let failed = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::Closed);
            }
            st.send_queue.push_back(SendWaiter {
                id,
                packet,
                done: tx,
            });
            if st.send_queue.len() == 1 {
                Self::kick_sender(&mut st)
            } else {
                Vec::new()
            }
        };
        Self::fail_sends(failed);

        Ok(SendHandle { id, rx })
    }

    /// Send a packet and wait for transmission to complete.
    pub async fn send(&self, packet: Packet) -> TransportResult<()> {
        self.submit_send(packet)?.await
    }

    /// Cancel a queued send. The head of the queue is already with
    /// QUIC and runs to completion; cancelling it is a no-op.
    pub fn cancel_send(&self, id: u64) -> bool {
        let waiter = {
            let mut st = self.state.lock();
            match st.send_queue.iter().position(|w| w.id == id) {
                Some(0) | None => None,
                Some(pos) => st.send_queue.remove(pos),
            }
        };
        match waiter {
            Some(w) => {
                let _ = w.done.send(Err(TransportError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Hand the head of the send queue to QUIC as two buffers.
    ///
    /// Returns waiters to fail outside the lock: the whole queue on a
    /// closed stream, or heads whose submission was rejected.
    pub(crate) fn kick_sender(
        st: &mut StreamState,
    ) -> Vec<(SendWaiter, TransportError)> {
        let mut failed = Vec::new();

        if st.closed {
            while let Some(w) = st.send_queue.pop_front() {
                failed.push((w, TransportError::Closed));
            }
            return failed;
        }

        // Before the handshake completes there is nothing to submit
        // to; the queue is kicked again once the stream handle lands.
        let Some(io) = st.io.clone() else {
            return failed;
        };

        while let Some(head) = st.send_queue.front() {
            let header = head.packet.header().to_vec();
            let body = head.packet.body().to_vec();
            match io.start_send(header, body) {
                Ok(()) => break,
                Err(err) => {
                    log::warn!("[MQTT-QUIC] send submission failed: {}", err);
                    if let Some(w) = st.send_queue.pop_front() {
                        failed.push((w, err));
                    }
                }
            }
        }
        failed
    }

    pub(crate) fn fail_sends(failed: Vec<(SendWaiter, TransportError)>) {
        for (w, err) in failed {
            let _ = w.done.send(Err(err));
        }
    }

    /// Stream-level send completion: advance the queue, then complete
    /// the finished request outside the lock.
    fn on_send_complete(&self, ok: bool) {
        let (head, failed) = {
            let mut st = self.state.lock();
            let head = st.send_queue.pop_front();
            let failed = Self::kick_sender(&mut st);
            (head, failed)
        };

        if let Some(w) = head {
            let result = if ok {
                Ok(())
            } else {
                Err(TransportError::Transport("send aborted".to_string()))
            };
            let _ = w.done.send(result);
        }
        Self::fail_sends(failed);
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Queue a request for the next decoded packet. Packets already
    /// parked in the overflow queue complete the request right away.
    pub fn submit_recv(&self) -> TransportResult<RecvHandle> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        let mut st = self.state.lock();
        if st.closed {
            return Err(TransportError::Closed);
        }
        if let Some(packet) = st.overflow.pop() {
            drop(st);
            let _ = tx.send(Ok(packet));
            return Ok(RecvHandle { id, rx });
        }

        st.recv_queue.push_back(RecvWaiter { id, done: tx });
        if st.recv_queue.len() == 1 {
            if st.decoder.at_boundary() {
                st.decoder.reset();
            }
            if !st.ring.is_empty() {
                // Bytes piled up while nobody was waiting.
                self.schedule_pump_locked(&mut st);
            } else if let Some(io) = st.io.clone() {
                io.set_receive_enabled(true);
            }
        }
        drop(st);
        Ok(RecvHandle { id, rx })
    }

    /// Wait for the next decoded packet.
    pub async fn recv(&self) -> TransportResult<Packet> {
        self.submit_recv()?.await
    }

    /// Cancel a queued receive. Unlike sends, the head may be
    /// cancelled; a packet completing with no waiter parks in the
    /// overflow queue.
    pub fn cancel_recv(&self, id: u64) -> bool {
        let waiter = {
            let mut st = self.state.lock();
            st.recv_queue
                .iter()
                .position(|w| w.id == id)
                .and_then(|pos| st.recv_queue.remove(pos))
        };
        match waiter {
            Some(w) => {
                let _ = w.done.send(Err(TransportError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Stream-level receive: append the chunk to the ring, ack it to
    /// QUIC, and let the pump do the decoding outside this callback.
    fn on_receive(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        if st.closed {
            log::trace!("[MQTT-QUIC] dropping {} bytes on closed stream", chunk.len());
            return;
        }
        st.ring.append(&chunk);
        if let Some(io) = st.io.clone() {
            io.receive_complete(chunk.len());
        }
        if !st.recv_queue.is_empty() {
            self.schedule_pump_locked(&mut st);
        }
    }

    pub(crate) fn schedule_pump_locked(&self, st: &mut StreamState) {
        if st.pump_scheduled {
            return;
        }
        let Some(this) = self.arc() else {
            return;
        };
        st.pump_scheduled = true;
        self.runtime.spawn(async move {
            this.pump();
        });
    }

    /// Decoder pump. Runs on a runtime task: advances the frame state
    /// machine and delivers completed packets until the ring runs dry
    /// or no waiters remain.
    fn pump(&self) {
        self.state.lock().pump_scheduled = false;

        enum Action {
            Stop,
            Enable(Option<Arc<dyn StreamIo>>),
            Deliver {
                waiter: RecvWaiter,
                packet: Packet,
                more: bool,
            },
            Drain(Vec<RecvWaiter>),
            Fatal {
                sends: Vec<SendWaiter>,
                recvs: Vec<RecvWaiter>,
                conn: Option<Arc<dyn ConnectionIo>>,
                err: TransportError,
            },
        }

        loop {
            let action = {
                let mut st = self.state.lock();
                if st.closed {
                    Action::Drain(st.recv_queue.drain(..).collect())
                } else {
                    let step = {
                        let StreamState {
                            ref mut decoder,
                            ref mut ring,
                            ..
                        } = *st;
                        decoder.step(ring)
                    };
                    match step {
                        Ok(DecodeStep::NeedMore) => {
                            st.ring.compact();
                            if st.recv_queue.is_empty() {
                                Action::Stop
                            } else {
                                Action::Enable(st.io.clone())
                            }
                        }
                        Ok(DecodeStep::Complete(packet)) => match st.recv_queue.pop_front() {
                            Some(waiter) => {
                                st.ring.compact();
                                Action::Deliver {
                                    waiter,
                                    packet,
                                    more: !st.recv_queue.is_empty(),
                                }
                            }
                            None => {
                                // No waiter (head was cancelled): park it.
                                if st.overflow.push(packet).is_err() {
                                    log::warn!(
                                        "[MQTT-QUIC] overflow queue at ceiling, packet dropped"
                                    );
                                }
                                st.ring.compact();
                                Action::Stop
                            }
                        },
                        Err(err) => {
                            st.closed = true;
                            st.fatal = true;
                            st.conn_state = ConnState::Draining;
                            Action::Fatal {
                                sends: st.send_queue.drain(..).collect(),
                                recvs: st.recv_queue.drain(..).collect(),
                                conn: st.conn.clone(),
                                err,
                            }
                        }
                    }
                }
            };

            match action {
                Action::Stop => return,
                Action::Enable(io) => {
                    if let Some(io) = io {
                        io.set_receive_enabled(true);
                    }
                    return;
                }
                Action::Deliver {
                    waiter,
                    packet,
                    more,
                } => {
                    let _ = waiter.done.send(Ok(packet));
                    if !more {
                        return;
                    }
                }
                Action::Drain(waiters) => {
                    for w in waiters {
                        let _ = w.done.send(Err(TransportError::Closed));
                    }
                    return;
                }
                Action::Fatal {
                    sends,
                    recvs,
                    conn,
                    err,
                } => {
                    log::warn!("[MQTT-QUIC] closing stream: {}", err);
                    Self::fail_sends(sends.into_iter().map(|w| (w, err.clone())).collect());
                    for w in recvs {
                        let _ = w.done.send(Err(TransportError::Closed));
                    }
                    if let Some(conn) = conn {
                        conn.shutdown();
                    }
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close the stream: terminal. All queued requests fail with
    /// `Closed` and the connection is shut down gracefully.
    pub fn close(&self) {
        let (sends, recvs, conn) = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.fatal = true;
            st.conn_state = ConnState::Draining;
            (
                st.send_queue.drain(..).collect::<Vec<_>>(),
                st.recv_queue.drain(..).collect::<Vec<_>>(),
                st.conn.clone(),
            )
        };

        for w in sends {
            let _ = w.done.send(Err(TransportError::Closed));
        }
        for w in recvs {
            let _ = w.done.send(Err(TransportError::Closed));
        }
        if let Some(conn) = conn {
            conn.shutdown();
        }
    }

    /// Final teardown: mark destroyed and fail anything still queued.
    pub(crate) fn destroy(&self) {
        let (sends, recvs) = {
            let mut st = self.state.lock();
            st.closed = true;
            st.conn_state = ConnState::Destroyed;
            (
                st.send_queue.drain(..).collect::<Vec<_>>(),
                st.recv_queue.drain(..).collect::<Vec<_>>(),
            )
        };
        for w in sends {
            let _ = w.done.send(Err(TransportError::Closed));
        }
        for w in recvs {
            let _ = w.done.send(Err(TransportError::Closed));
        }
    }
}

impl EventSink for Stream {
    fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected(),
            ConnectionEvent::ShutdownByTransport { status } => {
                self.on_shutdown_by_transport(status)
            }
            ConnectionEvent::ShutdownByPeer { error_code } => {
                self.on_shutdown_by_peer(error_code)
            }
            ConnectionEvent::ShutdownComplete {
                app_close_in_progress,
            } => self.on_shutdown_complete(app_close_in_progress),
            ConnectionEvent::ResumptionTicket { ticket } => self.on_resumption_ticket(ticket),
        }
    }

    fn on_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Receive { chunk } => self.on_receive(chunk),
            StreamEvent::SendComplete { ok } => self.on_send_complete(ok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct NullEngine;

    impl ProtocolEngine for NullEngine {
        fn create_pipe(&self, _stream: crate::StreamHandle) -> TransportResult<Box<dyn Pipe>> {
            struct NullPipe;
            impl Pipe for NullPipe {
                fn start(&mut self) {}
                fn close(&mut self) {}
                fn stop(&mut self) {}
            }
            Ok(Box::new(NullPipe))
        }
    }

    struct NullProvider;

    impl QuicProvider for NullProvider {
        fn open_connection(
            &self,
            _sink: Arc<dyn EventSink>,
        ) -> TransportResult<Arc<dyn ConnectionIo>> {
            Err(TransportError::Transport("not used in unit tests".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingIo {
        sent: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
        enabled: AtomicBool,
        acked: AtomicU64,
        fail_sends: AtomicBool,
    }

    impl StreamIo for RecordingIo {
        fn start_send(&self, header: Vec<u8>, body: Vec<u8>) -> TransportResult<()> {
            if self.fail_sends.load(Ordering::Relaxed) {
                return Err(TransportError::Transport("rejected".to_string()));
            }
            self.sent.lock().push((header, body));
            Ok(())
        }

        fn set_receive_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::Relaxed);
        }

        fn receive_complete(&self, consumed: usize) {
            self.acked.fetch_add(consumed as u64, Ordering::Relaxed);
        }

        fn close(&self) {}
    }

    fn test_stream() -> (Arc<Stream>, Arc<RecordingIo>) {
        test_stream_with(QuicConfig::default())
    }

    fn test_stream_with(config: QuicConfig) -> (Arc<Stream>, Arc<RecordingIo>) {
        let stream = Stream::new(
            Arc::new(NullProvider),
            Arc::new(NullEngine),
            config,
            tokio::runtime::Handle::current(),
            "broker.local".to_string(),
            1883,
        );
        let io = Arc::new(RecordingIo::default());
        {
            let mut st = stream.state.lock();
            st.io = Some(io.clone());
            st.conn_state = ConnState::Ready;
        }
        (stream, io)
    }

    fn puback(tag: u8) -> Packet {
        Packet::new(vec![0x40, 0x02], vec![0x00, tag])
    }

    #[tokio::test]
    async fn test_send_head_submitted_immediately() {
        let (stream, io) = test_stream();

        let h1 = stream.submit_send(puback(1)).unwrap();
        let h2 = stream.submit_send(puback(2)).unwrap();

        // Only the head goes to QUIC.
        assert_eq!(io.sent.lock().len(), 1);

        stream.on_stream_event(StreamEvent::SendComplete { ok: true });
        h1.await.unwrap();
        assert_eq!(io.sent.lock().len(), 2);

        stream.on_stream_event(StreamEvent::SendComplete { ok: true });
        h2.await.unwrap();

        let sent = io.sent.lock();
        assert_eq!(sent[0].1, vec![0x00, 1]);
        assert_eq!(sent[1].1, vec![0x00, 2]);
    }

    #[tokio::test]
    async fn test_cancel_send_head_is_noop() {
        let (stream, _io) = test_stream();

        let h1 = stream.submit_send(puback(1)).unwrap();
        let h2 = stream.submit_send(puback(2)).unwrap();

        assert!(!stream.cancel_send(h1.id()), "head is already in flight");
        assert!(stream.cancel_send(h2.id()));

        assert!(matches!(h2.await, Err(TransportError::Cancelled)));

        stream.on_stream_event(StreamEvent::SendComplete { ok: true });
        h1.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_submission_failure_fails_request() {
        let (stream, io) = test_stream();
        io.fail_sends.store(true, Ordering::Relaxed);

        let h = stream.submit_send(puback(1)).unwrap();
        assert!(matches!(h.await, Err(TransportError::Transport(_))));
        assert!(stream.state.lock().send_queue.is_empty());
    }

    #[tokio::test]
    async fn test_recv_delivers_from_chunk() {
        let (stream, io) = test_stream();

        let h = stream.submit_recv().unwrap();
        assert!(io.enabled.load(Ordering::Relaxed), "head waiter enables delivery");

        stream.on_stream_event(StreamEvent::Receive {
            chunk: vec![0xD0, 0x00],
        });
        assert_eq!(io.acked.load(Ordering::Relaxed), 2, "chunk acked in full");

        let packet = tokio::time::timeout(Duration::from_secs(2), h)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.header(), &[0xD0, 0x00]);
    }

    #[tokio::test]
    async fn test_recv_served_from_overflow_synchronously() {
        let (stream, _io) = test_stream();

        stream.state.lock().overflow.push(puback(7)).unwrap();

        let h = stream.submit_recv().unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), h)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.body(), &[0x00, 7]);
    }

    #[tokio::test]
    async fn test_cancelled_head_recv_parks_packet() {
        let (stream, _io) = test_stream();

        let h = stream.submit_recv().unwrap();
        assert!(stream.cancel_recv(h.id()));
        assert!(matches!(h.await, Err(TransportError::Cancelled)));

        stream.on_stream_event(StreamEvent::Receive {
            chunk: vec![0x40, 0x02, 0x00, 0x09],
        });
        // No waiter: pump was not scheduled, bytes sit in the ring
        // until the next receive arrives and drains them.
        let h = stream.submit_recv().unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), h)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.body(), &[0x00, 0x09]);
    }

    #[tokio::test]
    async fn test_closed_rejects_submissions() {
        let (stream, _io) = test_stream();

        let pending_send = stream.submit_send(puback(1)).unwrap();
        let pending_recv = stream.submit_recv().unwrap();

        stream.close();

        assert!(matches!(pending_send.await, Err(TransportError::Closed)));
        assert!(matches!(pending_recv.await, Err(TransportError::Closed)));

        assert!(matches!(
            stream.submit_send(puback(2)),
            Err(TransportError::Closed)
        ));
        assert!(matches!(stream.submit_recv(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_protocol_error_tears_down() {
        let (stream, _io) = test_stream();

        let h = stream.submit_recv().unwrap();
        stream.on_stream_event(StreamEvent::Receive {
            chunk: vec![0x30, 0xFF, 0xFF, 0xFF, 0xFF],
        });

        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), h).await.unwrap(),
            Err(TransportError::Closed)
        ));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_overflow_drop_at_ceiling() {
        let (stream, _io) =
            test_stream_with(QuicConfig::builder().overflow_capacity(1, 1).build());

        // Head-cancel race: the packet completes with no waiter while
        // the overflow queue is already at its ceiling.
        let r = stream.submit_recv().unwrap();
        stream.on_stream_event(StreamEvent::Receive {
            chunk: vec![0x40, 0x02, 0x00, 0x01],
        });
        assert!(stream.cancel_recv(r.id()));
        stream.state.lock().overflow.push(puback(0xEE)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        // The pre-parked packet survives; the decoded one was dropped.
        let h = stream.submit_recv().unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), h)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.body(), &[0x00, 0xEE]);

        let starved = stream.submit_recv().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), starved)
                .await
                .is_err(),
            "dropped packet must never be delivered"
        );
    }

    #[tokio::test]
    async fn test_sends_queue_before_ready() {
        let stream = Stream::new(
            Arc::new(NullProvider),
            Arc::new(NullEngine),
            QuicConfig::default(),
            tokio::runtime::Handle::current(),
            "broker.local".to_string(),
            1883,
        );

        // No io handle installed yet: the submit queues silently.
        let _h = stream.submit_send(puback(1)).unwrap();
        assert_eq!(stream.state.lock().send_queue.len(), 1);
    }
}
