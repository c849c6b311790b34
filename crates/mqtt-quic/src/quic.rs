// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! quinn-backed QUIC provider.
//!
//! Maps the provider contract onto quinn 0.11 + rustls 0.23:
//!
//! - one lazily created client endpoint per provider, bound to
//!   `0.0.0.0:0`, shared across connections and reconnects,
//! - a driver task per connection translating quinn I/O into
//!   `ConnectionEvent`/`StreamEvent` calls on the sink,
//! - command handles (`ConnectionIo`/`StreamIo`) that never block:
//!   they push onto an unbounded channel the driver drains,
//! - TLS 1.3 session tickets observed through a client-session-store
//!   wrapper. rustls keeps the ticket itself, so the event carries an
//!   empty marker and `set_resumption_ticket` is satisfied by endpoint
//!   reuse (the shared store resumes the session on reconnect).
//!
//! Receive follows the explicit pull model: the reader pauses itself
//! after every delivered chunk and waits for `set_receive_enabled`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use quinn::VarInt;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;
use tokio::sync::{mpsc, watch};

use crate::config::{QuicConfig, ALPN_MQTT};
use crate::provider::{
    ConnectionEvent, ConnectionIo, EventSink, QuicProvider, StreamEvent, StreamIo,
};
use crate::{TransportError, TransportResult};

/// Largest chunk pulled from quinn per read.
const RECV_CHUNK_BYTES: usize = 64 * 1024;

/// TLS 1.3 tickets retained per server name.
const MAX_TLS13_TICKETS: usize = 2;

/// quinn-backed provider: endpoint plus shared session cache.
pub struct QuinnProvider {
    config: QuicConfig,
    cache: Arc<SessionCache>,
    endpoint: Arc<Mutex<Option<quinn::Endpoint>>>,
}

impl QuinnProvider {
    /// Create a provider. The endpoint is bound on first connect.
    pub fn new(config: QuicConfig) -> Self {
        Self {
            config,
            cache: Arc::new(SessionCache::default()),
            endpoint: Arc::new(Mutex::new(None)),
        }
    }
}

impl QuicProvider for QuinnProvider {
    fn open_connection(&self, sink: Arc<dyn EventSink>) -> TransportResult<Arc<dyn ConnectionIo>> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(QuinnConnection {
            config: self.config.clone(),
            cache: self.cache.clone(),
            endpoint: self.endpoint.clone(),
            sink,
            inner: Mutex::new(ConnInner {
                started: false,
                cmd_tx: Some(cmd_tx),
                cmd_rx: Some(cmd_rx),
            }),
        }))
    }
}

// ============================================================================
// Connection handle and driver
// ============================================================================

enum ConnCmd {
    OpenStream {
        sink: Arc<dyn EventSink>,
        enabled: Arc<watch::Sender<bool>>,
    },
    Send {
        header: Vec<u8>,
        body: Vec<u8>,
    },
    CloseStream,
    Shutdown,
}

struct ConnInner {
    started: bool,
    cmd_tx: Option<mpsc::UnboundedSender<ConnCmd>>,
    cmd_rx: Option<mpsc::UnboundedReceiver<ConnCmd>>,
}

struct QuinnConnection {
    config: QuicConfig,
    cache: Arc<SessionCache>,
    endpoint: Arc<Mutex<Option<quinn::Endpoint>>>,
    sink: Arc<dyn EventSink>,
    inner: Mutex<ConnInner>,
}

impl QuinnConnection {
    fn endpoint_handle(&self) -> TransportResult<quinn::Endpoint> {
        let mut slot = self.endpoint.lock();
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.clone());
        }
        let endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(|e| TransportError::Transport(format!("endpoint bind failed: {}", e)))?;
        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }
}

impl ConnectionIo for QuinnConnection {
    fn set_resumption_ticket(&self, ticket: &[u8]) -> TransportResult<()> {
        // The ticket lives in the shared rustls session store; the
        // bytes handed back here are the arrival marker.
        log::debug!(
            "[MQTT-QUIC] resumption via shared session store ({} marker bytes)",
            ticket.len()
        );
        Ok(())
    }

    fn start(&self, host: &str, port: u16) -> TransportResult<()> {
        let cmd_rx = {
            let mut inner = self.inner.lock();
            if inner.started {
                return Err(TransportError::Transport(
                    "connection already started".to_string(),
                ));
            }
            inner.started = true;
            inner.cmd_rx.take()
        };
        let Some(cmd_rx) = cmd_rx else {
            return Err(TransportError::Transport(
                "connection handle already released".to_string(),
            ));
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::Transport("no tokio runtime".to_string()))?;

        let endpoint = self.endpoint_handle()?;
        let (ticket_tx, ticket_rx) = mpsc::unbounded_channel();
        let client_config = build_client_config(&self.config, self.cache.clone(), ticket_tx)?;

        let server_name = self
            .config
            .server_name
            .clone()
            .unwrap_or_else(|| host.to_string());

        runtime.spawn(drive(
            endpoint,
            client_config,
            host.to_string(),
            port,
            server_name,
            self.sink.clone(),
            cmd_rx,
            ticket_rx,
        ));
        Ok(())
    }

    fn open_stream(&self, sink: Arc<dyn EventSink>) -> TransportResult<Arc<dyn StreamIo>> {
        let cmd_tx = {
            let inner = self.inner.lock();
            inner.cmd_tx.clone()
        };
        let Some(cmd_tx) = cmd_tx else {
            return Err(TransportError::Transport(
                "connection handle already released".to_string(),
            ));
        };

        // Delivery starts disabled: explicit pull model.
        let (enabled_tx, _) = watch::channel(false);
        let enabled = Arc::new(enabled_tx);
        let io = Arc::new(QuinnStreamIo {
            cmd_tx: cmd_tx.clone(),
            enabled: enabled.clone(),
        });
        cmd_tx
            .send(ConnCmd::OpenStream { sink, enabled })
            .map_err(|_| TransportError::Transport("connection driver gone".to_string()))?;
        Ok(io)
    }

    fn shutdown(&self) {
        let cmd_tx = self.inner.lock().cmd_tx.clone();
        if let Some(cmd_tx) = cmd_tx {
            let _ = cmd_tx.send(ConnCmd::Shutdown);
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.cmd_tx = None;
        inner.cmd_rx = None;
    }
}

/// Command-channel face of the bidirectional stream.
struct QuinnStreamIo {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    enabled: Arc<watch::Sender<bool>>,
}

impl StreamIo for QuinnStreamIo {
    fn start_send(&self, header: Vec<u8>, body: Vec<u8>) -> TransportResult<()> {
        self.cmd_tx
            .send(ConnCmd::Send { header, body })
            .map_err(|_| TransportError::Transport("connection driver gone".to_string()))
    }

    fn set_receive_enabled(&self, enabled: bool) {
        self.enabled.send_replace(enabled);
    }

    fn receive_complete(&self, _consumed: usize) {
        // quinn returns flow-control credit as chunks are read; there
        // is no separate acknowledgement call.
    }

    fn close(&self) {
        let _ = self.cmd_tx.send(ConnCmd::CloseStream);
    }
}

/// Per-connection driver: owns the quinn connection and serializes
/// all stream I/O, so sends complete in submission order.
#[allow(clippy::too_many_arguments)]
async fn drive(
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    host: String,
    port: u16,
    server_name: String,
    sink: Arc<dyn EventSink>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    mut ticket_rx: mpsc::UnboundedReceiver<()>,
) {
    let connection =
        match connect_peer(&endpoint, client_config, &host, port, &server_name).await {
            Ok(connection) => connection,
            Err(err) => {
                log::warn!("[MQTT-QUIC] connect to {}:{} failed: {}", host, port, err);
                sink.on_connection_event(ConnectionEvent::ShutdownByTransport { status: 1 });
                sink.on_connection_event(ConnectionEvent::ShutdownComplete {
                    app_close_in_progress: false,
                });
                return;
            }
        };

    sink.on_connection_event(ConnectionEvent::Connected);

    let mut send_stream: Option<quinn::SendStream> = None;
    let mut cmd_done = false;

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !cmd_done => match cmd {
                Some(ConnCmd::OpenStream { sink: stream_sink, enabled }) => {
                    match connection.open_bi().await {
                        Ok((tx, rx)) => {
                            send_stream = Some(tx);
                            let pause = Arc::downgrade(&enabled);
                            let watch_rx = enabled.subscribe();
                            tokio::spawn(read_loop(rx, pause, watch_rx, stream_sink));
                        }
                        Err(err) => {
                            log::warn!("[MQTT-QUIC] stream open failed: {}", err);
                            connection.close(VarInt::from_u32(0), b"");
                        }
                    }
                }
                Some(ConnCmd::Send { header, body }) => {
                    let ok = write_buffers(send_stream.as_mut(), &header, &body).await;
                    sink.on_stream_event(StreamEvent::SendComplete { ok });
                }
                Some(ConnCmd::CloseStream) => {
                    if let Some(mut tx) = send_stream.take() {
                        let _ = tx.finish();
                    }
                }
                Some(ConnCmd::Shutdown) => {
                    connection.close(VarInt::from_u32(0), b"");
                }
                None => {
                    // Handle released with the connection still up.
                    cmd_done = true;
                    connection.close(VarInt::from_u32(0), b"");
                }
            },
            Some(()) = ticket_rx.recv() => {
                sink.on_connection_event(ConnectionEvent::ResumptionTicket {
                    ticket: Vec::new(),
                });
            }
            reason = connection.closed() => break reason,
        }
    };

    match reason {
        quinn::ConnectionError::ApplicationClosed(ref close) => {
            log::info!("[MQTT-QUIC] closed by peer: {}", close);
            sink.on_connection_event(ConnectionEvent::ShutdownByPeer {
                error_code: close.error_code.into_inner(),
            });
        }
        quinn::ConnectionError::LocallyClosed => {}
        ref other => {
            log::info!("[MQTT-QUIC] connection lost: {}", other);
            sink.on_connection_event(ConnectionEvent::ShutdownByTransport { status: 0 });
        }
    }
    sink.on_connection_event(ConnectionEvent::ShutdownComplete {
        app_close_in_progress: false,
    });
}

async fn connect_peer(
    endpoint: &quinn::Endpoint,
    client_config: quinn::ClientConfig,
    host: &str,
    port: u16,
    server_name: &str,
) -> Result<quinn::Connection, String> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("resolve failed: {}", e))?;
    let addr = addrs
        .next()
        .ok_or_else(|| format!("no address for {}", host))?;

    let connecting = endpoint
        .connect_with(client_config, addr, server_name)
        .map_err(|e| e.to_string())?;
    connecting.await.map_err(|e| e.to_string())
}

/// Pull-model reader: waits for delivery to be enabled, reads one
/// chunk, pauses delivery again, hands the chunk to the sink. Exits
/// when the stream handle is dropped or the stream ends.
async fn read_loop(
    mut rx: quinn::RecvStream,
    pause: std::sync::Weak<watch::Sender<bool>>,
    mut enabled: watch::Receiver<bool>,
    sink: Arc<dyn EventSink>,
) {
    loop {
        while !*enabled.borrow_and_update() {
            if enabled.changed().await.is_err() {
                return;
            }
        }

        match rx.read_chunk(RECV_CHUNK_BYTES, true).await {
            Ok(Some(chunk)) => {
                let Some(pause) = pause.upgrade() else {
                    return;
                };
                // Pause before delivery; the sink re-enables when it
                // wants more.
                pause.send_replace(false);
                sink.on_stream_event(StreamEvent::Receive {
                    chunk: chunk.bytes.to_vec(),
                });
            }
            Ok(None) => {
                log::debug!("[MQTT-QUIC] peer finished the stream");
                return;
            }
            Err(err) => {
                log::debug!("[MQTT-QUIC] stream read ended: {}", err);
                return;
            }
        }
    }
}

async fn write_buffers(
    stream: Option<&mut quinn::SendStream>,
    header: &[u8],
    body: &[u8],
) -> bool {
    let Some(stream) = stream else {
        log::warn!("[MQTT-QUIC] send submitted with no open stream");
        return false;
    };
    if !header.is_empty() {
        if let Err(err) = stream.write_all(header).await {
            log::debug!("[MQTT-QUIC] header write failed: {}", err);
            return false;
        }
    }
    if !body.is_empty() {
        if let Err(err) = stream.write_all(body).await {
            log::debug!("[MQTT-QUIC] body write failed: {}", err);
            return false;
        }
    }
    true
}

// ============================================================================
// TLS configuration and session-ticket observation
// ============================================================================

fn build_client_config(
    config: &QuicConfig,
    cache: Arc<SessionCache>,
    tickets: mpsc::UnboundedSender<()>,
) -> TransportResult<quinn::ClientConfig> {
    let builder = rustls::ClientConfig::builder();
    let mut crypto = if config.dangerous_skip_verify {
        log::warn!("[MQTT-QUIC] TLS verification DISABLED - dangerous_skip_verify=true");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else if let Some(pem) = &config.root_ca_pem {
        let mut roots = rustls::RootCertStore::empty();
        let mut reader = std::io::BufReader::new(pem.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert
                .map_err(|e| TransportError::Transport(format!("bad root CA PEM: {}", e)))?;
            roots
                .add(cert)
                .map_err(|e| TransportError::Transport(format!("root CA rejected: {}", e)))?;
        }
        if roots.is_empty() {
            return Err(TransportError::Transport(
                "no certificates in root CA PEM".to_string(),
            ));
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    crypto.alpn_protocols = vec![ALPN_MQTT.to_vec()];
    crypto.resumption = rustls::client::Resumption::store(Arc::new(TicketObserver {
        cache,
        tickets,
    }));
    crypto.enable_early_data = true;

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Transport(format!("TLS config rejected: {}", e)))?;
    let mut client = quinn::ClientConfig::new(Arc::new(quic_crypto));

    let mut transport = quinn::TransportConfig::default();
    let idle = quinn::IdleTimeout::try_from(config.idle_timeout)
        .map_err(|_| TransportError::Transport("idle timeout out of range".to_string()))?;
    transport.max_idle_timeout(Some(idle));
    if let Some(interval) = config.keep_alive_interval {
        transport.keep_alive_interval(Some(interval));
    }
    client.transport_config(Arc::new(transport));
    Ok(client)
}

/// Shared session state, retained across connections so a reconnect
/// resumes the TLS session.
#[derive(Default)]
struct SessionCache {
    kx_hints: Mutex<HashMap<ServerName<'static>, NamedGroup>>,
    tls12: Mutex<HashMap<ServerName<'static>, Tls12ClientSessionValue>>,
    tls13: Mutex<HashMap<ServerName<'static>, VecDeque<Tls13ClientSessionValue>>>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache").finish_non_exhaustive()
    }
}

/// Forwards to the shared cache and signals TLS 1.3 ticket arrival.
struct TicketObserver {
    cache: Arc<SessionCache>,
    tickets: mpsc::UnboundedSender<()>,
}

impl std::fmt::Debug for TicketObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketObserver").finish_non_exhaustive()
    }
}

impl ClientSessionStore for TicketObserver {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.cache.kx_hints.lock().insert(server_name, group);
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.cache
            .kx_hints
            .lock()
            .get(&server_name.to_owned())
            .copied()
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.cache.tls12.lock().insert(server_name, value);
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.cache
            .tls12
            .lock()
            .get(&server_name.to_owned())
            .cloned()
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.cache.tls12.lock().remove(server_name);
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        let mut tls13 = self.cache.tls13.lock();
        let entry = tls13.entry(server_name).or_default();
        if entry.len() == MAX_TLS13_TICKETS {
            entry.pop_front();
        }
        entry.push_back(value);
        drop(tls13);
        let _ = self.tickets.send(());
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        self.cache
            .tls13
            .lock()
            .get_mut(server_name)
            .and_then(|entry| entry.pop_front())
    }
}

/// Skip server certificate verification (for testing only).
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_skip_verify() {
        let config = QuicConfig::builder().dangerous_skip_verify().build();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = build_client_config(&config, Arc::new(SessionCache::default()), tx);
        assert!(result.is_ok());
    }

    #[test]
    fn test_client_config_webpki_default() {
        let config = QuicConfig::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = build_client_config(&config, Arc::new(SessionCache::default()), tx);
        assert!(result.is_ok());
    }

    #[test]
    fn test_client_config_custom_root_ca() {
        let cert = rcgen::generate_simple_self_signed(vec!["broker.local".to_string()]).unwrap();
        let config = QuicConfig::builder().root_ca(cert.cert.pem()).build();

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = build_client_config(&config, Arc::new(SessionCache::default()), tx);
        assert!(result.is_ok());
    }

    #[test]
    fn test_client_config_bad_root_ca() {
        let config = QuicConfig::builder().root_ca("not a certificate").build();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = build_client_config(&config, Arc::new(SessionCache::default()), tx);
        assert!(matches!(result, Err(TransportError::Transport(_))));
    }

    #[test]
    fn test_session_cache_kx_hints() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let observer = TicketObserver {
            cache: Arc::new(SessionCache::default()),
            tickets: tx,
        };

        let name = ServerName::try_from("broker.local").unwrap().to_owned();
        assert!(observer.kx_hint(&name).is_none());

        observer.set_kx_hint(name.clone(), NamedGroup::X25519);
        assert_eq!(observer.kx_hint(&name), Some(NamedGroup::X25519));
    }
}
