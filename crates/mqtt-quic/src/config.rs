// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport configuration.

use std::time::Duration;

/// ALPN identifier carried in the TLS handshake.
pub const ALPN_MQTT: &[u8] = b"mqtt";

/// Maximum resumption ticket size retained per stream.
pub const MAX_TICKET_LEN: usize = 2048;

/// MQTT-over-QUIC transport configuration.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Server name for TLS SNI (default: None, use the connect host).
    pub server_name: Option<String>,

    /// Connection idle timeout (default: 100 s).
    ///
    /// Expiry causes a transport-initiated shutdown; with an active
    /// resumption ticket the stream reconnects automatically.
    pub idle_timeout: Duration,

    /// Keep-alive interval at the QUIC layer (default: disabled).
    ///
    /// MQTT has its own PINGREQ/PINGRESP keep-alive above this
    /// transport, so QUIC-level pings are off unless asked for.
    pub keep_alive_interval: Option<Duration>,

    /// Delay before a ticket-gated reconnect attempt (default: 3 s).
    pub reconnect_delay: Duration,

    /// Initial capacity of the receive ring in bytes (default: 4 KiB).
    pub ring_capacity: usize,

    /// Initial capacity of the decoded-packet overflow queue
    /// (default: 16 packets).
    pub overflow_capacity: usize,

    /// Ceiling the overflow queue may grow to by doubling
    /// (default: 1024 packets). Packets decoded past a full queue at
    /// the ceiling are dropped.
    pub overflow_max_capacity: usize,

    /// Root CA certificate(s) in PEM form for server verification.
    ///
    /// If None, the WebPKI root store is used.
    pub root_ca_pem: Option<String>,

    /// Skip server certificate verification (for testing only).
    ///
    /// **WARNING**: Never use in production!
    pub dangerous_skip_verify: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            idle_timeout: Duration::from_secs(100),
            keep_alive_interval: None,
            reconnect_delay: Duration::from_secs(3),
            ring_capacity: 4096,
            overflow_capacity: 16,
            overflow_max_capacity: 1024,
            root_ca_pem: None,
            dangerous_skip_verify: false,
        }
    }
}

impl QuicConfig {
    /// Create a new configuration builder.
    pub fn builder() -> QuicConfigBuilder {
        QuicConfigBuilder::default()
    }
}

/// Builder for transport configuration.
#[derive(Debug, Default)]
pub struct QuicConfigBuilder {
    config: QuicConfig,
}

impl QuicConfigBuilder {
    /// Set the server name for TLS SNI.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    /// Set the connection idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the QUIC keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = Some(interval);
        self
    }

    /// Set the delay before a ticket-gated reconnect.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the initial receive ring capacity in bytes.
    pub fn ring_capacity(mut self, bytes: usize) -> Self {
        self.config.ring_capacity = bytes;
        self
    }

    /// Set the initial and maximum overflow queue capacity.
    pub fn overflow_capacity(mut self, initial: usize, max: usize) -> Self {
        self.config.overflow_capacity = initial;
        self.config.overflow_max_capacity = max.max(initial);
        self
    }

    /// Set root CA certificate(s) in PEM form.
    pub fn root_ca(mut self, pem: impl Into<String>) -> Self {
        self.config.root_ca_pem = Some(pem.into());
        self
    }

    /// Skip server certificate verification (testing only).
    ///
    /// # Warning
    ///
    /// This completely disables TLS security. Only use for local testing.
    pub fn dangerous_skip_verify(mut self) -> Self {
        self.config.dangerous_skip_verify = true;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> QuicConfig {
        self.config
    }
}
