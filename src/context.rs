//! Per-connection context
//!
//! Created by the front-end once the handshake completes and passed
//! read-only to the policy composer and dispatcher.

use std::net::SocketAddr;

/// Transport the connection arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Quic,
}

/// Negotiated application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    H2,
    H3,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::H2 => "h2",
            Protocol::H3 => "h3",
        }
    }

    pub fn from_http_version(version: http::Version) -> Self {
        match version {
            http::Version::HTTP_2 => Protocol::H2,
            http::Version::HTTP_3 => Protocol::H3,
            _ => Protocol::Http1,
        }
    }
}

/// Read-only per-connection state, owned by the front-end.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionContext {
    pub client_addr: SocketAddr,
    pub transport: Transport,
    pub protocol: Protocol,
    /// True while the request arrived as TLS/QUIC 0-RTT early data, i.e.
    /// before handshake completion. Early requests are replayable and are
    /// restricted to idempotent methods.
    pub early_data: bool,
}

impl ConnectionContext {
    pub fn new(client_addr: SocketAddr, transport: Transport, protocol: Protocol) -> Self {
        Self {
            client_addr,
            transport,
            protocol,
            early_data: false,
        }
    }

    pub fn with_early_data(mut self, early: bool) -> Self {
        self.early_data = early;
        self
    }
}
