//! Bastion Gate - TLS-terminating security gateway
//!
//! A reverse proxy that fronts a single backend application and owns the
//! whole client-facing security surface:
//! - TLS 1.3 and QUIC termination with ALPN across HTTP/1.1, HTTP/2 and
//!   HTTP/3, OCSP stapling and session resumption
//! - A per-request response policy: nonce-bearing CSP (enforcing plus
//!   report-only), HSTS and the rest of the baseline header set
//! - Sensitive-route rate limiting and a regex WAF gate ahead of dispatch
//! - Plain-HTTP 301 redirection and well-known static passthroughs

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod ocsp;
pub mod policy;
pub mod quic_listener;
pub mod rate_limit;
pub mod static_assets;
pub mod tls_store;
pub mod waf;

pub use config::{ConfigManager, GatewayConfig};
pub use context::{ConnectionContext, Protocol, Transport};
pub use dispatch::BackendDispatcher;
pub use error::GatewayError;
pub use listener::{build_router, run_http_redirect, run_https_listener, GatewayState};
pub use ocsp::OcspRefresher;
pub use policy::{NonceSource, OsNonceSource, PolicyComposer};
pub use quic_listener::QuicListener;
pub use rate_limit::{RateDecision, SensitiveRateLimiter};
pub use static_assets::StaticAssets;
pub use tls_store::CertificateStore;
pub use waf::{WafGate, WafOutcome, WafRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
