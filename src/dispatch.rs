//! Backend dispatcher
//!
//! Forwards passed requests to the single backend application over a
//! loopback socket, attaching forwarded-identity metadata so the backend
//! can reconstruct the real client context. Response bodies are streamed,
//! never buffered. Connect failures on idempotent requests are retried a
//! small bounded number of times with doubling backoff; anything else is
//! surfaced immediately as an upstream failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{request, Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::config::BackendConfig;
use crate::context::{ConnectionContext, Transport};
use crate::error::GatewayError;

/// Hop-by-hop headers stripped before forwarding.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct BackendDispatcher {
    client: Client<HttpConnector, Body>,
    config: RwLock<BackendConfig>,
    /// Requests actually handed to the backend client, for diagnostics.
    dispatched: AtomicU64,
}

impl BackendDispatcher {
    pub fn new(config: &BackendConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle)
            .pool_idle_timeout(Duration::from_secs(90))
            .build_http();

        Self {
            client,
            config: RwLock::new(config.clone()),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Install reloaded backend parameters. The connection pool is kept;
    /// only deadlines and retry budgets change.
    pub fn install(&self, config: &BackendConfig) {
        *self.config.write() = config.clone();
    }

    /// Number of requests handed to the backend so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Forward one request and stream the response back.
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        ctx: &ConnectionContext,
        host: &str,
    ) -> Result<Response<Body>, GatewayError> {
        let config = self.config.read().clone();
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let backend_uri = format!("http://{}{}", config.address, path_and_query);

        // Connect failures are only retried when there is no body to
        // replay: idempotent method, no declared payload, no streaming
        // transfer. Anything with a body is dispatched exactly once so the
        // forwarded Content-Length always matches the bytes sent.
        let idempotent = parts.method == Method::GET
            || parts.method == Method::HEAD
            || parts.method == Method::OPTIONS;
        let has_body = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|len| len > 0)
            .unwrap_or(false)
            || parts.headers.contains_key(header::TRANSFER_ENCODING);
        let retriable = idempotent && !has_body;
        let attempts = if retriable { config.max_retries + 1 } else { 1 };
        let deadline = Duration::from_millis(config.timeout_ms);

        let mut body = Some(body);
        let mut backoff = Duration::from_millis(config.retry_backoff_ms);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                warn!(attempt, backend = %config.address, "retrying backend dispatch");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            let attempt_body = if retriable {
                Body::empty()
            } else {
                match body.take() {
                    Some(b) => b,
                    None => break,
                }
            };
            let proxy_req =
                self.build_backend_request(&parts, attempt_body, &backend_uri, ctx, host)?;

            self.dispatched.fetch_add(1, Ordering::Relaxed);

            match tokio::time::timeout(deadline, self.client.request(proxy_req)).await {
                Ok(Ok(response)) => {
                    debug!(status = %response.status(), backend = %config.address, "backend responded");
                    let (mut parts, incoming) = response.into_parts();
                    // Upgrade is meaningless once re-framed by the gateway.
                    parts.headers.remove(header::UPGRADE);
                    return Ok(Response::from_parts(parts, Body::new(incoming)));
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    error!(error = %e, backend = %config.address, "backend request failed");
                    if !(retriable && e.is_connect()) {
                        break;
                    }
                }
                Err(_) => {
                    error!(timeout_ms = config.timeout_ms, backend = %config.address, "backend timed out");
                    return Err(GatewayError::BackendTimeout(config.timeout_ms));
                }
            }
        }

        Err(GatewayError::BackendUnavailable(last_error))
    }

    fn build_backend_request(
        &self,
        parts: &request::Parts,
        body: Body,
        backend_uri: &str,
        ctx: &ConnectionContext,
        host: &str,
    ) -> Result<Request<Body>, GatewayError> {
        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(backend_uri);

        if let Some(headers) = builder.headers_mut() {
            for (name, value) in parts.headers.iter() {
                let lower = name.as_str();
                if lower == "host" || HOP_BY_HOP.contains(&lower) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }

            // Forwarded-identity metadata for the backend.
            if let Ok(v) = HeaderValue::from_str(host) {
                headers.insert(header::HOST, v);
            }
            let client_ip = ctx.client_addr.ip().to_string();
            if let Ok(v) = HeaderValue::from_str(&client_ip) {
                headers.insert(HeaderName::from_static("x-real-ip"), v);
            }
            let forwarded_for = match parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{}, {}", existing, client_ip),
                None => client_ip,
            };
            if let Ok(v) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), v);
            }
            headers.insert(
                HeaderName::from_static("x-forwarded-proto"),
                HeaderValue::from_static("https"),
            );
            if ctx.transport == Transport::Quic {
                headers.insert(
                    HeaderName::from_static("x-forwarded-transport"),
                    HeaderValue::from_static("quic"),
                );
            }
        }

        builder
            .body(body)
            .map_err(|e| GatewayError::BackendUnavailable(format!("request build: {}", e)))
    }
}
