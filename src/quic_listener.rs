//! QUIC listener: HTTP/3 termination
//!
//! Accepts QUIC connections on the same port as the TCP listener (UDP side)
//! and serves HTTP/3 through the same gate pipeline. The axum middleware
//! stack does not run here, so the policy header set and Alt-Svc are
//! applied explicitly to every response, rejections included. When 0-RTT is
//! enabled, requests arriving before the handshake completes are flagged as
//! early data and the pipeline holds them to idempotent methods.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::{Buf, Bytes};
use h3_quinn::Connection as H3Connection;
use http_body_util::BodyExt;
use quinn::{Endpoint, ServerConfig as QuinnServerConfig, TransportConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::context::{ConnectionContext, Protocol, Transport};
use crate::error::GatewayError;
use crate::listener::{error_response, run_pipeline, GatewayState};
use crate::tls_store::CertificateStore;

/// Requests larger than this are refused with 413. HTTP/3 bodies are
/// buffered before dispatch because the h3 stream cannot be handed to the
/// backend client directly.
const MAX_H3_BODY: usize = 16 * 1024 * 1024;

pub struct QuicListener {
    endpoint: Endpoint,
    state: GatewayState,
    shutdown_rx: mpsc::Receiver<()>,
}

impl QuicListener {
    pub fn new(
        state: GatewayState,
        store: &Arc<CertificateStore>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<Self, GatewayError> {
        let config = state.config.get();
        let addr = config
            .server
            .https_socket_addr()
            .map_err(|e| GatewayError::Config(format!("bind address: {}", e)))?;

        let mut transport = TransportConfig::default();
        transport.max_concurrent_bidi_streams(config.server.max_streams_per_connection.into());
        transport.max_concurrent_uni_streams(config.server.max_streams_per_connection.into());
        transport.keep_alive_interval(Some(Duration::from_secs(
            config.server.keepalive_interval_secs,
        )));
        transport.max_idle_timeout(Some(
            Duration::from_secs(config.server.max_idle_timeout_secs)
                .try_into()
                .map_err(|e| GatewayError::Config(format!("idle timeout: {}", e)))?,
        ));

        let crypto = store.clone().quic_server_config()?;
        let mut server_config = QuinnServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport = Arc::new(transport);

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| GatewayError::Config(format!("quic endpoint: {}", e)))?;

        info!(%addr, versions = ?config.tls.h3_versions, "quic endpoint created");
        Ok(Self {
            endpoint,
            state,
            shutdown_rx,
        })
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(incoming) = self.endpoint.accept() => {
                    let remote = incoming.remote_address();
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(incoming, remote, state).await {
                            debug!(%remote, error = %e, "quic connection ended with error");
                        }
                    });
                }
                _ = self.shutdown_rx.recv() => {
                    info!("quic listener draining");
                    break;
                }
            }
        }
        self.endpoint.wait_idle().await;
        info!("quic listener stopped");
    }
}

async fn handle_connection(
    incoming: quinn::Incoming,
    remote: SocketAddr,
    state: GatewayState,
) -> anyhow::Result<()> {
    let connecting = incoming.accept()?;
    let enable_0rtt = state.config.get().tls.enable_0rtt;

    // With 0-RTT the connection is usable before the handshake finishes;
    // the watch channel tells each request whether it arrived early.
    let (connection, handshake_done) = if enable_0rtt {
        match connecting.into_0rtt() {
            Ok((connection, accepted)) => {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    accepted.await;
                    let _ = tx.send(true);
                });
                (connection, Some(rx))
            }
            Err(connecting) => (connecting.await?, None),
        }
    } else {
        (connecting.await?, None)
    };

    debug!(%remote, "quic connection established");

    let mut h3 = h3::server::Connection::new(H3Connection::new(connection)).await?;
    loop {
        match h3.accept().await {
            Ok(Some(resolver)) => {
                let (request, stream) = match resolver.resolve_request().await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        debug!(%remote, error = %e, "h3 request resolution failed");
                        continue;
                    }
                };
                let early = handshake_done
                    .as_ref()
                    .map(|rx| !*rx.borrow())
                    .unwrap_or(false);
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_request(request, stream, remote, early, state).await {
                        debug!(%remote, error = %e, "h3 request failed");
                    }
                });
            }
            Ok(None) => {
                debug!(%remote, "h3 connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(%remote, error = %e, "h3 accept error");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_request<S>(
    request: http::Request<()>,
    mut stream: h3::server::RequestStream<S, Bytes>,
    remote: SocketAddr,
    early: bool,
    state: GatewayState,
) -> anyhow::Result<()>
where
    S: h3::quic::BidiStream<Bytes>,
{
    let ctx = ConnectionContext::new(remote, Transport::Quic, Protocol::H3).with_early_data(early);

    // :authority lands in the URI; fall back to a Host header.
    let host = request
        .uri()
        .authority()
        .map(|a| a.host().to_string())
        .or_else(|| {
            request
                .headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_default();

    // Buffer the request body; the h3 stream is not a hyper body.
    let mut body = Vec::new();
    let mut too_large = false;
    while let Some(mut chunk) = stream.recv_data().await? {
        while chunk.has_remaining() {
            let bytes = chunk.chunk();
            body.extend_from_slice(bytes);
            chunk.advance(bytes.len());
        }
        if body.len() > MAX_H3_BODY {
            too_large = true;
            break;
        }
    }

    let response = if too_large {
        let mut response = axum::http::Response::new(Body::empty());
        *response.status_mut() = http::StatusCode::PAYLOAD_TOO_LARGE;
        response
    } else {
        let (mut parts, _) = request.into_parts();
        // Rebuild the URI as origin-form; the dispatcher supplies scheme
        // and authority for the backend hop.
        if let Some(pq) = parts.uri.path_and_query() {
            if let Ok(uri) = http::Uri::builder().path_and_query(pq.clone()).build() {
                parts.uri = uri;
            }
        }
        let request = http::Request::from_parts(parts, Body::from(body));
        match run_pipeline(&state, &ctx, &host, request).await {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, GatewayError::EarlyDataRejected(_)) {
                    debug!(%remote, "early-data request held for handshake");
                }
                error_response(&err)
            }
        }
    };

    let (mut parts, body) = response.into_parts();
    state
        .policy
        .decorate(&mut parts.headers, state.policy.compose(&ctx));
    append_alt_svc(&state, &mut parts.headers);

    stream
        .send_response(http::Response::from_parts(parts, ()))
        .await?;

    let mut body = body;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    stream.send_data(data).await?;
                }
            }
            Err(e) => {
                error!(%remote, error = %e, "h3 response body error");
                break;
            }
        }
    }
    stream.finish().await?;
    Ok(())
}

fn append_alt_svc(state: &GatewayState, headers: &mut http::HeaderMap) {
    let config = state.config.get();
    let port = config.server.https_port;
    let ma = config.tls.alt_svc_max_age_secs;
    let value = config
        .tls
        .h3_versions
        .iter()
        .map(|v| format!("{}=\":{}\"; ma={}", v, port, ma))
        .collect::<Vec<_>>()
        .join(", ");
    if let Ok(v) = http::HeaderValue::from_str(&value) {
        headers.insert("alt-svc", v);
    }
}
