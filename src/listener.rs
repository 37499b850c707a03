//! TCP listener: TLS termination for HTTP/1.1 and HTTP/2
//!
//! Terminates TLS via the certificate store's per-handshake resolver and
//! runs every request through the gate pipeline before it may reach the
//! backend dispatcher. The policy layer is the outermost middleware so that
//! rejections (WAF blocks, rate-limit 429s, upstream failures) carry the
//! same header set as proxied responses. Also hosts the plain-HTTP
//! redirector that 301s everything to HTTPS.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Host, State},
    http::{header, HeaderValue, Method, Request, Response, StatusCode, Uri},
    middleware::{self, Next},
    response::IntoResponse,
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tracing::{debug, info, warn};

use crate::config::ConfigManager;
use crate::context::{ConnectionContext, Protocol, Transport};
use crate::dispatch::BackendDispatcher;
use crate::error::GatewayError;
use crate::policy::PolicyComposer;
use crate::rate_limit::{RateDecision, SensitiveRateLimiter};
use crate::static_assets::StaticAssets;
use crate::tls_store::CertificateStore;
use crate::waf::{WafGate, WafOutcome, WafRequest};

/// Shared state for every listener. Each component handles its own reload
/// internally; the state itself is immutable.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ConfigManager>,
    pub policy: Arc<PolicyComposer>,
    pub waf: Arc<WafGate>,
    pub limiter: Arc<SensitiveRateLimiter>,
    pub dispatcher: Arc<BackendDispatcher>,
    pub assets: Arc<StaticAssets>,
}

/// Build the router shared by the TCP and QUIC request paths.
///
/// Layer order matters: axum runs the last-added layer first, so the policy
/// layer is added last to wrap everything, including error responses
/// produced by the inner layers.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .fallback(any(gateway_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            alt_svc_layer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            policy_layer,
        ))
        .with_state(state)
}

/// Run the HTTPS listener until the handle signals shutdown.
pub async fn run_https_listener(
    state: GatewayState,
    store: Arc<CertificateStore>,
    handle: Handle,
) -> Result<(), GatewayError> {
    let config = state.config.get();
    let addr = config
        .server
        .https_socket_addr()
        .map_err(|e| GatewayError::Config(format!("bind address: {}", e)))?;

    let rustls_config = store.server_config()?;
    let tls = RustlsConfig::from_config(Arc::new(rustls_config));

    let app = build_router(state);
    info!(%addr, alpn = ?config.tls.alpn_protocols, "https listener ready");

    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| GatewayError::Config(format!("https listener: {}", e)))
}

/// Plain-HTTP redirector. Every request is answered with a 301 to the same
/// host, path and query on HTTPS; nothing is ever proxied.
pub async fn run_http_redirect(
    state: GatewayState,
    handle: Handle,
) -> Result<(), GatewayError> {
    let config = state.config.get();
    if !config.http_redirect.enabled {
        info!("http redirect listener disabled");
        return Ok(());
    }
    let https_port = config.server.https_port;
    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.http_redirect.port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("redirect bind address: {}", e)))?;

    let app = Router::new().fallback(move |Host(host): Host, uri: Uri| async move {
        redirect_to_https(&host, &uri, https_port)
    });

    info!(%addr, "http redirect listener ready");
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| GatewayError::Config(format!("redirect listener: {}", e)))
}

fn redirect_to_https(host: &str, uri: &Uri, https_port: u16) -> Response<Body> {
    // Strip any port the client sent in Host.
    let bare_host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    let path = uri.path();
    let query = uri.query().map(|q| format!("?{}", q)).unwrap_or_default();
    let location = if https_port == 443 {
        format!("https://{}{}{}", bare_host, path, query)
    } else {
        format!("https://{}:{}{}{}", bare_host, https_port, path, query)
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(v) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, v);
    }
    response
}

/// Outermost layer: derives the connection context, runs the inner stack
/// and decorates whatever comes back with the composed policy header set.
async fn policy_layer(
    State(state): State<GatewayState>,
    mut request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ctx = context_for(&request);
    request.extensions_mut().insert(ctx);

    let composed = state.policy.compose(&ctx);
    let mut response = next.run(request).await;
    state.policy.decorate(response.headers_mut(), composed);
    response
}

/// Advertise the HTTP/3 endpoint on every TCP response.
async fn alt_svc_layer(
    State(state): State<GatewayState>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let config = state.config.get();
    let mut response = next.run(request).await;

    if config.server.enable_quic {
        let port = config.server.https_port;
        let ma = config.tls.alt_svc_max_age_secs;
        let value = config
            .tls
            .h3_versions
            .iter()
            .map(|v| format!("{}=\":{}\"; ma={}", v, port, ma))
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(v) = HeaderValue::from_str(&value) {
            response.headers_mut().insert("alt-svc", v);
        }
    }
    response
}

fn context_for(request: &Request<Body>) -> ConnectionContext {
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    ConnectionContext::new(
        client_addr,
        Transport::Tcp,
        Protocol::from_http_version(request.version()),
    )
}

/// The gate pipeline. Order is fixed: global backstop, WAF, sensitive rate
/// limit, violation intake, static passthroughs, early-data gate, dispatch.
async fn gateway_handler(
    State(state): State<GatewayState>,
    Host(host): Host,
    request: Request<Body>,
) -> Response<Body> {
    let ctx = request
        .extensions()
        .get::<ConnectionContext>()
        .copied()
        .unwrap_or_else(|| context_for(&request));

    match run_pipeline(&state, &ctx, &host, request).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn run_pipeline(
    state: &GatewayState,
    ctx: &ConnectionContext,
    host: &str,
    request: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let config = state.config.get();
    let client_ip = ctx.client_addr.ip();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();
    let method = request.method().clone();

    // Global per-IP backstop ahead of any parsing work.
    if let RateDecision::Deny { retry_after_secs } = state.limiter.check_global(client_ip) {
        debug!(%client_ip, "global rate limit tripped");
        return Err(GatewayError::RateLimitExceeded { retry_after_secs });
    }

    // When identities are configured, a Host matching none of them gets a
    // generic not-found; the outer layer still decorates it.
    if !config.server.hostnames.is_empty() {
        let bare_host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        if !config
            .server
            .hostnames
            .iter()
            .any(|h| h.eq_ignore_ascii_case(bare_host))
        {
            debug!(%client_ip, host = %host, "request for unconfigured host");
            return Err(GatewayError::Routing(host.to_string()));
        }
    }

    // Buffer a bounded body prefix for the WAF. Bodies with no declared
    // length or beyond the scan budget are forwarded after metadata-only
    // inspection; buffering them would hold the stream hostage.
    let scan_budget = config.waf.max_body_scan_bytes;
    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let (request, scanned_body) = match declared_len {
        Some(len) if len > 0 && len <= scan_budget => {
            let (parts, body) = request.into_parts();
            let bytes = axum::body::to_bytes(body, scan_budget)
                .await
                .map_err(|e| GatewayError::BackendUnavailable(format!("read body: {}", e)))?;
            let request = Request::from_parts(parts, Body::from(bytes.clone()));
            (request, Some(bytes))
        }
        _ => (request, None),
    };

    let waf_view = WafRequest {
        method: method.as_str(),
        path: &path,
        query: &query,
        headers: request.headers(),
        body: scanned_body.as_deref(),
    };
    match state.waf.evaluate(&waf_view) {
        WafOutcome::Block { rule_id, severity } => {
            warn!(%client_ip, rule_id = %rule_id, ?severity, path = %path, "request blocked");
            return Err(GatewayError::PolicyViolation { rule_id });
        }
        WafOutcome::LogOnly { rule_id, severity } => {
            warn!(%client_ip, rule_id = %rule_id, ?severity, path = %path, "suspicious request forwarded");
        }
        WafOutcome::Pass => {}
    }

    if config.is_sensitive_path(&path) {
        if let RateDecision::Deny { retry_after_secs } = state.limiter.check_sensitive(client_ip) {
            warn!(%client_ip, path = %path, "sensitive route rate limit tripped");
            return Err(GatewayError::RateLimitExceeded { retry_after_secs });
        }
    }

    // CSP violation reports terminate here; they are operator telemetry,
    // not backend traffic.
    if method == Method::POST && path == config.policy.report_uri {
        let report = scanned_body
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        warn!(%client_ip, report = %report, "csp violation reported");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        return Ok(response);
    }

    if let Some(response) = state.assets.serve(&path).await {
        return Ok(response);
    }

    // Replayable early data may only carry idempotent methods.
    if ctx.early_data
        && !config
            .tls
            .early_data_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    {
        return Err(GatewayError::EarlyDataRejected(method.to_string()));
    }

    state.dispatcher.dispatch(request, ctx, host).await
}

/// Generic response for a pipeline rejection. The policy layer adds the
/// header set afterwards.
pub(crate) fn error_response(err: &GatewayError) -> Response<Body> {
    let mut response = (err.status(), err.public_message()).into_response();
    if let GatewayError::RateLimitExceeded { retry_after_secs } = err {
        if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }
    }
    response
}
