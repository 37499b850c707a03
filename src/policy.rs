//! Response policy composer
//!
//! Builds the full security header set for each response: the fixed
//! baseline (nosniff, frame policy, legacy XSS filter off, referrer and
//! permissions restrictions, HSTS, COOP/COEP report-only), an enforcing
//! Content-Security-Policy carrying a fresh per-request nonce, and a
//! report-only CSP variant rendered from the same directive table so the
//! two cannot drift apart structurally. The report-only variant adds
//! `block-all-mixed-content` and a `report-uri`, mirroring the deployed
//! policy pair it replaces.
//!
//! Composition is deterministic apart from nonce generation, which is an
//! injected random source called exactly once per request.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::PolicyConfig;
use crate::context::ConnectionContext;

/// Nonce bytes before encoding; 16 bytes = 128 bits of entropy.
const NONCE_LEN: usize = 16;

/// Source of per-request CSP nonces. Injected so tests can observe calls
/// and so the composer itself stays free of ambient randomness.
pub trait NonceSource: Send + Sync {
    /// Produce one fresh unguessable token. Called once per request; the
    /// value lives for a single request/response cycle and is never stored.
    fn next_nonce(&self) -> String;
}

/// Operating-system CSPRNG nonce source.
#[derive(Debug, Default)]
pub struct OsNonceSource;

impl NonceSource for OsNonceSource {
    fn next_nonce(&self) -> String {
        let mut buf = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut buf);
        STANDARD_NO_PAD.encode(buf)
    }
}

/// One rendered CSP directive: the name plus its static source list and
/// whether a nonce slot is present.
#[derive(Debug, Clone)]
struct CspDirective {
    name: String,
    /// Static sources with `{nonce}` slots removed
    static_sources: Vec<String>,
    /// Whether this directive receives the per-request nonce
    wants_nonce: bool,
}

/// Immutable, precompiled policy table; swapped atomically on config
/// reload so in-flight requests keep a consistent view.
#[derive(Debug)]
struct PolicyTable {
    /// Fixed baseline headers in emission order
    baseline: Vec<(HeaderName, HeaderValue)>,
    directives: Vec<CspDirective>,
    report_uri: String,
    server_identity: HeaderValue,
    cookie_attributes: String,
}

impl PolicyTable {
    fn compile(config: &PolicyConfig) -> Self {
        let mut baseline = Vec::new();
        let mut push = |name: HeaderName, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                baseline.push((name, v));
            }
        };

        push(header::STRICT_TRANSPORT_SECURITY, &config.hsts);
        push(header::X_FRAME_OPTIONS, &config.x_frame_options);
        push(header::X_CONTENT_TYPE_OPTIONS, &config.x_content_type_options);
        push(header::X_XSS_PROTECTION, &config.x_xss_protection);
        push(header::REFERRER_POLICY, &config.referrer_policy);
        push(
            HeaderName::from_static("permissions-policy"),
            &config.permissions_policy,
        );
        push(
            HeaderName::from_static("cross-origin-opener-policy-report-only"),
            &config.cross_origin_opener_policy,
        );
        push(
            HeaderName::from_static("cross-origin-embedder-policy-report-only"),
            &config.cross_origin_embedder_policy,
        );

        let directives = config
            .csp_directives
            .iter()
            .map(|d| {
                let wants_nonce = d.sources.iter().any(|s| s == "{nonce}");
                CspDirective {
                    name: d.name.clone(),
                    static_sources: d
                        .sources
                        .iter()
                        .filter(|s| s.as_str() != "{nonce}")
                        .cloned()
                        .collect(),
                    wants_nonce,
                }
            })
            .collect();

        Self {
            baseline,
            directives,
            report_uri: config.report_uri.clone(),
            server_identity: HeaderValue::from_str(&config.server_identity)
                .unwrap_or_else(|_| HeaderValue::from_static("bastion")),
            cookie_attributes: config.cookie_attributes.clone(),
        }
    }

    /// Render the CSP value, substituting the nonce into every directive
    /// that carries a nonce slot.
    fn render_csp(&self, nonce: &str, report_only: bool) -> String {
        let mut parts = Vec::with_capacity(self.directives.len() + 2);
        for directive in &self.directives {
            let mut sources = directive.static_sources.clone();
            if directive.wants_nonce {
                sources.push(format!("'nonce-{}'", nonce));
            }
            if sources.is_empty() {
                parts.push(directive.name.clone());
            } else {
                parts.push(format!("{} {}", directive.name, sources.join(" ")));
            }
        }
        if report_only {
            parts.push("block-all-mixed-content".to_string());
            parts.push(format!("report-uri {}", self.report_uri));
        }
        parts.join("; ")
    }
}

/// Builds the response header set for every request.
pub struct PolicyComposer {
    table: ArcSwap<PolicyTable>,
    nonce_source: Arc<dyn NonceSource>,
}

impl PolicyComposer {
    pub fn new(config: &PolicyConfig, nonce_source: Arc<dyn NonceSource>) -> Self {
        Self {
            table: ArcSwap::from_pointee(PolicyTable::compile(config)),
            nonce_source,
        }
    }

    /// Recompile the policy table from a reloaded configuration.
    pub fn install(&self, config: &PolicyConfig) {
        self.table.store(Arc::new(PolicyTable::compile(config)));
    }

    /// Build the complete header set for one request/response cycle.
    /// Pure apart from the single nonce draw.
    pub fn compose(&self, ctx: &ConnectionContext) -> HeaderMap {
        let table = self.table.load();
        let nonce = self.nonce_source.next_nonce();

        let mut headers = HeaderMap::with_capacity(table.baseline.len() + 4);
        for (name, value) in &table.baseline {
            headers.insert(name.clone(), value.clone());
        }

        if let Ok(v) = HeaderValue::from_str(&table.render_csp(&nonce, false)) {
            headers.insert(header::CONTENT_SECURITY_POLICY, v);
        }
        if let Ok(v) = HeaderValue::from_str(&table.render_csp(&nonce, true)) {
            headers.insert(header::CONTENT_SECURITY_POLICY_REPORT_ONLY, v);
        }

        headers.insert(header::SERVER, table.server_identity.clone());
        if let Ok(v) = HeaderValue::from_str(ctx.protocol.as_str()) {
            headers.insert(HeaderName::from_static("x-negotiated-protocol"), v);
        }

        headers
    }

    /// Merge composed policy headers into a response, with policy values
    /// taking precedence over any conflicting backend-supplied header of
    /// the same name. Backend `Set-Cookie` headers are hardened with the
    /// strict attribute set.
    pub fn decorate(&self, response_headers: &mut HeaderMap, composed: HeaderMap) {
        let cookie_attributes = self.table.load().cookie_attributes.clone();

        let cookies: Vec<HeaderValue> = response_headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| harden_cookie(v, &cookie_attributes))
            .collect();
        if !cookies.is_empty() {
            response_headers.remove(header::SET_COOKIE);
            for cookie in cookies {
                response_headers.append(header::SET_COOKIE, cookie);
            }
        }

        for (name, value) in composed.iter() {
            response_headers.insert(name.clone(), value.clone());
        }
    }

    /// Build a gateway-set cookie carrying the strict attribute set.
    pub fn build_cookie(&self, name: &str, value: &str) -> Option<HeaderValue> {
        let attrs = &self.table.load().cookie_attributes;
        HeaderValue::from_str(&format!("{}={}; {}", name, value, attrs)).ok()
    }
}

/// Append any missing attribute from the configured set to a Set-Cookie
/// value. Attributes already present (case-insensitive) are left alone.
fn harden_cookie(value: &HeaderValue, attributes: &str) -> HeaderValue {
    let Ok(raw) = value.to_str() else {
        return value.clone();
    };
    // Attribute names already on the cookie, compared exactly; the first
    // segment is the name=value pair and never an attribute.
    let existing: Vec<String> = raw
        .split(';')
        .skip(1)
        .map(|part| {
            part.trim()
                .split('=')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
        .collect();
    let mut hardened = raw.to_string();
    for attr in attributes.split(';').map(str::trim).filter(|a| !a.is_empty()) {
        let key = attr.split('=').next().unwrap_or(attr).trim().to_ascii_lowercase();
        if !existing.iter().any(|e| e == &key) {
            hardened.push_str("; ");
            hardened.push_str(attr);
        }
    }
    HeaderValue::from_str(&hardened).unwrap_or_else(|_| value.clone())
}
