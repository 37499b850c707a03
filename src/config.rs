//! Configuration with TOML parsing and hot-reload support
//!
//! All tunables are externalized: listen ports, certificate bundle paths,
//! the policy header table, WAF rules, rate-limit windows and the backend
//! address. The active configuration is an immutable snapshot behind an
//! `ArcSwap`; a reload parses and validates the new file fully before the
//! swap, so readers never observe a partially-updated configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub ocsp: OcspConfig,
    pub policy: PolicyConfig,
    pub rate_limit: RateLimitConfig,
    pub waf: WafConfig,
    pub backend: BackendConfig,
    pub http_redirect: HttpRedirectConfig,
    pub static_assets: StaticAssetsConfig,
    pub logging: LoggingConfig,
}

/// Listener bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for both TCP and UDP listeners
    pub bind_address: String,
    /// HTTPS port (TCP for HTTP/1.1+2, UDP for QUIC/HTTP3)
    pub https_port: u16,
    /// Enable the QUIC/HTTP3 listener on the UDP side of `https_port`
    pub enable_quic: bool,
    /// Hostnames this gateway answers for; the first entry is the canonical
    /// identity
    pub hostnames: Vec<String>,
    /// Worker threads (0 = one per core)
    pub worker_threads: usize,
    /// Maximum idle time for a QUIC connection
    pub max_idle_timeout_secs: u64,
    /// QUIC keep-alive interval
    pub keepalive_interval_secs: u64,
    /// Maximum concurrent streams per QUIC connection
    pub max_streams_per_connection: u32,
    /// Drain window for in-flight requests after a shutdown signal
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            https_port: 443,
            enable_quic: true,
            hostnames: Vec::new(),
            worker_threads: 0,
            max_idle_timeout_secs: 120,
            keepalive_interval_secs: 15,
            max_streams_per_connection: 256,
            graceful_shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn https_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.https_port).parse()
    }
}

/// One certificate bundle: a full chain plus its private key. Several
/// bundles (e.g. ECDSA and RSA) may serve the same identity; the resolver
/// picks one per handshake from the client's signature algorithms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertBundleConfig {
    /// Bundle label, also used in logs ("ecdsa", "rsa", ...)
    pub label: String,
    /// PEM certificate chain, leaf first
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#8, SEC1 or PKCS#1)
    pub key_path: PathBuf,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate bundles, in preference order
    pub bundles: Vec<CertBundleConfig>,
    /// Label of the bundle used when no SNI is present or nothing matches
    pub default_bundle: String,
    /// ALPN protocols advertised on the TCP listener
    pub alpn_protocols: Vec<String>,
    /// HTTP/3 version strings advertised via Alt-Svc ("h3", "h3-29", ...)
    pub h3_versions: Vec<String>,
    /// Alt-Svc max-age in seconds
    pub alt_svc_max_age_secs: u64,
    /// Minimum TLS version ("1.2" or "1.3")
    pub min_version: String,
    /// Accept TLS 1.3 / QUIC 0-RTT early data. Early requests are limited to
    /// idempotent methods because they are replayable.
    pub enable_0rtt: bool,
    /// Methods allowed on early-data requests
    pub early_data_methods: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            bundles: Vec::new(),
            default_bundle: "ecdsa".to_string(),
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            h3_versions: vec!["h3".to_string()],
            alt_svc_max_age_secs: 86_400,
            min_version: "1.3".to_string(),
            enable_0rtt: false,
            early_data_methods: vec!["GET".to_string(), "HEAD".to_string()],
        }
    }
}

/// OCSP stapling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcspConfig {
    /// Enable OCSP stapling
    pub enabled: bool,
    /// Re-fetch this long before the cached response expires
    pub refresh_before_expiry_secs: u64,
    /// Floor between responder fetches
    pub min_refresh_interval_secs: u64,
    /// HTTP timeout for responder requests
    pub timeout_secs: u64,
    /// Retries per fetch attempt
    pub max_retries: u32,
    /// Delay between retries (milliseconds)
    pub retry_delay_ms: u64,
}

impl Default for OcspConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_before_expiry_secs: 3600,
            min_refresh_interval_secs: 300,
            timeout_secs: 10,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Response policy configuration: the baseline security header table and
/// the CSP directive source table shared by the enforcing and report-only
/// variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// HSTS value, emitted on HTTPS responses only
    pub hsts: String,
    pub x_frame_options: String,
    pub x_content_type_options: String,
    /// Legacy XSS filter, disabled ("0") per current guidance
    pub x_xss_protection: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
    /// COOP/COEP are emitted report-only
    pub cross_origin_opener_policy: String,
    pub cross_origin_embedder_policy: String,
    /// Synthetic Server header replacing any backend banner
    pub server_identity: String,
    /// CSP directive table; `{nonce}` placeholders receive the per-request
    /// nonce in every directive that carries one
    pub csp_directives: Vec<CspDirectiveConfig>,
    /// Violation-report endpoint appended to the report-only variant
    pub report_uri: String,
    /// Attributes appended to any cookie the gateway itself sets
    pub cookie_attributes: String,
}

/// One CSP directive: name plus its static source list. Directives whose
/// sources include the literal `{nonce}` get the per-request nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CspDirectiveConfig {
    pub name: String,
    pub sources: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            hsts: "max-age=63072000; includeSubDomains; preload".to_string(),
            x_frame_options: "DENY".to_string(),
            x_content_type_options: "nosniff".to_string(),
            x_xss_protection: "0".to_string(),
            referrer_policy: "strict-origin-when-cross-origin".to_string(),
            permissions_policy:
                "camera=(), microphone=(), geolocation=(), payment=(), fullscreen=(self)"
                    .to_string(),
            cross_origin_opener_policy: "same-origin".to_string(),
            cross_origin_embedder_policy: "require-corp".to_string(),
            server_identity: "bastion".to_string(),
            csp_directives: vec![
                CspDirectiveConfig {
                    name: "default-src".to_string(),
                    sources: vec!["'self'".to_string()],
                },
                CspDirectiveConfig {
                    name: "script-src".to_string(),
                    sources: vec!["'self'".to_string(), "{nonce}".to_string()],
                },
                CspDirectiveConfig {
                    name: "style-src".to_string(),
                    sources: vec!["'self'".to_string(), "{nonce}".to_string()],
                },
                CspDirectiveConfig {
                    name: "object-src".to_string(),
                    sources: vec!["'none'".to_string()],
                },
                CspDirectiveConfig {
                    name: "base-uri".to_string(),
                    sources: vec!["'self'".to_string()],
                },
                CspDirectiveConfig {
                    name: "frame-ancestors".to_string(),
                    sources: vec!["'none'".to_string()],
                },
            ],
            report_uri: "/csp-violations".to_string(),
            cookie_attributes: "Secure; HttpOnly; SameSite=Strict; Path=/".to_string(),
        }
    }
}

/// Rate limiting configuration. The windowed limiter applies only to routes
/// listed as sensitive; the global limiter is a coarse per-IP DoS backstop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests allowed per window on a sensitive route
    pub capacity: u32,
    /// Window length in seconds
    pub window_secs: u64,
    /// Idle time after which a client's window entry is reclaimed
    pub idle_evict_secs: u64,
    /// Path prefixes classed as sensitive (auth endpoints)
    pub sensitive_paths: Vec<String>,
    /// Global per-IP requests per second (0 disables the global layer)
    pub global_requests_per_second: u32,
    /// Global burst allowance
    pub global_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10,
            window_secs: 60,
            idle_evict_secs: 600,
            sensitive_paths: vec![
                "/login".to_string(),
                "/signup".to_string(),
                "/oauth".to_string(),
            ],
            global_requests_per_second: 100,
            global_burst: 50,
        }
    }
}

/// One WAF rule. Rules are evaluated in file order; the first match with a
/// blocking action ends evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafRuleConfig {
    /// Stable identifier, logged but never sent to clients
    pub id: String,
    /// Regex applied to path, query, selected headers and scanned body bytes
    pub pattern: String,
    /// "block" or "log"
    #[serde(default = "default_waf_action")]
    pub action: String,
    /// "low" | "medium" | "high" | "critical"
    #[serde(default = "default_waf_severity")]
    pub severity: String,
}

fn default_waf_action() -> String {
    "block".to_string()
}

fn default_waf_severity() -> String {
    "high".to_string()
}

/// WAF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WafConfig {
    pub enabled: bool,
    /// Include the built-in rule pack (SQLi, XSS, traversal, command
    /// injection) ahead of `rules`
    pub builtin_rules: bool,
    /// Operator-supplied rules, evaluated after the built-ins
    pub rules: Vec<WafRuleConfig>,
    /// Maximum body bytes scanned per request
    pub max_body_scan_bytes: usize,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            builtin_rules: true,
            rules: Vec::new(),
            max_body_scan_bytes: 65_536,
        }
    }
}

/// The single backend the gateway fronts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Loopback address of the backend application (host:port)
    pub address: String,
    /// Connect + response deadline in milliseconds
    pub timeout_ms: u64,
    /// Bounded retry count for connect failures on idempotent requests
    pub max_retries: u32,
    /// Backoff between retries (doubles per attempt)
    pub retry_backoff_ms: u64,
    /// Idle keep-alive connections held to the backend
    pub pool_max_idle: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8000".to_string(),
            timeout_ms: 30_000,
            max_retries: 2,
            retry_backoff_ms: 50,
            pool_max_idle: 32,
        }
    }
}

/// Plaintext redirect listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRedirectConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HttpRedirectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 80,
        }
    }
}

/// Well-known static passthrough paths served from a read-only root,
/// bypassing the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticAssetsConfig {
    pub enabled: bool,
    /// Read-only filesystem root for the files below
    pub root: PathBuf,
    /// Request path → file name relative to `root`
    pub paths: HashMap<String, String>,
}

impl Default for StaticAssetsConfig {
    fn default() -> Self {
        let mut paths = HashMap::new();
        paths.insert("/robots.txt".to_string(), "robots.txt".to_string());
        paths.insert("/sitemap.xml".to_string(), "sitemap.xml".to_string());
        paths.insert(
            "/.well-known/security.txt".to_string(),
            "security.txt".to_string(),
        );
        paths.insert("/pgp-key.txt".to_string(), "pgp-key.txt".to_string());
        Self {
            enabled: true,
            root: PathBuf::from("/var/lib/bastion-gate/static"),
            paths,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: GatewayConfig = toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.tls.bundles.is_empty() {
            return Err(GatewayError::Config(
                "tls.bundles must list at least one certificate bundle".to_string(),
            ));
        }
        if !self
            .tls
            .bundles
            .iter()
            .any(|b| b.label == self.tls.default_bundle)
        {
            return Err(GatewayError::Config(format!(
                "tls.default_bundle '{}' does not name a configured bundle",
                self.tls.default_bundle
            )));
        }
        {
            let mut seen = std::collections::HashSet::new();
            for bundle in &self.tls.bundles {
                if !seen.insert(bundle.label.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "duplicate tls bundle label '{}'",
                        bundle.label
                    )));
                }
            }
        }
        match self.tls.min_version.as_str() {
            "1.2" | "1.3" => {}
            other => {
                return Err(GatewayError::Config(format!(
                    "tls.min_version must be \"1.2\" or \"1.3\", got \"{}\"",
                    other
                )));
            }
        }
        if self.rate_limit.capacity == 0 {
            return Err(GatewayError::Config(
                "rate_limit.capacity must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(GatewayError::Config(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }
        for rule in &self.waf.rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                GatewayError::Config(format!("waf rule '{}': invalid pattern: {}", rule.id, e))
            })?;
            match rule.action.as_str() {
                "block" | "log" => {}
                other => {
                    return Err(GatewayError::Config(format!(
                        "waf rule '{}': action must be \"block\" or \"log\", got \"{}\"",
                        rule.id, other
                    )));
                }
            }
        }
        if self.backend.address.parse::<SocketAddr>().is_err() {
            return Err(GatewayError::Config(format!(
                "backend.address '{}' is not a socket address",
                self.backend.address
            )));
        }
        Ok(())
    }

    /// True when the path is classed sensitive for rate limiting.
    pub fn is_sensitive_path(&self, path: &str) -> bool {
        self.rate_limit
            .sensitive_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Events emitted on configuration changes
#[derive(Debug, Clone)]
pub enum ConfigReloadEvent {
    /// New configuration validated and installed
    Reloaded(Arc<GatewayConfig>),
    /// Reload attempt failed; previous snapshot stays active
    ReloadFailed(String),
}

/// Configuration container with atomic snapshot swap and file watching.
pub struct ConfigManager {
    config: ArcSwap<GatewayConfig>,
    watcher: RwLock<Option<RecommendedWatcher>>,
    reload_tx: mpsc::Sender<ConfigReloadEvent>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load the initial configuration and create the reload channel.
    pub fn new(path: &Path) -> Result<(Self, mpsc::Receiver<ConfigReloadEvent>), GatewayError> {
        let config = GatewayConfig::load(path)?;
        let (reload_tx, reload_rx) = mpsc::channel(8);
        info!(path = %path.display(), "configuration loaded");
        Ok((
            Self {
                config: ArcSwap::from_pointee(config),
                watcher: RwLock::new(None),
                reload_tx,
                config_path: path.to_path_buf(),
            },
            reload_rx,
        ))
    }

    /// Current immutable snapshot.
    pub fn get(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    /// Parse, validate and atomically install the file at `config_path`.
    /// On failure the previous snapshot stays active.
    pub fn reload(&self) -> Result<Arc<GatewayConfig>, GatewayError> {
        let config = GatewayConfig::load(&self.config_path)?;
        let config = Arc::new(config);
        self.config.store(config.clone());
        info!("configuration reloaded");
        Ok(config)
    }

    /// Start watching the config file; change events trigger a reload and a
    /// `ConfigReloadEvent` for components holding derived state (WAF rules,
    /// policy table, limiter parameters).
    pub fn start_watching(self: Arc<Self>) -> Result<(), GatewayError> {
        let manager = Arc::clone(&self);
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    debug!(kind = ?event.kind, "config file changed");
                    let outcome = match manager.reload() {
                        Ok(config) => ConfigReloadEvent::Reloaded(config),
                        Err(e) => {
                            error!(error = %e, "config reload failed, keeping previous snapshot");
                            ConfigReloadEvent::ReloadFailed(e.to_string())
                        }
                    };
                    if manager.reload_tx.try_send(outcome).is_err() {
                        warn!("reload event channel full, dropping notification");
                    }
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "config watcher error"),
            })
            .map_err(|e| GatewayError::Config(format!("watcher init: {}", e)))?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                GatewayError::Config(format!("watch {}: {}", self.config_path.display(), e))
            })?;
        *self.watcher.write() = Some(watcher);
        info!(path = %self.config_path.display(), "config hot-reload enabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[server]
bind_address = "127.0.0.1"
https_port = 8443
hostnames = ["example.test"]

[tls]
default_bundle = "ecdsa"

[[tls.bundles]]
label = "ecdsa"
cert_path = "/tmp/ecdsa.pem"
key_path = "/tmp/ecdsa.key"

[backend]
address = "127.0.0.1:8000"
"#
    }

    #[test]
    fn parses_minimal_config() {
        let config: GatewayConfig = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.https_port, 8443);
        assert_eq!(config.tls.bundles.len(), 1);
        assert_eq!(config.backend.address, "127.0.0.1:8000");
    }

    #[test]
    fn default_policy_table_has_nonce_slots() {
        let config = PolicyConfig::default();
        let nonce_directives = config
            .csp_directives
            .iter()
            .filter(|d| d.sources.iter().any(|s| s == "{nonce}"))
            .count();
        assert!(nonce_directives >= 2, "script-src and style-src carry nonces");
    }

    #[test]
    fn rejects_unknown_default_bundle() {
        let mut config: GatewayConfig = toml::from_str(minimal_toml()).unwrap();
        config.tls.default_bundle = "rsa".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_waf_pattern() {
        let mut config: GatewayConfig = toml::from_str(minimal_toml()).unwrap();
        config.waf.rules.push(WafRuleConfig {
            id: "bad".to_string(),
            pattern: "(".to_string(),
            action: "block".to_string(),
            severity: "high".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn sensitive_path_matching_uses_prefixes() {
        let config = GatewayConfig::default();
        assert!(config.is_sensitive_path("/login"));
        assert!(config.is_sensitive_path("/login/step2"));
        assert!(!config.is_sensitive_path("/about"));
    }
}
