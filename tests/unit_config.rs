//! Configuration parsing and validation tests

use bastion_gate::config::*;

#[test]
fn defaults_are_sensible() {
    let config = GatewayConfig::default();

    assert_eq!(config.server.https_port, 443);
    assert!(config.server.enable_quic);
    assert_eq!(config.tls.min_version, "1.3");
    assert_eq!(config.tls.alpn_protocols, vec!["h2", "http/1.1"]);
    assert_eq!(config.policy.x_frame_options, "DENY");
    assert_eq!(config.policy.x_xss_protection, "0");
    assert_eq!(config.rate_limit.capacity, 10);
    assert_eq!(config.rate_limit.window_secs, 60);
    assert!(config.waf.enabled);
    assert_eq!(config.http_redirect.port, 80);
}

#[test]
fn minimal_toml_overrides_defaults() {
    let raw = r#"
[server]
bind_address = "127.0.0.1"
https_port = 8443

[[tls.bundles]]
label = "ecdsa"
cert_path = "/etc/test/cert.pem"
key_path = "/etc/test/key.pem"

[backend]
address = "127.0.0.1:9000"
"#;

    let config: GatewayConfig = toml::from_str(raw).unwrap();
    assert_eq!(config.server.bind_address, "127.0.0.1");
    assert_eq!(config.server.https_port, 8443);
    assert_eq!(config.tls.bundles.len(), 1);
    assert_eq!(config.backend.address, "127.0.0.1:9000");
    // Untouched sections keep their defaults.
    assert_eq!(config.rate_limit.capacity, 10);
    assert!(config.validate().is_ok());
}

#[test]
fn validation_requires_a_bundle() {
    let config = GatewayConfig::default();
    assert!(config.validate().is_err());
}

#[test]
fn validation_rejects_unknown_default_bundle() {
    let raw = r#"
[tls]
default_bundle = "rsa"

[[tls.bundles]]
label = "ecdsa"
cert_path = "/etc/test/cert.pem"
key_path = "/etc/test/key.pem"
"#;
    let config: GatewayConfig = toml::from_str(raw).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn validation_rejects_bad_min_version() {
    let raw = r#"
[tls]
min_version = "1.1"

[[tls.bundles]]
label = "ecdsa"
cert_path = "/etc/test/cert.pem"
key_path = "/etc/test/key.pem"
"#;
    let config: GatewayConfig = toml::from_str(raw).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn validation_rejects_invalid_waf_rule() {
    let raw = r#"
[[tls.bundles]]
label = "ecdsa"
cert_path = "/etc/test/cert.pem"
key_path = "/etc/test/key.pem"

[[waf.rules]]
id = "broken"
pattern = "(unclosed"
action = "block"
severity = "high"
"#;
    let config: GatewayConfig = toml::from_str(raw).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn validation_rejects_unparseable_backend_address() {
    let raw = r#"
[[tls.bundles]]
label = "ecdsa"
cert_path = "/etc/test/cert.pem"
key_path = "/etc/test/key.pem"

[backend]
address = "not-a-socket-addr"
"#;
    let config: GatewayConfig = toml::from_str(raw).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn sensitive_paths_match_by_prefix() {
    let config = GatewayConfig::default();
    assert!(config.is_sensitive_path("/login"));
    assert!(config.is_sensitive_path("/login/sso"));
    assert!(config.is_sensitive_path("/oauth/token"));
    assert!(!config.is_sensitive_path("/blog/login-tips"));
}

#[test]
fn nonce_placeholder_survives_parsing() {
    let raw = r#"
[[policy.csp_directives]]
name = "script-src"
sources = ["'self'", "{nonce}"]
"#;
    let config: GatewayConfig = toml::from_str(raw).unwrap();
    let script_src = &config.policy.csp_directives[0];
    assert_eq!(script_src.name, "script-src");
    assert!(script_src.sources.iter().any(|s| s == "{nonce}"));
}
