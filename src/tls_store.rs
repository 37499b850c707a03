//! Certificate store and handshake-time bundle selection
//!
//! Holds every configured certificate bundle (typically one ECDSA and one
//! RSA chain for the same identity) as immutable `CertifiedKey` snapshots
//! behind an `ArcSwap`. Selection happens per handshake from the client's
//! offered signature schemes; clients with no usable match get the default
//! bundle. OCSP staples are attached by rebuilding the affected bundle's
//! `CertifiedKey`, so in-flight handshakes keep the snapshot they started
//! with.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::crypto::ring::Ticketer;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, ServerSessionMemoryCache};
use rustls::sign::CertifiedKey;
use rustls::{SignatureAlgorithm, SignatureScheme};
use tracing::{debug, info, warn};

use crate::config::{CertBundleConfig, TlsConfig};
use crate::error::GatewayError;

/// One loaded bundle: label, key algorithm, raw chain for OCSP request
/// building, and the rustls material offered during handshakes.
pub struct LoadedBundle {
    pub label: String,
    pub algorithm: SignatureAlgorithm,
    pub chain: Vec<CertificateDer<'static>>,
    certified: Arc<CertifiedKey>,
}

pub struct CertificateStore {
    bundles: ArcSwap<Vec<Arc<LoadedBundle>>>,
    tls_config: RwLock<TlsConfig>,
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self
            .bundles
            .load()
            .iter()
            .map(|b| b.label.clone())
            .collect();
        f.debug_struct("CertificateStore")
            .field("bundles", &labels)
            .finish()
    }
}

impl CertificateStore {
    pub fn new(tls_config: &TlsConfig) -> Result<Self, GatewayError> {
        let bundles = load_bundles(&tls_config.bundles)?;
        if bundles.is_empty() {
            return Err(GatewayError::Certificate(
                "no certificate bundles configured".to_string(),
            ));
        }
        info!(
            bundles = bundles.len(),
            labels = ?bundles.iter().map(|b| b.label.as_str()).collect::<Vec<_>>(),
            "certificate store loaded"
        );
        Ok(Self {
            bundles: ArcSwap::from_pointee(bundles),
            tls_config: RwLock::new(tls_config.clone()),
        })
    }

    /// Reload every bundle from disk. The swap is all-or-nothing: a parse
    /// failure leaves the previous snapshot serving.
    pub fn reload(&self, tls_config: &TlsConfig) -> Result<(), GatewayError> {
        let fresh = load_bundles(&tls_config.bundles)?;
        // Carry staples forward so a certificate rotation does not drop
        // stapling until the next responder fetch.
        let current = self.bundles.load();
        let mut next = Vec::with_capacity(fresh.len());
        for bundle in fresh {
            let staple = current
                .iter()
                .find(|b| b.label == bundle.label)
                .and_then(|b| b.certified.ocsp.clone());
            match staple {
                Some(der) => {
                    let mut ck =
                        CertifiedKey::new(bundle.chain.clone(), bundle.certified.key.clone());
                    ck.ocsp = Some(der);
                    next.push(Arc::new(LoadedBundle {
                        label: bundle.label.clone(),
                        algorithm: bundle.algorithm,
                        chain: bundle.chain.clone(),
                        certified: Arc::new(ck),
                    }));
                }
                None => next.push(bundle),
            }
        }
        self.bundles.store(Arc::new(next));
        *self.tls_config.write() = tls_config.clone();
        info!("certificate bundles reloaded");
        Ok(())
    }

    /// Attach an OCSP staple to the named bundle.
    pub fn set_staple(&self, label: &str, der: Vec<u8>) {
        let current = self.bundles.load_full();
        let mut next: Vec<Arc<LoadedBundle>> = Vec::with_capacity(current.len());
        let mut found = false;
        for bundle in current.iter() {
            if bundle.label == label {
                let mut ck = CertifiedKey::new(bundle.chain.clone(), bundle.certified.key.clone());
                ck.ocsp = Some(der.clone());
                next.push(Arc::new(LoadedBundle {
                    label: bundle.label.clone(),
                    algorithm: bundle.algorithm,
                    chain: bundle.chain.clone(),
                    certified: Arc::new(ck),
                }));
                found = true;
            } else {
                next.push(bundle.clone());
            }
        }
        if found {
            self.bundles.store(Arc::new(next));
            debug!(label, "ocsp staple installed");
        } else {
            warn!(label, "staple for unknown bundle ignored");
        }
    }

    /// Certificate chain of the named bundle, leaf first. Used by the OCSP
    /// refresher to build responder requests.
    pub fn bundle_chain(&self, label: &str) -> Option<Vec<CertificateDer<'static>>> {
        self.bundles
            .load()
            .iter()
            .find(|b| b.label == label)
            .map(|b| b.chain.clone())
    }

    pub fn bundle_labels(&self) -> Vec<String> {
        self.bundles.load().iter().map(|b| b.label.clone()).collect()
    }

    fn default_bundle(&self) -> Option<Arc<CertifiedKey>> {
        let label = self.tls_config.read().default_bundle.clone();
        let bundles = self.bundles.load();
        bundles
            .iter()
            .find(|b| b.label == label)
            .or_else(|| bundles.first())
            .map(|b| b.certified.clone())
    }

    fn select(&self, schemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        let bundles = self.bundles.load();
        for bundle in bundles.iter() {
            if schemes.iter().any(|s| scheme_matches(*s, bundle.algorithm)) {
                return Some(bundle.certified.clone());
            }
        }
        None
    }

    /// Build the rustls server configuration for the TCP listener.
    pub fn server_config(self: Arc<Self>) -> Result<rustls::ServerConfig, GatewayError> {
        let tls = self.tls_config.read().clone();
        let mut config = base_builder(&tls).with_cert_resolver(self.clone());

        config.alpn_protocols = tls
            .alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        config.ticketer = Ticketer::new()
            .map_err(|e| GatewayError::Certificate(format!("ticketer: {}", e)))?;
        config.session_storage = ServerSessionMemoryCache::new(4096);
        if tls.enable_0rtt {
            config.max_early_data_size = 16_384;
            config.send_half_rtt_data = true;
        }
        Ok(config)
    }

    /// Build the rustls configuration backing the QUIC endpoint. ALPN is
    /// always the configured h3 version list; early data on QUIC is all or
    /// nothing.
    pub fn quic_server_config(
        self: Arc<Self>,
    ) -> Result<quinn::crypto::rustls::QuicServerConfig, GatewayError> {
        let tls = self.tls_config.read().clone();
        let mut config = base_builder(&tls).with_cert_resolver(self.clone());

        config.alpn_protocols = tls
            .h3_versions
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        if tls.enable_0rtt {
            config.max_early_data_size = u32::MAX;
        }
        quinn::crypto::rustls::QuicServerConfig::try_from(config)
            .map_err(|e| GatewayError::Certificate(format!("quic tls config: {}", e)))
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match self.select(client_hello.signature_schemes()) {
            Some(key) => Some(key),
            None => {
                debug!(
                    sni = ?client_hello.server_name(),
                    "no signature-scheme match, offering default bundle"
                );
                self.default_bundle()
            }
        }
    }
}

fn base_builder(
    tls: &TlsConfig,
) -> rustls::ConfigBuilder<rustls::ServerConfig, rustls::server::WantsServerCert> {
    let versions: &[&rustls::SupportedProtocolVersion] = match tls.min_version.as_str() {
        "1.2" => &[&rustls::version::TLS12, &rustls::version::TLS13],
        _ => &[&rustls::version::TLS13],
    };
    rustls::ServerConfig::builder_with_protocol_versions(versions).with_no_client_auth()
}

fn scheme_matches(scheme: SignatureScheme, algorithm: SignatureAlgorithm) -> bool {
    match algorithm {
        SignatureAlgorithm::ECDSA => matches!(
            scheme,
            SignatureScheme::ECDSA_NISTP256_SHA256
                | SignatureScheme::ECDSA_NISTP384_SHA384
                | SignatureScheme::ECDSA_NISTP521_SHA512
        ),
        SignatureAlgorithm::RSA => matches!(
            scheme,
            SignatureScheme::RSA_PSS_SHA256
                | SignatureScheme::RSA_PSS_SHA384
                | SignatureScheme::RSA_PSS_SHA512
                | SignatureScheme::RSA_PKCS1_SHA256
                | SignatureScheme::RSA_PKCS1_SHA384
                | SignatureScheme::RSA_PKCS1_SHA512
        ),
        SignatureAlgorithm::ED25519 => scheme == SignatureScheme::ED25519,
        _ => false,
    }
}

fn load_bundles(configs: &[CertBundleConfig]) -> Result<Vec<Arc<LoadedBundle>>, GatewayError> {
    let mut bundles = Vec::with_capacity(configs.len());
    for config in configs {
        let chain = load_certificates(&config.cert_path)?;
        let key = load_private_key(&config.key_path)?;
        let signing_key = any_supported_type(&key).map_err(|e| {
            GatewayError::Certificate(format!(
                "unsupported key in {:?}: {}",
                config.key_path, e
            ))
        })?;
        let algorithm = signing_key.algorithm();
        let certified = CertifiedKey::new(chain.clone(), signing_key);
        certified.keys_match().map_err(|e| {
            GatewayError::Certificate(format!(
                "key {:?} does not match certificate {:?}: {}",
                config.key_path, config.cert_path, e
            ))
        })?;
        debug!(label = %config.label, ?algorithm, certs = chain.len(), "bundle loaded");
        bundles.push(Arc::new(LoadedBundle {
            label: config.label.clone(),
            algorithm,
            chain,
            certified: Arc::new(certified),
        }));
    }
    Ok(bundles)
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Certificate(format!("open {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Certificate(format!("parse {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Certificate(format!(
            "no certificates in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, GatewayError> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Certificate(format!("open {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::Certificate(format!("parse {:?}: {}", path, e)))?
        .ok_or_else(|| GatewayError::Certificate(format!("no private key in {:?}", path)))
}
