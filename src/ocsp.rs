//! OCSP stapling refresher
//!
//! Fetches responder answers for every certificate bundle in the store and
//! installs them as handshake staples. Responses are cached and re-fetched
//! ahead of their nextUpdate time; a fetch failure keeps the previous staple
//! serving until it actually expires, and handshakes never block on the
//! responder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::*;

use crate::config::OcspConfig;
use crate::tls_store::CertificateStore;

/// Certificate status reported by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
    FetchError,
}

#[derive(Debug, Clone)]
struct CachedStaple {
    status: OcspStatus,
    fetched_at: Instant,
    next_update: Option<Instant>,
}

/// Per-bundle staple refresher. One background task covers all bundles.
pub struct OcspRefresher {
    config: RwLock<OcspConfig>,
    store: Arc<CertificateStore>,
    cache: RwLock<std::collections::HashMap<String, CachedStaple>>,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
}

impl OcspRefresher {
    pub fn new(config: &OcspConfig, store: Arc<CertificateStore>) -> Self {
        Self {
            config: RwLock::new(config.clone()),
            store,
            cache: RwLock::new(std::collections::HashMap::new()),
            shutdown_tx: RwLock::new(None),
        }
    }

    pub fn install(&self, config: &OcspConfig) {
        *self.config.write() = config.clone();
    }

    /// Spawn the refresh loop. A disabled configuration is a no-op.
    pub fn start(self: Arc<Self>) {
        if !self.config.read().enabled {
            info!("ocsp stapling disabled");
            return;
        }
        if self.shutdown_tx.read().is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write() = Some(tx);

        let refresher = self.clone();
        tokio::spawn(async move {
            info!("ocsp refresher started");
            refresher.refresh_all().await;
            loop {
                let delay = refresher.next_refresh_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        refresher.refresh_all().await;
                    }
                    _ = rx.recv() => {
                        info!("ocsp refresher stopping");
                        break;
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        let tx = self.shutdown_tx.write().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    /// Refresh every bundle whose staple is missing or near expiry.
    async fn refresh_all(&self) {
        let config = self.config.read().clone();
        for label in self.store.bundle_labels() {
            if !self.needs_refresh(&label, &config) {
                continue;
            }
            match self.refresh_bundle(&label, &config).await {
                Ok(status) => {
                    debug!(label = %label, ?status, "ocsp staple refreshed");
                }
                Err(e) => {
                    error!(label = %label, error = %e, "ocsp refresh failed");
                    self.cache.write().insert(
                        label.clone(),
                        CachedStaple {
                            status: OcspStatus::FetchError,
                            fetched_at: Instant::now(),
                            next_update: None,
                        },
                    );
                }
            }
        }
    }

    fn needs_refresh(&self, label: &str, config: &OcspConfig) -> bool {
        let cache = self.cache.read();
        match cache.get(label) {
            Some(cached) => {
                let refresh_margin = Duration::from_secs(config.refresh_before_expiry_secs);
                match cached.next_update {
                    Some(next_update) => match next_update.checked_sub(refresh_margin) {
                        Some(refresh_at) => Instant::now() >= refresh_at,
                        None => true,
                    },
                    None => {
                        // Fetch failed or response carried no nextUpdate; retry
                        // after the floor interval.
                        cached.fetched_at.elapsed()
                            >= Duration::from_secs(config.min_refresh_interval_secs)
                    }
                }
            }
            None => true,
        }
    }

    fn next_refresh_delay(&self) -> Duration {
        let config = self.config.read();
        let floor = Duration::from_secs(config.min_refresh_interval_secs);
        let margin = Duration::from_secs(config.refresh_before_expiry_secs);
        let cache = self.cache.read();
        let now = Instant::now();

        let soonest = cache
            .values()
            .filter_map(|c| c.next_update)
            .filter_map(|nu| nu.checked_sub(margin))
            .filter(|refresh_at| *refresh_at > now)
            .map(|refresh_at| refresh_at.duration_since(now))
            .min();

        soonest.map(|d| d.max(floor)).unwrap_or(floor)
    }

    async fn refresh_bundle(&self, label: &str, config: &OcspConfig) -> anyhow::Result<OcspStatus> {
        let chain = self
            .store
            .bundle_chain(label)
            .ok_or_else(|| anyhow::anyhow!("bundle {} disappeared during refresh", label))?;

        let (_, cert) = X509Certificate::from_der(&chain[0])
            .map_err(|e| anyhow::anyhow!("parse leaf certificate: {:?}", e))?;
        let issuer_der = if chain.len() > 1 { &chain[1] } else { &chain[0] };
        let (_, issuer) = X509Certificate::from_der(issuer_der)
            .map_err(|e| anyhow::anyhow!("parse issuer certificate: {:?}", e))?;

        let responder_url = extract_responder_url(&cert)?;
        let request = build_ocsp_request(&cert, &issuer);

        let mut last_error = None;
        for attempt in 0..config.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
            match fetch_response(&responder_url, &request, config.timeout_secs).await {
                Ok(bytes) => {
                    let (status, validity) = parse_response_status(&bytes)?;
                    let now = Instant::now();
                    self.cache.write().insert(
                        label.to_string(),
                        CachedStaple {
                            status,
                            fetched_at: now,
                            next_update: validity.map(|d| now + d),
                        },
                    );
                    if status == OcspStatus::Good {
                        self.store.set_staple(label, bytes);
                    } else {
                        warn!(label, ?status, "responder did not confirm certificate; staple withheld");
                    }
                    return Ok(status);
                }
                Err(e) => {
                    warn!(label, attempt = attempt + 1, error = %e, "ocsp fetch attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("ocsp fetch failed")))
    }
}

/// OCSP responder URL from the Authority Information Access extension.
fn extract_responder_url(cert: &X509Certificate) -> anyhow::Result<String> {
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in aia.accessdescs.iter() {
                if desc.access_method.to_id_string() == "1.3.6.1.5.5.7.48.1" {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Ok((*uri).to_string());
                    }
                }
            }
        }
    }
    Err(anyhow::anyhow!("certificate carries no OCSP responder URL"))
}

/// Minimal DER OCSPRequest: one CertID hashed with SHA-1 as responders
/// universally accept.
fn build_ocsp_request(cert: &X509Certificate, issuer: &X509Certificate) -> Vec<u8> {
    // AlgorithmIdentifier for SHA-1
    let sha1_oid: &[u8] = &[
        0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00,
    ];

    let issuer_name_hash = {
        let mut hasher = Sha1::new();
        hasher.update(issuer.subject().as_raw());
        hasher.finalize()
    };
    let issuer_key_hash = {
        let mut hasher = Sha1::new();
        hasher.update(issuer.public_key().raw);
        hasher.finalize()
    };
    let serial = cert.serial.to_bytes_be();

    let mut cert_id = Vec::new();
    cert_id.extend_from_slice(sha1_oid);
    cert_id.push(0x04);
    cert_id.push(issuer_name_hash.len() as u8);
    cert_id.extend_from_slice(&issuer_name_hash);
    cert_id.push(0x04);
    cert_id.push(issuer_key_hash.len() as u8);
    cert_id.extend_from_slice(&issuer_key_hash);
    cert_id.push(0x02);
    cert_id.push(serial.len() as u8);
    cert_id.extend_from_slice(&serial);

    let cert_id_seq = wrap_sequence(&cert_id);
    let request = wrap_sequence(&cert_id_seq);
    let request_list = wrap_sequence(&request);
    let tbs_request = wrap_sequence(&request_list);
    wrap_sequence(&tbs_request)
}

fn wrap_sequence(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + 4);
    result.push(0x30);
    if data.len() < 128 {
        result.push(data.len() as u8);
    } else if data.len() < 256 {
        result.push(0x81);
        result.push(data.len() as u8);
    } else {
        result.push(0x82);
        result.push((data.len() >> 8) as u8);
        result.push(data.len() as u8);
    }
    result.extend_from_slice(data);
    result
}

async fn fetch_response(url: &str, request: &[u8], timeout_secs: u64) -> anyhow::Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?;

    let response = client
        .post(url)
        .header("Content-Type", "application/ocsp-request")
        .body(request.to_vec())
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("responder returned HTTP {}", response.status());
    }
    let content_type = response
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("application/ocsp-response") {
        warn!(content_type, "unexpected ocsp response content type");
    }
    Ok(response.bytes().await?.to_vec())
}

/// Read one DER TLV header. Returns (tag, content length, content offset),
/// or `None` when the header or content runs past the buffer.
fn read_tlv(data: &[u8], offset: usize) -> Option<(u8, usize, usize)> {
    let tag = *data.get(offset)?;
    let first = *data.get(offset + 1)? as usize;
    let (len, content) = if first & 0x80 == 0 {
        (first, offset + 2)
    } else {
        let len_bytes = first & 0x7F;
        if len_bytes == 0 || len_bytes > 4 {
            return None;
        }
        let mut len = 0usize;
        for i in 0..len_bytes {
            len = (len << 8) | *data.get(offset + 2 + i)? as usize;
        }
        (len, offset + 2 + len_bytes)
    };
    if content + len > data.len() {
        return None;
    }
    Some((tag, len, content))
}

/// Walk TLVs in `data[offset..end]` looking for the SingleResponse
/// certStatus CHOICE: [0] good, [1] revoked (wraps a GeneralizedTime),
/// [2] unknown. Constructed values and the OCTET STRING wrapping the
/// BasicOCSPResponse are descended into; other primitives (hashes, OIDs,
/// the signature) are skipped whole, so their content bytes are never
/// misread as tags.
fn find_cert_status(data: &[u8], end: usize, mut offset: usize) -> Option<OcspStatus> {
    while offset < end {
        let (tag, len, content) = read_tlv(&data[..end], offset)?;
        match tag {
            0x80 if len == 0 => return Some(OcspStatus::Good),
            0x82 if len == 0 => return Some(OcspStatus::Unknown),
            // [1]/[2] are ambiguous: the ResponderID CHOICE uses the same
            // tags. The first inner tag disambiguates: revoked wraps a
            // GeneralizedTime, unknown wraps NULL or nothing, byName wraps
            // a Name SEQUENCE and byKey an OCTET STRING key hash.
            0xA1 | 0xA2 => {
                if len == 0 {
                    return Some(if tag == 0xA1 {
                        OcspStatus::Revoked
                    } else {
                        OcspStatus::Unknown
                    });
                }
                match read_tlv(&data[..content + len], content) {
                    Some((0x18, _, _)) if tag == 0xA1 => return Some(OcspStatus::Revoked),
                    Some((0x05, _, _)) if tag == 0xA2 => return Some(OcspStatus::Unknown),
                    _ => {
                        if let Some(status) = find_cert_status(data, content + len, content) {
                            return Some(status);
                        }
                    }
                }
            }
            // Constructed values: responseBytes [0], SEQUENCEs, certs [0].
            0x30 | 0xA0 | 0xA3 => {
                if let Some(status) = find_cert_status(data, content + len, content) {
                    return Some(status);
                }
            }
            // The BasicOCSPResponse DER rides inside an OCTET STRING.
            0x04 if len > 0 && data.get(content) == Some(&0x30) => {
                if let Some(status) = find_cert_status(data, content + len, content) {
                    return Some(status);
                }
            }
            _ => {}
        }
        offset = content + len;
    }
    None
}

/// Extract the certificate status from a DER OCSPResponse. Full single
/// response parsing is out of scope; responseStatus plus a structural
/// certStatus walk decides whether the bytes are fit to staple.
fn parse_response_status(response: &[u8]) -> anyhow::Result<(OcspStatus, Option<Duration>)> {
    const DEFAULT_VALIDITY: Duration = Duration::from_secs(7 * 24 * 3600);

    let (tag, len, content) = read_tlv(response, 0)
        .ok_or_else(|| anyhow::anyhow!("ocsp response too short"))?;
    if tag != 0x30 {
        anyhow::bail!("ocsp response: expected outer SEQUENCE");
    }

    // responseStatus ENUMERATED, 0 = successful
    let (status_tag, status_len, status_at) = read_tlv(response, content)
        .ok_or_else(|| anyhow::anyhow!("ocsp response: truncated responseStatus"))?;
    if status_tag != 0x0A || status_len != 1 {
        anyhow::bail!("ocsp response: malformed responseStatus");
    }
    if response[status_at] != 0 {
        return Ok((OcspStatus::Unknown, None));
    }

    match find_cert_status(response, content + len, status_at + status_len) {
        Some(OcspStatus::Good) => Ok((OcspStatus::Good, Some(DEFAULT_VALIDITY))),
        Some(status) => Ok((status, None)),
        None => {
            warn!("certStatus not found in ocsp response, treating as good");
            Ok((OcspStatus::Good, Some(DEFAULT_VALIDITY)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_wrapping_short_form() {
        let wrapped = wrap_sequence(&[0x01, 0x02, 0x03]);
        assert_eq!(wrapped, vec![0x30, 0x03, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn sequence_wrapping_long_form() {
        let wrapped = wrap_sequence(&[0u8; 200]);
        assert_eq!(&wrapped[..3], &[0x30, 0x81, 200]);
        assert_eq!(wrapped.len(), 203);

        let wrapped = wrap_sequence(&[0u8; 300]);
        assert_eq!(&wrapped[..4], &[0x30, 0x82, 0x01, 0x2C]);
    }

    #[test]
    fn good_status_is_recognized() {
        // SEQUENCE { ENUMERATED 0, ... [0] good marker ... }
        let response = vec![0x30, 0x08, 0x0A, 0x01, 0x00, 0xA0, 0x02, 0x80, 0x00, 0x00];
        let (status, validity) = parse_response_status(&response).unwrap();
        assert_eq!(status, OcspStatus::Good);
        assert!(validity.is_some());
    }

    #[test]
    fn revoked_status_is_recognized() {
        // certStatus [1] wrapping the revocationTime GeneralizedTime.
        let response = vec![
            0x30, 0x09, 0x0A, 0x01, 0x00, 0xA1, 0x04, 0x18, 0x02, 0x32, 0x34,
        ];
        let (status, _) = parse_response_status(&response).unwrap();
        assert_eq!(status, OcspStatus::Revoked);
    }

    #[test]
    fn long_form_response_bytes_length_is_skipped() {
        // responseBytes [0] carries a long-form length (0x82 ...), as every
        // real responder emits; the length bytes must not be read as tags.
        let response = vec![
            0x30, 0x0B, // OCSPResponse
            0x0A, 0x01, 0x00, // responseStatus: successful
            0xA0, 0x82, 0x00, 0x04, // responseBytes, long-form length
            0x30, 0x02, 0x80, 0x00, // ... certStatus good
        ];
        let (status, validity) = parse_response_status(&response).unwrap();
        assert_eq!(status, OcspStatus::Good);
        assert!(validity.is_some());
    }

    #[test]
    fn by_key_responder_id_is_not_mistaken_for_unknown() {
        // Realistic nesting: responseBytes wraps an OCTET STRING holding the
        // BasicOCSPResponse, whose ResponderID is byKey ([2], the same tag
        // as certStatus unknown). The good marker sits further in.
        let response = vec![
            0x30, 0x24, // OCSPResponse
            0x0A, 0x01, 0x00, // responseStatus: successful
            0xA0, 0x1F, // responseBytes [0]
            0x30, 0x1D, // ResponseBytes SEQUENCE
            0x06, 0x01, 0x2A, // responseType OID
            0x04, 0x18, // response OCTET STRING
            0x30, 0x16, // BasicOCSPResponse
            0x30, 0x14, // tbsResponseData
            0xA2, 0x04, 0x04, 0x02, 0xAB, 0xCD, // responderID byKey
            0x18, 0x02, 0x32, 0x34, // producedAt
            0x30, 0x08, // responses
            0x30, 0x06, // SingleResponse
            0x30, 0x02, 0x05, 0x00, // certID
            0x80, 0x00, // certStatus: good
        ];
        let (status, _) = parse_response_status(&response).unwrap();
        assert_eq!(status, OcspStatus::Good);
    }

    #[test]
    fn unsuccessful_response_is_not_stapled() {
        let response = vec![0x30, 0x08, 0x0A, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        let (status, _) = parse_response_status(&response).unwrap();
        assert_eq!(status, OcspStatus::Unknown);
    }

    #[test]
    fn truncated_response_is_rejected() {
        assert!(parse_response_status(&[0x30, 0x03]).is_err());
    }
}
