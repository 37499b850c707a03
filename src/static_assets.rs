//! Well-known static passthroughs
//!
//! A small fixed table of paths (robots.txt, security.txt and friends)
//! served directly from a read-only directory. Requests matching the table
//! never reach the backend or the sensitive rate limiter; the security
//! header set is still applied by the outer policy layer.

use std::collections::HashMap;
use std::path::PathBuf;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::StaticAssetsConfig;

struct AssetTable {
    enabled: bool,
    root: PathBuf,
    paths: HashMap<String, String>,
}

pub struct StaticAssets {
    table: ArcSwap<AssetTable>,
}

impl StaticAssets {
    pub fn new(config: &StaticAssetsConfig) -> Self {
        Self {
            table: ArcSwap::from_pointee(AssetTable {
                enabled: config.enabled,
                root: config.root.clone(),
                paths: config.paths.clone(),
            }),
        }
    }

    pub fn install(&self, config: &StaticAssetsConfig) {
        self.table.store(std::sync::Arc::new(AssetTable {
            enabled: config.enabled,
            root: config.root.clone(),
            paths: config.paths.clone(),
        }));
    }

    /// Serve the file mapped to `path`, or `None` when the path is not in
    /// the passthrough table. A mapped path whose file is missing on disk
    /// answers 404 rather than falling through to the backend.
    pub async fn serve(&self, path: &str) -> Option<Response<Body>> {
        let table = self.table.load();
        if !table.enabled {
            return None;
        }
        let file_name = table.paths.get(path)?;
        let full = table.root.join(file_name);

        match tokio::fs::read(&full).await {
            Ok(bytes) => {
                debug!(path, file = %full.display(), "served static passthrough");
                let mut response = Response::new(Body::from(bytes));
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type_for(file_name));
                response.headers_mut().insert(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("public, max-age=3600"),
                );
                Some(response)
            }
            Err(e) => {
                warn!(path, file = %full.display(), error = %e, "static passthrough missing");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::NOT_FOUND;
                Some(response)
            }
        }
    }
}

fn content_type_for(file_name: &str) -> HeaderValue {
    let ct = match file_name.rsplit('.').next() {
        Some("xml") => "application/xml; charset=utf-8",
        Some("json") => "application/json",
        Some("asc") => "application/pgp-keys",
        _ => "text/plain; charset=utf-8",
    };
    HeaderValue::from_static(ct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn config_with_root(root: &std::path::Path) -> StaticAssetsConfig {
        StaticAssetsConfig {
            root: root.to_path_buf(),
            ..StaticAssetsConfig::default()
        }
    }

    #[tokio::test]
    async fn unmapped_path_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let assets = StaticAssets::new(&config_with_root(dir.path()));
        assert!(assets.serve("/index.html").await.is_none());
    }

    #[tokio::test]
    async fn mapped_path_serves_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("robots.txt"), "User-agent: *\nDisallow:\n").unwrap();
        let assets = StaticAssets::new(&config_with_root(dir.path()));

        let response = assets.serve("/robots.txt").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"User-agent: *\nDisallow:\n");
    }

    #[tokio::test]
    async fn mapped_path_missing_on_disk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let assets = StaticAssets::new(&config_with_root(dir.path()));
        let response = assets.serve("/sitemap.xml").await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disabled_table_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("robots.txt"), "x").unwrap();
        let mut config = config_with_root(dir.path());
        config.enabled = false;
        let assets = StaticAssets::new(&config);
        assert!(assets.serve("/robots.txt").await.is_none());
    }

    #[test]
    fn xml_gets_xml_content_type() {
        assert_eq!(content_type_for("sitemap.xml"), "application/xml; charset=utf-8");
        assert_eq!(content_type_for("pgp-key.txt"), "text/plain; charset=utf-8");
    }
}
