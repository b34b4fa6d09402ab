//! Manifest cache: revision + tag link layout over the blob store, an
//! in-memory freshness map for tags, and graceful degradation when the
//! origin is down.
//!
//! A manifest body is stored once, content-addressed. A revision link
//! (`revisions/sha256/{hex}/link`) marks the digest as known for an image,
//! and a tag link (`tags/{tag}/current/link`) points the mutable tag at a
//! revision. A stale tag link still resolves to a valid revision and body.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::config::{
    DEFAULT_MANIFEST_MEDIA_TYPE, MANIFEST_ACCEPTS, RATELIMIT_SOURCE_HEADER,
};
use crate::errcode::{self, Code};
use crate::pathinfo::{
    blob_data_path, manifest_revision_link_path, manifest_tag_link_path, parse_sha256, PathInfo,
    Reference,
};
use crate::upstream::UpstreamClient;

#[derive(Deserialize)]
struct MediaTypeProbe {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

pub struct ManifestCache {
    cache: Cache,
    upstream: Arc<UpstreamClient>,
    accepts: String,
    duration: Duration,
    freshness: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ManifestCache {
    pub fn new(cache: Cache, upstream: Arc<UpstreamClient>, duration: Duration) -> Self {
        Self {
            cache,
            upstream,
            accepts: MANIFEST_ACCEPTS.join(","),
            duration,
            freshness: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start_sweeper(&self, cancel: tokio_util::sync::CancellationToken) {
        let freshness = Arc::clone(&self.freshness);
        let duration = self.duration;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(duration);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Some(cutoff) = Instant::now().checked_sub(duration) {
                            freshness.lock().unwrap().retain(|_, at| *at > cutoff);
                        }
                    }
                }
            }
        });
    }

    fn touch(&self, link_path: &str) {
        self.freshness
            .lock()
            .unwrap()
            .insert(link_path.to_string(), Instant::now());
    }

    fn is_fresh(&self, link_path: &str) -> bool {
        let freshness = self.freshness.lock().unwrap();
        match freshness.get(link_path) {
            Some(at) => at.elapsed() < self.duration,
            None => false,
        }
    }

    /// Serve a manifest request: cache first when allowed, then origin,
    /// then cached fallback when the origin misbehaves.
    pub async fn serve(&self, method: &Method, info: &PathInfo) -> Response {
        let Reference::Manifests(reference) = &info.reference else {
            return errcode::serve_code(Code::Unknown);
        };

        if let Some(response) = self.try_first_serve(method, info, reference).await {
            return response;
        }

        let response = match self
            .upstream
            .request(
                method.clone(),
                &info.host,
                &info.upstream_path(),
                Some(&self.accepts),
                &info.image,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if let Some(response) = self.fallback_serve(method, info, reference).await {
                    tracing::warn!(
                        host = %info.host,
                        image = %info.image,
                        error = %e,
                        "origin unreachable, serving cached manifest"
                    );
                    return response;
                }
                tracing::error!(host = %info.host, image = %info.image, error = %e, "origin request failed");
                return errcode::serve_code(Code::Unknown);
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if let Some(cached) = self.fallback_serve(method, info, reference).await {
                tracing::error!(
                    host = %info.host,
                    image = %info.image,
                    status = %status,
                    "origin manifest response 40x, but hit caches"
                );
                return cached;
            }
            tracing::error!(host = %info.host, image = %info.image, status = %status, "origin manifest denied");
            return errcode::serve_code(Code::Denied);
        }

        if !status.is_success() {
            if let Some(cached) = self.fallback_serve(method, info, reference).await {
                tracing::error!(
                    host = %info.host,
                    image = %info.image,
                    status = %status,
                    "origin manifest error, but hit caches"
                );
                return cached;
            }
            // Surface the origin error as-is.
            let headers = copy_headers(response.headers());
            let body = response.bytes().await.unwrap_or_default();
            return (status, headers, body).into_response();
        }

        let headers = copy_headers(response.headers());

        if method == Method::HEAD {
            return (status, headers).into_response();
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(host = %info.host, image = %info.image, error = %e, "failed to read manifest body");
                return errcode::serve_code(Code::Unknown);
            }
        };

        if let Err(e) = self.store(info, reference, &body).await {
            tracing::error!(host = %info.host, image = %info.image, error = %e, "failed to cache manifest");
            return errcode::serve_code(Code::Unknown);
        }

        let mut headers = headers;
        if !headers.contains_key("docker-content-digest") {
            let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
            if let Ok(value) = digest.parse() {
                headers.insert(
                    HeaderName::from_static("docker-content-digest"),
                    value,
                );
            }
        }

        (status, headers, body).into_response()
    }

    /// Cache-first path: digests are immutable and always eligible; tags
    /// only while their freshness entry is within the cache duration.
    async fn try_first_serve(
        &self,
        method: &Method,
        info: &PathInfo,
        reference: &str,
    ) -> Option<Response> {
        let link_path = match parse_sha256(reference) {
            Some(hx) => manifest_revision_link_path(&info.host, &info.image, hx),
            None => {
                let link_path = manifest_tag_link_path(&info.host, &info.image, reference);
                if !self.is_fresh(&link_path) {
                    return None;
                }
                link_path
            }
        };
        self.serve_cached(method, &link_path).await
    }

    /// Degraded path after an origin failure. Digest refs never fall back:
    /// a cached body that does not match the requested digest must not be
    /// served.
    async fn fallback_serve(
        &self,
        method: &Method,
        info: &PathInfo,
        reference: &str,
    ) -> Option<Response> {
        if parse_sha256(reference).is_some() {
            return None;
        }
        let link_path = manifest_tag_link_path(&info.host, &info.image, reference);
        self.serve_cached(method, &link_path).await
    }

    async fn serve_cached(&self, method: &Method, link_path: &str) -> Option<Response> {
        let digest_bytes = match self.cache.get_content(link_path).await {
            Ok(content) => content,
            Err(e) => {
                if !e.is_not_found() {
                    tracing::error!(link_path = %link_path, error = %e, "manifest link read failed");
                }
                return None;
            }
        };
        let digest = String::from_utf8(digest_bytes).ok()?;
        let hx = parse_sha256(digest.trim())?;

        let body = match self.cache.get_content(&blob_data_path(hx)).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(link_path = %link_path, error = %e, "manifest blob cache missed");
                return None;
            }
        };

        let probe: MediaTypeProbe = match serde_json::from_slice(&body) {
            Ok(probe) => probe,
            Err(e) => {
                tracing::error!(link_path = %link_path, error = %e, "cached manifest is not json");
                return None;
            }
        };
        let media_type = probe
            .media_type
            .filter(|mt| !mt.is_empty())
            .unwrap_or_else(|| DEFAULT_MANIFEST_MEDIA_TYPE.to_string());

        tracing::info!(link_path = %link_path, "manifest cache hit");

        if self.duration > Duration::ZERO {
            self.touch(link_path);
        }

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, media_type)
            .header(header::CONTENT_LENGTH, body.len())
            .header(
                HeaderName::from_static("docker-content-digest"),
                digest.trim(),
            );

        if method == Method::HEAD {
            return response.body(Body::empty()).ok();
        }
        response.body(Body::from(body)).ok()
    }

    /// Write body + links. For a digest request the body hash must match
    /// the requested digest exactly; nothing is written otherwise.
    async fn store(
        &self,
        info: &PathInfo,
        reference: &str,
        body: &[u8],
    ) -> crate::error::Result<()> {
        let hash = hex::encode(Sha256::digest(body));
        let link_value = format!("sha256:{}", hash);

        if let Some(requested) = parse_sha256(reference) {
            if requested != hash {
                return Err(crate::error::ProxyError::Cache(format!(
                    "expected hash {} is not same to {}",
                    requested, hash
                )));
            }
        }

        // Body first so a readable link always points at a readable body.
        self.cache
            .put_content(&blob_data_path(&hash), body)
            .await?;
        self.cache
            .put_content(
                &manifest_revision_link_path(&info.host, &info.image, &hash),
                link_value.as_bytes(),
            )
            .await?;

        if parse_sha256(reference).is_none() {
            let tag_link = manifest_tag_link_path(&info.host, &info.image, reference);
            self.cache
                .put_content(&tag_link, link_value.as_bytes())
                .await?;
            if self.duration > Duration::ZERO {
                self.touch(&tag_link);
            }
        }

        Ok(())
    }
}

fn copy_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in source {
        if name.as_str().eq_ignore_ascii_case(RATELIMIT_SOURCE_HEADER) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
