//! Blob agent: deduplicated, weight-scheduled blob download and delivery.
//!
//! One origin fetch per digest runs process-wide. Requests enter a weighted
//! admission queue whose workers perform the origin handshake, classify the
//! blob by size, and hand the in-flight response to a size-bucketed
//! download pool. Most pool workers sit on the smallest bucket so a few
//! huge blobs cannot starve many small ones. Requesters wait on the shared
//! in-memory entry, never on each other, and a disconnecting client does
//! not tear down a fetch other clients are waiting for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use reqwest::Method as UpstreamMethod;
use tokio::sync::broadcast;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::blob_cache::{BlobCache, BlobEntry};
use crate::cache::Cache;
use crate::config::{AgentConfig, BLOB_GROUP_BASE_SIZE, BLOB_GROUP_COUNT, MAX_ERROR_BODY};
use crate::errcode::{self, Code, Errors};
use crate::error::ProxyError;
use crate::limit::{pace, throttle_stream, RateLimiter};
use crate::queue::{FinishGuard, WeightQueue};
use crate::queue_client::{MessageAttr, MessageStatus, QueueClient, KIND_BLOB};
use crate::token::Attribute;
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobInfo {
    pub host: String,
    pub image: String,
    pub digest: String,
}

struct DownloadBlob {
    response: reqwest::Response,
    info: BlobInfo,
    admitted: FinishGuard,
}

enum QueueOutcome {
    Completed,
    Failed(String),
}

#[derive(Default)]
pub struct AgentOptions {
    pub config: AgentConfig,
    pub big_cache: Option<Cache>,
    pub queue_client: Option<Arc<dyn QueueClient>>,
}

pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    upstream: Arc<UpstreamClient>,
    cache: Cache,
    big_cache: Option<Cache>,
    config: AgentConfig,
    blob_cache: Arc<BlobCache>,
    admission: Arc<WeightQueue<BlobInfo>>,
    groups: Vec<Arc<WeightQueue<DownloadBlob>>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<()>>>,
    no_redirect_limit: Option<Arc<RateLimiter>>,
    queue_client: Option<Arc<dyn QueueClient>>,
    cancel: CancellationToken,
}

/// Size bucket and the extra scheduling weight a blob of `size` bytes gets.
fn size_to_group_and_weight(size: u64) -> (usize, i64) {
    let group = if size <= BLOB_GROUP_BASE_SIZE {
        0
    } else {
        ((size / BLOB_GROUP_BASE_SIZE).ilog2() as usize).min(BLOB_GROUP_COUNT - 1)
    };
    let extra = if size == 0 { 0 } else { size.ilog2() as i64 };
    (group, extra)
}

/// Worker share per size bucket: the bulk on the smallest blobs.
fn group_workers(concurrency: usize, group: usize) -> usize {
    match group {
        0 => (concurrency * 8 / 10).max(1),
        1 => (concurrency / 10).max(1),
        _ => 1,
    }
}

fn errors_from(e: &ProxyError) -> Errors {
    match e {
        ProxyError::Registry(errs) => errs.clone(),
        _ => Code::Unknown.into(),
    }
}

impl Agent {
    pub fn new(upstream: Arc<UpstreamClient>, cache: Cache, options: AgentOptions) -> Self {
        let cancel = CancellationToken::new();
        let blob_cache = Arc::new(BlobCache::new(options.config.blob_cache_duration()));
        blob_cache.start_sweeper(cancel.clone());

        let no_redirect_limit = if options.config.no_redirect_max_bytes_per_second > 0 {
            Some(Arc::new(RateLimiter::new(
                options.config.no_redirect_max_bytes_per_second,
                1024,
            )))
        } else {
            None
        };

        let groups: Vec<Arc<WeightQueue<DownloadBlob>>> = (0..BLOB_GROUP_COUNT)
            .map(|_| Arc::new(WeightQueue::new()))
            .collect();

        let inner = Arc::new(AgentInner {
            upstream,
            cache,
            big_cache: options.big_cache,
            config: options.config,
            blob_cache,
            admission: Arc::new(WeightQueue::new()),
            groups,
            in_flight: Mutex::new(HashMap::new()),
            no_redirect_limit,
            queue_client: options.queue_client,
            cancel,
        });

        for _ in 0..inner.config.concurrency.max(1) {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move { inner.admission_worker().await });
        }
        for (group, queue) in inner.groups.iter().enumerate() {
            for _ in 0..group_workers(inner.config.concurrency.max(1), group) {
                let inner = Arc::clone(&inner);
                let queue = Arc::clone(queue);
                tokio::spawn(async move { inner.download_worker(queue).await });
            }
        }

        Self { inner }
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Serve one blob request end to end.
    pub async fn serve(
        &self,
        method: &Method,
        headers: &HeaderMap,
        remote_addr: &str,
        info: &BlobInfo,
        attr: &Attribute,
    ) -> Response {
        let inner = &self.inner;
        let start = Instant::now();

        if let Some(entry) = inner.blob_cache.get(&info.digest) {
            return inner
                .serve_entry(method, headers, remote_addr, info, attr, entry, start)
                .await;
        }

        if let Some(response) = inner
            .try_serve_storage(method, headers, remote_addr, info, attr, start)
            .await
        {
            return response;
        }

        AgentInner::fetch_shared(inner, info, attr.weight).await;

        if let Some(entry) = inner.blob_cache.get(&info.digest) {
            return inner
                .serve_entry(method, headers, remote_addr, info, attr, entry, start)
                .await;
        }

        if let Some(response) = inner
            .try_serve_storage(method, headers, remote_addr, info, attr, start)
            .await
        {
            return response;
        }

        tracing::error!(digest = %info.digest, "blob absent after fetch completed");
        errcode::serve_code(Code::Unknown)
    }
}

impl AgentInner {
    /// Singleflight: the first requester enqueues the download; everyone
    /// else joins the same in-flight fetch. The fetch itself is owned by
    /// the admission worker, so a caller going away cannot cancel it.
    async fn fetch_shared(inner: &Arc<AgentInner>, info: &BlobInfo, weight: i64) {
        let mut rx = {
            let mut in_flight = inner.in_flight.lock().unwrap();
            match in_flight.entry(info.digest.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.get().subscribe(),
                std::collections::hash_map::Entry::Vacant(slot) => {
                    let (tx, rx) = broadcast::channel(1);
                    slot.insert(tx.clone());

                    let finished = inner.admission.add_weight(info.clone(), weight);
                    let digest = info.digest.clone();
                    let completion_inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        finished.wait().await;
                        completion_inner.in_flight.lock().unwrap().remove(&digest);
                        let _ = tx.send(());
                    });
                    rx
                }
            }
        };
        let _ = rx.recv().await;
    }

    async fn admission_worker(self: Arc<Self>) {
        loop {
            let Some((info, weight, finish)) = self.admission.get_or_wait(&self.cancel).await
            else {
                return;
            };

            if let Some(client) = self.queue_client.clone() {
                match self.waiting_queue(&client, &info, weight).await {
                    Ok(QueueOutcome::Completed) => {
                        // Another agent produced the blob into shared
                        // storage; nothing local to do unless it is absent.
                        if self.stat_any(&info.digest).await {
                            finish.finish();
                            continue;
                        }
                        tracing::warn!(
                            digest = %info.digest,
                            "queue reported completed but blob is absent, fetching locally"
                        );
                    }
                    Ok(QueueOutcome::Failed(message)) => {
                        tracing::warn!(digest = %info.digest, error = %message, "queue reported failure");
                        self.blob_cache.put_error(
                            &info.digest,
                            Errors(vec![Code::Unknown.with_message(message)]),
                            None,
                        );
                        finish.finish();
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(digest = %info.digest, error = %e, "queue wait failed");
                    }
                }
            }

            match self.start_fetch(&info).await {
                Err((status, errors)) => {
                    tracing::warn!(
                        digest = %info.digest,
                        host = %info.host,
                        image = %info.image,
                        error = %errors,
                        "blob fetch request failed"
                    );
                    self.blob_cache.put_error(&info.digest, errors, status);
                    finish.finish();
                }
                Ok(response) => {
                    let size = response.content_length().unwrap_or(0);
                    let (group, extra) = size_to_group_and_weight(size);
                    let _ = self.groups[group].add_weight(
                        DownloadBlob {
                            response,
                            info,
                            admitted: finish,
                        },
                        weight + extra,
                    );
                }
            }
        }
    }

    async fn download_worker(self: Arc<Self>, queue: Arc<WeightQueue<DownloadBlob>>) {
        loop {
            let Some((bb, _, finish)) = queue.get_or_wait(&self.cancel).await else {
                return;
            };
            let DownloadBlob {
                response,
                info,
                admitted,
            } = bb;

            match self.store_blob(response, &info).await {
                Ok(()) => {
                    tracing::info!(digest = %info.digest, host = %info.host, "blob downloaded");
                }
                Err(e) => {
                    tracing::warn!(digest = %info.digest, error = %e, "blob download failed");
                    self.blob_cache
                        .put_error(&info.digest, errors_from(&e), None);
                }
            }

            finish.finish();
            admitted.finish();
        }
    }

    /// Origin handshake: open the blob GET and validate the status. The
    /// body stays unread; the download pool consumes it.
    async fn start_fetch(
        &self,
        info: &BlobInfo,
    ) -> std::result::Result<reqwest::Response, (Option<u16>, Errors)> {
        let path = format!("/v2/{}/blobs/{}", info.image, info.digest);
        let response = match self
            .upstream
            .request(UpstreamMethod::GET, &info.host, &path, Some("*/*"), &info.image)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(host = %info.host, path = %path, error = %e, "blob request failed");
                return Err((None, Code::Unknown.into()));
            }
        };

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                drop(response);
                return Err((None, Code::Denied.into()));
            }
            s if s.is_success() => return Ok(response),
            _ => {}
        }

        if status.as_u16() >= 400 {
            let body = match read_limited(response).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(status = %status, error = %e, "failed to read error body");
                    return Err((None, Code::Unknown.into()));
                }
            };
            if let Some(errors) = Errors::parse(&body) {
                return Err((Some(status.as_u16()), errors));
            }
            return if serde_json::from_slice::<serde_json::Value>(&body).is_ok() {
                Err((None, Code::Unknown.into()))
            } else {
                Err((None, Code::Denied.into()))
            };
        }

        tracing::error!(status = %status, host = %info.host, "unexpected upstream status");
        Err((None, Code::Unknown.into()))
    }

    /// Drain the response into the content-addressed store, then publish
    /// the entry other requests are waiting on.
    async fn store_blob(
        &self,
        response: reqwest::Response,
        info: &BlobInfo,
    ) -> crate::error::Result<()> {
        let expected = response.content_length();
        let stream = Box::pin(
            response
                .bytes_stream()
                .map(|item| item.map_err(ProxyError::Http)),
        );

        let big_target = match (&self.big_cache, expected) {
            (Some(big), Some(size))
                if self.config.big_cache_size > 0 && size > self.config.big_cache_size =>
            {
                Some(big)
            }
            _ => None,
        };

        if let Some(big) = big_target {
            big.put_blob(&info.digest, stream, expected).await?;
            let stat = big.stat_blob(&info.digest).await?;
            self.blob_cache
                .put_no_ttl(&info.digest, stat.mod_time, stat.size, true);
        } else {
            self.cache.put_blob(&info.digest, stream, expected).await?;
            let stat = self.cache.stat_blob(&info.digest).await?;
            self.blob_cache
                .put(&info.digest, stat.mod_time, stat.size, false);
        }
        Ok(())
    }

    async fn stat_any(&self, digest: &str) -> bool {
        if self.cache.stat_blob(digest).await.is_ok() {
            return true;
        }
        if let Some(big) = &self.big_cache {
            return big.stat_blob(digest).await.is_ok();
        }
        false
    }

    /// Global coordination: register interest in the digest and wait for
    /// some agent in the fleet to finish it.
    async fn waiting_queue(
        &self,
        client: &Arc<dyn QueueClient>,
        info: &BlobInfo,
        weight: i64,
    ) -> crate::error::Result<QueueOutcome> {
        let mut message = client
            .create(
                &info.digest,
                weight + 1,
                MessageAttr {
                    kind: KIND_BLOB.to_string(),
                    host: info.host.clone(),
                    image: info.image.clone(),
                    ..MessageAttr::default()
                },
            )
            .await?;

        if !message.status.is_terminal() {
            tracing::info!(digest = %info.digest, "watching queue message");
            let mut watch = client.watch(message.message_id).await?;
            loop {
                match watch.recv().await {
                    Some(update) => {
                        message = update;
                        if message.status.is_terminal() {
                            break;
                        }
                    }
                    None => {
                        // Watch closed early; back off and re-open.
                        if message.status.is_terminal() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        watch = client.watch(message.message_id).await?;
                    }
                }
            }
        }

        match message.status {
            MessageStatus::Completed => Ok(QueueOutcome::Completed),
            MessageStatus::Failed => Ok(QueueOutcome::Failed(format!(
                "{:?} queue error: {}",
                info.digest, message.data.error
            ))),
            status => Err(ProxyError::Queue(format!(
                "unexpected status {} for message {:?}",
                status.as_u64(),
                info.digest
            ))),
        }
    }

    async fn try_serve_storage(
        &self,
        method: &Method,
        headers: &HeaderMap,
        remote_addr: &str,
        info: &BlobInfo,
        attr: &Attribute,
        start: Instant,
    ) -> Option<Response> {
        if let Ok(stat) = self.cache.stat_blob(&info.digest).await {
            if let Some(big) = &self.big_cache {
                if self.config.big_cache_size > 0 && stat.size >= self.config.big_cache_size {
                    if let Ok(big_stat) = big.stat_blob(&info.digest).await {
                        return Some(
                            self.serve_big(
                                method,
                                remote_addr,
                                info,
                                attr,
                                big_stat.mod_time,
                                big_stat.size,
                                start,
                            )
                            .await,
                        );
                    }
                }
            }
            return Some(
                self.serve_local(
                    method,
                    headers,
                    remote_addr,
                    info,
                    attr,
                    stat.mod_time,
                    stat.size,
                    start,
                )
                .await,
            );
        }

        if let Some(big) = &self.big_cache {
            if let Ok(stat) = big.stat_blob(&info.digest).await {
                return Some(
                    self.serve_big(
                        method,
                        remote_addr,
                        info,
                        attr,
                        stat.mod_time,
                        stat.size,
                        start,
                    )
                    .await,
                );
            }
        }

        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_entry(
        &self,
        method: &Method,
        headers: &HeaderMap,
        remote_addr: &str,
        info: &BlobInfo,
        attr: &Attribute,
        entry: BlobEntry,
        start: Instant,
    ) -> Response {
        if let Some(error) = entry.error {
            let status = error.status.and_then(|s| StatusCode::from_u16(s).ok());
            return errcode::serve_json(&error.errors, status);
        }

        if let Some(response) = head_response(method, &info.digest, entry.size) {
            return response;
        }

        if entry.big_cache {
            return self
                .serve_big(
                    method,
                    remote_addr,
                    info,
                    attr,
                    entry.mod_time,
                    entry.size,
                    start,
                )
                .await;
        }

        self.serve_local(
            method,
            headers,
            remote_addr,
            info,
            attr,
            entry.mod_time,
            entry.size,
            start,
        )
        .await
    }

    fn referer(&self, remote_addr: &str, info: &BlobInfo, attr: &Attribute) -> String {
        format!(
            "{}-{}:{}:{}/{}",
            attr.registry_id, attr.token_id, remote_addr, info.host, info.image
        )
    }

    async fn serve_big(
        &self,
        method: &Method,
        remote_addr: &str,
        info: &BlobInfo,
        attr: &Attribute,
        mod_time: SystemTime,
        size: u64,
        start: Instant,
    ) -> Response {
        if let Some(response) = head_response(method, &info.digest, size) {
            return response;
        }

        if !attr.no_rate_limit {
            pace(size as f64, attr.rate_limit_per_second as f64, start).await;
        }

        let big = match &self.big_cache {
            Some(big) => big,
            None => return errcode::serve_code(Code::Unknown),
        };

        let referer = self.referer(remote_addr, info, attr);
        match big.redirect_blob(&info.digest, &referer).await {
            Ok(url) => {
                self.blob_cache
                    .put_no_ttl(&info.digest, mod_time, size, true);
                tracing::info!(digest = %info.digest, url = %url, "big cache hit");
                redirect_response(&url)
            }
            Err(e) => {
                tracing::info!(digest = %info.digest, error = %e, "failed to redirect blob");
                self.blob_cache.remove(&info.digest);
                errcode::serve_code(Code::Unknown)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_local(
        &self,
        method: &Method,
        headers: &HeaderMap,
        remote_addr: &str,
        info: &BlobInfo,
        attr: &Attribute,
        mod_time: SystemTime,
        size: u64,
        start: Instant,
    ) -> Response {
        if let Some(response) = head_response(method, &info.digest, size) {
            return response;
        }

        let redirect = !self.config.force_no_redirect
            && (attr.always_redirect
                || (self.config.no_redirect_size > 0 && size > self.config.no_redirect_size)
                || self
                    .no_redirect_limit
                    .as_ref()
                    .map(|l| !l.check(1.0))
                    .unwrap_or(false));

        if redirect {
            if !attr.no_rate_limit {
                pace(size as f64, attr.rate_limit_per_second as f64, start).await;
            }

            let referer = self.referer(remote_addr, info, attr);
            return match self.cache.redirect_blob(&info.digest, &referer).await {
                Ok(url) => {
                    self.blob_cache.put(&info.digest, mod_time, size, false);
                    tracing::info!(digest = %info.digest, url = %url, "cache hit, redirecting");
                    redirect_response(&url)
                }
                Err(e) => {
                    tracing::info!(digest = %info.digest, error = %e, "failed to redirect blob");
                    self.blob_cache.remove(&info.digest);
                    errcode::serve_code(Code::Unknown)
                }
            };
        }

        if !attr.no_rate_limit {
            pace(size as f64, attr.rate_limit_per_second as f64, start).await;
        }
        if let Some(limit) = &self.no_redirect_limit {
            limit.acquire(1.0).await;
        }

        let (offset, length, partial) = match parse_range(headers, size) {
            RangeOutcome::Full => (0, size, None),
            RangeOutcome::Partial { offset, length } => {
                (offset, length, Some((offset, offset + length - 1)))
            }
            RangeOutcome::Unsatisfiable => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                )
                    .into_response();
            }
        };

        let reader = match self.cache.blob_reader(&info.digest, offset).await {
            Ok(reader) => reader,
            Err(e) => {
                tracing::info!(digest = %info.digest, error = %e, "failed to open blob");
                self.blob_cache.remove(&info.digest);
                return errcode::serve_code(Code::Unknown);
            }
        };

        self.blob_cache.put(&info.digest, mod_time, size, false);

        let mut limiters = Vec::new();
        if !attr.no_rate_limit && attr.rate_limit_per_second > 0 {
            limiters.push(Arc::new(RateLimiter::new(
                attr.rate_limit_per_second,
                1024,
            )));
        }
        if let Some(limit) = &self.no_redirect_limit {
            limiters.push(Arc::clone(limit));
        }

        let reader = tokio::io::AsyncReadExt::take(reader, length);
        let stream = throttle_stream(ReaderStream::new(reader), limiters);
        let body = Body::from_stream(stream);

        let mut builder = Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, length)
            .header(header::ACCEPT_RANGES, "bytes")
            .header("Docker-Content-Digest", info.digest.clone());

        builder = match partial {
            Some((first, last)) => builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", first, last, size)),
            None => builder.status(StatusCode::OK),
        };

        builder
            .body(body)
            .unwrap_or_else(|_| errcode::serve_code(Code::Unknown))
    }
}

fn head_response(method: &Method, digest: &str, size: u64) -> Option<Response> {
    if size != 0 && method == Method::HEAD {
        return Some(
            (
                StatusCode::OK,
                [
                    (header::CONTENT_LENGTH, size.to_string()),
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::HeaderName::from_static("docker-content-digest"),
                        digest.to_string(),
                    ),
                ],
            )
                .into_response(),
        );
    }
    None
}

fn redirect_response(url: &str) -> Response {
    match url.parse::<axum::http::HeaderValue>() {
        Ok(location) => (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, location)],
        )
            .into_response(),
        Err(_) => errcode::serve_code(Code::Unknown),
    }
}

enum RangeOutcome {
    Full,
    Partial { offset: u64, length: u64 },
    Unsatisfiable,
}

/// Single-range `bytes=` parsing; anything more exotic is served in full.
fn parse_range(headers: &HeaderMap, size: u64) -> RangeOutcome {
    let Some(value) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) else {
        return RangeOutcome::Full;
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    match (start.is_empty(), end.is_empty()) {
        // bytes=-N: final N bytes.
        (true, false) => {
            let Ok(n) = end.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            if n == 0 || size == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            let n = n.min(size);
            RangeOutcome::Partial {
                offset: size - n,
                length: n,
            }
        }
        // bytes=N-: from N to the end.
        (false, true) => {
            let Ok(offset) = start.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            if offset >= size {
                return RangeOutcome::Unsatisfiable;
            }
            RangeOutcome::Partial {
                offset,
                length: size - offset,
            }
        }
        (false, false) => {
            let (Ok(offset), Ok(last)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return RangeOutcome::Full;
            };
            if offset > last || offset >= size {
                return RangeOutcome::Unsatisfiable;
            }
            let last = last.min(size - 1);
            RangeOutcome::Partial {
                offset,
                length: last - offset + 1,
            }
        }
        (true, true) => RangeOutcome::Full,
    }
}

async fn read_limited(response: reqwest::Response) -> reqwest::Result<Vec<u8>> {
    let mut stream = Box::pin(response.bytes_stream());
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (body.len() as u64) + (chunk.len() as u64) > MAX_ERROR_BODY {
            body.extend_from_slice(&chunk[..(MAX_ERROR_BODY as usize - body.len())]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
