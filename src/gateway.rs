//! HTTP entry point for the `/v2` pull surface.
//!
//! The gateway authenticates the caller, resolves the upstream host,
//! enforces block and tags-list policy, and dispatches: blobs to the
//! agent, manifests to the manifest cache, everything else straight
//! through to the origin with pagination links rewritten.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::StreamExt;

use crate::agent::{Agent, BlobInfo};
use crate::config::{GatewayConfig, RATELIMIT_SOURCE_HEADER, V2_PREFIX};
use crate::errcode::{self, Code};
use crate::error::ProxyError;
use crate::limit::{throttle_stream, RateLimiter};
use crate::manifest::ManifestCache;
use crate::pathinfo::{rewrite_pagination_link, PathInfo, Reference};
use crate::token::{Attribute, Authenticator, Token};
use crate::upstream::UpstreamClient;

const CATALOG_PATH: &str = "/v2/_catalog";
const EMPTY_TAGS_LIST: &str = r#"{"name":"disable-list-tags","tags":[]}"#;

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub host: String,
    pub name: String,
}

pub type PathModifyFn = Box<dyn Fn(ImageInfo) -> ImageInfo + Send + Sync>;

#[derive(Default)]
pub struct GatewayOptions {
    pub config: GatewayConfig,
    pub authenticator: Option<Arc<Authenticator>>,
    pub agent: Option<Arc<Agent>>,
    pub manifests: Option<Arc<ManifestCache>>,
    pub modify: Option<PathModifyFn>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    upstream: Arc<UpstreamClient>,
    authenticator: Option<Arc<Authenticator>>,
    agent: Option<Arc<Agent>>,
    manifests: Option<Arc<ManifestCache>>,
    modify: Option<PathModifyFn>,
}

impl Gateway {
    pub fn new(upstream: Arc<UpstreamClient>, options: GatewayOptions) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config: options.config,
                upstream,
                authenticator: options.authenticator,
                agent: options.agent,
                manifests: options.manifests,
                modify: options.modify,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2/", any(handle))
            .route("/v2/*path", any(handle))
            .with_state(self.clone())
    }
}

fn api_base() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{}",
    )
        .into_response()
}

fn empty_tags_list() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        EMPTY_TAGS_LIST,
    )
        .into_response()
}

fn remote_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn handle(State(gateway): State<Gateway>, request: Request) -> Response {
    let inner = &gateway.inner;
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if method != Method::GET && method != Method::HEAD {
        return errcode::serve_code(Code::Unsupported);
    }
    if path == CATALOG_PATH {
        return errcode::serve_code(Code::Unsupported);
    }

    let remote_addr = remote_ip(&request);
    let headers = request.headers().clone();
    let service = request_host(&headers);

    // The challenge names the scope of whatever repository was asked for.
    let challenge_scope = PathInfo::parse(&path)
        .map(|info| info.scope())
        .unwrap_or_default();

    let token = match &inner.authenticator {
        Some(authenticator) => match authenticator.authorization(&headers) {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!(remote_addr = %remote_addr, error = %e, "authorization failed");
                return authenticator.challenge(&service, &challenge_scope);
            }
        },
        None => Token::default(),
    };

    if path == V2_PREFIX {
        return api_base();
    }

    if let Some(authenticator) = &inner.authenticator {
        if token.scope.is_empty() {
            return authenticator.challenge(&service, &challenge_scope);
        }
        if token.attribute.block {
            return errcode::serve_denied(&token.attribute.block_message);
        }
    }

    let Some(mut info) = PathInfo::parse(&path) else {
        return errcode::serve_code(Code::Denied);
    };

    if !token.attribute.host.is_empty() {
        info.host = token.attribute.host.clone();
    }
    if info.host.is_empty() {
        info.host = inner.config.default_registry.clone().unwrap_or_default();
        if let Some(overridden) = inner.config.override_default_registry.get(&service) {
            info.host = overridden.clone();
        }
    }
    if info.host.is_empty() {
        return errcode::serve_code(Code::Denied);
    }

    // Clients pulling through a mirror pass the registry as `ns=`; a value
    // disagreeing with the resolved host would silently fetch from the
    // wrong upstream.
    if let Some(ns) = query_param(request.uri().query(), "ns") {
        if !ns.is_empty() && ns != info.host {
            return errcode::serve_code(Code::Denied);
        }
    }

    if !token.attribute.image.is_empty() {
        info.image = token.attribute.image.clone();
    }

    if let Some(modify) = &inner.modify {
        let modified = modify(ImageInfo {
            host: info.host.clone(),
            name: info.image.clone(),
        });
        info.host = modified.host;
        info.image = modified.name;
    }

    if inner.config.disable_tags_list
        && info.reference == Reference::TagsList
        && !token.attribute.allow_tags_list
    {
        return empty_tags_list();
    }

    match &info.reference {
        Reference::Blobs(digest) => {
            serve_blob(inner, &method, &headers, &remote_addr, &info, digest, &token.attribute)
                .await
        }
        Reference::Manifests(_) => match &inner.manifests {
            Some(manifests) => manifests.serve(&method, &info).await,
            None => forward(inner, &method, &info, &token.attribute).await,
        },
        Reference::TagsList => forward(inner, &method, &info, &token.attribute).await,
    }
}

async fn serve_blob(
    inner: &Arc<GatewayInner>,
    method: &Method,
    headers: &HeaderMap,
    remote_addr: &str,
    info: &PathInfo,
    digest: &str,
    attr: &Attribute,
) -> Response {
    // A token may pin blob traffic to a dedicated agent fleet.
    if !attr.no_blobs_agent && !attr.blobs_agent_url.is_empty() {
        let url = format!(
            "{}/v2/{}/{}/blobs/{}",
            attr.blobs_agent_url.trim_end_matches('/'),
            info.host,
            info.image,
            digest
        );
        return match url.parse::<HeaderValue>() {
            Ok(location) => (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, location)],
            )
                .into_response(),
            Err(_) => errcode::serve_code(Code::Unknown),
        };
    }

    match &inner.agent {
        Some(agent) => {
            let blob_info = BlobInfo {
                host: info.host.clone(),
                image: info.image.clone(),
                digest: digest.to_string(),
            };
            agent.serve(method, headers, remote_addr, &blob_info, attr).await
        }
        None => forward(inner, method, info, attr).await,
    }
}

/// Direct passthrough for non-cacheable endpoints.
async fn forward(
    inner: &Arc<GatewayInner>,
    method: &Method,
    info: &PathInfo,
    attr: &Attribute,
) -> Response {
    let response = match inner
        .upstream
        .request(
            method.clone(),
            &info.host,
            &info.upstream_path(),
            None,
            &info.image,
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(host = %info.host, image = %info.image, error = %e, "origin request failed");
            return errcode::serve_code(Code::Unknown);
        }
    };

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        tracing::warn!(host = %info.host, image = %info.image, status = %status, "origin direct response 40x");
        return errcode::serve_code(Code::Denied);
    }

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if name.as_str().eq_ignore_ascii_case(RATELIMIT_SOURCE_HEADER) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if status == StatusCode::OK {
        if let Some(link) = headers
            .get(header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        {
            if let Ok(rewritten) = rewrite_pagination_link(&link, &info.host).parse() {
                headers.insert(header::LINK, rewritten);
            }
        }
    }

    if method == Method::HEAD {
        return (status, headers).into_response();
    }

    let mut limiters = Vec::new();
    if !attr.no_rate_limit && attr.rate_limit_per_second > 0 {
        limiters.push(Arc::new(RateLimiter::new(
            attr.rate_limit_per_second,
            1024 * 1024,
        )));
    }

    let stream = throttle_stream(
        response.bytes_stream().map(|item| item.map_err(ProxyError::Http)),
        limiters,
    );

    (status, headers, Body::from_stream(stream)).into_response()
}
