//! HTTP client for origin registries.
//!
//! Handles per-host basic credentials and the anonymous bearer dance: on a
//! 401 the `WWW-Authenticate` header names a token endpoint, we fetch a
//! short-lived bearer there (cached until shortly before expiry) and retry
//! the request once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Method, StatusCode};

use crate::config::{
    UpstreamConfig, BEARER_EXPIRY_SAFETY_MARGIN_SECS, DEFAULT_BEARER_EXPIRY_SECS,
};
use crate::error::Result;
use crate::ttl::TtlCache;

#[derive(Debug, Default, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parse `Bearer realm="…",service="…",scope="…"`.
fn parse_bearer_challenge(www_auth: &str) -> Option<BearerChallenge> {
    let rest = www_auth.strip_prefix("Bearer ").unwrap_or(www_auth);
    let mut challenge = BearerChallenge::default();
    for part in rest.split(',') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => challenge.realm = value,
            "service" => challenge.service = Some(value),
            "scope" => challenge.scope = Some(value),
            _ => {}
        }
    }
    if challenge.realm.is_empty() {
        None
    } else {
        Some(challenge)
    }
}

fn token_url(challenge: &BearerChallenge, repository: &str) -> String {
    let mut url = challenge.realm.clone();
    let mut sep = if url.contains('?') { '&' } else { '?' };
    if let Some(service) = &challenge.service {
        url.push(sep);
        url.push_str("service=");
        url.push_str(service);
        sep = '&';
    }
    let scope = challenge
        .scope
        .clone()
        .unwrap_or_else(|| format!("repository:{}:pull", repository));
    url.push(sep);
    url.push_str("scope=");
    url.push_str(&scope);
    url
}

pub struct UpstreamClient {
    client: reqwest::Client,
    userpass: HashMap<String, (String, String)>,
    plain_http: HashSet<String>,
    bearer_cache: Arc<TtlCache<String, String>>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            userpass: config.userpass.clone(),
            plain_http: config.plain_http.clone(),
            bearer_cache: Arc::new(TtlCache::new()),
        })
    }

    pub fn scheme_for(&self, host: &str) -> &'static str {
        if self.plain_http.contains(host) {
            "http"
        } else {
            "https"
        }
    }

    pub fn url_for(&self, host: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme_for(host), host, path)
    }

    fn build(
        &self,
        method: &Method,
        host: &str,
        path: &str,
        accept: Option<&str>,
        bearer: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method.clone(), self.url_for(host, path));
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }
        if let Some(bearer) = bearer {
            request = request.bearer_auth(bearer);
        } else if let Some((user, pass)) = self.userpass.get(host) {
            request = request.basic_auth(user, Some(pass.clone()));
        }
        request
    }

    /// Issue a request against an origin, transparently handling a bearer
    /// challenge once.
    pub async fn request(
        &self,
        method: Method,
        host: &str,
        path: &str,
        accept: Option<&str>,
        repository: &str,
    ) -> Result<reqwest::Response> {
        let response = self.build(&method, host, path, accept, None).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(www_auth) = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        else {
            return Ok(response);
        };

        let Some(bearer) = self.fetch_bearer(&www_auth, repository).await else {
            return Ok(response);
        };

        let retried = self
            .build(&method, host, path, accept, Some(&bearer))
            .send()
            .await?;
        Ok(retried)
    }

    async fn fetch_bearer(&self, www_auth: &str, repository: &str) -> Option<String> {
        let challenge = parse_bearer_challenge(www_auth)?;
        let url = token_url(&challenge, repository);

        if let Some(cached) = self.bearer_cache.get(&url) {
            return Some(cached);
        }

        let response = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(url = %url, status = %response.status(), "bearer fetch refused");
                return None;
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "bearer fetch failed");
                return None;
            }
        };

        let body: serde_json::Value = response.json().await.ok()?;
        // Docker Hub answers "token"; some registries use "access_token".
        let bearer = body
            .get("token")
            .and_then(|t| t.as_str())
            .or_else(|| body.get("access_token").and_then(|t| t.as_str()))?
            .to_string();

        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_BEARER_EXPIRY_SECS);
        let ttl = Duration::from_secs(
            expires_in.saturating_sub(BEARER_EXPIRY_SAFETY_MARGIN_SECS).max(1),
        );
        self.bearer_cache.set_with_ttl(url, bearer.clone(), ttl);

        Some(bearer)
    }
}
