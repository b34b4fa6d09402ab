//! Per-registry policy: anonymous rules, special-IP bundles, token-record
//! lookup, image allowlists.
//!
//! The resolver never mutates the signed token; it derives an effective
//! [`Attribute`] from the registry record, the caller's credentials, and
//! the requested image. Lookups go through short-lived TTL caches, and
//! lookup failures are cached too so bad credentials do not hammer the
//! backing store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::hostmatch::HostMatcher;
use crate::token::{Attribute, Token};
use crate::ttl::TtlCache;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAttr {
    /// Upstream source registry for repositories that do not name one.
    #[serde(default)]
    pub source: String,
    /// Whether a `host.domain/...` prefix in the repository may select the
    /// upstream host.
    #[serde(default)]
    pub allow_prefix: bool,
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub anonymous: Attribute,
    /// Attribute bundles keyed by caller IP, taking precedence over the
    /// anonymous rules.
    #[serde(default)]
    pub special_ips: HashMap<String, Attribute>,
    #[serde(default)]
    pub enable_allowlist: bool,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub allowlist_block_message: String,
    /// Lookup cache TTL override; the effective TTL never exceeds the
    /// resolver default.
    #[serde(default)]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    pub registry_id: i64,
    pub user_id: i64,
    /// Service domain this registry record answers for.
    pub domain: String,
    #[serde(default)]
    pub data: RegistryAttr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: i64,
    pub user_id: i64,
    pub account: String,
    pub password: String,
    #[serde(default)]
    pub data: Attribute,
}

/// Lookup contract against the persistent user/token/registry records.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn registry_by_domain(&self, domain: &str) -> Result<Registry>;
    async fn token_by_account(
        &self,
        user_id: i64,
        account: &str,
        password: &str,
    ) -> Result<TokenRecord>;
}

#[derive(Clone)]
struct CachedRegistry {
    registry: Registry,
    matcher: Option<HostMatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UserKey {
    user_id: i64,
    account: String,
    password: String,
}

/// Either the record or the error message the lookup produced; both are
/// cached.
type CachedLookup<T> = std::result::Result<T, String>;

pub struct PolicyResolver {
    store: Arc<dyn RegistryStore>,
    default_ttl: Duration,
    registry_cache: Arc<TtlCache<String, CachedLookup<CachedRegistry>>>,
    token_cache: Arc<TtlCache<UserKey, CachedLookup<TokenRecord>>>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn RegistryStore>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            registry_cache: Arc::new(TtlCache::new()),
            token_cache: Arc::new(TtlCache::new()),
        }
    }

    pub fn start_sweepers(&self, cancel: tokio_util::sync::CancellationToken) {
        self.registry_cache
            .start_sweeper(self.default_ttl, cancel.clone());
        self.token_cache.start_sweeper(self.default_ttl, cancel);
    }

    fn entry_ttl(&self, registry: &Registry) -> Duration {
        if registry.data.ttl_seconds > 0 {
            self.default_ttl
                .min(Duration::from_secs(registry.data.ttl_seconds))
        } else {
            self.default_ttl
        }
    }

    async fn get_registry(&self, service: &str) -> Result<CachedRegistry> {
        if let Some(cached) = self.registry_cache.get(&service.to_string()) {
            return cached.map_err(ProxyError::Token);
        }

        match self.store.registry_by_domain(service).await {
            Ok(registry) => {
                let matcher = if registry.data.enable_allowlist {
                    Some(HostMatcher::new(&registry.data.allowlist))
                } else {
                    None
                };
                let cached = CachedRegistry { registry, matcher };
                let ttl = self.entry_ttl(&cached.registry);
                self.registry_cache
                    .set_with_ttl(service.to_string(), Ok(cached.clone()), ttl);
                Ok(cached)
            }
            Err(e) => {
                let message = e.to_string();
                self.registry_cache.set_with_ttl(
                    service.to_string(),
                    Err(message.clone()),
                    self.default_ttl,
                );
                Err(ProxyError::Token(message))
            }
        }
    }

    async fn get_token_record(
        &self,
        userinfo: Option<&(String, String)>,
        token: &Token,
        registry: &CachedRegistry,
    ) -> Result<TokenRecord> {
        let Some((account, password)) = userinfo else {
            if let Some(attrs) = registry.registry.data.special_ips.get(&token.ip) {
                return Ok(TokenRecord {
                    user_id: registry.registry.user_id,
                    data: attrs.clone(),
                    ..TokenRecord::default()
                });
            }

            if !registry.registry.data.allow_anonymous {
                return Err(ProxyError::Token(
                    "anonymous access is not allowed".to_string(),
                ));
            }

            return Ok(TokenRecord {
                user_id: registry.registry.user_id,
                data: registry.registry.data.anonymous.clone(),
                ..TokenRecord::default()
            });
        };

        let key = UserKey {
            user_id: registry.registry.user_id,
            account: account.clone(),
            password: password.clone(),
        };

        if let Some(cached) = self.token_cache.get(&key) {
            return cached.map_err(ProxyError::Token);
        }

        match self
            .store
            .token_by_account(key.user_id, account, password)
            .await
        {
            Ok(record) => {
                let ttl = self.entry_ttl(&registry.registry);
                self.token_cache.set_with_ttl(key, Ok(record.clone()), ttl);
                Ok(record)
            }
            Err(e) => {
                let message = e.to_string();
                self.token_cache
                    .set_with_ttl(key, Err(message.clone()), self.default_ttl);
                Err(ProxyError::Token(message))
            }
        }
    }

    /// Derive the effective attributes for a request.
    pub async fn resolve(
        &self,
        userinfo: Option<&(String, String)>,
        token: &Token,
    ) -> Result<Attribute> {
        let registry = self.get_registry(&token.service).await?;
        let record = self.get_token_record(userinfo, token, &registry).await?;

        let mut attr = Attribute {
            user_id: record.user_id,
            token_id: record.token_id,
            registry_id: registry.registry.registry_id,
            ..record.data.clone()
        };

        if !attr.block {
            if !token.image.is_empty() {
                match split_host_image(
                    &token.image,
                    registry.registry.data.allow_prefix,
                    &registry.registry.data.source,
                ) {
                    Ok((host, image)) => {
                        attr.host = host;
                        attr.image = image;
                    }
                    Err(message) => {
                        attr.block = true;
                        attr.block_message = message;
                    }
                }
            }

            if !attr.block
                && !attr.no_allowlist
                && !attr.host.is_empty()
                && !attr.image.is_empty()
            {
                if let Some(matcher) = &registry.matcher {
                    if !matcher.matches(&format!("{}/{}", attr.host, attr.image)) {
                        attr.block = true;
                        attr.block_message =
                            if registry.registry.data.allowlist_block_message.is_empty() {
                                format!("image {}/{} is not allowed", attr.host, attr.image)
                            } else {
                                registry.registry.data.allowlist_block_message.clone()
                            };
                    }
                }
            }
        }

        Ok(attr)
    }
}

fn is_domain_name(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|label| {
            !label.is_empty()
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

/// Split a repository into `(host, image)`: a leading domain segment is the
/// host when the registry allows prefixes; otherwise the registry's
/// configured source fills in; otherwise the repository is invalid.
fn split_host_image(
    repo: &str,
    allow_prefix: bool,
    source: &str,
) -> std::result::Result<(String, String), String> {
    if let Some((first, rest)) = repo.split_once('/') {
        if first.contains('.') && is_domain_name(first) && allow_prefix {
            return Ok((first.to_string(), rest.to_string()));
        }
    }
    if !source.is_empty() {
        return Ok((source.to_string(), repo.to_string()));
    }
    Err(format!(
        "invalid repository: {:?}, source: {:?}",
        repo, source
    ))
}

/// JSON-file-backed store for deployments without a record service; also
/// the store used by tests.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StaticRegistryStore {
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub tokens: Vec<TokenRecord>,
}

impl StaticRegistryStore {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl RegistryStore for StaticRegistryStore {
    async fn registry_by_domain(&self, domain: &str) -> Result<Registry> {
        self.registries
            .iter()
            .find(|r| r.domain == domain)
            .cloned()
            .ok_or_else(|| ProxyError::Token(format!("unknown registry {:?}", domain)))
    }

    async fn token_by_account(
        &self,
        user_id: i64,
        account: &str,
        password: &str,
    ) -> Result<TokenRecord> {
        self.tokens
            .iter()
            .find(|t| t.user_id == user_id && t.account == account && t.password == password)
            .cloned()
            .ok_or_else(|| ProxyError::Token("invalid account or password".to_string()))
    }
}
