use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Registry API prefix every request must carry.
pub const V2_PREFIX: &str = "/v2/";

/// Manifest media types requested from the origin, multi-arch indexes first.
pub const MANIFEST_ACCEPTS: [&str; 4] = [
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// Fallback manifest content type when a cached body carries no mediaType.
pub const DEFAULT_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Upstream rate-limit accounting header, stripped before responses leave
/// the proxy.
pub const RATELIMIT_SOURCE_HEADER: &str = "Docker-Ratelimit-Source";

/// Number of size buckets the blob download scheduler maintains.
pub const BLOB_GROUP_COUNT: usize = 4;

/// Size that maps to group 0; each further group doubles it.
pub const BLOB_GROUP_BASE_SIZE: u64 = 1 << 20;

/// Largest upstream error body the proxy is willing to buffer.
pub const MAX_ERROR_BODY: u64 = 1024 * 1024;

/// Floor for TTLs that gate repeated work (blob/manifest caches).
pub const MIN_CACHE_DURATION: Duration = Duration::from_secs(10);

/// TTL for cached upstream failures against a blob digest.
pub const NEGATIVE_BLOB_TTL: Duration = Duration::from_secs(10);

/// Pacing sleeps shorter than this are skipped.
pub const MIN_PACING_SLEEP: Duration = Duration::from_millis(100);

/// Assumed lifetime of an origin bearer token that does not carry one.
pub const DEFAULT_BEARER_EXPIRY_SECS: u64 = 300;

/// Margin subtracted from origin bearer expiries so a token is never used
/// at the edge of its lifetime.
pub const BEARER_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

fn default_concurrency() -> usize {
    10
}

fn default_blob_cache_secs() -> u64 {
    3600
}

fn default_manifest_cache_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_policy_ttl_secs() -> u64 {
    10
}

/// Origin client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `host -> (user, password)` credentials for origins that need them.
    #[serde(default)]
    pub userpass: HashMap<String, (String, String)>,
    /// Hosts reached over plain HTTP (local mirrors, tests).
    #[serde(default)]
    pub plain_http: HashSet<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            userpass: HashMap::new(),
            plain_http: HashSet::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Blob agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_blob_cache_secs")]
    pub blob_cache_secs: u64,
    /// Blobs larger than this are stored in the big cache, when one is
    /// configured.
    #[serde(default)]
    pub big_cache_size: u64,
    /// Blobs larger than this are redirected instead of streamed.
    #[serde(default)]
    pub no_redirect_size: u64,
    /// Total streamed bandwidth in bytes per second; zero disables the
    /// ceiling.
    #[serde(default)]
    pub no_redirect_max_bytes_per_second: u64,
    #[serde(default)]
    pub force_no_redirect: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            blob_cache_secs: default_blob_cache_secs(),
            big_cache_size: 0,
            no_redirect_size: 0,
            no_redirect_max_bytes_per_second: 0,
            force_no_redirect: false,
        }
    }
}

impl AgentConfig {
    pub fn blob_cache_duration(&self) -> Duration {
        Duration::from_secs(self.blob_cache_secs).max(MIN_CACHE_DURATION)
    }
}

/// Gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host used when the path carries no registry domain and the token
    /// does not name one.
    #[serde(default)]
    pub default_registry: Option<String>,
    /// `request-host -> registry` overrides applied before the default.
    #[serde(default)]
    pub override_default_registry: HashMap<String, String>,
    #[serde(default)]
    pub disable_tags_list: bool,
    #[serde(default = "default_manifest_cache_secs")]
    pub manifest_cache_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_registry: None,
            override_default_registry: HashMap::new(),
            disable_tags_list: false,
            manifest_cache_secs: default_manifest_cache_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn manifest_cache_duration(&self) -> Duration {
        Duration::from_secs(self.manifest_cache_secs).max(MIN_CACHE_DURATION)
    }
}

/// Policy resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Default TTL for registry/token lookups; a registry record may lower
    /// it via `ttl_seconds` but never raise it above its own value.
    #[serde(default = "default_policy_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_policy_ttl_secs(),
        }
    }
}

impl PolicyConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
