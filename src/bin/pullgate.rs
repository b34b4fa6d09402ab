use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use ed25519_dalek::{SigningKey, VerifyingKey};
use tokio_util::sync::CancellationToken;
use url::Url;

use pullgate::agent::{Agent, AgentOptions};
use pullgate::auth::TokenIssuer;
use pullgate::cache::Cache;
use pullgate::config::{AgentConfig, GatewayConfig, PolicyConfig, UpstreamConfig};
use pullgate::gateway::{Gateway, GatewayOptions};
use pullgate::manifest::ManifestCache;
use pullgate::policy::{PolicyResolver, StaticRegistryStore};
use pullgate::queue_client::HttpQueueClient;
use pullgate::storage::FsDriver;
use pullgate::token::{Authenticator, Decoder, Encoder, Signer, Verifier};
use pullgate::upstream::UpstreamClient;

/// Caching reverse proxy for OCI/Docker registry pull traffic.
#[derive(Parser, Debug)]
#[command(name = "pullgate", version)]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:18001")]
    address: String,

    /// Root directory of the content-addressed store.
    #[arg(long)]
    storage_root: PathBuf,

    /// Base URL blob redirects are issued under.
    #[arg(long)]
    redirect_base: Option<Url>,

    /// Lifetime of signed redirect links, in seconds (0 = no expiry).
    #[arg(long, default_value_t = 0)]
    link_expires: u64,

    /// Origin credentials as user:pass@host; repeatable.
    #[arg(long = "user", short = 'u')]
    userpass: Vec<String>,

    /// Origin hosts reached over plain HTTP; repeatable.
    #[arg(long)]
    plain_http: Vec<String>,

    /// Origin request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    upstream_timeout: u64,

    /// Registry used when neither the path nor the token names one.
    #[arg(long)]
    default_registry: Option<String>,

    /// Per-request-host default registry as host=registry; repeatable.
    #[arg(long = "override-default-registry")]
    override_default_registry: Vec<String>,

    /// Serve the empty tags list unless a token allows listing.
    #[arg(long)]
    disable_tags_list: bool,

    /// Tag manifest freshness window, in seconds.
    #[arg(long, default_value_t = 60)]
    manifest_cache_duration: u64,

    /// Blob scheduler worker count.
    #[arg(long, default_value_t = 10)]
    concurrency: usize,

    /// In-memory blob entry lifetime, in seconds.
    #[arg(long, default_value_t = 3600)]
    blob_cache_duration: u64,

    /// Root directory of the big-blob store.
    #[arg(long)]
    big_cache_root: Option<PathBuf>,

    /// Blobs larger than this many bytes go to the big-blob store.
    #[arg(long, default_value_t = 0)]
    big_cache_size: u64,

    /// Blobs larger than this many bytes redirect instead of streaming.
    #[arg(long, default_value_t = 0)]
    no_redirect_size: u64,

    /// Total streamed bandwidth ceiling in bytes per second (0 = off).
    #[arg(long, default_value_t = 0)]
    no_redirect_max_bps: u64,

    /// Never redirect; always stream blobs.
    #[arg(long)]
    force_no_redirect: bool,

    /// Public key verifying client bearer tokens; enables authentication.
    #[arg(long)]
    token_public_key_file: Option<PathBuf>,

    /// Private key signing issued tokens and redirect URLs.
    #[arg(long)]
    token_private_key_file: Option<PathBuf>,

    /// Realm URL named in the authentication challenge.
    #[arg(long)]
    token_url: Option<String>,

    /// JSON file of registry and token records backing the policy
    /// resolver; enables the local token endpoint.
    #[arg(long)]
    registry_config: Option<PathBuf>,

    /// Policy lookup cache TTL in seconds.
    #[arg(long, default_value_t = 10)]
    policy_cache_ttl: u64,

    /// Issued token lifetime in seconds.
    #[arg(long, default_value_t = 300)]
    token_duration: u64,

    /// Base URL of the shared work queue coordinating a fleet of agents.
    #[arg(long)]
    queue_url: Option<Url>,
}

fn decode_key_bytes(path: &Path) -> Result<[u8; 32]> {
    let contents = std::fs::read(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;

    let decoded = if contents.len() == 32 {
        contents
    } else {
        let text = std::str::from_utf8(&contents)
            .context("key file is neither 32 raw bytes nor text")?;
        let text = text.trim();
        let text = text.strip_prefix("ed25519:").unwrap_or(text);
        STANDARD
            .decode(text)
            .context("failed to decode base64 key")?
    };

    decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected a 32-byte key in {}", path.display()))
}

fn load_signing_key(path: &Path) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&decode_key_bytes(path)?))
}

fn load_verifying_key(path: &Path) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(&decode_key_bytes(path)?)
        .with_context(|| format!("invalid public key in {}", path.display()))
}

fn parse_userpass(entries: &[String]) -> Result<HashMap<String, (String, String)>> {
    let mut out = HashMap::new();
    for entry in entries {
        let Some((creds, host)) = entry.rsplit_once('@') else {
            bail!("bad --user value {:?}, expected user:pass@host", entry);
        };
        let Some((user, pass)) = creds.split_once(':') else {
            bail!("bad --user value {:?}, expected user:pass@host", entry);
        };
        out.insert(host.to_string(), (user.to_string(), pass.to_string()));
    }
    Ok(out)
}

fn parse_overrides(entries: &[String]) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for entry in entries {
        let Some((host, registry)) = entry.split_once('=') else {
            bail!(
                "bad --override-default-registry value {:?}, expected host=registry",
                entry
            );
        };
        out.insert(host.to_string(), registry.to_string());
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pullgate=info,info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let signing_key = cli
        .token_private_key_file
        .as_deref()
        .map(load_signing_key)
        .transpose()?;

    let mut driver = FsDriver::new(cli.storage_root.clone())
        .map_err(|e| anyhow::anyhow!("failed to open storage root: {}", e))?;
    if let Some(base) = cli.redirect_base.clone() {
        driver = driver.with_redirect_base(base);
    }
    if let Some(key) = &signing_key {
        driver = driver.with_signing_key(key.clone());
    }
    let mut cache = Cache::new(Arc::new(driver));
    if cli.link_expires > 0 {
        cache = cache.with_link_expires(Duration::from_secs(cli.link_expires));
    }

    let big_cache = cli
        .big_cache_root
        .clone()
        .map(|root| -> Result<Cache> {
            let mut driver = FsDriver::new(root)
                .map_err(|e| anyhow::anyhow!("failed to open big cache root: {}", e))?;
            if let Some(base) = cli.redirect_base.clone() {
                driver = driver.with_redirect_base(base);
            }
            if let Some(key) = &signing_key {
                driver = driver.with_signing_key(key.clone());
            }
            let mut cache = Cache::new(Arc::new(driver));
            if cli.link_expires > 0 {
                cache = cache.with_link_expires(Duration::from_secs(cli.link_expires));
            }
            Ok(cache)
        })
        .transpose()?;

    let upstream = Arc::new(
        UpstreamClient::new(&UpstreamConfig {
            userpass: parse_userpass(&cli.userpass)?,
            plain_http: cli.plain_http.iter().cloned().collect(),
            timeout_secs: cli.upstream_timeout,
        })
        .map_err(|e| anyhow::anyhow!("failed to build upstream client: {}", e))?,
    );

    let queue_client = cli
        .queue_url
        .clone()
        .map(|url| -> Result<Arc<dyn pullgate::queue_client::QueueClient>> {
            Ok(Arc::new(
                HttpQueueClient::new(url)
                    .map_err(|e| anyhow::anyhow!("failed to build queue client: {}", e))?,
            ))
        })
        .transpose()?;

    let agent = Arc::new(Agent::new(
        Arc::clone(&upstream),
        cache.clone(),
        AgentOptions {
            config: AgentConfig {
                concurrency: cli.concurrency,
                blob_cache_secs: cli.blob_cache_duration,
                big_cache_size: cli.big_cache_size,
                no_redirect_size: cli.no_redirect_size,
                no_redirect_max_bytes_per_second: cli.no_redirect_max_bps,
                force_no_redirect: cli.force_no_redirect,
            },
            big_cache,
            queue_client,
        },
    ));

    let gateway_config = GatewayConfig {
        default_registry: cli.default_registry.clone(),
        override_default_registry: parse_overrides(&cli.override_default_registry)?,
        disable_tags_list: cli.disable_tags_list,
        manifest_cache_secs: cli.manifest_cache_duration,
    };
    let manifests = Arc::new(ManifestCache::new(
        cache.clone(),
        Arc::clone(&upstream),
        gateway_config.manifest_cache_duration(),
    ));
    manifests.start_sweeper(cancel.clone());

    let authenticator = match (&cli.token_public_key_file, &signing_key) {
        (Some(path), _) => Some(load_verifying_key(path)?),
        (None, Some(key)) => Some(key.verifying_key()),
        (None, None) => None,
    }
    .map(|key| {
        Arc::new(Authenticator::new(
            Decoder::new(Verifier::new(key)),
            cli.token_url.clone().unwrap_or_default(),
        ))
    });

    let gateway = Gateway::new(
        Arc::clone(&upstream),
        GatewayOptions {
            config: gateway_config,
            authenticator,
            agent: Some(agent),
            manifests: Some(manifests),
            modify: None,
        },
    );

    let mut router = gateway.router();

    if let Some(path) = &cli.registry_config {
        let Some(key) = signing_key else {
            bail!("--registry-config requires --token-private-key-file");
        };
        let records = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let store = StaticRegistryStore::from_json(&records)
            .map_err(|e| anyhow::anyhow!("bad registry config: {}", e))?;
        let resolver = Arc::new(PolicyResolver::new(
            Arc::new(store),
            PolicyConfig {
                cache_ttl_secs: cli.policy_cache_ttl,
            }
            .cache_ttl(),
        ));
        resolver.start_sweepers(cancel.clone());
        let issuer = Arc::new(TokenIssuer::new(
            Encoder::new(Signer::new(key)),
            resolver,
            Duration::from_secs(cli.token_duration),
        ));
        router = router.merge(issuer.router());
    }

    let listener = tokio::net::TcpListener::bind(&cli.address)
        .await
        .with_context(|| format!("failed to bind {}", cli.address))?;
    tracing::info!(address = %cli.address, "pullgate listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
    .context("server error")?;

    cancel.cancel();
    Ok(())
}
