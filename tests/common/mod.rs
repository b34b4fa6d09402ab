//! Shared harness: a scripted origin registry and a proxy instance wired
//! against it, both on ephemeral ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use url::Url;

use pullgate::agent::{Agent, AgentOptions};
use pullgate::cache::Cache;
use pullgate::config::{AgentConfig, GatewayConfig, UpstreamConfig};
use pullgate::gateway::{Gateway, GatewayOptions};
use pullgate::manifest::ManifestCache;
use pullgate::queue_client::QueueClient;
use pullgate::storage::FsDriver;
use pullgate::token::{Authenticator, Decoder, Verifier};
use pullgate::upstream::UpstreamClient;

#[derive(Clone, Default)]
pub struct ScriptedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay_ms: u64,
}

impl ScriptedResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            status: 200,
            body: body.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

#[derive(Clone, Default)]
struct OriginState {
    responses: Arc<Mutex<HashMap<String, ScriptedResponse>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

pub struct Origin {
    pub host: String,
    state: OriginState,
}

async fn origin_handler(State(state): State<OriginState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let key = format!("{} {}", request.method(), path);
    *state.hits.lock().unwrap().entry(key).or_insert(0) += 1;

    let scripted = state.responses.lock().unwrap().get(&path).cloned();
    let Some(scripted) = scripted else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if scripted.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(scripted.delay_ms)).await;
    }

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(scripted.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    if let Some(content_type) = &scripted.content_type {
        builder = builder.header("Content-Type", content_type);
    }
    for (name, value) in &scripted.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Body::from(scripted.body)).unwrap()
}

impl Origin {
    pub async fn start() -> Origin {
        let state = OriginState::default();
        let app = Router::new()
            .fallback(origin_handler)
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Origin {
            host: format!("127.0.0.1:{}", addr.port()),
            state,
        }
    }

    pub fn set(&self, path: &str, response: ScriptedResponse) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    /// Hit count for `"GET /v2/..."`-style keys.
    pub fn hits(&self, method_and_path: &str) -> usize {
        *self
            .state
            .hits
            .lock()
            .unwrap()
            .get(method_and_path)
            .unwrap_or(&0)
    }
}

pub struct Proxy {
    pub base: String,
    pub storage: tempfile::TempDir,
}

impl Proxy {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn storage_file(&self, key: &str) -> std::path::PathBuf {
        self.storage.path().join(key.trim_start_matches('/'))
    }
}

pub struct ProxyBuilder {
    origin_host: String,
    agent_config: AgentConfig,
    gateway_config: GatewayConfig,
    redirect_base: Option<Url>,
    auth_key: Option<SigningKey>,
    token_url: String,
    queue_client: Option<Arc<dyn QueueClient>>,
    prepared_storage: Option<tempfile::TempDir>,
}

impl ProxyBuilder {
    pub fn against(origin_host: &str) -> Self {
        Self {
            origin_host: origin_host.to_string(),
            agent_config: AgentConfig::default(),
            gateway_config: GatewayConfig::default(),
            redirect_base: None,
            auth_key: None,
            token_url: "http://auth.test/token".to_string(),
            queue_client: None,
            prepared_storage: None,
        }
    }

    pub fn agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = config;
        self
    }

    pub fn gateway_config(mut self, config: GatewayConfig) -> Self {
        self.gateway_config = config;
        self
    }

    pub fn redirect_base(mut self, base: &str) -> Self {
        self.redirect_base = Some(Url::parse(base).unwrap());
        self
    }

    /// Require bearer tokens verified against this key.
    pub fn auth_key(mut self, key: SigningKey) -> Self {
        self.auth_key = Some(key);
        self
    }

    pub fn queue_client(mut self, client: Arc<dyn QueueClient>) -> Self {
        self.queue_client = Some(client);
        self
    }

    /// Reuse storage from a previous proxy instance (fresh in-memory
    /// state, warm disk state).
    pub fn storage(mut self, storage: tempfile::TempDir) -> Self {
        self.prepared_storage = Some(storage);
        self
    }

    pub async fn start(self) -> Proxy {
        let storage = self
            .prepared_storage
            .unwrap_or_else(|| tempfile::tempdir().unwrap());

        let mut driver = FsDriver::new(storage.path().to_path_buf()).unwrap();
        if let Some(base) = &self.redirect_base {
            driver = driver.with_redirect_base(base.clone());
            driver = driver.with_signing_key(SigningKey::generate(&mut rand::rngs::OsRng));
        }
        let cache = Cache::new(Arc::new(driver)).with_link_expires(Duration::from_secs(60));

        let mut upstream_config = UpstreamConfig::default();
        upstream_config.plain_http.insert(self.origin_host.clone());
        let upstream = Arc::new(UpstreamClient::new(&upstream_config).unwrap());

        let agent = Arc::new(Agent::new(
            Arc::clone(&upstream),
            cache.clone(),
            AgentOptions {
                config: self.agent_config,
                big_cache: None,
                queue_client: self.queue_client,
            },
        ));

        let manifests = Arc::new(ManifestCache::new(
            cache.clone(),
            Arc::clone(&upstream),
            self.gateway_config.manifest_cache_duration(),
        ));

        let authenticator = self.auth_key.map(|key| {
            Arc::new(Authenticator::new(
                Decoder::new(Verifier::new(key.verifying_key())),
                self.token_url.clone(),
            ))
        });

        let gateway = Gateway::new(
            upstream,
            GatewayOptions {
                config: self.gateway_config,
                authenticator,
                agent: Some(agent),
                manifests: Some(manifests),
                modify: None,
            },
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = gateway.router();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Proxy {
            base: format!("http://127.0.0.1:{}", addr.port()),
            storage,
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn blob_storage_key(hx: &str) -> String {
    format!("/docker/registry/v2/blobs/sha256/{}/{}/data", &hx[..2], hx)
}

pub fn tag_link_key(host: &str, image: &str, tag: &str) -> String {
    format!(
        "/docker/registry/v2/repositories/{}/{}/_manifests/tags/{}/current/link",
        host, image, tag
    )
}

pub fn revision_link_key(host: &str, image: &str, hx: &str) -> String {
    format!(
        "/docker/registry/v2/repositories/{}/{}/_manifests/revisions/sha256/{}/link",
        host, image, hx
    )
}
