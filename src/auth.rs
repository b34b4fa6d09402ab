//! Token endpoint: turns credentials + requested scope into a signed
//! bearer token carrying the effective attributes from the policy
//! resolver. This is the realm the gateway's challenge points at.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::Serialize;

use crate::errcode::{self, Code, Errors};
use crate::policy::PolicyResolver;
use crate::token::{Encoder, Token};

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    expires_in: u64,
    issued_at: String,
}

pub struct TokenIssuer {
    encoder: Encoder,
    resolver: Arc<PolicyResolver>,
    token_ttl: Duration,
}

fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// `repository:{name}:pull` -> `{name}`.
fn repository_from_scope(scope: &str) -> String {
    let Some(rest) = scope.strip_prefix("repository:") else {
        return String::new();
    };
    match rest.rsplit_once(':') {
        Some((name, _actions)) => name.to_string(),
        None => rest.to_string(),
    }
}

fn query_value(query: Option<&str>, name: &str) -> String {
    let Some(query) = query else {
        return String::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

impl TokenIssuer {
    pub fn new(encoder: Encoder, resolver: Arc<PolicyResolver>, token_ttl: Duration) -> Self {
        Self {
            encoder,
            resolver,
            token_ttl,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/auth/token", get(issue_handler))
            .with_state(self)
    }

    pub async fn issue(
        &self,
        query: Option<&str>,
        headers: &HeaderMap,
        remote_ip: &str,
    ) -> Response {
        let scope = query_value(query, "scope");
        let service = query_value(query, "service");
        let userinfo = parse_basic_auth(headers);

        let mut token = Token {
            scope: scope.clone(),
            service,
            ip: remote_ip.to_string(),
            image: repository_from_scope(&scope),
            ..Token::default()
        };
        if let Some((account, _)) = &userinfo {
            token.account = account.clone();
        }

        let attribute = match self.resolver.resolve(userinfo.as_ref(), &token).await {
            Ok(attribute) => attribute,
            Err(e) => {
                tracing::warn!(remote_ip = %remote_ip, error = %e, "token request refused");
                return errcode::serve_json(
                    &Errors(vec![Code::Denied.with_message(e.to_string())]),
                    Some(StatusCode::UNAUTHORIZED),
                );
            }
        };

        token.attribute = attribute;
        let issued_at = Utc::now();
        token.expires_at =
            Some(issued_at + chrono::Duration::seconds(self.token_ttl.as_secs() as i64));

        match self.encoder.encode(&token) {
            Ok(code) => Json(TokenResponse {
                token: code,
                expires_in: self.token_ttl.as_secs(),
                issued_at: issued_at.to_rfc3339(),
            })
            .into_response(),
            Err(e) => {
                tracing::error!(error = %e, "failed to sign token");
                errcode::serve_code(Code::Unknown)
            }
        }
    }
}

async fn issue_handler(State(issuer): State<Arc<TokenIssuer>>, request: Request) -> Response {
    let remote_ip = request
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    issuer
        .issue(request.uri().query(), request.headers(), &remote_ip)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Registry, RegistryAttr, StaticRegistryStore, TokenRecord};
    use crate::token::{Attribute, Decoder, Signer, Verifier};
    use ed25519_dalek::SigningKey;

    fn issuer_with(
        store: StaticRegistryStore,
    ) -> (Arc<TokenIssuer>, Decoder) {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let decoder = Decoder::new(Verifier::new(key.verifying_key()));
        let encoder = Encoder::new(Signer::new(key));
        let resolver = Arc::new(PolicyResolver::new(
            Arc::new(store),
            Duration::from_secs(10),
        ));
        (
            Arc::new(TokenIssuer::new(
                encoder,
                resolver,
                Duration::from_secs(300),
            )),
            decoder,
        )
    }

    fn sample_store() -> StaticRegistryStore {
        StaticRegistryStore {
            registries: vec![Registry {
                registry_id: 1,
                user_id: 2,
                domain: "mirror.example.com".to_string(),
                data: RegistryAttr {
                    source: "docker.io".to_string(),
                    allow_anonymous: true,
                    ..RegistryAttr::default()
                },
            }],
            tokens: vec![TokenRecord {
                token_id: 9,
                user_id: 2,
                account: "alice".to_string(),
                password: "pw".to_string(),
                data: Attribute {
                    weight: 4,
                    ..Attribute::default()
                },
            }],
        }
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(
            repository_from_scope("repository:library/busybox:pull"),
            "library/busybox"
        );
        assert_eq!(
            repository_from_scope("repository:docker.io/library/busybox:pull,push"),
            "docker.io/library/busybox"
        );
        assert_eq!(repository_from_scope("bogus"), "");
    }

    #[tokio::test]
    async fn anonymous_token_issued() {
        let (issuer, decoder) = issuer_with(sample_store());

        let response = issuer
            .issue(
                Some("scope=repository:library/busybox:pull&service=mirror.example.com"),
                &HeaderMap::new(),
                "9.9.9.9",
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = decoder.decode(parsed["token"].as_str().unwrap()).unwrap();
        assert_eq!(token.attribute.host, "docker.io");
        assert_eq!(token.attribute.image, "library/busybox");
        assert!(token.expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn basic_auth_token_carries_record_attrs() {
        let (issuer, decoder) = issuer_with(sample_store());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("alice:pw")).parse().unwrap(),
        );
        let response = issuer
            .issue(
                Some("scope=repository:library/busybox:pull&service=mirror.example.com"),
                &headers,
                "9.9.9.9",
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = decoder.decode(parsed["token"].as_str().unwrap()).unwrap();
        assert_eq!(token.attribute.token_id, 9);
        assert_eq!(token.attribute.weight, 4);
        assert_eq!(token.account, "alice");
    }

    #[tokio::test]
    async fn bad_credentials_refused() {
        let (issuer, _) = issuer_with(sample_store());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("alice:wrong"))
                .parse()
                .unwrap(),
        );
        let response = issuer
            .issue(Some("service=mirror.example.com"), &headers, "9.9.9.9")
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn anonymous_refused_when_disallowed() {
        let mut store = sample_store();
        store.registries[0].data.allow_anonymous = false;
        let (issuer, _) = issuer_with(store);

        let response = issuer
            .issue(Some("service=mirror.example.com"), &HeaderMap::new(), "9.9.9.9")
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
