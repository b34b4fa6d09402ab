//! Signed bearer tokens.
//!
//! A token is `base64url(signature) "." base64url(payload)` where the
//! payload is the canonical JSON claim set below. Decoding verifies the
//! signature before touching the JSON, so an unverified payload is never
//! parsed.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::errcode::{self, Code, Errors};
use crate::error::{ProxyError, Result};

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Effective authorization attributes carried by a token and produced by
/// the policy resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub registry_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub token_id: i64,

    #[serde(default, skip_serializing_if = "is_false")]
    pub no_rate_limit: bool,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub rate_limit_per_second: u64,

    #[serde(default, skip_serializing_if = "is_false")]
    pub no_allowlist: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_block: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_tags_list: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cache_first: bool,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub weight: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub no_blobs_agent: bool,
    #[serde(rename = "blobs_url", default, skip_serializing_if = "String::is_empty")]
    pub blobs_agent_url: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub always_redirect: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub block: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub block_message: String,
}

/// The signed claim set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default)]
    pub attribute: Attribute,
}

pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn sign(&self, data: &[u8]) -> String {
        let sig = self.key.sign(data);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(sig.to_bytes()),
            URL_SAFE_NO_PAD.encode(data)
        )
    }
}

pub struct Verifier {
    key: VerifyingKey,
}

impl Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    pub fn verify(&self, code: &str) -> Result<Vec<u8>> {
        let (sig_part, payload_part) = code
            .split_once('.')
            .ok_or_else(|| ProxyError::Token("malformed token".to_string()))?;

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|_| ProxyError::Token("malformed token signature".to_string()))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| ProxyError::Token("malformed token signature".to_string()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(|_| ProxyError::Token("malformed token payload".to_string()))?;

        self.key
            .verify(&payload, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| ProxyError::Token("invalid token signature".to_string()))?;

        Ok(payload)
    }
}

pub struct Encoder {
    signer: Signer,
}

impl Encoder {
    pub fn new(signer: Signer) -> Self {
        Self { signer }
    }

    pub fn encode(&self, token: &Token) -> Result<String> {
        let payload = serde_json::to_vec(token)?;
        Ok(self.signer.sign(&payload))
    }
}

pub struct Decoder {
    verifier: Verifier,
}

impl Decoder {
    pub fn new(verifier: Verifier) -> Self {
        Self { verifier }
    }

    pub fn decode(&self, code: &str) -> Result<Token> {
        let payload = self.verifier.verify(code)?;
        let token: Token = serde_json::from_slice(&payload)
            .map_err(|e| ProxyError::Token(format!("malformed token claims: {}", e)))?;
        Ok(token)
    }
}

/// Validates the `Authorization` header on incoming requests and issues the
/// bearer challenge pointing clients at the token endpoint.
pub struct Authenticator {
    decoder: Decoder,
    token_url: String,
}

impl Authenticator {
    pub fn new(decoder: Decoder, token_url: String) -> Self {
        Self { decoder, token_url }
    }

    pub fn authorization(&self, headers: &HeaderMap) -> Result<Token> {
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProxyError::Token("no authorization provided".to_string()))?;

        let code = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ProxyError::Token("authorization is not bearer".to_string()))?;

        let token = self.decoder.decode(code)?;

        match token.expires_at {
            Some(expires_at) if expires_at > Utc::now() => Ok(token),
            _ => Err(ProxyError::Token("token expired".to_string())),
        }
    }

    /// 401 with the `WWW-Authenticate: Bearer` challenge.
    pub fn challenge(&self, service: &str, scope: &str) -> Response {
        let mut challenge = format!("Bearer realm=\"{}\"", self.token_url);
        if !service.is_empty() {
            challenge.push_str(&format!(",service=\"{}\"", service));
        }
        if !scope.is_empty() {
            challenge.push_str(&format!(",scope=\"{}\"", scope));
        }

        let errors: Errors = Code::Unauthorized.into();
        let mut response = errcode::serve_json(&errors, Some(StatusCode::UNAUTHORIZED));
        if let Ok(value) = challenge.parse() {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}
