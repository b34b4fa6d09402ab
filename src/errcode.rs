//! The docker/distribution error envelope.
//!
//! Every error surfaced to a registry client is a JSON document of the form
//! `{"errors":[{"code":...,"message":...,"detail":...}]}`. Clients key off
//! the `code` field, so the codes here must match the distribution spec.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Well-known error codes from the distribution spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Unsupported,
    Unauthorized,
    Denied,
    Unknown,
    ManifestUnknown,
    BlobUnknown,
}

impl Code {
    pub fn identifier(&self) -> &'static str {
        match self {
            Code::Unsupported => "UNSUPPORTED",
            Code::Unauthorized => "UNAUTHORIZED",
            Code::Denied => "DENIED",
            Code::Unknown => "UNKNOWN",
            Code::ManifestUnknown => "MANIFEST_UNKNOWN",
            Code::BlobUnknown => "BLOB_UNKNOWN",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            Code::Unsupported => "The operation is unsupported.",
            Code::Unauthorized => "authentication required",
            Code::Denied => "requested access to the resource is denied",
            Code::Unknown => "unknown error",
            Code::ManifestUnknown => "manifest unknown",
            Code::BlobUnknown => "blob unknown to registry",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Code::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            Code::Unauthorized => StatusCode::UNAUTHORIZED,
            Code::Denied => StatusCode::FORBIDDEN,
            Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            Code::ManifestUnknown | Code::BlobUnknown => StatusCode::NOT_FOUND,
        }
    }

    pub fn with_message(self, message: impl Into<String>) -> ErrorEntry {
        ErrorEntry {
            code: self.identifier().to_string(),
            message: message.into(),
            detail: None,
        }
    }
}

impl From<Code> for ErrorEntry {
    fn from(code: Code) -> Self {
        ErrorEntry {
            code: code.identifier().to_string(),
            message: code.default_message().to_string(),
            detail: None,
        }
    }
}

impl From<Code> for Errors {
    fn from(code: Code) -> Self {
        Errors(vec![code.into()])
    }
}

/// One entry of the envelope. Upstream registries send arbitrary codes, so
/// `code` is an open string rather than the [`Code`] enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// The full envelope, as serialized on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Errors(pub Vec<ErrorEntry>);

#[derive(Serialize, Deserialize)]
struct Envelope {
    errors: Vec<ErrorEntry>,
}

impl Errors {
    /// Parse an upstream error body. Returns `None` when the body is not a
    /// valid envelope, so callers can fall back to `UNKNOWN`.
    pub fn parse(body: &[u8]) -> Option<Errors> {
        let envelope: Envelope = serde_json::from_slice(body).ok()?;
        if envelope.errors.is_empty() {
            return None;
        }
        Some(Errors(envelope.errors))
    }

    pub fn to_body(&self) -> Vec<u8> {
        serde_json::to_vec(&Envelope {
            errors: self.0.clone(),
        })
        .unwrap_or_else(|_| b"{\"errors\":[]}".to_vec())
    }

    /// HTTP status for this envelope: the status of the first recognized
    /// code, or 500 for codes we do not know.
    pub fn status(&self) -> StatusCode {
        let first = match self.0.first() {
            Some(entry) => entry,
            None => return StatusCode::INTERNAL_SERVER_ERROR,
        };
        match first.code.as_str() {
            "UNSUPPORTED" => StatusCode::METHOD_NOT_ALLOWED,
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "DENIED" => StatusCode::FORBIDDEN,
            "MANIFEST_UNKNOWN" | "BLOB_UNKNOWN" | "NAME_UNKNOWN" => StatusCode::NOT_FOUND,
            "TOOMANYREQUESTS" => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for entry in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", entry.code, entry.message)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

/// Serve an envelope, optionally overriding the derived status code with the
/// one observed upstream.
pub fn serve_json(errors: &Errors, status_override: Option<StatusCode>) -> Response {
    let status = status_override.unwrap_or_else(|| errors.status());
    let body = errors.to_body();
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Serve a single well-known code with its default message.
pub fn serve_code(code: Code) -> Response {
    serve_json(&code.into(), Some(code.status()))
}

/// Serve `DENIED` with a custom message, falling back to the default when
/// the message is empty.
pub fn serve_denied(message: &str) -> Response {
    if message.is_empty() {
        serve_code(Code::Denied)
    } else {
        serve_json(
            &Errors(vec![Code::Denied.with_message(message)]),
            Some(StatusCode::FORBIDDEN),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let errs: Errors = Code::Denied.into();
        let body = errs.to_body();
        let parsed = Errors::parse(&body).unwrap();
        assert_eq!(parsed.0[0].code, "DENIED");
        assert_eq!(parsed.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn parse_rejects_non_envelope() {
        assert!(Errors::parse(b"not json").is_none());
        assert!(Errors::parse(b"{\"message\":\"x\"}").is_none());
        assert!(Errors::parse(b"{\"errors\":[]}").is_none());
    }

    #[test]
    fn upstream_codes_pass_through() {
        let body = br#"{"errors":[{"code":"TOOMANYREQUESTS","message":"slow down"}]}"#;
        let parsed = Errors::parse(body).unwrap();
        assert_eq!(parsed.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(parsed.0[0].message, "slow down");
    }
}
