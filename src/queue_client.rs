//! Client contract for the external persistent work queue.
//!
//! A fleet of agents uses the queue to serve each blob at most once
//! globally: `create` is idempotent on content, and `watch` streams message
//! updates until a terminal status or a server-side timeout closes it.

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    /// Terminal; the message is treated as missing.
    Cleanup,
}

impl MessageStatus {
    pub fn as_u64(&self) -> u64 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Processing => 10,
            MessageStatus::Completed => 20,
            MessageStatus::Failed => 30,
            MessageStatus::Cleanup => 90,
        }
    }

    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(MessageStatus::Pending),
            10 => Some(MessageStatus::Processing),
            20 => Some(MessageStatus::Completed),
            30 => Some(MessageStatus::Failed),
            90 => Some(MessageStatus::Cleanup),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending | MessageStatus::Processing)
    }
}

impl Serialize for MessageStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_u64())
    }
}

impl<'de> Deserialize<'de> for MessageStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        MessageStatus::from_u64(value)
            .ok_or_else(|| D::Error::custom(format!("unknown message status {}", value)))
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageAttr {
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub progress: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i64,
}

pub const KIND_BLOB: &str = "blob";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message_id: i64,
    pub status: MessageStatus,
    #[serde(default)]
    pub data: MessageAttr,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Create or join a message keyed by `content`.
    async fn create(
        &self,
        content: &str,
        priority: i64,
        attr: MessageAttr,
    ) -> Result<MessageResponse>;

    /// Stream updates for a message. The channel closes on terminal status
    /// or when the server times the watch out.
    async fn watch(&self, message_id: i64) -> Result<mpsc::Receiver<MessageResponse>>;
}

/// HTTP implementation speaking newline-delimited JSON on the watch stream.
pub struct HttpQueueClient {
    base: Url,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    content: &'a str,
    priority: i64,
    data: &'a MessageAttr,
}

impl HttpQueueClient {
    pub fn new(base: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| ProxyError::Queue(format!("bad queue url: {}", e)))
    }
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    async fn create(
        &self,
        content: &str,
        priority: i64,
        attr: MessageAttr,
    ) -> Result<MessageResponse> {
        let url = self.endpoint("messages")?;
        let response = self
            .client
            .post(url)
            .json(&CreateRequest {
                content,
                priority,
                data: &attr,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProxyError::Queue(format!(
                "create message failed: {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    async fn watch(&self, message_id: i64) -> Result<mpsc::Receiver<MessageResponse>> {
        let url = self.endpoint(&format!("messages/{}/watch", message_id))?;
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(ProxyError::Queue(format!(
                "watch message failed: {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut stream = Box::pin(response.bytes_stream());
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<MessageResponse>(line) {
                        Ok(update) => {
                            let terminal = update.status.is_terminal();
                            if tx.send(update).await.is_err() {
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(message_id, error = %e, "bad watch update");
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_values() {
        for (status, value) in [
            (MessageStatus::Pending, 0),
            (MessageStatus::Processing, 10),
            (MessageStatus::Completed, 20),
            (MessageStatus::Failed, 30),
            (MessageStatus::Cleanup, 90),
        ] {
            assert_eq!(status.as_u64(), value);
            assert_eq!(MessageStatus::from_u64(value), Some(status));
        }
        assert_eq!(MessageStatus::from_u64(55), None);
    }

    #[test]
    fn message_round_trip() {
        let response = MessageResponse {
            message_id: 42,
            status: MessageStatus::Processing,
            data: MessageAttr {
                kind: KIND_BLOB.to_string(),
                host: "docker.io".to_string(),
                image: "library/busybox".to_string(),
                size: 1024,
                ..MessageAttr::default()
            },
        };
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains("\"status\":10"));
        let decoded: MessageResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
        assert!(MessageStatus::Completed.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(MessageStatus::Cleanup.is_terminal());
    }
}
