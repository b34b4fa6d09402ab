//! Content-addressed cache facade over a [`StorageDriver`].
//!
//! Blob bodies live at the shared registry layout paths of
//! [`crate::pathinfo`]; link files are plain `sha256:<hex>` strings.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;

use crate::error::{ProxyError, Result};
use crate::pathinfo::{blob_data_path, parse_sha256};
use crate::storage::{FileInfo, StorageDriver, UrlOptions};

#[derive(Clone)]
pub struct Cache {
    driver: Arc<dyn StorageDriver>,
    link_expires: Option<Duration>,
}

impl Cache {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            driver,
            link_expires: None,
        }
    }

    pub fn with_link_expires(mut self, expires: Duration) -> Self {
        self.link_expires = Some(expires);
        self
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    fn blob_path(digest: &str) -> Result<String> {
        let hx = parse_sha256(digest)
            .ok_or_else(|| ProxyError::Cache(format!("invalid blob digest {:?}", digest)))?;
        Ok(blob_data_path(hx))
    }

    /// Stream a blob body into the store, verifying the content hash against
    /// the digest key and, when known, the byte count against
    /// `expected_size`. Nothing becomes visible on failure.
    pub async fn put_blob<S>(
        &self,
        digest: &str,
        mut stream: S,
        expected_size: Option<u64>,
    ) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Unpin + Send,
    {
        let hx = parse_sha256(digest)
            .ok_or_else(|| ProxyError::Cache(format!("invalid blob digest {:?}", digest)))?;
        let path = blob_data_path(hx);

        let mut writer = self.driver.writer(&path, false).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    writer.cancel().await?;
                    return Err(e);
                }
            };
            hasher.update(&chunk);
            written += chunk.len() as u64;
            if let Err(e) = writer.write_chunk(&chunk).await {
                writer.cancel().await?;
                return Err(e);
            }
        }

        if let Some(expected) = expected_size {
            if written != expected {
                writer.cancel().await?;
                return Err(ProxyError::Cache(format!(
                    "expected {} bytes for {}, got {}",
                    expected, digest, written
                )));
            }
        }

        let got = hex::encode(hasher.finalize());
        if got != hx {
            writer.cancel().await?;
            return Err(ProxyError::Cache(format!(
                "expected hash {}, got {}",
                hx, got
            )));
        }

        writer.commit().await
    }

    pub async fn stat_blob(&self, digest: &str) -> Result<FileInfo> {
        self.driver.stat(&Self::blob_path(digest)?).await
    }

    pub async fn blob_reader(
        &self,
        digest: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        self.driver.reader(&Self::blob_path(digest)?, offset).await
    }

    pub async fn delete_blob(&self, digest: &str) -> Result<()> {
        self.driver.delete(&Self::blob_path(digest)?).await
    }

    /// Signed URL granting temporary direct read access to a blob.
    pub async fn redirect_blob(&self, digest: &str, referer: &str) -> Result<String> {
        let opts = UrlOptions {
            method: "GET".to_string(),
            expires_in: self.link_expires,
            referer: if referer.is_empty() {
                None
            } else {
                Some(referer.to_string())
            },
        };
        self.driver.url_for(&Self::blob_path(digest)?, &opts).await
    }

    pub async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        self.driver.get_content(path).await
    }

    pub async fn put_content(&self, path: &str, content: &[u8]) -> Result<()> {
        self.driver.put_content(path, content).await
    }
}
