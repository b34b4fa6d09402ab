//! Storage driver contract and the filesystem implementation.
//!
//! The proxy only assumes a content-addressed key/value store with
//! streaming reads and writes, stat, delete, and signed-URL generation.
//! Object-store backends implement the same trait out of tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use url::Url;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub mod_time: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    pub method: String,
    pub expires_in: Option<Duration>,
    pub referer: Option<String>,
}

/// A streaming write that only becomes visible on `commit`.
#[async_trait]
pub trait BlobWriter: Send {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<()>;
    /// Publish the write and return the number of bytes written.
    async fn commit(self: Box<Self>) -> Result<u64>;
    async fn cancel(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn get_content(&self, path: &str) -> Result<Vec<u8>>;
    async fn put_content(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn reader(
        &self,
        path: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn BlobWriter>>;
    async fn stat(&self, path: &str) -> Result<FileInfo>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn list(&self, path: &str) -> Result<Vec<String>>;
    async fn walk(&self, path: &str) -> Result<Vec<FileInfo>>;
    async fn url_for(&self, path: &str, opts: &UrlOptions) -> Result<String>;
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed driver. Signed URLs are issued under `redirect_base`
/// with an ed25519 signature over `path|expiry|referer`, to be checked by
/// whatever serves that base.
pub struct FsDriver {
    root: PathBuf,
    redirect_base: Option<Url>,
    signing_key: Option<SigningKey>,
}

impl FsDriver {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| ProxyError::Storage(format!("create storage root: {}", e)))?;
        Ok(Self {
            root,
            redirect_base: None,
            signing_key: None,
        })
    }

    pub fn with_redirect_base(mut self, base: Url) -> Self {
        self.redirect_base = Some(base);
        self
    }

    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn rel_path(&self, full: &Path) -> String {
        match full.strip_prefix(&self.root) {
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => full.to_string_lossy().into_owned(),
        }
    }
}

struct FsWriter {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

#[async_trait]
impl BlobWriter for FsWriter {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        self.file.sync_all().await?;
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.written)
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for FsDriver {
    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.full_path(path)).await?)
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Atomic write: temp file, then rename.
        let temp = full.with_extension(format!("{}.tmp", TEMP_SEQ.fetch_add(1, Ordering::Relaxed)));
        fs::write(&temp, content).await?;
        fs::rename(&temp, &full).await?;
        Ok(())
    }

    async fn reader(
        &self,
        path: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        use tokio::io::AsyncSeekExt;
        let mut file = fs::File::open(self.full_path(path)).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn BlobWriter>> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        if append {
            return Err(ProxyError::Storage(
                "append writes are not supported".to_string(),
            ));
        }
        let temp =
            full.with_extension(format!("{}.tmp", TEMP_SEQ.fetch_add(1, Ordering::Relaxed)));
        let file = fs::File::create(&temp).await?;
        Ok(Box::new(FsWriter {
            file,
            temp_path: temp,
            final_path: full,
            written: 0,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let meta = fs::metadata(self.full_path(path)).await?;
        Ok(FileInfo {
            path: path.to_string(),
            size: meta.len(),
            mod_time: meta.modified().unwrap_or(UNIX_EPOCH),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.full_path(path);
        let mut entries = fs::read_dir(&full).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(self.rel_path(&entry.path()));
        }
        names.sort();
        Ok(names)
    }

    async fn walk(&self, path: &str) -> Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        let mut stack = vec![self.full_path(path)];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    out.push(FileInfo {
                        path: self.rel_path(&entry.path()),
                        size: meta.len(),
                        mod_time: meta.modified().unwrap_or(UNIX_EPOCH),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn url_for(&self, path: &str, opts: &UrlOptions) -> Result<String> {
        let base = self
            .redirect_base
            .as_ref()
            .ok_or_else(|| ProxyError::Storage("no redirect base configured".to_string()))?;

        let mut url = base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ProxyError::Storage(format!("join redirect url: {}", e)))?;

        let expires = opts.expires_in.map(|d| {
            (SystemTime::now() + d)
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

        {
            let mut query = url.query_pairs_mut();
            if let Some(exp) = expires {
                query.append_pair("expires", &exp.to_string());
            }
            if let Some(key) = &self.signing_key {
                let payload = format!(
                    "{}|{}|{}",
                    path,
                    expires.unwrap_or(0),
                    opts.referer.as_deref().unwrap_or("")
                );
                let sig = key.sign(payload.as_bytes());
                query.append_pair("sig", &URL_SAFE_NO_PAD.encode(sig.to_bytes()));
            }
        }

        Ok(url.to_string())
    }
}
