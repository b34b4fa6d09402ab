//! In-memory blob state shared by all requests: size and mtime of known
//! blobs, and short-lived negative entries for upstream failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::config::NEGATIVE_BLOB_TTL;
use crate::errcode::Errors;

#[derive(Debug, Clone)]
pub struct BlobError {
    /// Status observed upstream, when one should be echoed to the client.
    pub status: Option<u16>,
    pub errors: Errors,
}

#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub size: u64,
    pub mod_time: SystemTime,
    pub big_cache: bool,
    pub error: Option<BlobError>,
}

struct Slot {
    entry: BlobEntry,
    deadline: Option<Instant>,
}

pub struct BlobCache {
    entries: Arc<Mutex<HashMap<String, Slot>>>,
    ttl: Duration,
}

impl BlobCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn get(&self, digest: &str) -> Option<BlobEntry> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(digest) {
            Some(slot) if slot.deadline.map(|d| d > Instant::now()).unwrap_or(true) => {
                Some(slot.entry.clone())
            }
            Some(_) => {
                entries.remove(digest);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, digest: &str, mod_time: SystemTime, size: u64, big_cache: bool) {
        self.insert(digest, mod_time, size, big_cache, Some(self.ttl));
    }

    /// Entries that never expire; used for the big cache, whose redirect
    /// path re-validates against storage anyway.
    pub fn put_no_ttl(&self, digest: &str, mod_time: SystemTime, size: u64, big_cache: bool) {
        self.insert(digest, mod_time, size, big_cache, None);
    }

    fn insert(
        &self,
        digest: &str,
        mod_time: SystemTime,
        size: u64,
        big_cache: bool,
        ttl: Option<Duration>,
    ) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            digest.to_string(),
            Slot {
                entry: BlobEntry {
                    size,
                    mod_time,
                    big_cache,
                    error: None,
                },
                deadline: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Negative entry shedding repeat fetches for a digest that just
    /// failed. Kept short so transient failures clear quickly.
    pub fn put_error(&self, digest: &str, errors: Errors, status: Option<u16>) {
        let ttl = NEGATIVE_BLOB_TTL.min(self.ttl);
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            digest.to_string(),
            Slot {
                entry: BlobEntry {
                    size: 0,
                    mod_time: SystemTime::UNIX_EPOCH,
                    big_cache: false,
                    error: Some(BlobError { status, errors }),
                },
                deadline: Some(Instant::now() + ttl),
            },
        );
    }

    pub fn remove(&self, digest: &str) {
        self.entries.lock().unwrap().remove(digest);
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, slot| slot.deadline.map(|d| d > now).unwrap_or(true));
    }

    pub fn start_sweeper(&self, cancel: CancellationToken) {
        let entries = Arc::clone(&self.entries);
        let interval = self.ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        entries
                            .lock()
                            .unwrap()
                            .retain(|_, slot| slot.deadline.map(|d| d > now).unwrap_or(true));
                    }
                }
            }
        });
    }
}
