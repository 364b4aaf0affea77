//! Side cache for inbound media.
//!
//! Messages only carry a `MediaReference`. Downloading happens afterwards on
//! a spawned task; a failed download is logged and never affects the
//! message that referenced it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::channels::message::MediaReference;

pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Bytes returned by a platform-specific fetcher.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Resolves a platform reference (file id, media id, URL) to bytes.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, media: &MediaReference) -> Result<FetchedMedia>;
}

/// Plain URL download.
#[derive(Debug, Clone, Default)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// A downloader for references that already are http(s) URLs.
    pub fn for_reference(media: &MediaReference) -> Option<Arc<dyn MediaFetcher>> {
        let is_url = media.reference.starts_with("https://") || media.reference.starts_with("http://");
        is_url.then(|| Arc::new(Self::default()) as Arc<dyn MediaFetcher>)
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, media: &MediaReference) -> Result<FetchedMedia> {
        let resp = self
            .client
            .get(&media.reference)
            .send()
            .await?
            .error_for_status()?;
        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| media.mime_type.clone());
        let bytes = resp.bytes().await?.to_vec();
        Ok(FetchedMedia { bytes, mime_type })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub mime_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MediaCacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct MediaCache {
    dir: PathBuf,
    ttl: Duration,
    index: RwLock<HashMap<String, MediaCacheEntry>>,
}

impl MediaCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key for one reference of one account.
    pub fn key_for(account_id: &str, media: &MediaReference) -> String {
        format!("{account_id}:{}", media.reference)
    }

    fn file_stem(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(7))
    }

    /// Expired by its recorded deadline or by the TTL configured now.
    fn expired(&self, entry: &MediaCacheEntry, now: DateTime<Utc>) -> bool {
        entry.is_expired(now) || entry.fetched_at + self.ttl() <= now
    }

    /// Download in the background. Returns immediately.
    pub fn spawn_fetch(self: &Arc<Self>, key: String, media: MediaReference, fetcher: Arc<dyn MediaFetcher>) {
        if self.get(&key).is_some() {
            debug!(key, "media already cached");
            return;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let fetched = match fetcher.fetch(&media).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(key, "media fetch failed: {e:#}");
                    return;
                }
            };
            if let Err(e) = cache.store(&key, fetched).await {
                warn!(key, "media cache write failed: {e:#}");
            }
        });
    }

    pub async fn store(&self, key: &str, fetched: FetchedMedia) -> Result<MediaCacheEntry> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating media cache {}", self.dir.display()))?;

        let stem = Self::file_stem(key);
        let path = self.dir.join(format!("{stem}.bin"));
        tokio::fs::write(&path, &fetched.bytes)
            .await
            .with_context(|| format!("writing media {}", path.display()))?;

        let fetched_at = Utc::now();
        let ttl = self.ttl();
        let entry = MediaCacheEntry {
            key: key.to_string(),
            path,
            size: fetched.bytes.len() as u64,
            mime_type: fetched.mime_type,
            fetched_at,
            expires_at: fetched_at + ttl,
        };

        let meta_path = self.dir.join(format!("{stem}.json"));
        let meta = serde_json::to_vec_pretty(&entry).context("serializing media metadata")?;
        tokio::fs::write(&meta_path, meta)
            .await
            .with_context(|| format!("writing media metadata {}", meta_path.display()))?;

        self.index.write().insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    /// Live entry for `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<MediaCacheEntry> {
        self.index
            .read()
            .get(key)
            .filter(|entry| !self.expired(entry, Utc::now()))
            .cloned()
    }

    /// Remove expired entries from disk and index. Returns how many went.
    ///
    /// Walks the `.json` sidecars on disk, so files cached by an earlier
    /// process are purged too; their live entries are put back in the index.
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("reading media cache {}", self.dir.display())),
        };

        let now = Utc::now();
        let mut purged = 0;
        while let Some(dirent) = dir.next_entry().await? {
            let meta_path = dirent.path();
            if meta_path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let entry = match tokio::fs::read(&meta_path).await {
                Ok(raw) => serde_json::from_slice::<MediaCacheEntry>(&raw).ok(),
                Err(_) => None,
            };
            let Some(entry) = entry else {
                warn!(path = %meta_path.display(), "skipping unreadable media metadata");
                continue;
            };

            if self.expired(&entry, now) {
                self.index.write().remove(&entry.key);
                let _ = tokio::fs::remove_file(meta_path.with_extension("bin")).await;
                let _ = tokio::fs::remove_file(&meta_path).await;
                purged += 1;
            } else {
                self.index.write().entry(entry.key.clone()).or_insert(entry);
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct StaticFetcher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl MediaFetcher for StaticFetcher {
        async fn fetch(&self, _media: &MediaReference) -> Result<FetchedMedia> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("404 from platform");
            }
            Ok(FetchedMedia {
                bytes: vec![1, 2, 3, 4],
                mime_type: Some("image/jpeg".into()),
            })
        }
    }

    #[tokio::test]
    async fn store_records_size_mime_and_expiry() {
        let tmp = TempDir::new().unwrap();
        let cache = MediaCache::new(tmp.path(), DEFAULT_TTL);
        let entry = cache
            .store(
                "acc:file-1",
                FetchedMedia {
                    bytes: vec![0; 10],
                    mime_type: Some("audio/ogg".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(entry.size, 10);
        assert_eq!(entry.mime_type.as_deref(), Some("audio/ogg"));
        assert_eq!(entry.expires_at - entry.fetched_at, chrono::Duration::days(7));
        assert!(entry.path.exists());
        assert!(entry.path.with_extension("json").exists());
        assert_eq!(cache.get("acc:file-1"), Some(entry));
    }

    #[tokio::test]
    async fn spawned_fetch_populates_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(MediaCache::new(tmp.path(), DEFAULT_TTL));
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicU32::new(0),
            fail: false,
        });

        cache.spawn_fetch("acc:ph".into(), MediaReference::new("ph"), fetcher.clone());
        for _ in 0..50 {
            if cache.get("acc:ph").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.get("acc:ph").unwrap().size, 4);

        cache.spawn_fetch("acc:ph".into(), MediaReference::new("ph"), fetcher.clone());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_swallowed() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(MediaCache::new(tmp.path(), DEFAULT_TTL));
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicU32::new(0),
            fail: true,
        });
        cache.spawn_fetch("acc:gone".into(), MediaReference::new("gone"), fetcher.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("acc:gone").is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_entries_are_purged() {
        let tmp = TempDir::new().unwrap();
        let cache = MediaCache::new(tmp.path(), Duration::ZERO);
        let entry = cache
            .store(
                "acc:old",
                FetchedMedia {
                    bytes: vec![9],
                    mime_type: None,
                },
            )
            .await
            .unwrap();
        assert!(cache.get("acc:old").is_none());
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert!(!entry.path.exists());
    }

    #[tokio::test]
    async fn purge_covers_files_from_an_earlier_process() {
        let tmp = TempDir::new().unwrap();
        let first = MediaCache::new(tmp.path(), DEFAULT_TTL);
        let entry = first
            .store(
                "acc:before-restart",
                FetchedMedia {
                    bytes: vec![7; 3],
                    mime_type: None,
                },
            )
            .await
            .unwrap();

        let reopened = MediaCache::new(tmp.path(), DEFAULT_TTL);
        assert!(reopened.get("acc:before-restart").is_none());
        assert_eq!(reopened.purge_expired().await.unwrap(), 0);
        assert_eq!(reopened.get("acc:before-restart"), Some(entry.clone()));

        let short = MediaCache::new(tmp.path(), Duration::ZERO);
        assert_eq!(short.purge_expired().await.unwrap(), 1);
        assert!(!entry.path.exists());
        assert!(!entry.path.with_extension("json").exists());
    }

    #[tokio::test]
    async fn purge_of_missing_dir_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = MediaCache::new(tmp.path().join("never-created"), DEFAULT_TTL);
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }

    #[test]
    fn url_references_get_a_plain_downloader() {
        assert!(HttpMediaFetcher::for_reference(&MediaReference::new("https://cdn.example.com/a.jpg")).is_some());
        assert!(HttpMediaFetcher::for_reference(&MediaReference::new("AgACAgQAAxkBAAI")).is_none());
    }
}
