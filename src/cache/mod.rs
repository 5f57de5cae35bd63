//! Scrape result cache: TTL snapshots, negative markers and freshness marks.
//!
//! Key layout (persisted, must stay stable):
//! - `match:{id}:snapshot`  – latest JSON snapshot
//! - `match:{id}:missing`   – negative-cache marker
//! - `match:{id}:freshness` – timestamp of the last successful scrape
//!
//! Expiry is enforced by the backend, never by timers in this process.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ScrapeError;

/// Key/value store with native per-key TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Value of a live (unexpired) key.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Delete all `keys` in one operation; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    /// Physically drop expired rows. Expired keys are already invisible.
    async fn purge_expired(&self) -> Result<u64>;
    async fn ping(&self) -> Result<()>;
}

pub fn snapshot_key(match_id: &str) -> String {
    format!("match:{}:snapshot", match_id)
}

pub fn missing_key(match_id: &str) -> String {
    format!("match:{}:missing", match_id)
}

pub fn freshness_key(match_id: &str) -> String {
    format!("match:{}:freshness", match_id)
}

#[derive(Clone)]
pub struct ScrapeCache {
    backend: Arc<dyn CacheBackend>,
    snapshot_ttl: Duration,
    negative_ttl: Duration,
    freshness_ttl: Duration,
}

impl ScrapeCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        snapshot_ttl: Duration,
        negative_ttl: Duration,
        freshness_ttl: Duration,
    ) -> Self {
        ScrapeCache {
            backend,
            snapshot_ttl,
            negative_ttl,
            freshness_ttl,
        }
    }

    pub async fn ping(&self) -> Result<(), ScrapeError> {
        self.backend.ping().await.map_err(ScrapeError::Cache)
    }

    /// Store `data` as the match snapshot; `None` uses the configured TTL.
    pub async fn set_snapshot(
        &self,
        match_id: &str,
        data: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), ScrapeError> {
        let body = serde_json::to_string(data).map_err(|e| ScrapeError::Cache(e.into()))?;
        self.backend
            .set_ex(&snapshot_key(match_id), &body, ttl.unwrap_or(self.snapshot_ttl))
            .await
            .map_err(ScrapeError::Cache)
    }

    pub async fn get_snapshot(
        &self,
        match_id: &str,
    ) -> Result<Option<serde_json::Value>, ScrapeError> {
        let Some(body) = self
            .backend
            .get(&snapshot_key(match_id))
            .await
            .map_err(ScrapeError::Cache)?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&body) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Treat a corrupt row as absent; the next scrape overwrites it.
                debug!("Discarding unreadable snapshot for {}: {}", match_id, e);
                Ok(None)
            }
        }
    }

    pub async fn set_negative_cache(
        &self,
        match_id: &str,
        ttl: Option<Duration>,
    ) -> Result<(), ScrapeError> {
        self.backend
            .set_ex(&missing_key(match_id), "1", ttl.unwrap_or(self.negative_ttl))
            .await
            .map_err(ScrapeError::Cache)
    }

    pub async fn is_negative_cached(&self, match_id: &str) -> Result<bool, ScrapeError> {
        self.backend
            .exists(&missing_key(match_id))
            .await
            .map_err(ScrapeError::Cache)
    }

    /// Record `at` as the time of the last successful scrape.
    pub async fn mark_fresh(&self, match_id: &str, at: DateTime<Utc>) -> Result<(), ScrapeError> {
        self.backend
            .set_ex(&freshness_key(match_id), &at.to_rfc3339(), self.freshness_ttl)
            .await
            .map_err(ScrapeError::Cache)
    }

    pub async fn last_scraped_at(
        &self,
        match_id: &str,
    ) -> Result<Option<DateTime<Utc>>, ScrapeError> {
        let raw = self
            .backend
            .get(&freshness_key(match_id))
            .await
            .map_err(ScrapeError::Cache)?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Stop tracking a finished match: snapshot and freshness keys go in a
    /// single batched delete.
    pub async fn archive_match(&self, match_id: &str) -> Result<(), ScrapeError> {
        let keys = [snapshot_key(match_id), freshness_key(match_id)];
        let removed = self
            .backend
            .delete(&keys)
            .await
            .map_err(ScrapeError::Cache)?;
        info!("Archived match {} ({} keys removed)", match_id, removed);
        Ok(())
    }

    pub async fn purge_expired(&self) -> Result<u64, ScrapeError> {
        self.backend.purge_expired().await.map_err(ScrapeError::Cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every delete batch on top of an in-memory store.
    #[derive(Default)]
    struct RecordingBackend {
        inner: MemoryBackend,
        deletes: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CacheBackend for RecordingBackend {
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.set_ex(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn delete(&self, keys: &[String]) -> Result<u64> {
            self.deletes.lock().unwrap().push(keys.to_vec());
            self.inner.delete(keys).await
        }
        async fn purge_expired(&self) -> Result<u64> {
            self.inner.purge_expired().await
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn cache_over(backend: Arc<dyn CacheBackend>) -> ScrapeCache {
        ScrapeCache::new(
            backend,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(snapshot_key("42"), "match:42:snapshot");
        assert_eq!(missing_key("42"), "match:42:missing");
        assert_eq!(freshness_key("42"), "match:42:freshness");
    }

    #[tokio::test]
    async fn test_archive_is_one_batched_delete() {
        let backend = Arc::new(RecordingBackend::default());
        let cache = cache_over(backend.clone());
        cache
            .set_snapshot("7", &json!({"home_score": 1}), None)
            .await
            .unwrap();
        cache.mark_fresh("7", Utc::now()).await.unwrap();

        cache.archive_match("7").await.unwrap();

        let deletes = backend.deletes.lock().unwrap().clone();
        assert_eq!(deletes.len(), 1);
        assert_eq!(
            deletes[0],
            vec!["match:7:snapshot".to_string(), "match:7:freshness".to_string()]
        );
        assert!(cache.get_snapshot("7").await.unwrap().is_none());
        assert!(cache.last_scraped_at("7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_and_negative_keys_are_independent() {
        let cache = cache_over(Arc::new(MemoryBackend::new()));
        cache
            .set_snapshot("m1", &json!({"status": "in_progress"}), None)
            .await
            .unwrap();
        assert!(!cache.is_negative_cached("m1").await.unwrap());

        cache
            .set_negative_cache("m1", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(cache.is_negative_cached("m1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.is_negative_cached("m1").await.unwrap());
        assert_eq!(
            cache.get_snapshot("m1").await.unwrap(),
            Some(json!({"status": "in_progress"}))
        );
    }

    #[tokio::test]
    async fn test_snapshot_ttl_expires() {
        let cache = cache_over(Arc::new(MemoryBackend::new()));
        cache
            .set_snapshot("m2", &json!([1, 2]), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get_snapshot("m2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_freshness_roundtrip_keeps_instant() {
        let cache = cache_over(Arc::new(MemoryBackend::new()));
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        cache.mark_fresh("m3", at).await.unwrap();
        assert_eq!(cache.last_scraped_at("m3").await.unwrap(), Some(at));
    }
}
