//! Render service: cache-aside orchestration over the capture pipeline.
//!
//! A request first consults the cache store; a fresh entry resolves to the
//! remote reference recorded at upload time, anything else triggers a
//! capture. Cache store failures degrade to a capture instead of failing
//! the request.

use crate::utils::{sanitize_cache_key, validate_url};
use crate::{
    CacheEntry, CacheStore, CaptureEngine, Config, Metrics, PoolStats, RemoteRef, RemoteStore,
    RenderError, RenderRequest, RenderSessionPool,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a request resolved to: an already-uploaded render, or a fresh
/// capture file on local disk.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Cached(RemoteRef),
    Captured(PathBuf),
}

/// Pure cache-aside decision: serve the recorded upload only when the
/// entry exists, is fresh, and the caller did not force a refresh.
pub fn should_serve_cached(entry: Option<&CacheEntry>, force_refresh: bool, ttl: Duration) -> bool {
    if force_refresh {
        return false;
    }
    entry.map(|e| !e.is_expired(ttl)).unwrap_or(false)
}

pub struct RenderService {
    pool: Arc<RenderSessionPool>,
    capture: CaptureEngine,
    cache: CacheStore,
    config: Config,
    metrics: Arc<Metrics>,
}

impl RenderService {
    pub async fn new(config: Config) -> Result<Self, RenderError> {
        let metrics = Arc::new(Metrics::new());
        let cache = CacheStore::open(&config.cache_db_path, config.cache_ttl)?;
        let pool = RenderSessionPool::new(config.clone(), Arc::clone(&metrics)).await;
        let capture = CaptureEngine::new(Arc::clone(&pool), config.clone(), Arc::clone(&metrics));

        Ok(Self {
            pool,
            capture,
            cache,
            config,
            metrics,
        })
    }

    /// Resolve a request through the cache, capturing on miss, staleness
    /// or forced refresh.
    pub async fn get_render(&self, request: &RenderRequest) -> Result<RenderOutcome, RenderError> {
        validate_url(&request.url)?;
        let cache_key = sanitize_cache_key(&request.cache_key);

        let entry = if request.force_refresh {
            debug!(request_id = %request.id, "forced refresh, skipping cache lookup");
            None
        } else {
            match self.cache.lookup(&cache_key) {
                Ok(entry) => entry,
                Err(e) => {
                    // A broken cache store must not take renders down.
                    warn!(request_id = %request.id, "cache lookup failed, treating as miss: {e}");
                    None
                }
            }
        };

        let hit = entry.is_some();
        let expired = entry
            .as_ref()
            .map(|e| e.is_expired(self.config.cache_ttl))
            .unwrap_or(false);
        self.metrics.record_cache_lookup(hit, expired);

        if let Some(entry) = entry {
            if should_serve_cached(Some(&entry), request.force_refresh, self.config.cache_ttl) {
                info!(
                    request_id = %request.id,
                    "cache hit for {cache_key} (age {:?})",
                    entry.age_at(chrono::Utc::now())
                );
                return Ok(RenderOutcome::Cached(RemoteRef {
                    locator_id: entry.remote_locator_id,
                    entry_id: entry.remote_entry_id,
                }));
            }
        }

        if expired {
            debug!(request_id = %request.id, "cache entry for {cache_key} expired, re-rendering");
        }

        let path = self.capture.capture(&request.url, &cache_key).await?;
        Ok(RenderOutcome::Captured(path))
    }

    /// Resolve a request and make the result durable: fresh captures are
    /// uploaded, recorded in the cache, and removed from local disk. An
    /// upload failure degrades to the local file instead of failing.
    pub async fn render_and_store(
        &self,
        request: &RenderRequest,
        remote: &dyn RemoteStore,
        caption: &str,
    ) -> Result<RenderOutcome, RenderError> {
        let outcome = self.get_render(request).await?;
        let path = match outcome {
            RenderOutcome::Cached(_) => return Ok(outcome),
            RenderOutcome::Captured(ref path) => path.clone(),
        };

        let cache_key = sanitize_cache_key(&request.cache_key);
        match remote.upload(&path, caption).await {
            Ok(remote_ref) => {
                if let Err(e) =
                    self.cache
                        .upsert(&cache_key, remote_ref.locator_id, &remote_ref.entry_id)
                {
                    warn!(request_id = %request.id, "failed to record upload in cache: {e}");
                }
                self.delete_local_file(&path).await;
                Ok(RenderOutcome::Cached(remote_ref))
            }
            Err(e) => {
                self.metrics.record_upload_failure();
                warn!(request_id = %request.id, "upload failed, keeping local capture: {e}");
                Ok(outcome)
            }
        }
    }

    /// Best-effort removal of a consumed capture file.
    pub async fn delete_local_file(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("could not remove capture file {}: {e}", path.display());
        } else {
            debug!("removed capture file {}", path.display());
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn list_cache(&self) -> Result<Vec<CacheEntry>, RenderError> {
        self.cache.list_all()
    }

    pub fn clear_cache(&self) -> Result<usize, RenderError> {
        self.cache.delete_all()
    }

    pub fn delete_cache_entry(&self, cache_key: &str) -> Result<bool, RenderError> {
        self.cache.delete_one(&sanitize_cache_key(cache_key))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The metrics handle every pipeline component records to.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn restart_engine(&self) -> Result<(), RenderError> {
        self.pool.restart().await
    }

    pub async fn shutdown(&self) {
        info!("shutting down render service");
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const TTL: Duration = Duration::from_secs(5 * 60 * 60);

    fn entry(age: Duration) -> CacheEntry {
        CacheEntry {
            cache_key: "k".to_string(),
            remote_entry_id: "f".to_string(),
            remote_locator_id: 1,
            created_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
        }
    }

    #[test]
    fn fresh_entry_is_served() {
        let entry = entry(Duration::from_secs(60));
        assert!(should_serve_cached(Some(&entry), false, TTL));
    }

    #[test]
    fn force_refresh_bypasses_fresh_entry() {
        let entry = entry(Duration::from_secs(60));
        assert!(!should_serve_cached(Some(&entry), true, TTL));
    }

    #[test]
    fn expired_entry_is_not_served() {
        let entry = entry(TTL + Duration::from_secs(60));
        assert!(!should_serve_cached(Some(&entry), false, TTL));
    }

    #[test]
    fn miss_is_not_served() {
        assert!(!should_serve_cached(None, false, TTL));
        assert!(!should_serve_cached(None, true, TTL));
    }
}
