//! Periodic housekeeping: expired cache rows and orphaned capture files.
//!
//! Runs on a fixed interval. A run that is still in progress suppresses
//! the next tick instead of stacking; the guard is a compare-exchange on
//! an atomic flag, so overlapping manual runs are rejected the same way.

use crate::{CacheStore, Config, Metrics, RenderError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Extensions of files the sweep is allowed to delete.
const SWEEPABLE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub rows_purged: usize,
    pub files_deleted: usize,
}

pub struct HousekeepingScheduler {
    cache: Arc<CacheStore>,
    config: Config,
    metrics: Arc<Metrics>,
    running: AtomicBool,
}

impl HousekeepingScheduler {
    pub fn new(cache: Arc<CacheStore>, config: Config, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            config,
            metrics,
            running: AtomicBool::new(false),
        })
    }

    /// Run one housekeeping pass now. Returns `None` when another pass is
    /// already in flight.
    pub async fn run_once(&self) -> Option<Result<HousekeepingReport, RenderError>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("housekeeping already running, skipping");
            return None;
        }

        let result = self.sweep().await;
        self.running.store(false, Ordering::SeqCst);
        Some(result)
    }

    async fn sweep(&self) -> Result<HousekeepingReport, RenderError> {
        let rows_purged = self.cache.purge_expired()?;
        let files_deleted = sweep_stale_files(
            &self.config.output_dir,
            self.config.local_file_max_age,
        )
        .await?;

        self.metrics.record_housekeeping(rows_purged, files_deleted);
        if rows_purged > 0 || files_deleted > 0 {
            info!("housekeeping removed {rows_purged} cache rows and {files_deleted} files");
        } else {
            debug!("housekeeping found nothing to remove");
        }

        Ok(HousekeepingReport {
            rows_purged,
            files_deleted,
        })
    }

    /// Spawn the interval loop. Ends when the shutdown channel fires.
    pub fn spawn(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.housekeeping_interval);
            // The immediate first tick would race startup; consume it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(Err(e)) = scheduler.run_once().await {
                            warn!("housekeeping pass failed: {e}");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("housekeeping loop stopping");
                        break;
                    }
                }
            }
        })
    }
}

/// Delete capture files older than `max_age` by modification time. A
/// missing output directory is not an error; nothing has been captured yet.
async fn sweep_stale_files(dir: &Path, max_age: Duration) -> Result<usize, RenderError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_sweepable(&path) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok());
        let Some(age) = age else { continue };

        if age > max_age {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("swept stale capture {}", path.display());
                    deleted += 1;
                }
                Err(e) => warn!("could not sweep {}: {e}", path.display()),
            }
        }
    }

    Ok(deleted)
}

fn is_sweepable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SWEEPABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheStore;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "render-cache-hk-{tag}-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn scheduler(output_dir: PathBuf, max_age: Duration) -> Arc<HousekeepingScheduler> {
        let config = Config {
            output_dir,
            local_file_max_age: max_age,
            ..Default::default()
        };
        let cache = Arc::new(CacheStore::open_in_memory(config.cache_ttl).unwrap());
        HousekeepingScheduler::new(cache, config, Arc::new(Metrics::new()))
    }

    #[test]
    fn sweepable_extensions() {
        assert!(is_sweepable(Path::new("shot.jpeg")));
        assert!(is_sweepable(Path::new("shot.JPG")));
        assert!(is_sweepable(Path::new("shot.png")));
        assert!(!is_sweepable(Path::new("render-cache.db")));
        assert!(!is_sweepable(Path::new("notes.txt")));
        assert!(!is_sweepable(Path::new("noext")));
    }

    #[tokio::test]
    async fn sweep_deletes_only_old_captures() {
        let dir = temp_dir("sweep");
        std::fs::write(dir.join("old.jpeg"), b"x").unwrap();
        std::fs::write(dir.join("keep.db"), b"x").unwrap();

        // Zero max age: every capture file is already stale.
        let deleted = sweep_stale_files(&dir, Duration::ZERO).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!dir.join("old.jpeg").exists());
        assert!(dir.join("keep.db").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_captures() {
        let dir = temp_dir("fresh");
        std::fs::write(dir.join("new.jpeg"), b"x").unwrap();

        let deleted = sweep_stale_files(&dir, Duration::from_secs(24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(dir.join("new.jpeg").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn missing_output_dir_is_not_an_error() {
        let dir = std::env::temp_dir().join(format!("render-cache-hk-none-{}", uuid::Uuid::new_v4()));
        assert_eq!(sweep_stale_files(&dir, Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_once_reports_counts() {
        let dir = temp_dir("counts");
        std::fs::write(dir.join("stale.png"), b"x").unwrap();

        let scheduler = scheduler(dir.clone(), Duration::ZERO);
        let report = scheduler.run_once().await.unwrap().unwrap();
        assert_eq!(
            report,
            HousekeepingReport {
                rows_purged: 0,
                files_deleted: 1
            }
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn spawned_loop_sweeps_and_stops_on_shutdown() {
        let dir = temp_dir("loop");
        std::fs::write(dir.join("stale.jpeg"), b"x").unwrap();

        let config = Config {
            output_dir: dir.clone(),
            local_file_max_age: Duration::ZERO,
            housekeeping_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let cache = Arc::new(CacheStore::open_in_memory(config.cache_ttl).unwrap());
        let scheduler = HousekeepingScheduler::new(cache, config, Arc::new(Metrics::new()));

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let handle = scheduler.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dir.join("stale.jpeg").exists());

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop after shutdown")
            .unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let dir = temp_dir("overlap");
        let scheduler = scheduler(dir.clone(), Duration::ZERO);

        scheduler.running.store(true, Ordering::SeqCst);
        assert!(scheduler.run_once().await.is_none());

        scheduler.running.store(false, Ordering::SeqCst);
        assert!(scheduler.run_once().await.is_some());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
