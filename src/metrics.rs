use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;

pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_expired_hits: Counter,
    pub captures_taken: Counter,
    pub captures_failed: Counter,
    pub capture_duration: Histogram,
    pub capture_retries: Counter,
    pub engine_restarts: Counter,
    pub pages_evicted: Counter,
    pub live_pages: Gauge,
    pub remote_upload_failures: Counter,
    pub housekeeping_runs: Counter,
    pub housekeeping_files_deleted: Counter,
    pub housekeeping_rows_purged: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_hits: Counter::noop(),
            cache_misses: Counter::noop(),
            cache_expired_hits: Counter::noop(),
            captures_taken: Counter::noop(),
            captures_failed: Counter::noop(),
            capture_duration: Histogram::noop(),
            capture_retries: Counter::noop(),
            engine_restarts: Counter::noop(),
            pages_evicted: Counter::noop(),
            live_pages: Gauge::noop(),
            remote_upload_failures: Counter::noop(),
            housekeeping_runs: Counter::noop(),
            housekeeping_files_deleted: Counter::noop(),
            housekeeping_rows_purged: Counter::noop(),
        }
    }

    pub fn record_cache_lookup(&self, hit: bool, expired: bool) {
        match (hit, expired) {
            (true, false) => self.cache_hits.increment(1),
            (true, true) => self.cache_expired_hits.increment(1),
            (false, _) => self.cache_misses.increment(1),
        }
    }

    pub fn record_capture(&self, duration: Duration, success: bool) {
        if success {
            self.captures_taken.increment(1);
        } else {
            self.captures_failed.increment(1);
        }
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.capture_retries.increment(1);
    }

    pub fn record_engine_restart(&self) {
        self.engine_restarts.increment(1);
    }

    pub fn record_eviction(&self, closed: usize) {
        self.pages_evicted.increment(closed as u64);
    }

    pub fn set_live_pages(&self, count: usize) {
        self.live_pages.set(count as f64);
    }

    pub fn record_upload_failure(&self) {
        self.remote_upload_failures.increment(1);
    }

    pub fn record_housekeeping(&self, rows_purged: usize, files_deleted: usize) {
        self.housekeeping_runs.increment(1);
        self.housekeeping_rows_purged.increment(rows_purged as u64);
        self.housekeeping_files_deleted.increment(files_deleted as u64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
