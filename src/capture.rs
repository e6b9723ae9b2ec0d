//! Capture engine: retried render-to-JPEG of a single page.
//!
//! Each capture is serialized per cache key, navigated under a hard
//! timeout, waited on through a layered readiness chain, stripped of
//! page chrome, then screenshotted and written as a JPEG file. Attempts
//! are independent: a failed attempt releases its page so the next one
//! starts from a fresh handle.

use crate::utils::capture_filename;
use crate::{Config, Metrics, RenderError, RenderSessionPool};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Selectors that indicate the schedule table has rendered, tried before
/// falling back to the document body.
const CONTENT_SELECTORS: &str =
    "table, .timetable, [class*=\"schedule\"], [class*=\"table\"], #schedule, #timetable";

/// Page chrome hidden before the shot so the capture is just content.
const HIDE_CHROME_JS: &str = r#"
(() => {
    const selectors = [
        'header', '.header', '[class*="header"]', '[id*="header"]',
        'nav', '.nav', '.navbar',
        'footer', '.footer', '[class*="footer"]', '[id*="footer"]',
        '[class*="contact"]', '[class*="bottom"]',
    ];
    for (const selector of selectors) {
        document.querySelectorAll(selector).forEach((el) => {
            el.style.display = 'none';
        });
    }
})()
"#;

pub struct CaptureEngine {
    pool: Arc<RenderSessionPool>,
    config: Config,
    metrics: Arc<Metrics>,
}

impl CaptureEngine {
    pub fn new(pool: Arc<RenderSessionPool>, config: Config, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            config,
            metrics,
        }
    }

    /// Render `url` and write a JPEG capture file, returning its path.
    ///
    /// Holds the per-key lock for the whole capture, so two concurrent
    /// requests for the same key produce one render. Retries up to the
    /// configured attempt budget with a fixed backoff between attempts.
    pub async fn capture(&self, url: &str, cache_key: &str) -> Result<PathBuf, RenderError> {
        let result = self.capture_serialized(url, cache_key).await;
        // The lock entry is reclaimed once no other capture waits on it.
        self.pool.release_key_lock(cache_key);
        result
    }

    async fn capture_serialized(&self, url: &str, cache_key: &str) -> Result<PathBuf, RenderError> {
        let key_lock = self.pool.key_lock(cache_key);
        let _serialized = key_lock.lock().await;

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let path = self.config.output_dir.join(capture_filename(cache_key));

        let started = Instant::now();
        let total = self.config.capture_attempts;

        let outcome = run_attempts(total, self.config.retry_backoff, |attempt| {
            let path = path.clone();
            async move {
                if attempt > 1 {
                    self.metrics.record_retry();
                }
                debug!("capture attempt {attempt}/{total} for key {cache_key}: {url}");

                let result = self.capture_attempt(url, cache_key, &path).await;
                // The page may hold broken state; drop it so the next attempt
                // starts clean.
                self.pool.release_page(cache_key).await;
                if let Err(e) = &result {
                    warn!("capture attempt {attempt}/{total} failed for key {cache_key}: {e}");
                }
                result
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                self.pool.record_screenshot().await;
                self.metrics.record_capture(started.elapsed(), true);
                info!("captured {cache_key} -> {}", path.display());
                Ok(path)
            }
            Err(e) => {
                self.metrics.record_capture(started.elapsed(), false);
                Err(e)
            }
        }
    }

    async fn capture_attempt(
        &self,
        url: &str,
        cache_key: &str,
        path: &Path,
    ) -> Result<(), RenderError> {
        self.pool.ensure_healthy().await;
        self.pool.evict_idle(self.config.max_pages).await;

        let page = self.pool.acquire_page(cache_key).await?;

        self.navigate(&page, url).await?;
        self.wait_for_content(&page).await?;
        self.hide_chrome(&page).await?;
        let png = self.take_screenshot(&page).await?;
        self.write_jpeg(png, path).await?;

        Ok(())
    }

    /// Navigate under the hard timeout. A timeout here is its own error
    /// kind so callers can tell "site too slow" from "site broken".
    async fn navigate(&self, page: &Page, url: &str) -> Result<(), RenderError> {
        match timeout(self.config.navigation_timeout, page.goto(url)).await {
            Err(_) => Err(RenderError::NavigationTimeout(self.config.navigation_timeout)),
            Ok(Err(e)) => Err(navigation_error(e, self.config.navigation_timeout)),
            Ok(Ok(_)) => {
                // Wait out the load event too; if the page is already
                // settled this resolves immediately.
                let _ = timeout(self.config.navigation_timeout, page.wait_for_navigation()).await;
                Ok(())
            }
        }
    }

    /// Layered readiness chain: content selector, then body fallback, then
    /// a best-effort scroll-height check, then a fixed settle delay.
    async fn wait_for_content(&self, page: &Page) -> Result<(), RenderError> {
        if self
            .wait_for_selector(page, CONTENT_SELECTORS, self.config.selector_wait)
            .await
        {
            debug!("content selector matched");
        } else {
            debug!("no content selector matched, falling back to body");
            if !self
                .wait_for_selector(page, "body", self.config.body_wait)
                .await
            {
                return Err(RenderError::PageError(
                    "document body never appeared".to_string(),
                ));
            }
        }

        if !self.wait_for_height(page).await {
            // Short pages are still worth capturing.
            debug!("content height stayed below threshold");
        }

        sleep(self.config.settle_delay).await;
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        page: &Page,
        selector: &str,
        limit: std::time::Duration,
    ) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if page.find_element(selector).await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    async fn wait_for_height(&self, page: &Page) -> bool {
        let expression = format!(
            "document.body !== null && document.body.scrollHeight > {}",
            self.config.min_content_height
        );
        let deadline = Instant::now() + self.config.height_wait;
        loop {
            let tall_enough = page
                .evaluate(expression.as_str())
                .await
                .ok()
                .and_then(|result| result.into_value::<bool>().ok())
                .unwrap_or(false);
            if tall_enough {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    async fn hide_chrome(&self, page: &Page) -> Result<(), RenderError> {
        page.evaluate(HIDE_CHROME_JS)
            .await
            .map_err(|e| RenderError::PageError(e.to_string()))?;
        Ok(())
    }

    /// Shoot the content element when one exists, otherwise the full page.
    async fn take_screenshot(&self, page: &Page) -> Result<Vec<u8>, RenderError> {
        let png = match page.find_element(CONTENT_SELECTORS).await {
            Ok(element) => element
                .screenshot(CaptureScreenshotFormat::Png)
                .await
                .map_err(|e| RenderError::PageError(e.to_string()))?,
            Err(_) => page
                .screenshot(
                    ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .full_page(true)
                        .build(),
                )
                .await
                .map_err(|e| RenderError::PageError(e.to_string()))?,
        };
        Ok(png)
    }

    /// Re-encode the engine's PNG as a JPEG at the configured quality and
    /// write it out. Encoding runs off the async runtime.
    async fn write_jpeg(&self, png: Vec<u8>, path: &Path) -> Result<(), RenderError> {
        let quality = self.config.jpeg_quality;
        let jpeg = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, RenderError> {
            let decoded = image::load_from_memory(&png)
                .map_err(|e| RenderError::PageError(format!("capture decode failed: {e}")))?;
            // JPEG has no alpha channel.
            let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
            let mut out = Vec::new();
            rgb.write_to(
                &mut Cursor::new(&mut out),
                image::ImageOutputFormat::Jpeg(quality),
            )
            .map_err(|e| RenderError::PageError(format!("jpeg encode failed: {e}")))?;
            Ok(out)
        })
        .await
        .map_err(|e| RenderError::Io(e.to_string()))??;

        tokio::fs::write(path, &jpeg).await?;
        debug!("wrote {} bytes to {}", jpeg.len(), path.display());
        Ok(())
    }
}

/// Drive the attempt closure until it succeeds or the budget is spent,
/// sleeping the backoff between attempts. Exhaustion yields `CaptureFailed`
/// wrapping the last attempt's error.
async fn run_attempts<F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut attempt_fn: F,
) -> Result<(), RenderError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<(), RenderError>>,
{
    let mut last_error = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            sleep(backoff).await;
        }
        match attempt_fn(attempt).await {
            Ok(()) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }

    Err(RenderError::capture_failed(last_error.unwrap_or(
        RenderError::PageError("no capture attempts were made".to_string()),
    )))
}

/// A CDP-level request timeout during navigation is still a slow server,
/// not a broken one; it keeps its timeout identity.
fn navigation_error(err: CdpError, ceiling: Duration) -> RenderError {
    match err {
        CdpError::Timeout => RenderError::NavigationTimeout(ceiling),
        other => RenderError::NavigationFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_budget_spans_transient_outages() {
        // Three attempts with 5s backoff give a failing site at least 10s
        // of breathing room before the capture is declared failed.
        let config = Config::default();
        let total_backoff = config.retry_backoff * (config.capture_attempts - 1);
        assert!(total_backoff >= Duration::from_secs(10));
    }

    #[test]
    fn content_selectors_cover_schedule_markup() {
        for fragment in ["table", ".timetable", "#schedule", "#timetable"] {
            assert!(CONTENT_SELECTORS.contains(fragment));
        }
    }

    #[test]
    fn hide_chrome_targets_page_furniture() {
        for fragment in ["header", "nav", "footer", "contact", "bottom"] {
            assert!(HIDE_CHROME_JS.contains(fragment));
        }
    }

    #[tokio::test]
    async fn exhausted_attempts_wrap_the_last_error() {
        let calls = AtomicU32::new(0);
        let backoff = Duration::from_millis(10);
        let started = Instant::now();

        let result = run_attempts(3, backoff, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(RenderError::PageError(format!("attempt {attempt}"))) }
        })
        .await;

        // Every attempt ran, with the backoff slept between them.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= backoff * 2);

        match result {
            Err(RenderError::CaptureFailed(inner)) => {
                assert!(matches!(*inner, RenderError::PageError(ref msg) if msg == "attempt 3"));
            }
            other => panic!("expected CaptureFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_stops_the_retry_loop() {
        let calls = AtomicU32::new(0);

        let result = run_attempts(3, Duration::from_millis(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(RenderError::NavigationFailed("flaky".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_identity_survives_retry_exhaustion() {
        let result = run_attempts(3, Duration::from_millis(1), |_| async {
            Err(RenderError::NavigationTimeout(Duration::from_secs(120)))
        })
        .await;

        assert!(result.unwrap_err().is_navigation_timeout());
    }

    #[test]
    fn cdp_timeouts_keep_their_timeout_identity() {
        let ceiling = Duration::from_secs(120);
        assert!(navigation_error(CdpError::Timeout, ceiling).is_navigation_timeout());

        let io = CdpError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(matches!(
            navigation_error(io, ceiling),
            RenderError::NavigationFailed(_)
        ));
    }
}
