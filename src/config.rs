//! Configuration management with serde serialization/deserialization
//!
//! All tunables for the render pipeline: pool limits, per-step timeouts,
//! retry policy, cache TTLs, output paths and browser launch variants.

use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the render-and-cache pipeline.
///
/// # Examples
///
/// ```rust
/// use render_cache::Config;
///
/// let config = Config {
///     max_pages: 10,
///     ..Default::default()
/// };
/// assert_eq!(config.capture_attempts, 3);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory where capture files are written (created if absent).
    pub output_dir: PathBuf,

    /// SQLite file backing the cache metadata store.
    pub cache_db_path: PathBuf,

    /// Page count cap; `evict_idle` closes oldest pages beyond this.
    pub max_pages: usize,

    /// Screenshots taken since the last restart before the engine is
    /// proactively restarted.
    pub screenshots_per_restart: u32,

    /// Minimum gap between engine restarts, preventing restart storms
    /// under sustained failure.
    pub restart_cooldown: Duration,

    /// Pause between closing the old engine and relaunching.
    pub relaunch_pause: Duration,

    /// Total capture attempts (1 initial + retries).
    pub capture_attempts: u32,

    /// Sleep between capture attempts.
    pub retry_backoff: Duration,

    /// Ceiling for a single page navigation.
    pub navigation_timeout: Duration,

    /// Bounded wait for the content selector heuristics.
    pub selector_wait: Duration,

    /// Fallback wait for the root content node.
    pub body_wait: Duration,

    /// Wait for the page to reach a non-trivial scroll height.
    pub height_wait: Duration,

    /// Fixed settle delay after the readiness chain.
    pub settle_delay: Duration,

    /// Scroll height below which the page is considered still loading.
    pub min_content_height: u32,

    /// Cache entry time-to-live.
    pub cache_ttl: Duration,

    /// Age after which orphaned capture files are swept from disk.
    pub local_file_max_age: Duration,

    /// Cadence of the housekeeping task.
    pub housekeeping_interval: Duration,

    /// JPEG quality for capture output (0-100).
    pub jpeg_quality: u8,

    /// Browser viewport used for renders.
    pub viewport: Viewport,

    /// Path to Chrome/Chromium executable (default: auto-detect).
    pub chrome_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("screenshots"),
            cache_db_path: PathBuf::from("render-cache.db"),
            max_pages: 5,
            screenshots_per_restart: 50,
            restart_cooldown: Duration::from_secs(30),
            relaunch_pause: Duration::from_secs(2),
            capture_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            navigation_timeout: Duration::from_secs(120),
            selector_wait: Duration::from_secs(20),
            body_wait: Duration::from_secs(15),
            height_wait: Duration::from_secs(20),
            settle_delay: Duration::from_secs(3),
            min_content_height: 500,
            cache_ttl: Duration::from_secs(5 * 60 * 60),
            local_file_max_age: Duration::from_secs(24 * 60 * 60),
            housekeeping_interval: Duration::from_secs(60 * 60),
            jpeg_quality: 100,
            viewport: Viewport::default(),
            chrome_path: None,
        }
    }
}

/// Browser viewport used when rendering pages.
///
/// The default matches the original service: a 4K viewport so long
/// schedule tables fit without horizontal scrolling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 3840,
            height: 2160,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// One render request as received from a caller.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Correlation id for logs.
    pub id: String,
    pub url: String,
    pub cache_key: String,
    pub force_refresh: bool,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            cache_key: cache_key.into(),
            force_refresh: false,
        }
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// A named browser launch configuration, tried in order until one works.
#[derive(Debug, Clone)]
pub struct LaunchVariant {
    pub name: &'static str,
    pub args: Vec<String>,
}

/// The configured variant list: a standard argument set, then a minimal
/// fallback for constrained environments.
pub fn launch_variants(config: &Config) -> Vec<LaunchVariant> {
    vec![
        LaunchVariant {
            name: "standard",
            args: vec![
                "--no-sandbox".to_string(),
                "--disable-setuid-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-accelerated-2d-canvas".to_string(),
                "--disable-gpu".to_string(),
                "--disable-features=IsolateOrigins,site-per-process".to_string(),
                "--disable-web-security".to_string(),
                format!(
                    "--window-size={},{}",
                    config.viewport.width, config.viewport.height
                ),
            ],
        },
        LaunchVariant {
            name: "minimal",
            args: vec![
                "--no-sandbox".to_string(),
                "--disable-setuid-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
            ],
        },
    ]
}

/// Build a chromiumoxide browser config for one launch variant.
pub fn browser_config_for_variant(
    config: &Config,
    variant: &LaunchVariant,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    // The CDP request timeout must cover the full navigation ceiling, or
    // slow navigations get cut off at the protocol default instead.
    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .request_timeout(config.navigation_timeout)
        .args(variant.args.clone());

    let chrome_path = config
        .chrome_path
        .clone()
        .or_else(detect_chrome_path);
    if let Some(chrome_path) = chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(RenderError::EngineLaunchFailed)
}

/// Locate a Chrome/Chromium executable: `CHROME_BIN` first, then the usual
/// install locations. `None` leaves detection to the automation layer.
pub fn detect_chrome_path() -> Option<String> {
    if let Ok(path) = std::env::var("CHROME_BIN") {
        if std::path::Path::new(&path).exists() {
            return Some(path);
        }
    }

    known_chrome_paths()
        .iter()
        .find(|p| std::path::Path::new(p).exists())
        .map(|p| p.to_string())
}

fn known_chrome_paths() -> &'static [&'static str] {
    &[
        "/usr/bin/chromium-browser",
        "/usr/bin/chromium",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/sbin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_contract() {
        let config = Config::default();
        assert_eq!(config.max_pages, 5);
        assert_eq!(config.screenshots_per_restart, 50);
        assert_eq!(config.restart_cooldown, Duration::from_secs(30));
        assert_eq!(config.capture_attempts, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.navigation_timeout, Duration::from_secs(120));
        assert_eq!(config.cache_ttl, Duration::from_secs(5 * 60 * 60));
        assert_eq!(config.local_file_max_age, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.housekeeping_interval, Duration::from_secs(60 * 60));
    }

    #[test]
    fn launch_variant_order() {
        let variants = launch_variants(&Config::default());
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].name, "standard");
        assert_eq!(variants[1].name, "minimal");
        assert!(variants[0].args.len() > variants[1].args.len());
        // Both variants disable the sandbox for container environments
        for variant in &variants {
            assert!(variant.args.contains(&"--no-sandbox".to_string()));
        }
    }

    #[test]
    fn request_builder() {
        let req = RenderRequest::new("https://example.com", "group-101");
        assert!(!req.force_refresh);
        assert!(!req.id.is_empty());

        let req = req.force_refresh();
        assert!(req.force_refresh);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_pages, config.max_pages);
        assert_eq!(parsed.viewport.width, 3840);
    }
}
