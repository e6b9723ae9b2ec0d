//! # render-cache
//!
//! Renders web pages to JPEG captures behind a TTL cache, using a pooled
//! headless Chrome engine. Built for slow, JavaScript-heavy schedule sites:
//! each page is rendered once per TTL window, uploaded to a durable store,
//! and served from the cache until it goes stale.
//!
//! ## Architecture
//!
//! - **Render session pool**: one browser engine instance with pages keyed
//!   by cache key, a page-count cap with oldest-first eviction, and
//!   counter-driven restarts with a cooldown.
//! - **Capture engine**: retried navigate-wait-shoot pipeline with layered
//!   readiness heuristics and chrome-hiding before the shot.
//! - **Cache store**: SQLite-backed key-to-upload mapping with a 5 hour
//!   TTL, computed at read time so stale entries stay visible.
//! - **Housekeeping**: hourly sweep of expired cache rows and capture
//!   files older than a day.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_cache::{Config, RenderRequest, RenderService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let service = RenderService::new(config).await?;
//!
//!     let request = RenderRequest::new("https://example.com/schedule", "group-101");
//!     let outcome = service.get_render(&request).await?;
//!     println!("{outcome:?}");
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-cache render --url https://example.com/schedule --key group-101
//! render-cache cache list
//! render-cache cleanup
//! ```

/// Configuration and settings for the render pipeline
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Browser engine lifecycle and keyed page management
pub mod session_pool;

/// Retried render-to-JPEG capture pipeline
pub mod capture;

/// SQLite-backed cache metadata store
pub mod cache_store;

/// Durable blob store boundary
pub mod remote;

/// Cache-aside orchestration over the capture pipeline
pub mod service;

/// Periodic cleanup of cache rows and capture files
pub mod housekeeping;

/// Command-line interface implementation
pub mod cli;

/// Pipeline metrics collection
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use cache_store::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use housekeeping::*;
pub use self::metrics::*;
pub use remote::*;
pub use service::*;
pub use session_pool::*;
pub use utils::*;
