//! Render session pool: one browser engine instance and its keyed pages.
//!
//! The pool owns the engine lifecycle (launch variants, liveness probe,
//! counter-driven restarts with a cooldown) and a bounded registry of pages
//! keyed by cache key. Engine-level operations are mutually exclusive with
//! page acquisition: a restart holds the engine lock for its full duration,
//! so concurrent `acquire_page` calls wait instead of racing a closing
//! engine.

use crate::{browser_config_for_variant, launch_variants, Config, Metrics, RenderError};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::page::Page;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Engine lifecycle per the restart state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Uninitialized,
    Healthy,
    Degraded,
    Restarting,
    /// All launch variants failed. Recoverable only by an explicit
    /// `restart()`; never retried on a timer.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Idle,
    InUse,
    Closed,
}

#[derive(Debug)]
struct PageSlot<P> {
    page: P,
    state: PageState,
    created_at: Instant,
    last_used: Instant,
}

/// Insertion-ordered page bookkeeping. At most one live slot per key.
///
/// Kept separate from the pool so the eviction-order and replacement
/// invariants are testable without a live browser.
#[derive(Debug)]
pub(crate) struct PageRegistry<P> {
    slots: HashMap<String, PageSlot<P>>,
    order: VecDeque<String>,
}

impl<P: Clone> PageRegistry<P> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Reuse the live page for `key`, marking it in use.
    fn checkout(&mut self, key: &str) -> Option<P> {
        let slot = self.slots.get_mut(key)?;
        if slot.state == PageState::Closed {
            return None;
        }
        slot.state = PageState::InUse;
        slot.last_used = Instant::now();
        Some(slot.page.clone())
    }

    /// Register a page for `key`; a displaced previous page is returned so
    /// the caller can close it.
    fn insert(&mut self, key: &str, page: P) -> Option<P> {
        let now = Instant::now();
        let displaced = self.slots.insert(
            key.to_string(),
            PageSlot {
                page,
                state: PageState::InUse,
                created_at: now,
                last_used: now,
            },
        );
        if displaced.is_none() {
            self.order.push_back(key.to_string());
        }
        displaced.map(|slot| slot.page)
    }

    fn remove(&mut self, key: &str) -> Option<P> {
        let slot = self.slots.remove(key)?;
        self.order.retain(|k| k != key);
        Some(slot.page)
    }

    fn mark_crashed(&mut self, key: &str) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.state = PageState::Closed;
        }
    }

    /// Remove the oldest-created pages until at most `max` remain,
    /// returning them oldest first.
    fn take_oldest_over(&mut self, max: usize) -> Vec<(String, P)> {
        let mut evicted = Vec::new();
        while self.slots.len() > max {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&key) {
                evicted.push((key, slot.page));
            }
        }
        evicted
    }

    fn drain_all(&mut self) -> Vec<(String, P)> {
        self.order.clear();
        self.slots
            .drain()
            .map(|(key, slot)| (key, slot.page))
            .collect()
    }
}

/// Per-key capture mutexes. Entries are reclaimed once released by the
/// last holder, so the map does not grow with every key ever rendered.
#[derive(Default)]
pub(crate) struct KeyLockMap {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl KeyLockMap {
    fn acquire(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Remove the entry when the map holds the only reference; a waiter
    /// still holding a clone keeps it alive, and a later release by that
    /// waiter reclaims it.
    fn release(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) <= 1);
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

struct EngineState {
    browser: Option<Arc<AsyncMutex<Browser>>>,
    handler: Option<tokio::task::JoinHandle<()>>,
    status: EngineStatus,
    screenshots_since_restart: u32,
    last_restart: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub status: EngineStatus,
    pub live_pages: usize,
    pub screenshots_since_restart: u32,
    pub last_restart_age: Option<Duration>,
}

pub struct RenderSessionPool {
    engine: AsyncMutex<EngineState>,
    pages: Arc<std::sync::Mutex<PageRegistry<Page>>>,
    key_locks: KeyLockMap,
    config: Config,
    metrics: Arc<Metrics>,
}

impl RenderSessionPool {
    /// Create the pool and attempt the initial engine launch. A failed
    /// launch leaves the pool `Unavailable` rather than failing startup;
    /// the next `restart()` can recover it.
    pub async fn new(config: Config, metrics: Arc<Metrics>) -> Arc<Self> {
        let pool = Arc::new(Self {
            engine: AsyncMutex::new(EngineState {
                browser: None,
                handler: None,
                status: EngineStatus::Uninitialized,
                screenshots_since_restart: 0,
                last_restart: None,
            }),
            pages: Arc::new(std::sync::Mutex::new(PageRegistry::new())),
            key_locks: KeyLockMap::default(),
            config,
            metrics,
        });

        {
            let mut state = pool.engine.lock().await;
            if let Err(e) = pool.launch_engine(&mut state).await {
                error!("initial engine launch failed, pool unavailable: {e}");
            }
        }

        pool
    }

    /// Try every configured launch variant in order. Leaves the state
    /// `Healthy` on success, `Unavailable` after the list is exhausted.
    async fn launch_engine(&self, state: &mut EngineState) -> Result<(), RenderError> {
        for variant in launch_variants(&self.config) {
            let browser_config = match browser_config_for_variant(&self.config, &variant) {
                Ok(c) => c,
                Err(e) => {
                    warn!("launch variant '{}' misconfigured: {e}", variant.name);
                    continue;
                }
            };

            match Browser::launch(browser_config).await {
                Ok((mut browser, mut handler)) => {
                    // The handler drives CDP traffic and must be polled for
                    // the browser's whole lifetime.
                    let handler_task = tokio::spawn(async move {
                        while let Some(event) = handler.next().await {
                            if let Err(e) = event {
                                debug!("CDP handler error: {e}");
                            }
                        }
                        debug!("CDP handler stream ended");
                    });

                    // Liveness probe before committing to this instance.
                    match browser.version().await {
                        Ok(version) => {
                            info!(
                                "engine launched with variant '{}': {}",
                                variant.name,
                                version.product
                            );
                            state.browser = Some(Arc::new(AsyncMutex::new(browser)));
                            state.handler = Some(handler_task);
                            state.status = EngineStatus::Healthy;
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(
                                "launch variant '{}' failed version probe: {e}",
                                variant.name
                            );
                            let _ = browser.close().await;
                            handler_task.abort();
                        }
                    }
                }
                Err(e) => {
                    warn!("launch variant '{}' failed: {e}", variant.name);
                }
            }
        }

        error!("all launch variants failed, engine unavailable");
        state.browser = None;
        state.handler = None;
        state.status = EngineStatus::Unavailable;
        Err(RenderError::EngineUnavailable)
    }

    /// Return the live page for `key`, or create a hardened one from the
    /// current engine. Waits out an in-progress restart.
    pub async fn acquire_page(&self, key: &str) -> Result<Page, RenderError> {
        let browser = {
            let mut state = self.engine.lock().await;

            if state.status == EngineStatus::Uninitialized {
                // First use after a launch that never happened.
                self.launch_engine(&mut state).await?;
            }

            match state.status {
                EngineStatus::Healthy | EngineStatus::Degraded => state
                    .browser
                    .clone()
                    .ok_or(RenderError::EngineUnavailable)?,
                _ => return Err(RenderError::EngineUnavailable),
            }
        };

        if let Some(page) = self.pages.lock().unwrap().checkout(key) {
            debug!("reusing page for key {key}");
            return Ok(page);
        }

        let page = browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| RenderError::PageError(e.to_string()))?;

        self.harden_page(key, &page).await?;

        let displaced = self.pages.lock().unwrap().insert(key, page.clone());
        if let Some(old) = displaced {
            // One live handle per key: a replaced page gets closed.
            let _ = old.close().await;
        }
        self.metrics
            .set_live_pages(self.pages.lock().unwrap().len());

        debug!("created page for key {key}");
        Ok(page)
    }

    /// Viewport override, resource blocking for fonts, media and
    /// websockets, and crash deregistration.
    async fn harden_page(&self, key: &str, page: &Page) -> Result<(), RenderError> {
        let viewport = &self.config.viewport;
        let metrics_override = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(RenderError::PageError)?;
        page.execute(metrics_override)
            .await
            .map_err(|e| RenderError::PageError(e.to_string()))?;

        enable_resource_blocking(page).await?;

        // A crashed renderer leaves a dead handle; flag it so checkout
        // creates a replacement instead of reusing it.
        let mut crashes = page
            .event_listener::<EventTargetCrashed>()
            .await
            .map_err(|e| RenderError::PageError(e.to_string()))?;
        let registry = Arc::clone(&self.pages);
        let key = key.to_string();
        tokio::spawn(async move {
            if crashes.next().await.is_some() {
                warn!("page for key {key} crashed, deregistering");
                registry.lock().unwrap().mark_crashed(&key);
            }
        });

        Ok(())
    }

    /// Best-effort close; the registry entry is removed regardless of the
    /// close outcome, so release is idempotent.
    pub async fn release_page(&self, key: &str) {
        let page = self.pages.lock().unwrap().remove(key);
        if let Some(page) = page {
            if let Err(e) = page.close().await {
                warn!("error closing page for key {key}: {e}");
            }
        }
        self.metrics
            .set_live_pages(self.pages.lock().unwrap().len());
    }

    /// Close oldest-created pages first until at most `max_pages` remain.
    pub async fn evict_idle(&self, max_pages: usize) {
        let evicted = self.pages.lock().unwrap().take_oldest_over(max_pages);
        if evicted.is_empty() {
            return;
        }

        let count = evicted.len();
        for (key, page) in evicted {
            debug!("evicting idle page {key}");
            let _ = page.close().await;
        }
        self.metrics.record_eviction(count);
        self.metrics
            .set_live_pages(self.pages.lock().unwrap().len());
    }

    /// Restart when the screenshot counter hits its threshold or the
    /// liveness probe fails, unless a restart happened within the cooldown.
    pub async fn ensure_healthy(&self) {
        let (browser, counter, last_restart, status) = {
            let state = self.engine.lock().await;
            (
                state.browser.clone(),
                state.screenshots_since_restart,
                state.last_restart,
                state.status,
            )
        };

        if matches!(
            status,
            EngineStatus::Uninitialized | EngineStatus::Unavailable | EngineStatus::Restarting
        ) {
            return;
        }

        let counter_exceeded = counter >= self.config.screenshots_per_restart;
        let probe_failed = !counter_exceeded && self.probe_dead(browser).await;

        if !counter_exceeded && !probe_failed {
            return;
        }

        let cooled_down = last_restart
            .map(|t| t.elapsed() >= self.config.restart_cooldown)
            .unwrap_or(true);
        if !cooled_down {
            debug!("engine restart suppressed by cooldown");
            return;
        }

        if probe_failed {
            let mut state = self.engine.lock().await;
            state.status = EngineStatus::Degraded;
        }
        warn!(
            "restarting engine (screenshots since restart: {counter}, probe failed: {probe_failed})"
        );
        if let Err(e) = self.restart().await {
            error!("engine restart failed: {e}");
        }
    }

    async fn probe_dead(&self, browser: Option<Arc<AsyncMutex<Browser>>>) -> bool {
        match browser {
            None => true,
            Some(browser) => browser.lock().await.version().await.is_err(),
        }
    }

    /// Close every page (ignoring per-page errors), close the engine, wait
    /// briefly, then relaunch through the variant list. Holds the engine
    /// lock throughout so page acquisition blocks until the new instance is
    /// up — or until the pool is marked `Unavailable`.
    pub async fn restart(&self) -> Result<(), RenderError> {
        let mut state = self.engine.lock().await;
        state.status = EngineStatus::Restarting;

        let pages = self.pages.lock().unwrap().drain_all();
        for (key, page) in pages {
            if let Err(e) = page.close().await {
                debug!("ignoring close error for page {key} during restart: {e}");
            }
        }
        self.metrics.set_live_pages(0);

        if let Some(browser) = state.browser.take() {
            let _ = browser.lock().await.close().await;
        }
        if let Some(handler) = state.handler.take() {
            handler.abort();
        }

        sleep(self.config.relaunch_pause).await;

        let result = self.launch_engine(&mut state).await;
        state.screenshots_since_restart = 0;
        state.last_restart = Some(Instant::now());
        self.metrics.record_engine_restart();

        match &result {
            Ok(()) => info!("engine restarted"),
            Err(e) => error!("engine relaunch failed: {e}"),
        }
        result
    }

    /// Counts successful captures toward the proactive restart threshold.
    pub async fn record_screenshot(&self) {
        let mut state = self.engine.lock().await;
        state.screenshots_since_restart += 1;
    }

    /// Per-key capture mutex: concurrent captures for the same key await
    /// one in-flight render instead of racing the page map.
    pub fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.key_locks.acquire(key)
    }

    /// Reclaim the lock entry for `key` once no capture holds or awaits it.
    pub fn release_key_lock(&self, key: &str) {
        self.key_locks.release(key);
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.engine.lock().await;
        PoolStats {
            status: state.status,
            live_pages: self.pages.lock().unwrap().len(),
            screenshots_since_restart: state.screenshots_since_restart,
            last_restart_age: state.last_restart.map(|t| t.elapsed()),
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down render session pool");
        let mut state = self.engine.lock().await;

        let pages = self.pages.lock().unwrap().drain_all();
        for (_, page) in pages {
            let _ = page.close().await;
        }

        if let Some(browser) = state.browser.take() {
            let _ = browser.lock().await.close().await;
        }
        if let Some(handler) = state.handler.take() {
            handler.abort();
        }
        state.status = EngineStatus::Unavailable;
    }
}

/// Pure allow/deny decision for a paused network request. Fonts, media and
/// websockets never contribute to a rendered schedule and only cost memory.
pub fn should_block_resource(resource_type: &ResourceType) -> bool {
    matches!(
        resource_type,
        ResourceType::Font | ResourceType::Media | ResourceType::WebSocket
    )
}

/// Wire the decision function to the engine's request-pause events for one
/// page. The forwarding task ends on its own once the page goes away.
async fn enable_resource_blocking(page: &Page) -> Result<(), RenderError> {
    let mut events = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| RenderError::PageError(e.to_string()))?;

    page.execute(fetch::EnableParams::default())
        .await
        .map_err(|e| RenderError::PageError(e.to_string()))?;

    let page = page.clone();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let request_id = event.request_id.clone();
            let outcome = if should_block_resource(&event.resource_type) {
                page.execute(FailRequestParams::new(request_id, ErrorReason::Aborted))
                    .await
                    .map(|_| ())
            } else {
                page.execute(ContinueRequestParams::new(request_id))
                    .await
                    .map(|_| ())
            };
            if outcome.is_err() {
                break;
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_evicts_oldest_first() {
        let mut registry: PageRegistry<u32> = PageRegistry::new();
        for (i, key) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            registry.insert(key, i as u32);
        }

        let evicted = registry.take_oldest_over(3);
        let keys: Vec<_> = evicted.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(registry.len(), 3);

        assert!(registry.checkout("A").is_none());
        assert!(registry.checkout("C").is_some());
        assert!(registry.checkout("D").is_some());
        assert!(registry.checkout("E").is_some());
    }

    #[test]
    fn registry_never_exceeds_limit_after_eviction() {
        let mut registry: PageRegistry<u32> = PageRegistry::new();
        for i in 0..10 {
            registry.insert(&format!("key-{i}"), i);
        }
        registry.take_oldest_over(4);
        assert_eq!(registry.len(), 4);

        // Already under the limit: a no-op.
        assert!(registry.take_oldest_over(4).is_empty());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn registry_keeps_one_handle_per_key() {
        let mut registry: PageRegistry<u32> = PageRegistry::new();
        assert!(registry.insert("k", 1).is_none());
        let displaced = registry.insert("k", 2);
        assert_eq!(displaced, Some(1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.checkout("k"), Some(2));
    }

    #[test]
    fn registry_checkout_skips_closed_pages() {
        let mut registry: PageRegistry<u32> = PageRegistry::new();
        registry.insert("k", 1);
        registry.mark_crashed("k");
        assert!(registry.checkout("k").is_none());
        // The dead handle can still be removed for replacement.
        assert_eq!(registry.remove("k"), Some(1));
    }

    #[test]
    fn registry_remove_is_idempotent() {
        let mut registry: PageRegistry<u32> = PageRegistry::new();
        registry.insert("k", 1);
        assert_eq!(registry.remove("k"), Some(1));
        assert_eq!(registry.remove("k"), None);
    }

    #[test]
    fn registry_drain_clears_order() {
        let mut registry: PageRegistry<u32> = PageRegistry::new();
        registry.insert("a", 1);
        registry.insert("b", 2);
        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.len(), 0);

        // Insertion order restarts cleanly after a drain.
        registry.insert("c", 3);
        registry.insert("d", 4);
        let evicted = registry.take_oldest_over(1);
        assert_eq!(evicted[0].0, "c");
    }

    #[test]
    fn key_lock_entries_are_reclaimed_after_last_holder() {
        let map = KeyLockMap::default();

        let lock = map.acquire("k");
        let waiter = map.acquire("k");
        assert!(Arc::ptr_eq(&lock, &waiter));
        assert_eq!(map.len(), 1);

        // A release while another capture still holds the lock is a no-op.
        drop(lock);
        map.release("k");
        assert_eq!(map.len(), 1);

        drop(waiter);
        map.release("k");
        assert_eq!(map.len(), 0);

        // The next capture for the same key just creates a fresh entry.
        let _again = map.acquire("k");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn resource_blocking_decision() {
        assert!(should_block_resource(&ResourceType::Font));
        assert!(should_block_resource(&ResourceType::Media));
        assert!(should_block_resource(&ResourceType::WebSocket));
        assert!(!should_block_resource(&ResourceType::Document));
        assert!(!should_block_resource(&ResourceType::Stylesheet));
        assert!(!should_block_resource(&ResourceType::Image));
        assert!(!should_block_resource(&ResourceType::Xhr));
    }
}
