//! Bounded pool of browser engines and reusable execution contexts.
//!
//! Launching a browser process is expensive, so a small fixed set of engines
//! is kept alive and isolated contexts are layered on top of them. Contexts
//! are lent out through [`ContextLease`]; dropping a lease on any path hands
//! the context back (reset for reuse, or closed).
//!
//! `recycle()` bumps the pool generation: leases from an older generation are
//! closed on return instead of being pooled, and acquisitions made while the
//! rebuild is running fail with `PoolUnavailable`.

pub mod cdp;
pub mod chromium;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use chromium::{ChromiumLauncher, ChromiumSettings};
pub use watchdog::{ProcessProbe, ProcessUsage};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ScrapeError;

/// An isolated page context inside a browser engine.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    fn id(&self) -> &str;
    /// Navigate and wait until the document has loaded.
    async fn navigate(&self, url: &str) -> Result<()>;
    /// Evaluate a script expression and return its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;
    async fn content(&self) -> Result<String> {
        let html = self.evaluate("document.documentElement.outerHTML").await?;
        Ok(html.as_str().unwrap_or_default().to_string())
    }
    /// Heap bytes currently used by the page.
    async fn memory_usage(&self) -> Result<u64>;
    /// Return to a blank state so the context can be reused.
    async fn reset(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// One running browser process.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn is_alive(&self) -> bool;
    async fn new_context(&self) -> Result<Box<dyn ExecutionContext>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserEngine>>;

    /// Command-line marker carried by every process this launcher starts.
    fn process_marker(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub browser_instances: usize,
    pub contexts_per_browser: usize,
    pub max_context_uses: u32,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        PoolSettings {
            browser_instances: config.browser_instances.max(1),
            contexts_per_browser: config.contexts_per_browser.max(1),
            max_context_uses: config.max_context_uses.max(1),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
        }
    }

    pub fn capacity(&self) -> usize {
        self.browser_instances * self.contexts_per_browser
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolPhase {
    Stopped,
    Running,
    Recycling,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub phase: PoolPhase,
    pub generation: u64,
    pub engines_alive: usize,
    pub idle_contexts: usize,
    pub leased_contexts: usize,
    pub capacity: usize,
    pub total_acquired: u64,
    pub contexts_closed: u64,
    pub recycles: u64,
}

struct PooledContext {
    ctx: Box<dyn ExecutionContext>,
    uses: u32,
}

enum ContextSource {
    Idle(PooledContext),
    Engine(Arc<dyn BrowserEngine>),
    Relaunch {
        slot: usize,
        dead: Option<Arc<dyn BrowserEngine>>,
    },
}

struct PoolInner {
    phase: PoolPhase,
    generation: u64,
    engines: Vec<Option<Arc<dyn BrowserEngine>>>,
    idle: Vec<PooledContext>,
    next_engine: usize,
}

struct PoolShared {
    launcher: Arc<dyn BrowserLauncher>,
    settings: PoolSettings,
    inner: Mutex<PoolInner>,
    permits: Arc<Semaphore>,
    leased: AtomicUsize,
    total_acquired: AtomicU64,
    contexts_closed: AtomicU64,
    recycles: AtomicU64,
}

pub struct AsyncBrowserPool {
    shared: Arc<PoolShared>,
}

impl AsyncBrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, settings: PoolSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.capacity()));
        AsyncBrowserPool {
            shared: Arc::new(PoolShared {
                launcher,
                inner: Mutex::new(PoolInner {
                    phase: PoolPhase::Stopped,
                    generation: 0,
                    engines: Vec::new(),
                    idle: Vec::new(),
                    next_engine: 0,
                }),
                settings,
                permits,
                leased: AtomicUsize::new(0),
                total_acquired: AtomicU64::new(0),
                contexts_closed: AtomicU64::new(0),
                recycles: AtomicU64::new(0),
            }),
        }
    }

    /// Launch the engines. Idempotent while running.
    pub async fn setup(&self) -> Result<(), ScrapeError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.phase != PoolPhase::Stopped {
            return Ok(());
        }
        let engines = self.shared.launch_all().await?;
        info!("Browser pool up: {} engine(s)", engines.len());
        inner.engines = engines.into_iter().map(Some).collect();
        inner.phase = PoolPhase::Running;
        Ok(())
    }

    /// Close every idle context and engine. Outstanding leases are closed
    /// when they come back.
    pub async fn shutdown(&self) {
        let (idle, engines) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.phase == PoolPhase::Stopped {
                return;
            }
            inner.phase = PoolPhase::Stopped;
            inner.generation += 1;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.engines),
            )
        };
        self.shared.teardown(idle, engines).await;
        info!("Browser pool shut down");
    }

    /// Tear down all engines and contexts and rebuild from empty state.
    pub async fn recycle(&self) -> Result<(), ScrapeError> {
        let (idle, engines) = {
            let mut inner = self.shared.inner.lock().await;
            match inner.phase {
                PoolPhase::Stopped => {
                    return Err(ScrapeError::PoolUnavailable("pool is stopped".into()))
                }
                PoolPhase::Recycling => {
                    debug!("Recycle already in progress");
                    return Ok(());
                }
                PoolPhase::Running => {}
            }
            inner.phase = PoolPhase::Recycling;
            inner.generation += 1;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.engines),
            )
        };

        warn!(
            "Recycling browser pool ({} engines, {} idle contexts)",
            engines.iter().flatten().count(),
            idle.len()
        );
        self.shared.teardown(idle, engines).await;
        let launched = self.shared.launch_all().await;

        let mut inner = self.shared.inner.lock().await;
        if inner.phase != PoolPhase::Recycling {
            // Shut down while rebuilding; do not resurrect.
            drop(inner);
            if let Ok(engines) = launched {
                self.shared
                    .teardown(Vec::new(), engines.into_iter().map(Some).collect())
                    .await;
            }
            return Err(ScrapeError::PoolUnavailable("pool stopped during recycle".into()));
        }
        self.shared.recycles.fetch_add(1, Ordering::Relaxed);
        match launched {
            Ok(engines) => {
                inner.engines = engines.into_iter().map(Some).collect();
                inner.phase = PoolPhase::Running;
                info!("Browser pool recycled (generation {})", inner.generation);
                Ok(())
            }
            Err(e) => {
                // Engines relaunch lazily on the next acquisition.
                inner.engines = (0..self.shared.settings.browser_instances)
                    .map(|_| None)
                    .collect();
                inner.phase = PoolPhase::Running;
                error!("Browser relaunch after recycle failed: {}", e);
                Err(e)
            }
        }
    }

    /// Borrow a context. The lease returns it on drop.
    pub async fn get_context(&self) -> Result<ContextLease, ScrapeError> {
        let permit = tokio::time::timeout(
            self.shared.settings.acquire_timeout,
            Arc::clone(&self.shared.permits).acquire_owned(),
        )
        .await
        .map_err(|_| ScrapeError::PoolUnavailable("timed out waiting for a context".into()))?
        .map_err(|_| ScrapeError::PoolUnavailable("pool closed".into()))?;

        // Launches and CDP round-trips happen outside the pool lock.
        let (generation, source) = {
            let mut inner = self.shared.inner.lock().await;
            match inner.phase {
                PoolPhase::Running => {}
                PoolPhase::Recycling => {
                    return Err(ScrapeError::PoolUnavailable("pool is recycling".into()))
                }
                PoolPhase::Stopped => {
                    return Err(ScrapeError::PoolUnavailable("pool is stopped".into()))
                }
            }
            let source = match inner.idle.pop() {
                Some(pooled) => ContextSource::Idle(pooled),
                None => self.shared.pick_engine(&mut inner),
            };
            (inner.generation, source)
        };

        let pooled = match source {
            ContextSource::Idle(pooled) => pooled,
            ContextSource::Engine(engine) => self.shared.open_context(engine).await?,
            ContextSource::Relaunch { slot, dead } => {
                if let Some(dead) = dead {
                    warn!("Engine in slot {} died (pid {:?}), relaunching", slot, dead.pid());
                    if let Err(e) = dead.close().await {
                        debug!("Closing dead engine: {}", e);
                    }
                }
                let engine = self
                    .shared
                    .launcher
                    .launch()
                    .await
                    .map_err(|e| ScrapeError::Browser(e.context("browser relaunch failed")))?;
                let engine = self.shared.publish_engine(slot, generation, engine).await?;
                self.shared.open_context(engine).await?
            }
        };

        self.shared.leased.fetch_add(1, Ordering::SeqCst);
        self.shared.total_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(ContextLease {
            pooled: Some(pooled),
            generation,
            discard: false,
            shared: Arc::clone(&self.shared),
            permit: Some(permit),
        })
    }

    /// PIDs of the engine processes currently owned by the pool.
    pub async fn tracked_pids(&self) -> HashSet<u32> {
        let inner = self.shared.inner.lock().await;
        inner
            .engines
            .iter()
            .flatten()
            .filter_map(|e| e.pid())
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock().await;
        PoolStats {
            phase: inner.phase,
            generation: inner.generation,
            engines_alive: inner.engines.iter().flatten().filter(|e| e.is_alive()).count(),
            idle_contexts: inner.idle.len(),
            leased_contexts: self.shared.leased.load(Ordering::SeqCst),
            capacity: self.shared.settings.capacity(),
            total_acquired: self.shared.total_acquired.load(Ordering::Relaxed),
            contexts_closed: self.shared.contexts_closed.load(Ordering::Relaxed),
            recycles: self.shared.recycles.load(Ordering::Relaxed),
        }
    }
}

impl PoolShared {
    async fn launch_all(&self) -> Result<Vec<Arc<dyn BrowserEngine>>, ScrapeError> {
        let mut engines: Vec<Arc<dyn BrowserEngine>> = Vec::new();
        for _ in 0..self.settings.browser_instances {
            match self.launcher.launch().await {
                Ok(engine) => engines.push(engine),
                Err(e) => {
                    for engine in engines {
                        if let Err(close_err) = engine.close().await {
                            warn!("Failed to close engine after launch error: {}", close_err);
                        }
                    }
                    return Err(ScrapeError::Browser(e.context("browser launch failed")));
                }
            }
        }
        Ok(engines)
    }

    /// Round-robin over engine slots. A dead engine is taken out of its slot
    /// so only one caller relaunches it.
    fn pick_engine(&self, inner: &mut PoolInner) -> ContextSource {
        if inner.engines.is_empty() {
            inner.engines = (0..self.settings.browser_instances).map(|_| None).collect();
        }
        let slot = inner.next_engine % inner.engines.len();
        inner.next_engine = inner.next_engine.wrapping_add(1);

        match inner.engines[slot].take() {
            Some(engine) if engine.is_alive() => {
                inner.engines[slot] = Some(Arc::clone(&engine));
                ContextSource::Engine(engine)
            }
            dead => ContextSource::Relaunch { slot, dead },
        }
    }

    /// Install a relaunched engine, unless the pool moved on meanwhile or
    /// another caller already filled the slot.
    async fn publish_engine(
        &self,
        slot: usize,
        generation: u64,
        engine: Arc<dyn BrowserEngine>,
    ) -> Result<Arc<dyn BrowserEngine>, ScrapeError> {
        let outcome = {
            let mut inner = self.inner.lock().await;
            if inner.phase != PoolPhase::Running
                || inner.generation != generation
                || slot >= inner.engines.len()
            {
                Err(ScrapeError::PoolUnavailable("pool changed during relaunch".into()))
            } else {
                match &inner.engines[slot] {
                    Some(current) if current.is_alive() => Ok(Some(Arc::clone(current))),
                    _ => {
                        inner.engines[slot] = Some(Arc::clone(&engine));
                        Ok(None)
                    }
                }
            }
        };

        match outcome {
            Ok(None) => Ok(engine),
            Ok(Some(current)) => {
                debug!("Slot {} already relaunched, closing extra engine", slot);
                self.close_engine(engine).await;
                Ok(current)
            }
            Err(e) => {
                self.close_engine(engine).await;
                Err(e)
            }
        }
    }

    async fn open_context(&self, engine: Arc<dyn BrowserEngine>) -> Result<PooledContext, ScrapeError> {
        let ctx = engine.new_context().await.map_err(ScrapeError::Browser)?;
        debug!("Opened context {}", ctx.id());
        Ok(PooledContext { ctx, uses: 0 })
    }

    async fn close_engine(&self, engine: Arc<dyn BrowserEngine>) {
        if let Err(e) = engine.close().await {
            warn!("Failed to close engine (pid {:?}): {}", engine.pid(), e);
        }
    }

    async fn release(&self, mut pooled: PooledContext, generation: u64, discard: bool) {
        pooled.uses += 1;
        let reusable = !discard && pooled.uses < self.settings.max_context_uses && {
            let inner = self.inner.lock().await;
            inner.phase == PoolPhase::Running && inner.generation == generation
        };

        if reusable {
            match pooled.ctx.reset().await {
                Ok(()) => {
                    let mut inner = self.inner.lock().await;
                    if inner.phase == PoolPhase::Running && inner.generation == generation {
                        inner.idle.push(pooled);
                        self.leased.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                }
                Err(e) => debug!("Context {} failed to reset: {}", pooled.ctx.id(), e),
            }
        }

        self.close_context(pooled.ctx).await;
        self.leased.fetch_sub(1, Ordering::SeqCst);
    }

    async fn close_context(&self, ctx: Box<dyn ExecutionContext>) {
        if let Err(e) = ctx.close().await {
            debug!("Closing context {}: {}", ctx.id(), e);
        }
        self.contexts_closed.fetch_add(1, Ordering::Relaxed);
    }

    async fn teardown(
        &self,
        idle: Vec<PooledContext>,
        engines: Vec<Option<Arc<dyn BrowserEngine>>>,
    ) {
        for pooled in idle {
            self.close_context(pooled.ctx).await;
        }
        for engine in engines.into_iter().flatten() {
            self.close_engine(engine).await;
        }
    }
}

/// Scoped ownership of one pooled context.
pub struct ContextLease {
    pooled: Option<PooledContext>,
    generation: u64,
    discard: bool,
    shared: Arc<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ContextLease {
    pub fn context(&self) -> &dyn ExecutionContext {
        &**self
    }

    /// Close the context on return instead of pooling it.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Return the context and wait for the hand-back to finish.
    pub async fn release(mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.shared.release(pooled, self.generation, self.discard).await;
        }
        self.permit.take();
    }
}

impl Deref for ContextLease {
    type Target = dyn ExecutionContext;

    fn deref(&self) -> &Self::Target {
        &*self
            .pooled
            .as_ref()
            .expect("lease holds its context until dropped")
            .ctx
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let permit = self.permit.take();
        let (generation, discard) = (self.generation, self.discard);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shared.release(pooled, generation, discard).await;
                    drop(permit);
                });
            }
            Err(_) => {
                // No runtime left to close it; the context's own drop cleans up.
                shared.leased.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLauncher;
    use super::*;

    fn settings(instances: usize, per_browser: usize) -> PoolSettings {
        PoolSettings {
            browser_instances: instances,
            contexts_per_browser: per_browser,
            max_context_uses: 100,
            acquire_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_get_context_before_setup_fails() {
        let pool = AsyncBrowserPool::new(Arc::new(FakeLauncher::new()), settings(1, 1));
        assert!(matches!(
            pool.get_context().await,
            Err(ScrapeError::PoolUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_release_cycles_do_not_leak() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = AsyncBrowserPool::new(launcher.clone(), settings(2, 2));
        pool.setup().await.unwrap();

        for _ in 0..50 {
            let a = pool.get_context().await.unwrap();
            let b = pool.get_context().await.unwrap();
            a.navigate("https://example.com").await.unwrap();
            a.release().await;
            drop(b);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(launcher.engines_launched(), 2);
        assert!(launcher.open_contexts() <= 4, "open contexts: {}", launcher.open_contexts());
        let stats = pool.stats().await;
        assert_eq!(stats.leased_contexts, 0);
        assert_eq!(stats.total_acquired, 100);
        assert_eq!(pool.tracked_pids().await.len(), 2);
    }

    #[tokio::test]
    async fn test_context_is_closed_on_error_path() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = AsyncBrowserPool::new(launcher.clone(), settings(1, 1));
        pool.setup().await.unwrap();

        async fn failing_scrape(pool: &AsyncBrowserPool) -> Result<(), ScrapeError> {
            let mut lease = pool.get_context().await?;
            lease.discard();
            lease
                .navigate("https://fail.invalid")
                .await
                .map_err(ScrapeError::Browser)?;
            Ok(())
        }
        assert!(failing_scrape(&pool).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(launcher.open_contexts(), 0);
        // The single slot is free again.
        let lease = pool.get_context().await.unwrap();
        lease.release().await;
    }

    #[tokio::test]
    async fn test_capacity_bounds_concurrent_leases() {
        let pool = AsyncBrowserPool::new(Arc::new(FakeLauncher::new()), settings(1, 2));
        pool.setup().await.unwrap();
        let _a = pool.get_context().await.unwrap();
        let _b = pool.get_context().await.unwrap();
        assert!(matches!(
            pool.get_context().await,
            Err(ScrapeError::PoolUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_contexts_retire_after_max_uses() {
        let launcher = Arc::new(FakeLauncher::new());
        let mut s = settings(1, 1);
        s.max_context_uses = 2;
        let pool = AsyncBrowserPool::new(launcher.clone(), s);
        pool.setup().await.unwrap();

        for _ in 0..4 {
            pool.get_context().await.unwrap().release().await;
        }
        assert_eq!(launcher.contexts_created(), 2);
        assert_eq!(pool.stats().await.contexts_closed, 2);
    }

    #[tokio::test]
    async fn test_recycle_rebuilds_and_closes_stale_leases() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = AsyncBrowserPool::new(launcher.clone(), settings(1, 2));
        pool.setup().await.unwrap();
        let before = pool.tracked_pids().await;

        let stale = pool.get_context().await.unwrap();
        pool.get_context().await.unwrap().release().await;

        pool.recycle().await.unwrap();
        let after = pool.tracked_pids().await;
        assert_eq!(after.len(), 1);
        assert!(before.is_disjoint(&after));
        assert_eq!(launcher.engines_closed(), 1);

        stale.release().await;
        let stats = pool.stats().await;
        assert_eq!(stats.idle_contexts, 0, "stale context must not be pooled");
        assert_eq!(stats.recycles, 1);
        assert_eq!(launcher.open_contexts(), 0);
    }

    #[tokio::test]
    async fn test_acquire_during_recycle_is_rejected() {
        let launcher = Arc::new(FakeLauncher::with_launch_delay(Duration::from_millis(100)));
        let pool = Arc::new(AsyncBrowserPool::new(launcher, settings(1, 2)));
        pool.setup().await.unwrap();

        let recycling = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.recycle().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            pool.get_context().await,
            Err(ScrapeError::PoolUnavailable(_))
        ));

        recycling.await.unwrap().unwrap();
        assert!(pool.get_context().await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_engine_is_relaunched() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = AsyncBrowserPool::new(launcher.clone(), settings(1, 1));
        pool.setup().await.unwrap();
        launcher.kill_all();

        let lease = pool.get_context().await.unwrap();
        lease.release().await;
        assert_eq!(launcher.engines_launched(), 2);
    }

    #[tokio::test]
    async fn test_relaunch_does_not_block_other_callers() {
        let launcher = Arc::new(FakeLauncher::with_launch_delay(Duration::from_millis(300)));
        let mut s = settings(1, 2);
        s.acquire_timeout = Duration::from_secs(2);
        let pool = Arc::new(AsyncBrowserPool::new(launcher.clone(), s));
        pool.setup().await.unwrap();
        pool.get_context().await.unwrap().release().await;

        let held = pool.get_context().await.unwrap();
        launcher.kill_all();
        let relaunching = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_context().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let quick = Duration::from_millis(100);
        assert!(tokio::time::timeout(quick, pool.tracked_pids()).await.is_ok());
        assert!(tokio::time::timeout(quick, pool.stats()).await.is_ok());

        // A context handed back mid-relaunch is immediately reusable.
        held.release().await;
        let reused = tokio::time::timeout(quick, pool.get_context()).await;
        assert!(matches!(reused, Ok(Ok(_))));

        assert!(relaunching.await.unwrap().is_ok());
        assert_eq!(launcher.engines_launched(), 2);
        assert_eq!(pool.tracked_pids().await.len(), 1);
    }
}
