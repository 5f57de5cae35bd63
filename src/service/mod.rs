//! Orchestration service: admission, worker loops, health monitor.
//!
//! ```text
//! submit_task -> AsyncScheduler -> worker -> pool lease -> adapter
//!                                      \-> ScrapeCache / ReliabilityTracker / HealthGrader
//! monitor: stall check -> recovery (pool recycle), degradation, orphan sweep
//! ```

pub mod runtime;

pub use runtime::RuntimeState;

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::adapter::{AdapterRegistry, MatchAdapter, MatchRecord, MatchStatus};
use crate::browser::{AsyncBrowserPool, BrowserLauncher, PoolSettings, PoolStats, ProcessProbe, ProcessUsage};
use crate::cache::{CacheBackend, ScrapeCache};
use crate::config::Config;
use crate::context::{ContextSettings, ContextSnapshot, MemoryVerdict, ScraperContext};
use crate::error::ScrapeError;
use crate::health::{HealthGrader, HealthSettings, HealthSummary, ResourceUsage};
use crate::resilience::{CallError, CircuitBreaker, CircuitBreakerStats, ReliabilityTracker, RetryPolicy};
use crate::scheduler::{Admission, AsyncScheduler, Priority, ScrapeTask};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub concurrency_cap: usize,
    pub monitor_interval: Duration,
    pub scrape_timeout: Duration,
    pub stop_timeout: Duration,
    pub reliability_window: usize,
    pub max_memory_restarts: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_timeout: Duration,
    pub context: ContextSettings,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        ServiceSettings {
            concurrency_cap: config.concurrency_cap.max(1),
            monitor_interval: Duration::from_secs(config.monitor_interval_secs.max(1)),
            scrape_timeout: Duration::from_secs(config.scrape_timeout_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            reliability_window: config.reliability_window,
            max_memory_restarts: config.max_memory_restarts,
            breaker_failure_threshold: config.breaker_failure_threshold,
            breaker_success_threshold: config.breaker_success_threshold,
            breaker_timeout: config.breaker_timeout(),
            context: ContextSettings::from_config(config),
        }
    }
}

/// What happened to one task.
#[derive(Debug)]
enum TaskOutcome {
    Scraped { finished: bool, restart: bool },
    NotFound,
    NegativeCached,
    AlreadyActive,
    CircuitOpen(String),
    Failed(ScrapeError),
}

/// Status projection for the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub health: HealthSummary,
    pub queue_depth: usize,
    pub max_queue_size: usize,
    pub in_flight: usize,
    pub pool: PoolStats,
    pub breakers: Vec<CircuitBreakerStats>,
    pub reliability: BTreeMap<String, f64>,
    pub active: Vec<ContextSnapshot>,
}

pub struct OrchestrationService {
    settings: ServiceSettings,
    scheduler: Arc<AsyncScheduler>,
    pool: Arc<AsyncBrowserPool>,
    cache: ScrapeCache,
    health: Arc<HealthGrader>,
    adapters: AdapterRegistry,
    retry: RetryPolicy,
    runtime: Arc<RuntimeState>,
    probe: Arc<ProcessProbe>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    reliability: Mutex<HashMap<String, ReliabilityTracker>>,
    usage: Mutex<ProcessUsage>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl OrchestrationService {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn BrowserLauncher>,
        cache_backend: Arc<dyn CacheBackend>,
        adapters: AdapterRegistry,
    ) -> Self {
        let marker = launcher.process_marker();
        OrchestrationService {
            settings: ServiceSettings::from_config(config),
            scheduler: Arc::new(AsyncScheduler::new(
                config.max_queue_size,
                config.rate_limit_burst,
                config.rate_limit_tokens_per_sec,
            )),
            pool: Arc::new(AsyncBrowserPool::new(launcher, PoolSettings::from_config(config))),
            cache: ScrapeCache::new(
                cache_backend,
                Duration::from_secs(config.snapshot_ttl_secs),
                Duration::from_secs(config.negative_ttl_secs),
                Duration::from_secs(config.freshness_ttl_secs),
            ),
            health: Arc::new(HealthGrader::new(HealthSettings::from_config(config))),
            adapters,
            retry: RetryPolicy::from_config(config),
            runtime: Arc::new(RuntimeState::new()),
            probe: Arc::new(ProcessProbe::new(marker)),
            breakers: Mutex::new(HashMap::new()),
            reliability: Mutex::new(HashMap::new()),
            usage: Mutex::new(ProcessUsage::default()),
            handles: tokio::sync::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn scheduler(&self) -> &Arc<AsyncScheduler> {
        &self.scheduler
    }

    pub fn health(&self) -> &Arc<HealthGrader> {
        &self.health
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    pub fn cache(&self) -> &ScrapeCache {
        &self.cache
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// Admit a scrape for `match_id`. Priority follows the last cached
    /// status of the match.
    pub async fn submit_task(&self, match_id: &str, url: &str) -> bool {
        self.submit(match_id, url, None).await.is_accepted()
    }

    pub async fn submit_task_with_priority(
        &self,
        match_id: &str,
        url: &str,
        priority: Priority,
    ) -> bool {
        self.submit(match_id, url, Some(priority)).await.is_accepted()
    }

    /// Full admission outcome.
    pub async fn submit(&self, match_id: &str, url: &str, priority: Option<Priority>) -> Admission {
        if match_id.trim().is_empty() {
            warn!("Rejected task with empty match id");
            return Admission::Invalid;
        }
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                warn!("[{}] Rejected task: invalid url {:?}: {}", match_id, url, e);
                return Admission::Invalid;
            }
        };
        if self.adapters.resolve(&parsed).is_none() {
            warn!("[{}] Rejected task: no adapter for {}", match_id, url);
            return Admission::Invalid;
        }
        let priority = match priority {
            Some(p) => p,
            None => self.derive_priority(match_id).await,
        };
        let admission = self.scheduler.admit(match_id, url, priority);
        if admission.is_accepted() {
            debug!("[{}] Queued ({:?})", match_id, priority);
        }
        admission
    }

    async fn derive_priority(&self, match_id: &str) -> Priority {
        let snapshot = match self.cache.get_snapshot(match_id).await {
            Ok(s) => s,
            Err(e) => {
                debug!("[{}] Snapshot lookup failed: {}", match_id, e);
                None
            }
        };
        let status = snapshot
            .and_then(|s| s.get("status").cloned())
            .and_then(|v| serde_json::from_value::<MatchStatus>(v).ok());
        match status {
            Some(s) if s.is_live() => Priority::Live,
            Some(MatchStatus::NotStarted) => Priority::Imminent,
            _ => Priority::Other,
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Connect the cache, launch the pool, then spawn workers and the monitor.
    pub async fn start(self: &Arc<Self>) -> Result<(), ScrapeError> {
        if self.scheduler.is_shutdown() {
            return Err(ScrapeError::ShuttingDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.init_resources().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.settings.concurrency_cap {
            let svc = Arc::clone(self);
            handles.push(tokio::spawn(async move { svc.worker_loop(worker_id).await }));
        }
        let svc = Arc::clone(self);
        let shutdown = self.runtime.subscribe_shutdown();
        handles.push(tokio::spawn(async move { svc.monitor_loop(shutdown).await }));

        info!(
            "Orchestration service started: {} workers, adapters {:?}",
            self.settings.concurrency_cap,
            self.adapters.names()
        );
        self.health.add_audit_log(
            "service_started",
            json!({ "workers": self.settings.concurrency_cap }),
        );
        Ok(())
    }

    async fn init_resources(&self) -> Result<(), ScrapeError> {
        self.cache.ping().await?;
        self.pool.setup().await
    }

    /// Stop admitting work, wait for in-flight tasks up to the stop timeout,
    /// then release the pool and flush expired cache rows.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping orchestration service");
        self.runtime.signal_shutdown();
        self.scheduler.shutdown();
        for ctx in self.runtime.contexts() {
            ctx.request_shutdown("service stopping");
        }

        let drained = self.scheduler.drain(self.settings.stop_timeout).await;
        if !drained {
            warn!(
                "{} task(s) still running after {:?}, treating as stuck",
                self.scheduler.in_flight(),
                self.settings.stop_timeout
            );
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if drained {
                if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                    debug!("Background task did not exit in time");
                }
            } else {
                handle.abort();
            }
        }

        self.pool.shutdown().await;
        match self.cache.purge_expired().await {
            Ok(n) => debug!("Purged {} expired cache entries on shutdown", n),
            Err(e) => warn!("Cache purge on shutdown failed: {}", e),
        }
        self.health.add_audit_log("service_stopped", json!({ "drained": drained }));
        info!("Orchestration service stopped");
    }

    // ── Workers ────────────────────────────────────────────────────────────

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("Worker {} started", worker_id);
        while let Some(task) = self.scheduler.next_task().await {
            let outcome = self.execute(&task).await;
            self.scheduler.task_done(&task);
            match &outcome {
                TaskOutcome::Scraped { finished: true, .. } => {
                    info!("[{}] Match finished, tracking stopped", task.match_id)
                }
                TaskOutcome::CircuitOpen(adapter) => {
                    debug!("[{}] Not attempted: circuit open for {}", task.match_id, adapter)
                }
                TaskOutcome::Failed(e) => {
                    debug!("[{}] Worker {} gave up: {}", task.match_id, worker_id, e)
                }
                other => debug!("[{}] Worker {} done: {:?}", task.match_id, worker_id, other),
            }
        }
        debug!("Worker {} exiting", worker_id);
    }

    async fn execute(&self, task: &ScrapeTask) -> TaskOutcome {
        let ctx = Arc::new(ScraperContext::new(
            &task.match_id,
            &task.url,
            self.settings.context.clone(),
        ));
        if !self.runtime.register(Arc::clone(&ctx)) {
            debug!("[{}] Already being scraped, dropping duplicate", task.match_id);
            return TaskOutcome::AlreadyActive;
        }
        let outcome = self.run_task(task, &ctx).await;
        if let TaskOutcome::Scraped { restart: true, .. } = outcome {
            self.schedule_restart(task, ctx);
        } else {
            self.runtime.unregister(&task.match_id);
        }
        outcome
    }

    /// The over-limit context stays registered through the grace period, so
    /// the match is not scraped twice; then it is shut down and the task
    /// goes back in line.
    fn schedule_restart(&self, task: &ScrapeTask, ctx: Arc<ScraperContext>) {
        let reason = ctx.restart_reason().unwrap_or_default();
        if task.restarts >= self.settings.max_memory_restarts {
            warn!(
                "[{}] Dropping task after {} memory restart(s): {}",
                task.match_id, task.restarts, reason
            );
            self.health.add_audit_log(
                "restart_limit_reached",
                json!({ "match_id": task.match_id, "restarts": task.restarts, "reason": reason }),
            );
            self.runtime.unregister(&task.match_id);
            return;
        }

        info!(
            "[{}] Restarting in a fresh context after {:?} ({})",
            task.match_id, ctx.settings.memory_restart_grace, reason
        );
        self.health.add_audit_log(
            "memory_restart",
            json!({ "match_id": task.match_id, "restarts": task.restarts + 1, "reason": reason }),
        );

        let mut next = task.clone();
        next.restarts += 1;
        let scheduler = Arc::clone(&self.scheduler);
        let active = Arc::clone(&self.runtime);
        let stopping = self.runtime.subscribe_shutdown();
        tokio::spawn(async move {
            let stopped = tokio::select! {
                _ = ctx.graceful_shutdown() => false,
                _ = runtime::shutdown_signalled(stopping) => true,
            };
            active.unregister(&next.match_id);
            if stopped {
                return;
            }
            let admission = scheduler.requeue(next.clone());
            if !admission.is_accepted() {
                warn!("[{}] Restart not queued: {:?}", next.match_id, admission);
            }
        });
    }

    async fn run_task(&self, task: &ScrapeTask, ctx: &Arc<ScraperContext>) -> TaskOutcome {
        match self.cache.is_negative_cached(&task.match_id).await {
            Ok(true) => {
                debug!("[{}] Negative-cached, skipping", task.match_id);
                return TaskOutcome::NegativeCached;
            }
            Ok(false) => {}
            Err(e) => debug!("[{}] Negative-cache lookup failed: {}", task.match_id, e),
        }

        let adapter = match Url::parse(&task.url).ok().and_then(|u| self.adapters.resolve(&u)) {
            Some(a) => a,
            None => {
                let err = ScrapeError::Adapter {
                    adapter: "none".to_string(),
                    source: anyhow!("no adapter supports {}", task.url),
                };
                return self.record_failure(task, "none", err);
            }
        };
        let name = adapter.name().to_string();
        let breaker = self.breaker_for(&name);

        let result = breaker
            .call(|| {
                self.retry
                    .run_transient(|| self.scrape_once(adapter.as_ref(), task, ctx))
            })
            .await;

        match result {
            Ok(Some(record)) => self.record_scrape(task, ctx, &name, record).await,
            Ok(None) => {
                info!("[{}] No match data at {}", task.match_id, task.url);
                if let Err(e) = self.cache.set_negative_cache(&task.match_id, None).await {
                    warn!("[{}] Failed to write negative cache: {}", task.match_id, e);
                }
                self.record_success(&name);
                TaskOutcome::NotFound
            }
            Err(CallError::Open) => TaskOutcome::CircuitOpen(name),
            Err(CallError::Failed(ScrapeError::ShuttingDown)) => {
                TaskOutcome::Failed(ScrapeError::ShuttingDown)
            }
            Err(CallError::Failed(e)) => self.record_failure(task, &name, e),
        }
    }

    /// One attempt: lease a context, run the adapter, sample memory.
    async fn scrape_once(
        &self,
        adapter: &dyn MatchAdapter,
        task: &ScrapeTask,
        ctx: &Arc<ScraperContext>,
    ) -> Result<Option<MatchRecord>, ScrapeError> {
        if ctx.is_shutdown_requested() {
            return Err(ScrapeError::ShuttingDown);
        }
        let mut lease = self.pool.get_context().await?;

        let fetched = tokio::time::timeout(
            self.settings.scrape_timeout,
            adapter.fetch_match(lease.context(), &task.url),
        )
        .await;

        match lease.memory_usage().await {
            Ok(bytes) => {
                if ctx.update_memory(bytes) == MemoryVerdict::RestartScheduled {
                    lease.discard();
                }
            }
            Err(e) => debug!("[{}] Memory probe failed: {}", task.match_id, e),
        }

        let result = match fetched {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(e)) => {
                lease.discard();
                Err(ScrapeError::Adapter {
                    adapter: adapter.name().to_string(),
                    source: e,
                })
            }
            Err(_) => {
                lease.discard();
                Err(ScrapeError::Adapter {
                    adapter: adapter.name().to_string(),
                    source: anyhow!("scrape timed out after {:?}", self.settings.scrape_timeout),
                })
            }
        };
        lease.release().await;
        result
    }

    async fn record_scrape(
        &self,
        task: &ScrapeTask,
        ctx: &Arc<ScraperContext>,
        adapter: &str,
        record: MatchRecord,
    ) -> TaskOutcome {
        if record.source_url != task.url {
            self.health.record_reconciliation_warning(&format!(
                "match {}: adapter {} reported source_url {} but fetched {}",
                task.match_id, adapter, record.source_url, task.url
            ));
        }

        match record.to_value() {
            Ok(value) => {
                if let Err(e) = self.cache.set_snapshot(&task.match_id, &value, None).await {
                    error!("[{}] Failed to store snapshot: {}", task.match_id, e);
                }
            }
            Err(e) => error!("[{}] Unserializable record: {}", task.match_id, e),
        }

        let now = Utc::now();
        let since = match self.cache.last_scraped_at(&task.match_id).await {
            Ok(Some(prev)) => prev,
            _ => task.enqueue_time,
        };
        let age = (now - since).num_milliseconds().max(0) as f64 / 1000.0;
        self.health.record_freshness(age);
        if let Err(e) = self.cache.mark_fresh(&task.match_id, now).await {
            warn!("[{}] Failed to mark fresh: {}", task.match_id, e);
        }

        self.record_success(adapter);
        info!("[{}] Scraped via {} (data age {:.1}s)", task.match_id, adapter, age);

        let finished = record.status == Some(MatchStatus::Finished);
        if finished {
            if let Err(e) = self.cache.archive_match(&task.match_id).await {
                warn!("[{}] Failed to archive: {}", task.match_id, e);
            }
            self.health
                .add_audit_log("match_archived", json!({ "match_id": task.match_id }));
        }
        TaskOutcome::Scraped {
            finished,
            restart: ctx.restart_requested() && !finished,
        }
    }

    fn record_success(&self, adapter: &str) {
        self.lock_reliability()
            .entry(adapter.to_string())
            .or_insert_with(|| ReliabilityTracker::new(self.settings.reliability_window))
            .record_success();
        self.health.record_success();
    }

    fn record_failure(&self, task: &ScrapeTask, adapter: &str, err: ScrapeError) -> TaskOutcome {
        error!("[{}] Scrape failed: {}", task.match_id, err);
        self.lock_reliability()
            .entry(adapter.to_string())
            .or_insert_with(|| ReliabilityTracker::new(self.settings.reliability_window))
            .record_failure();
        self.health.record_failure();
        self.health.add_audit_log(
            "scrape_failed",
            json!({ "match_id": task.match_id, "adapter": adapter, "error": err.to_string() }),
        );
        TaskOutcome::Failed(err)
    }

    fn breaker_for(&self, adapter: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(adapter.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                adapter,
                self.settings.breaker_failure_threshold,
                self.settings.breaker_success_threshold,
                self.settings.breaker_timeout,
            ))
        }))
    }

    /// Lowest adapter score; 100 before any outcome is known.
    pub fn reliability_score(&self) -> f64 {
        self.lock_reliability()
            .values()
            .map(ReliabilityTracker::get_score)
            .fold(100.0, f64::min)
    }

    fn lock_reliability(&self) -> MutexGuard<'_, HashMap<String, ReliabilityTracker>> {
        self.reliability.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Monitor ────────────────────────────────────────────────────────────

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.monitor_tick().await;
        }
        debug!("Monitor loop exiting");
    }

    /// One monitor pass: stall check, recovery, degradation, process probe,
    /// expired cache entries.
    pub(crate) async fn monitor_tick(&self) {
        let busy = self.scheduler.qsize() > 0 || self.runtime.active_matches() > 0;
        if busy {
            self.health.check_stall();
        } else {
            self.health.note_idle();
        }

        if self.health.should_trigger_recovery() {
            self.health.record_recovery_attempt();
            warn!("Recovery triggered: recycling browser pool");
            match self.pool.recycle().await {
                Ok(()) => self.health.add_audit_log("pool_recycled", json!({})),
                Err(e) => {
                    error!("Pool recycle failed: {}", e);
                    self.health
                        .add_audit_log("pool_recycle_failed", json!({ "error": e.to_string() }));
                }
            }
        }

        self.health.evaluate_degradation(self.reliability_score());
        self.probe_processes().await;

        match self.cache.purge_expired().await {
            Ok(0) => {}
            Ok(n) => debug!("Purged {} expired cache entries", n),
            Err(e) => warn!("Cache purge failed: {}", e),
        }
    }

    async fn probe_processes(&self) {
        let tracked = self.pool.tracked_pids().await;
        let probe = Arc::clone(&self.probe);
        let result = tokio::task::spawn_blocking(move || {
            // Our own children are never orphans, even mid-launch.
            let mut owned: HashSet<u32> = tracked.clone();
            owned.insert(std::process::id());
            let killed = probe.sweep_orphans(&owned);
            (killed, probe.usage(&tracked))
        })
        .await;

        match result {
            Ok((killed, usage)) => {
                if !killed.is_empty() {
                    self.health
                        .add_audit_log("orphans_killed", json!({ "pids": killed }));
                }
                *self.usage.lock().unwrap_or_else(PoisonError::into_inner) = usage;
            }
            Err(e) => warn!("Process probe failed: {}", e),
        }
    }

    // ── Status ─────────────────────────────────────────────────────────────

    pub fn summary(&self) -> HealthSummary {
        let usage = *self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        self.health.get_summary(ResourceUsage {
            pids_count: usage.pids_count,
            memory_usage_mb: usage.memory_bytes as f64 / (1024.0 * 1024.0),
            active_matches: self.runtime.active_matches(),
        })
    }

    pub async fn status(&self) -> ServiceStatus {
        let breakers: Vec<CircuitBreakerStats> = {
            let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
            let mut stats: Vec<_> = map.values().map(|b| b.stats()).collect();
            stats.sort_by(|a, b| a.name.cmp(&b.name));
            stats
        };
        let reliability = self
            .lock_reliability()
            .iter()
            .map(|(name, tracker)| (name.clone(), tracker.get_score()))
            .collect();
        ServiceStatus {
            health: self.summary(),
            queue_depth: self.scheduler.qsize(),
            max_queue_size: self.scheduler.max_queue_size(),
            in_flight: self.scheduler.in_flight(),
            pool: self.pool.stats().await,
            breakers,
            reliability,
            active: self.runtime.snapshots(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::FakeLauncher;
    use crate::cache::MemoryBackend;
    use crate::health::HealthState;
    use crate::resilience::CircuitState;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use crate::browser::ExecutionContext;

    type Behaviour = dyn Fn(&str) -> Result<Option<MatchRecord>> + Send + Sync;

    struct ScriptedAdapter {
        calls: AtomicUsize,
        behaviour: Box<Behaviour>,
    }

    impl ScriptedAdapter {
        fn new(f: impl Fn(&str) -> Result<Option<MatchRecord>> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(ScriptedAdapter {
                calls: AtomicUsize::new(0),
                behaviour: Box::new(f),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MatchAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports(&self, url: &Url) -> bool {
            url.scheme() == "https"
        }

        async fn fetch_match(
            &self,
            ctx: &dyn ExecutionContext,
            url: &str,
        ) -> Result<Option<MatchRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.navigate(url).await?;
            (self.behaviour)(url)
        }
    }

    fn live_record(url: &str, status: MatchStatus) -> Result<Option<MatchRecord>> {
        Ok(Some(
            MatchRecord::new("scripted", url)
                .with_status(Some(status))
                .with_field("home_score", json!(1)),
        ))
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config
            .set_concurrency_cap(2)
            .set_staleness_threshold_seconds(60.0)
            .set_pause_cooldown(0.0);
        config.retry_max_attempts = 1;
        config.retry_base_delay_secs = 0.01;
        config.retry_jitter_secs = 0.0;
        config.acquire_timeout_secs = 2;
        config.stop_timeout_secs = 2;
        config
    }

    fn service(config: &Config, adapter: Arc<ScriptedAdapter>) -> (Arc<OrchestrationService>, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new());
        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter);
        let svc = OrchestrationService::new(
            config,
            launcher.clone(),
            Arc::new(MemoryBackend::new()),
            adapters,
        );
        (Arc::new(svc), launcher)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn successes(svc: &OrchestrationService) -> u64 {
        svc.summary().details.total_successes
    }

    #[tokio::test]
    async fn test_scrape_stores_snapshot_and_freshness() {
        let adapter = ScriptedAdapter::new(|url| live_record(url, MatchStatus::InProgress));
        let (svc, _) = service(&test_config(), adapter.clone());
        svc.start().await.unwrap();

        assert!(svc.submit_task("m1", "https://scores.example/m1").await);
        wait_until(|| successes(&svc) == 1).await;

        let snap = svc.cache().get_snapshot("m1").await.unwrap().unwrap();
        assert_eq!(snap["status"], "in_progress");
        assert_eq!(snap["adapter"], "scripted");
        assert!(svc.cache().last_scraped_at("m1").await.unwrap().is_some());
        assert_eq!(svc.health().state(), HealthState::Healthy);
        assert_eq!(svc.reliability_score(), 100.0);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_submissions_are_rejected() {
        let adapter = ScriptedAdapter::new(|_| Ok(None));
        let (svc, _) = service(&test_config(), adapter);
        assert!(!svc.submit_task("m1", "not a url").await);
        assert!(!svc.submit_task("m1", "ftp://scores.example/m1").await);
        assert!(!svc.submit_task("", "https://scores.example/m1").await);
        assert_eq!(svc.scheduler().qsize(), 0);
    }

    #[tokio::test]
    async fn test_priority_follows_cached_status() {
        let adapter = ScriptedAdapter::new(|_| Ok(None));
        let (svc, _) = service(&test_config(), adapter);
        svc.cache()
            .set_snapshot("live", &json!({ "status": "half_time" }), None)
            .await
            .unwrap();
        svc.cache()
            .set_snapshot("soon", &json!({ "status": "not_started" }), None)
            .await
            .unwrap();

        assert!(svc.submit_task("new", "https://scores.example/new").await);
        assert!(svc.submit_task("soon", "https://scores.example/soon").await);
        assert!(svc.submit_task("live", "https://scores.example/live").await);

        let order: Vec<(String, Priority)> = std::iter::from_fn(|| svc.scheduler().try_dequeue())
            .map(|t| (t.match_id, t.priority))
            .collect();
        assert_eq!(
            order,
            vec![
                ("live".to_string(), Priority::Live),
                ("soon".to_string(), Priority::Imminent),
                ("new".to_string(), Priority::Other),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_page_sets_negative_cache() {
        let adapter = ScriptedAdapter::new(|_| Ok(None));
        let (svc, _) = service(&test_config(), adapter.clone());
        svc.start().await.unwrap();

        assert!(svc.submit_task("m1", "https://scores.example/m1").await);
        wait_until(|| successes(&svc) == 1).await;
        wait_until(|| svc.scheduler().in_flight() == 0).await;
        assert!(svc.cache().is_negative_cached("m1").await.unwrap());

        // Suppressed while the marker lives.
        assert!(svc.submit_task("m1", "https://scores.example/m1").await);
        wait_until(|| svc.scheduler().qsize() == 0 && svc.scheduler().in_flight() == 0).await;
        assert_eq!(adapter.calls(), 1);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_finished_match_is_archived() {
        let adapter = ScriptedAdapter::new(|url| live_record(url, MatchStatus::Finished));
        let (svc, _) = service(&test_config(), adapter);
        svc.start().await.unwrap();

        assert!(svc.submit_task("m1", "https://scores.example/m1").await);
        wait_until(|| {
            svc.health()
                .get_audit_log()
                .iter()
                .any(|e| e.event == "match_archived")
        })
        .await;
        assert!(svc.cache().get_snapshot("m1").await.unwrap().is_none());
        assert!(svc.cache().last_scraped_at("m1").await.unwrap().is_none());
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_failures_open_breaker_and_drop_reliability() {
        let mut config = test_config();
        config.set_concurrency_cap(1);
        config.breaker_failure_threshold = 2;
        config.breaker_timeout_secs = 600.0;
        let adapter = ScriptedAdapter::new(|_| Err(anyhow!("selector #score not found")));
        let (svc, launcher) = service(&config, adapter.clone());
        svc.start().await.unwrap();

        for id in ["a", "b", "c"] {
            assert!(svc.submit_task(id, &format!("https://scores.example/{}", id)).await);
        }
        wait_until(|| svc.scheduler().qsize() == 0 && svc.scheduler().in_flight() == 0).await;

        assert_eq!(adapter.calls(), 2, "third task must be rejected by the open circuit");
        assert_eq!(svc.breaker_for("scripted").state(), CircuitState::Open);
        assert_eq!(svc.reliability_score(), 0.0);
        assert_eq!(svc.summary().details.total_failures, 2);

        // Failed leases were discarded, not pooled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(launcher.open_contexts(), 0);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_source_url_mismatch_is_reconciled() {
        let adapter = ScriptedAdapter::new(|_| live_record("https://mirror.example/x", MatchStatus::InProgress));
        let (svc, _) = service(&test_config(), adapter);
        svc.start().await.unwrap();

        assert!(svc.submit_task("m1", "https://scores.example/m1").await);
        wait_until(|| successes(&svc) == 1).await;
        let warnings = svc.summary().details.reconciliation_warnings;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("mirror.example"));
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_memory_restart_waits_out_grace_and_is_bounded() {
        let mut config = test_config();
        config
            .set_memory_soft_limit_mb(1)
            .set_memory_restart_grace_seconds(0.2);
        config.max_memory_restarts = 1;
        let adapter = ScriptedAdapter::new(|url| live_record(url, MatchStatus::InProgress));
        let (svc, launcher) = service(&config, adapter.clone());
        launcher.set_memory_usage(64 * 1024 * 1024);
        svc.start().await.unwrap();

        assert!(svc.submit_task("m1", "https://scores.example/m1").await);
        wait_until(|| {
            adapter.calls() == 1
                && svc.runtime().contexts().iter().any(|c| c.memory_restart_scheduled())
        })
        .await;
        // The old context is held through the grace period.
        let held = svc.runtime().contexts().pop().unwrap();
        assert_eq!(held.match_id, "m1");
        assert!(!held.is_shutdown_requested());
        assert_eq!(svc.scheduler().qsize(), 0);

        wait_until(|| {
            svc.health()
                .get_audit_log()
                .iter()
                .any(|e| e.event == "restart_limit_reached")
        })
        .await;
        assert!(held.is_shutdown_requested());
        assert_eq!(adapter.calls(), 2);
        // Every over-limit context is discarded rather than reused.
        assert!(launcher.contexts_created() >= 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(adapter.calls(), 2, "restart loop must stop at the limit");
        assert_eq!(svc.runtime().active_matches(), 0);
        assert_eq!(svc.scheduler().qsize(), 0);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_purges_expired_cache_entries() {
        let backend = Arc::new(MemoryBackend::new());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(|_| Ok(None)));
        let svc = Arc::new(OrchestrationService::new(
            &test_config(),
            Arc::new(FakeLauncher::new()),
            backend.clone(),
            adapters,
        ));
        svc.start().await.unwrap();

        for i in 0..20 {
            svc.cache()
                .set_negative_cache(&format!("m{}", i), Some(Duration::from_millis(20)))
                .await
                .unwrap();
        }
        svc.cache()
            .set_snapshot("kept", &json!({ "status": "in_progress" }), None)
            .await
            .unwrap();
        assert_eq!(backend.len().await, 21);
        tokio::time::sleep(Duration::from_millis(50)).await;

        svc.monitor_tick().await;
        assert_eq!(backend.len().await, 1);
        assert!(svc.cache().get_snapshot("kept").await.unwrap().is_some());
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_recovers_from_stall() {
        let mut config = test_config();
        config.set_staleness_threshold_seconds(0.05);
        let adapter = ScriptedAdapter::new(|_| Ok(None));
        let (svc, _) = service(&config, adapter);
        // Pool up, but no workers: queued work never completes.
        svc.pool.setup().await.unwrap();
        assert!(svc.submit_task("m1", "https://scores.example/m1").await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        svc.monitor_tick().await;
        assert_eq!(svc.health().state(), HealthState::Recovering);
        assert_eq!(svc.pool.stats().await.recycles, 1);
        assert!(svc
            .health()
            .get_audit_log()
            .iter()
            .any(|e| e.event == "pool_recycled"));
    }

    #[tokio::test]
    async fn test_idle_service_is_not_declared_failing() {
        let mut config = test_config();
        config.set_staleness_threshold_seconds(0.05);
        let adapter = ScriptedAdapter::new(|_| Ok(None));
        let (svc, _) = service(&config, adapter);
        svc.pool.setup().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        svc.monitor_tick().await;
        assert_eq!(svc.health().state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_stop_shuts_everything_down() {
        let adapter = ScriptedAdapter::new(|_| Ok(None));
        let (svc, launcher) = service(&test_config(), adapter);
        svc.start().await.unwrap();
        assert!(svc.is_running());

        svc.stop().await;
        assert!(!svc.is_running());
        assert!(svc.runtime().is_shutting_down());
        assert!(!svc.submit_task("m1", "https://scores.example/m1").await);
        assert_eq!(launcher.engines_closed(), 1);
        assert!(matches!(svc.start().await, Err(ScrapeError::ShuttingDown)));

        let status = svc.status().await;
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.pool.phase, crate::browser::PoolPhase::Stopped);
    }
}
