use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Which store backs the scrape cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackendKind {
    Sqlite,
    Memory,
}

/// Live-match scraping orchestration runtime
#[derive(Parser, Debug, Clone)]
#[command(name = "livescrape", version, about)]
pub struct Config {
    /// Status endpoint listen address
    #[arg(long, env = "STATUS_ADDR", default_value = "0.0.0.0:8080")]
    pub status_addr: String,

    // ── Admission ────────────────────────────────────────────────────────────
    /// Maximum number of queued scrape tasks
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value = "100")]
    pub max_queue_size: usize,

    /// Token bucket capacity for task admission
    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "20")]
    pub rate_limit_burst: u32,

    /// Token bucket refill rate (tokens per second)
    #[arg(long, env = "RATE_LIMIT_TOKENS_PER_SEC", default_value = "5.0")]
    pub rate_limit_tokens_per_sec: f64,

    /// Number of concurrent scrape workers
    #[arg(long, env = "CONCURRENCY_CAP", default_value = "3")]
    pub concurrency_cap: usize,

    // ── Health ───────────────────────────────────────────────────────────────
    /// Seconds without a successful scrape before the runtime is considered stalled
    #[arg(long, env = "STALENESS_THRESHOLD_SECONDS", default_value = "120.0")]
    pub staleness_threshold_seconds: f64,

    /// Minimum seconds between two automated recovery attempts
    #[arg(long, env = "PAUSE_COOLDOWN", default_value = "300.0")]
    pub pause_cooldown: f64,

    /// Capacity of the health audit ring buffer
    #[arg(long, env = "AUDIT_MAX_ENTRIES", default_value = "200")]
    pub audit_max_entries: usize,

    /// Number of freshness samples kept for percentile reporting
    #[arg(long, env = "FRESHNESS_WINDOW", default_value = "500")]
    pub freshness_window: usize,

    /// Reliability score (0-100) below which the runtime is DEGRADED
    #[arg(long, env = "DEGRADED_RELIABILITY_THRESHOLD", default_value = "80.0")]
    pub degraded_reliability_threshold: f64,

    /// Freshness p90 (seconds) above which the runtime is DEGRADED
    #[arg(long, env = "DEGRADED_FRESHNESS_P90_SECS", default_value = "90.0")]
    pub degraded_freshness_p90_secs: f64,

    /// Health monitor poll interval in seconds
    #[arg(long, env = "MONITOR_INTERVAL_SECS", default_value = "5")]
    pub monitor_interval_secs: u64,

    // ── Memory ───────────────────────────────────────────────────────────────
    /// Per-context memory soft limit (MB) that schedules a graceful restart
    #[arg(long, env = "MEMORY_SOFT_LIMIT_MB", default_value = "512")]
    pub memory_soft_limit_mb: u64,

    /// Grace period before a memory-triggered restart shuts the context down
    #[arg(long, env = "MEMORY_RESTART_GRACE_SECONDS", default_value = "30.0")]
    pub memory_restart_grace_seconds: f64,

    /// Memory restarts allowed per task before it is dropped
    #[arg(long, env = "MAX_MEMORY_RESTARTS", default_value = "3")]
    pub max_memory_restarts: u32,

    // ── Browser pool ─────────────────────────────────────────────────────────
    /// Chromium executable
    #[arg(long, env = "BROWSER_BINARY", default_value = "chromium")]
    pub browser_binary: String,

    /// Number of browser processes in the pool
    #[arg(long, env = "BROWSER_INSTANCES", default_value = "1")]
    pub browser_instances: usize,

    /// Reusable contexts per browser process
    #[arg(long, env = "CONTEXTS_PER_BROWSER", default_value = "3")]
    pub contexts_per_browser: usize,

    /// Uses after which a pooled context is closed instead of reused
    #[arg(long, env = "MAX_CONTEXT_USES", default_value = "25")]
    pub max_context_uses: u32,

    /// Seconds to wait for a free browser context
    #[arg(long, env = "ACQUIRE_TIMEOUT_SECS", default_value = "30")]
    pub acquire_timeout_secs: u64,

    /// Page navigation timeout in seconds
    #[arg(long, env = "NAVIGATION_TIMEOUT_SECS", default_value = "20")]
    pub navigation_timeout_secs: u64,

    /// Hard timeout for one adapter fetch in seconds
    #[arg(long, env = "SCRAPE_TIMEOUT_SECS", default_value = "45")]
    pub scrape_timeout_secs: u64,

    // ── Cache ────────────────────────────────────────────────────────────────
    /// Cache store
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value = "sqlite")]
    pub cache_backend: CacheBackendKind,

    /// SQLite cache path
    #[arg(long, env = "CACHE_PATH", default_value = "livescrape-cache.db")]
    pub cache_path: String,

    /// Snapshot TTL in seconds
    #[arg(long, env = "SNAPSHOT_TTL_SECS", default_value = "300")]
    pub snapshot_ttl_secs: u64,

    /// Negative-cache TTL in seconds
    #[arg(long, env = "NEGATIVE_TTL_SECS", default_value = "60")]
    pub negative_ttl_secs: u64,

    /// Freshness marker TTL in seconds
    #[arg(long, env = "FRESHNESS_TTL_SECS", default_value = "21600")]
    pub freshness_ttl_secs: u64,

    // ── Resilience ───────────────────────────────────────────────────────────
    /// Attempts per scrape before giving up
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "3")]
    pub retry_max_attempts: u32,

    /// First retry delay in seconds
    #[arg(long, env = "RETRY_BASE_DELAY_SECS", default_value = "1.0")]
    pub retry_base_delay_secs: f64,

    /// Exponential backoff factor
    #[arg(long, env = "RETRY_FACTOR", default_value = "2.0")]
    pub retry_factor: f64,

    /// Backoff ceiling in seconds
    #[arg(long, env = "RETRY_MAX_DELAY_SECS", default_value = "30.0")]
    pub retry_max_delay_secs: f64,

    /// Maximum random jitter added to each backoff (seconds)
    #[arg(long, env = "RETRY_JITTER_SECS", default_value = "0.25")]
    pub retry_jitter_secs: f64,

    /// Consecutive failures that open an adapter's circuit
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value = "5")]
    pub breaker_failure_threshold: u32,

    /// Half-open successes needed to close the circuit again
    #[arg(long, env = "BREAKER_SUCCESS_THRESHOLD", default_value = "2")]
    pub breaker_success_threshold: u32,

    /// Seconds an open circuit rejects calls before trying again
    #[arg(long, env = "BREAKER_TIMEOUT_SECS", default_value = "60.0")]
    pub breaker_timeout_secs: f64,

    /// Outcomes kept per adapter for the reliability score
    #[arg(long, env = "RELIABILITY_WINDOW", default_value = "50")]
    pub reliability_window: usize,

    /// Seconds `stop()` waits for workers before treating them as stuck
    #[arg(long, env = "STOP_TIMEOUT_SECS", default_value = "15")]
    pub stop_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["livescrape"])
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be at least 1");
        }
        if self.rate_limit_burst == 0 {
            anyhow::bail!("rate_limit_burst must be at least 1");
        }
        if self.rate_limit_tokens_per_sec <= 0.0 {
            anyhow::bail!("rate_limit_tokens_per_sec must be positive");
        }
        if self.concurrency_cap == 0 {
            anyhow::bail!("concurrency_cap must be at least 1");
        }
        if self.staleness_threshold_seconds <= 0.0 {
            anyhow::bail!("staleness_threshold_seconds must be positive");
        }
        if self.pause_cooldown < 0.0 {
            anyhow::bail!("pause_cooldown must not be negative");
        }
        if self.audit_max_entries == 0 {
            anyhow::bail!("audit_max_entries must be at least 1");
        }
        if self.browser_instances == 0 || self.contexts_per_browser == 0 {
            anyhow::bail!("browser_instances and contexts_per_browser must be at least 1");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be at least 1");
        }
        if self.retry_factor < 1.0 {
            anyhow::bail!("retry_factor must be >= 1.0");
        }
        if !(0.0..=100.0).contains(&self.degraded_reliability_threshold) {
            anyhow::bail!("degraded_reliability_threshold must be between 0 and 100");
        }
        if self.memory_restart_grace_seconds < 0.0 {
            anyhow::bail!("memory_restart_grace_seconds must not be negative");
        }
        Ok(())
    }

    // ── Setters ──────────────────────────────────────────────────────────────

    pub fn set_max_queue_size(&mut self, value: usize) -> &mut Self {
        self.max_queue_size = value;
        self
    }

    pub fn set_rate_limit_burst(&mut self, value: u32) -> &mut Self {
        self.rate_limit_burst = value;
        self
    }

    pub fn set_rate_limit_tokens_per_sec(&mut self, value: f64) -> &mut Self {
        self.rate_limit_tokens_per_sec = value;
        self
    }

    pub fn set_concurrency_cap(&mut self, value: usize) -> &mut Self {
        self.concurrency_cap = value;
        self
    }

    pub fn set_staleness_threshold_seconds(&mut self, value: f64) -> &mut Self {
        self.staleness_threshold_seconds = value;
        self
    }

    pub fn set_pause_cooldown(&mut self, value: f64) -> &mut Self {
        self.pause_cooldown = value;
        self
    }

    pub fn set_audit_max_entries(&mut self, value: usize) -> &mut Self {
        self.audit_max_entries = value;
        self
    }

    pub fn set_memory_soft_limit_mb(&mut self, value: u64) -> &mut Self {
        self.memory_soft_limit_mb = value;
        self
    }

    pub fn set_memory_restart_grace_seconds(&mut self, value: f64) -> &mut Self {
        self.memory_restart_grace_seconds = value;
        self
    }

    // ── Derived durations ────────────────────────────────────────────────────

    pub fn staleness_threshold(&self) -> Duration {
        secs_f64(self.staleness_threshold_seconds)
    }

    pub fn pause_cooldown_duration(&self) -> Duration {
        secs_f64(self.pause_cooldown)
    }

    pub fn memory_restart_grace(&self) -> Duration {
        secs_f64(self.memory_restart_grace_seconds)
    }

    pub fn memory_soft_limit_bytes(&self) -> u64 {
        self.memory_soft_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn breaker_timeout(&self) -> Duration {
        secs_f64(self.breaker_timeout_secs)
    }
}

/// Negative or non-finite inputs clamp to zero instead of panicking.
pub fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}
