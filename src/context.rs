//! Per-task lifecycle state shared between the executing worker and the
//! memory watchdog.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub memory_soft_limit_bytes: u64,
    pub memory_restart_grace: Duration,
}

impl ContextSettings {
    pub fn from_config(config: &Config) -> Self {
        ContextSettings {
            memory_soft_limit_bytes: config.memory_soft_limit_bytes(),
            memory_restart_grace: config.memory_restart_grace(),
        }
    }
}

/// Result of feeding a memory reading to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryVerdict {
    WithinLimit,
    /// Soft limit crossed for the first time; a restart is now scheduled.
    RestartScheduled,
    /// Over the limit with a restart already pending.
    AlreadyScheduled,
}

#[derive(Debug, Default)]
struct ContextState {
    memory_bytes: u64,
    restart_requested: bool,
    restart_reason: Option<String>,
    memory_restart_scheduled: bool,
    shutdown_reason: Option<String>,
}

/// Serializable view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub match_id: String,
    pub url: String,
    pub memory_bytes: u64,
    pub restart_requested: bool,
    pub restart_reason: Option<String>,
    pub memory_restart_scheduled: bool,
    pub shutdown_requested: bool,
    pub shutdown_reason: Option<String>,
}

#[derive(Debug)]
pub struct ScraperContext {
    pub match_id: String,
    pub url: String,
    pub settings: ContextSettings,
    shutdown_requested: AtomicBool,
    state: Mutex<ContextState>,
}

impl ScraperContext {
    pub fn new(match_id: &str, url: &str, settings: ContextSettings) -> Self {
        ScraperContext {
            match_id: match_id.to_string(),
            url: url.to_string(),
            settings,
            shutdown_requested: AtomicBool::new(false),
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        self.lock().memory_bytes
    }

    pub fn restart_requested(&self) -> bool {
        self.lock().restart_requested
    }

    pub fn restart_reason(&self) -> Option<String> {
        self.lock().restart_reason.clone()
    }

    pub fn memory_restart_scheduled(&self) -> bool {
        self.lock().memory_restart_scheduled
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// One-way: once set the flag is never cleared.
    pub fn request_shutdown(&self, reason: &str) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            info!("[{}] Shutdown requested: {}", self.match_id, reason);
            self.lock().shutdown_reason = Some(reason.to_string());
        }
    }

    /// Record a memory reading; crossing the soft limit schedules a restart
    /// instead of killing the context outright.
    pub fn update_memory(&self, bytes: u64) -> MemoryVerdict {
        let mut state = self.lock();
        state.memory_bytes = bytes;
        if bytes <= self.settings.memory_soft_limit_bytes {
            return MemoryVerdict::WithinLimit;
        }
        if state.memory_restart_scheduled {
            return MemoryVerdict::AlreadyScheduled;
        }
        let reason = format!(
            "memory soft limit exceeded: {} MB > {} MB",
            bytes / (1024 * 1024),
            self.settings.memory_soft_limit_bytes / (1024 * 1024)
        );
        warn!("[{}] {}", self.match_id, reason);
        state.memory_restart_scheduled = true;
        state.restart_requested = true;
        state.restart_reason = Some(reason);
        MemoryVerdict::RestartScheduled
    }

    /// Wait out the restart grace period, then request shutdown.
    pub async fn graceful_shutdown(&self) {
        tokio::time::sleep(self.settings.memory_restart_grace).await;
        self.request_shutdown("memory restart grace period elapsed");
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.lock();
        ContextSnapshot {
            match_id: self.match_id.clone(),
            url: self.url.clone(),
            memory_bytes: state.memory_bytes,
            restart_requested: state.restart_requested,
            restart_reason: state.restart_reason.clone(),
            memory_restart_scheduled: state.memory_restart_scheduled,
            shutdown_requested: self.is_shutdown_requested(),
            shutdown_reason: state.shutdown_reason.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ctx(limit_bytes: u64, grace: Duration) -> Arc<ScraperContext> {
        Arc::new(ScraperContext::new(
            "m1",
            "https://example.com/m1",
            ContextSettings {
                memory_soft_limit_bytes: limit_bytes,
                memory_restart_grace: grace,
            },
        ))
    }

    #[test]
    fn test_memory_over_limit_schedules_restart_once() {
        let c = ctx(100, Duration::from_secs(30));
        assert_eq!(c.update_memory(50), MemoryVerdict::WithinLimit);
        assert!(!c.restart_requested());

        assert_eq!(c.update_memory(150), MemoryVerdict::RestartScheduled);
        assert!(c.restart_requested());
        assert!(c.memory_restart_scheduled());
        assert!(c.restart_reason().unwrap().contains("soft limit"));
        assert!(!c.is_shutdown_requested(), "restart is graceful, not immediate");

        assert_eq!(c.update_memory(200), MemoryVerdict::AlreadyScheduled);
        assert_eq!(c.memory_bytes(), 200);
    }

    #[test]
    fn test_shutdown_never_reverts() {
        let c = ctx(100, Duration::ZERO);
        c.request_shutdown("stop");
        c.request_shutdown("again");
        assert!(c.update_memory(u64::MAX) != MemoryVerdict::WithinLimit);
        assert!(c.is_shutdown_requested());
        assert_eq!(c.snapshot().shutdown_reason.as_deref(), Some("stop"));
        assert!(c.snapshot().shutdown_requested);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_after_grace() {
        let c = ctx(100, Duration::from_millis(30));
        c.update_memory(500);
        let waiter = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.graceful_shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!c.is_shutdown_requested());

        waiter.await.unwrap();
        assert!(c.is_shutdown_requested());
        assert_eq!(
            c.snapshot().shutdown_reason.as_deref(),
            Some("memory restart grace period elapsed")
        );
    }
}
