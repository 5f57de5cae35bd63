//! Aggregate health grading for the scraping runtime.
//!
//! ```text
//! HEALTHY/DEGRADED --[stall]--> FAILING --[recovery attempt]--> RECOVERING
//! RECOVERING --[successful scrape]--> HEALTHY
//! HEALTHY <--[soft thresholds]--> DEGRADED
//! ```
//!
//! Every mutation happens inside one critical section, so workers reporting
//! outcomes and the monitor loop driving transitions never lose updates.

pub mod freshness;

pub use freshness::{percentile, FreshnessStats};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;

/// Audit entries surfaced in the summary.
const SUMMARY_AUDIT_EXCERPT: usize = 10;
const MAX_RECONCILIATION_WARNINGS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failing,
    Recovering,
}

impl HealthState {
    pub fn score(self) -> u8 {
        match self {
            HealthState::Healthy => 100,
            HealthState::Degraded => 70,
            HealthState::Recovering => 50,
            HealthState::Failing => 20,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failing => "failing",
            HealthState::Recovering => "recovering",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub details: Value,
}

/// Grader thresholds, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub staleness_threshold: Duration,
    pub pause_cooldown: Duration,
    pub audit_max_entries: usize,
    pub freshness_window: usize,
    pub degraded_reliability_threshold: f64,
    pub degraded_freshness_p90_secs: f64,
}

impl HealthSettings {
    pub fn from_config(config: &Config) -> Self {
        HealthSettings {
            staleness_threshold: config.staleness_threshold(),
            pause_cooldown: config.pause_cooldown_duration(),
            audit_max_entries: config.audit_max_entries.max(1),
            freshness_window: config.freshness_window.max(1),
            degraded_reliability_threshold: config.degraded_reliability_threshold,
            degraded_freshness_p90_secs: config.degraded_freshness_p90_secs,
        }
    }
}

/// Resource counts supplied by the caller when building a summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub pids_count: usize,
    pub memory_usage_mb: f64,
    pub active_matches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub freshness: FreshnessStats,
    pub reconciliation_warnings: Vec<String>,
    pub recent_audit: Vec<AuditEntry>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub recovery_attempts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub state: HealthState,
    pub score: u8,
    pub uptime_seconds: f64,
    pub pids_count: usize,
    pub memory_usage_mb: f64,
    pub last_scrape_timestamp: Option<DateTime<Utc>>,
    pub active_matches: usize,
    pub details: HealthDetails,
}

struct GraderInner {
    state: HealthState,
    /// Reference point for stall detection; starts at construction.
    last_success: Instant,
    last_scrape_timestamp: Option<DateTime<Utc>>,
    last_recovery_attempt: Option<Instant>,
    audit: VecDeque<AuditEntry>,
    freshness: VecDeque<f64>,
    reconciliation_warnings: VecDeque<String>,
    total_successes: u64,
    total_failures: u64,
    recovery_attempts: u64,
}

pub struct HealthGrader {
    settings: HealthSettings,
    started_at: Instant,
    inner: Mutex<GraderInner>,
}

impl HealthGrader {
    pub fn new(settings: HealthSettings) -> Self {
        let now = Instant::now();
        HealthGrader {
            inner: Mutex::new(GraderInner {
                state: HealthState::Healthy,
                last_success: now,
                last_scrape_timestamp: None,
                last_recovery_attempt: None,
                audit: VecDeque::with_capacity(settings.audit_max_entries),
                freshness: VecDeque::with_capacity(settings.freshness_window),
                reconciliation_warnings: VecDeque::new(),
                total_successes: 0,
                total_failures: 0,
                recovery_attempts: 0,
            }),
            settings,
            started_at: now,
        }
    }

    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    /// The only path that changes state. Returns `false` for a no-op.
    pub fn transition_to(&self, next: HealthState, reason: &str) -> bool {
        let mut inner = self.lock();
        self.transition_locked(&mut inner, next, reason)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.last_success = Instant::now();
        inner.last_scrape_timestamp = Some(Utc::now());
        inner.total_successes += 1;
        if matches!(inner.state, HealthState::Recovering | HealthState::Failing) {
            self.transition_locked(&mut inner, HealthState::Healthy, "scrape succeeded");
        }
    }

    pub fn record_failure(&self) {
        self.lock().total_failures += 1;
    }

    /// Seconds since the last successful scrape (or since start).
    pub fn seconds_since_success(&self) -> f64 {
        self.lock().last_success.elapsed().as_secs_f64()
    }

    /// Restart the stall clock while there is no work to do, so the first
    /// task after an idle stretch is not measured against it.
    pub fn note_idle(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, HealthState::Healthy | HealthState::Degraded) {
            inner.last_success = Instant::now();
        }
    }

    /// Detect a stall and move HEALTHY/DEGRADED to FAILING.
    pub fn check_stall(&self) -> bool {
        let mut inner = self.lock();
        let idle = inner.last_success.elapsed();
        if idle <= self.settings.staleness_threshold {
            return false;
        }
        if matches!(inner.state, HealthState::Healthy | HealthState::Degraded) {
            let reason = format!(
                "no successful scrape for {:.1}s (threshold {:.1}s)",
                idle.as_secs_f64(),
                self.settings.staleness_threshold.as_secs_f64()
            );
            self.push_audit(
                &mut inner,
                "stall_detected",
                json!({ "idle_seconds": idle.as_secs_f64() }),
            );
            self.transition_locked(&mut inner, HealthState::Failing, &reason);
        }
        true
    }

    /// True when FAILING outside the cooldown, or when a previous recovery
    /// did not clear the stall and its cooldown has passed.
    pub fn should_trigger_recovery(&self) -> bool {
        let inner = self.lock();
        let cooled_down = inner
            .last_recovery_attempt
            .map_or(true, |t| t.elapsed() >= self.settings.pause_cooldown);
        match inner.state {
            HealthState::Failing => cooled_down,
            HealthState::Recovering => {
                cooled_down && inner.last_success.elapsed() > self.settings.staleness_threshold
            }
            _ => false,
        }
    }

    pub fn record_recovery_attempt(&self) {
        let mut inner = self.lock();
        inner.last_recovery_attempt = Some(Instant::now());
        inner.recovery_attempts += 1;
        let attempt = inner.recovery_attempts;
        self.push_audit(&mut inner, "recovery_attempt", json!({ "attempt": attempt }));
        self.transition_locked(&mut inner, HealthState::Recovering, "recovery triggered");
    }

    /// Apply the soft thresholds: HEALTHY <-> DEGRADED. Never touches
    /// FAILING or RECOVERING.
    pub fn evaluate_degradation(&self, reliability_score: f64) -> HealthState {
        let mut inner = self.lock();
        let p90 = freshness::stats(&inner.freshness).p90;
        let unreliable = reliability_score < self.settings.degraded_reliability_threshold;
        let stale = p90 > self.settings.degraded_freshness_p90_secs;

        match inner.state {
            HealthState::Healthy if unreliable || stale => {
                let reason = format!(
                    "reliability {:.0} (min {:.0}), freshness p90 {:.1}s (max {:.1}s)",
                    reliability_score,
                    self.settings.degraded_reliability_threshold,
                    p90,
                    self.settings.degraded_freshness_p90_secs
                );
                self.transition_locked(&mut inner, HealthState::Degraded, &reason);
            }
            HealthState::Degraded if !unreliable && !stale => {
                self.transition_locked(&mut inner, HealthState::Healthy, "signals back within limits");
            }
            _ => {}
        }
        inner.state
    }

    pub fn record_freshness(&self, age_seconds: f64) {
        if !age_seconds.is_finite() || age_seconds < 0.0 {
            return;
        }
        let mut inner = self.lock();
        if inner.freshness.len() == self.settings.freshness_window {
            inner.freshness.pop_front();
        }
        inner.freshness.push_back(age_seconds);
    }

    pub fn get_freshness_stats(&self) -> FreshnessStats {
        freshness::stats(&self.lock().freshness)
    }

    pub fn add_audit_log(&self, event: &str, details: Value) {
        let mut inner = self.lock();
        self.push_audit(&mut inner, event, details);
    }

    /// Entries oldest to newest.
    pub fn get_audit_log(&self) -> Vec<AuditEntry> {
        self.lock().audit.iter().cloned().collect()
    }

    pub fn record_reconciliation_warning(&self, text: &str) {
        warn!("Reconciliation: {}", text);
        let mut inner = self.lock();
        if inner.reconciliation_warnings.len() == MAX_RECONCILIATION_WARNINGS {
            inner.reconciliation_warnings.pop_front();
        }
        inner.reconciliation_warnings.push_back(text.to_string());
    }

    pub fn get_summary(&self, usage: ResourceUsage) -> HealthSummary {
        let inner = self.lock();
        let skip = inner.audit.len().saturating_sub(SUMMARY_AUDIT_EXCERPT);
        HealthSummary {
            state: inner.state,
            score: inner.state.score(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            pids_count: usage.pids_count,
            memory_usage_mb: usage.memory_usage_mb,
            last_scrape_timestamp: inner.last_scrape_timestamp,
            active_matches: usage.active_matches,
            details: HealthDetails {
                freshness: freshness::stats(&inner.freshness),
                reconciliation_warnings: inner.reconciliation_warnings.iter().cloned().collect(),
                recent_audit: inner.audit.iter().skip(skip).cloned().collect(),
                total_successes: inner.total_successes,
                total_failures: inner.total_failures,
                recovery_attempts: inner.recovery_attempts,
            },
        }
    }

    fn transition_locked(&self, inner: &mut GraderInner, next: HealthState, reason: &str) -> bool {
        let prev = inner.state;
        if prev == next {
            return false;
        }
        inner.state = next;
        match next {
            HealthState::Failing => warn!("Health {} -> {}: {}", prev.as_str(), next.as_str(), reason),
            _ => info!("Health {} -> {}: {}", prev.as_str(), next.as_str(), reason),
        }
        self.push_audit(
            inner,
            "state_transition",
            json!({ "from": prev.as_str(), "to": next.as_str(), "reason": reason }),
        );
        true
    }

    fn push_audit(&self, inner: &mut GraderInner, event: &str, details: Value) {
        if inner.audit.len() >= self.settings.audit_max_entries {
            inner.audit.pop_front();
        }
        inner.audit.push_back(AuditEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            details,
        });
    }

    fn lock(&self) -> MutexGuard<'_, GraderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
