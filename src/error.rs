use thiserror::Error;

/// Failure taxonomy of the orchestration runtime.
///
/// Admission failures (`QueueFull`, `RateLimited`, `ShuttingDown`) are local
/// signals; callers of `submit_task` only ever see a `bool`. Everything else
/// escalates to the health and reliability layer.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("queue full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    #[error("rate limited")]
    RateLimited,

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("circuit open for '{0}'")]
    CircuitOpen(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("browser pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("browser error: {0}")]
    Browser(#[source] anyhow::Error),

    #[error("cache error: {0}")]
    Cache(#[source] anyhow::Error),

    #[error("adapter '{adapter}' failed: {source}")]
    Adapter {
        adapter: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ScrapeError {
    /// Whether a retry of the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrapeError::Browser(_)
                | ScrapeError::Adapter { .. }
                | ScrapeError::Cache(_)
                | ScrapeError::PoolUnavailable(_)
        )
    }
}

pub type Result<T, E = ScrapeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ScrapeError::Browser(anyhow::anyhow!("tab crashed")).is_transient());
        assert!(ScrapeError::PoolUnavailable("recycling".into()).is_transient());
        assert!(!ScrapeError::ShuttingDown.is_transient());
        assert!(!ScrapeError::QueueFull { capacity: 3 }.is_transient());
    }

    #[test]
    fn test_retry_exhausted_message() {
        let e = ScrapeError::RetryExhausted {
            attempts: 3,
            last_error: "timeout".into(),
        };
        assert_eq!(e.to_string(), "retries exhausted after 3 attempts: timeout");
    }
}
