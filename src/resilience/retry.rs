//! Bounded retry with exponential backoff and jitter.
//!
//! Backoff only suspends the calling worker; the scheduler and the other
//! workers keep running.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{secs_f64, Config};
use crate::error::ScrapeError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to every backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: secs_f64(config.retry_base_delay_secs),
            factor: config.retry_factor,
            max_delay: secs_f64(config.retry_max_delay_secs),
            jitter: secs_f64(config.retry_jitter_secs),
        }
    }

    /// Backoff before retry number `attempt + 1` (`attempt` is zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let capped = secs_f64(base.min(self.max_delay.as_secs_f64()));
        if self.jitter.is_zero() {
            return capped;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter.as_secs_f64());
        capped + secs_f64(extra)
    }

    /// Run `operation` until it succeeds or the attempt budget is spent,
    /// sleeping on the tokio clock between attempts.
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, ScrapeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_with_sleep(operation, tokio::time::sleep).await
    }

    /// Like [`RetryPolicy::run`] with a caller-provided sleeper.
    pub async fn run_with_sleep<F, Fut, T, E, S, SFut>(
        &self,
        operation: F,
        sleep: S,
    ) -> Result<T, ScrapeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        S: FnMut(Duration) -> SFut,
        SFut: Future<Output = ()>,
    {
        match self.attempt_loop(operation, sleep, |_: &E| true).await {
            Ok(value) => Ok(value),
            Err(Stop::Exhausted { attempts, error }) | Err(Stop::Fatal { attempts, error }) => {
                Err(ScrapeError::RetryExhausted {
                    attempts,
                    last_error: error.to_string(),
                })
            }
        }
    }

    /// Retry only transient runtime errors. Anything else (shutdown, an open
    /// circuit) ends the loop at once and is returned unchanged.
    pub async fn run_transient<F, Fut, T>(&self, operation: F) -> Result<T, ScrapeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScrapeError>>,
    {
        match self
            .attempt_loop(operation, tokio::time::sleep, ScrapeError::is_transient)
            .await
        {
            Ok(value) => Ok(value),
            Err(Stop::Exhausted { attempts, error }) => Err(ScrapeError::RetryExhausted {
                attempts,
                last_error: error.to_string(),
            }),
            Err(Stop::Fatal { error, .. }) => Err(error),
        }
    }

    async fn attempt_loop<F, Fut, T, E, S, SFut, P>(
        &self,
        mut operation: F,
        mut sleep: S,
        retryable: P,
    ) -> Result<T, Stop<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        S: FnMut(Duration) -> SFut,
        SFut: Future<Output = ()>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !retryable(&e) {
                        return Err(Stop::Fatal {
                            attempts: attempt,
                            error: e,
                        });
                    }
                    if attempt >= attempts {
                        warn!("Giving up after {} attempts: {}", attempt, e);
                        return Err(Stop::Exhausted {
                            attempts: attempt,
                            error: e,
                        });
                    }
                    let delay = self.delay_for(attempt - 1);
                    debug!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, attempts, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

enum Stop<E> {
    Exhausted { attempts: u32, error: E },
    Fatal { attempts: u32, error: E },
}
