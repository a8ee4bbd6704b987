//! Document retrieval with per-request timeouts and exponential backoff.
//!
//! # Architecture
//!
//! - [`PageSource`]: core trait, "give me the body behind this URL"
//! - [`HttpSource`]: `reqwest`-backed implementation with a client-level timeout
//! - [`RetrySource`]: decorator that retries transient failures of any [`PageSource`]
//!
//! # Retry Strategy
//!
//! Only failures classified as transient by [`FetchError::is_transient`] are
//! retried. The delay before retry `n` is
//!
//! ```text
//! delay = min(base_delay * 2^(n-1), max_delay) + random_jitter(0..=max_jitter)
//! ```

use rand::{Rng, rng};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, instrument, warn};

use crate::errors::FetchError;

/// Something that can turn a URL into a response body.
pub trait PageSource {
    async fn get(&self, url: &str) -> Result<String, FetchError>;
}

/// Timeout and retry settings shared by every request of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl FetchPolicy {
    /// Delay before the given retry (1-based), without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Plain HTTP GET through a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(policy: &FetchPolicy) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        Ok(Self { client })
    }
}

impl PageSource for HttpSource {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let t0 = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        debug!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            bytes = body.len(),
            "GET complete"
        );
        Ok(body)
    }
}

/// Wraps a [`PageSource`] with bounded retries and jittered exponential backoff.
pub struct RetrySource<T> {
    inner: T,
    policy: FetchPolicy,
}

impl<T> RetrySource<T>
where
    T: PageSource,
{
    pub fn new(inner: T, policy: FetchPolicy) -> Self {
        Self { inner, policy }
    }

    #[cfg(test)]
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T> fmt::Debug for RetrySource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySource")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T> PageSource for RetrySource<T>
where
    T: PageSource,
{
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.get(url).await {
                Ok(body) => return Ok(body),
                Err(e) if !e.is_transient() => {
                    warn!(%url, error = %e, "Non-transient fetch failure; not retrying");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.policy.max_retries {
                        error!(
                            %url,
                            attempt,
                            max = self.policy.max_retries,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "Fetch exhausted retries"
                        );
                        return Err(e);
                    }

                    let jitter_ms = self.policy.max_jitter.as_millis() as u64;
                    let jitter = Duration::from_millis(rng().random_range(0..=jitter_ms));
                    let delay = self.policy.backoff(attempt) + jitter;

                    warn!(
                        %url,
                        attempt,
                        max = self.policy.max_retries,
                        ?delay,
                        error = %e,
                        "Fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
