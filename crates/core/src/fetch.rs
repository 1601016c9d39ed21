use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::warn;

use crate::progress::ProgressReporter;
use crate::{Error, Result};

/// Bounded retry with exponential backoff. Delay for attempt `n` is
/// `base * 2^n + jitter`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..jitter_range_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Downloaded-bytes counter shared by all range workers. Every mutation
/// happens under the lock; the optional reporter sees the post-update
/// total so the rendered progress is monotonic per emission.
pub struct SharedCounter {
    bytes: tokio::sync::Mutex<u64>,
    reporter: Option<Arc<ProgressReporter>>,
}

impl SharedCounter {
    pub fn new(reporter: Option<Arc<ProgressReporter>>) -> Self {
        Self {
            bytes: tokio::sync::Mutex::new(0),
            reporter,
        }
    }

    pub async fn add(&self, n: u64) {
        let current = {
            let mut guard = self.bytes.lock().await;
            *guard += n;
            *guard
        };
        if let Some(reporter) = &self.reporter {
            reporter.update(current);
        }
    }

    /// Rolls back bytes written by an attempt that is about to restart,
    /// keeping the counter equal to the sum of durable range bytes.
    pub async fn sub(&self, n: u64) {
        let mut guard = self.bytes.lock().await;
        *guard = guard.saturating_sub(n);
    }

    pub async fn current(&self) -> u64 {
        *self.bytes.lock().await
    }
}

/// One bounded byte-range read, retried with backoff. The worker owns the
/// range exclusively, so a positioned write into the pre-sized destination
/// cannot race with its siblings.
#[derive(Clone)]
pub struct RangeFetcher {
    client: reqwest::Client,
    url: String,
    user_agent: String,
    policy: RetryPolicy,
}

impl RangeFetcher {
    pub fn new(
        client: reqwest::Client,
        url: String,
        user_agent: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            url,
            user_agent,
            policy,
        }
    }

    /// Downloads `[start, end]` (inclusive) into `dest` at offset `start`.
    pub async fn fetch_range(
        &self,
        dest: &Path,
        start: u64,
        end: u64,
        counter: &SharedCounter,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(dest, start, end, counter).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt >= self.policy.max_retries {
                        return Err(e);
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        event = "download.range_retry",
                        start,
                        end,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "download.range_retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        dest: &Path,
        start: u64,
        end: u64,
        counter: &SharedCounter,
    ) -> Result<()> {
        let mut written: u64 = 0;
        let result = self
            .stream_range(dest, start, end, counter, &mut written)
            .await;
        if result.is_err() && written > 0 {
            // The whole range restarts on retry; drop the partial bytes.
            counter.sub(written).await;
        }
        result
    }

    async fn stream_range(
        &self,
        dest: &Path,
        start: u64,
        end: u64,
        counter: &SharedCounter,
        written: &mut u64,
    ) -> Result<()> {
        let mut response = self
            .client
            .get(&self.url)
            .header("Range", format!("bytes={start}-{end}"))
            .header("Accept-Encoding", "identity")
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| Error::Transport {
                message: format!("range request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport {
                message: format!("range request http {status}"),
            });
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(dest)
            .await?;
        file.seek(SeekFrom::Start(start)).await?;

        while let Some(chunk) = response.chunk().await.map_err(|e| Error::Transport {
            message: format!("range body read failed: {e}"),
        })? {
            file.write_all(&chunk).await?;
            *written += chunk.len() as u64;
            counter.add(chunk.len() as u64).await;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_under_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: true,
        };
        for attempt in 0..10 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn counter_add_sub_round_trips() {
        let counter = SharedCounter::new(None);
        counter.add(100).await;
        counter.add(50).await;
        counter.sub(30).await;
        assert_eq!(counter.current().await, 120);
        counter.sub(1000).await;
        assert_eq!(counter.current().await, 0);
    }
}
