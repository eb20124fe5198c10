use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine_logging::{engine_debug, engine_warn};

use crate::cache::{CachedResponse, ResponseStore};
use crate::{FetchError, FetchStrategy, FetchedPage, RequestIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// Cache-aware fetch with bounded retries on transient failures.
#[derive(Clone, Default)]
pub struct RetryingFetcher {
    policy: RetryPolicy,
    cache: Option<Arc<dyn ResponseStore>>,
}

impl RetryingFetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Serves `request` from the cache, or fetches it through `strategy` and
    /// stores the response. Only transient errors are retried; the last error
    /// is returned once the attempt budget is spent.
    pub async fn fetch(
        &self,
        request: &RequestIdentity,
        strategy: &dyn FetchStrategy,
    ) -> Result<FetchedPage, FetchError> {
        let key = request.cache_key();
        if let Some(cache) = &self.cache {
            match cache.read(&key) {
                Ok(Some(hit)) => {
                    engine_debug!("cache hit {} ({})", request.url(), key);
                    return Ok(hit.into_page());
                }
                Ok(None) => engine_debug!("cache miss {} ({})", request.url(), key),
                Err(err) => {
                    engine_warn!("ignoring unreadable cache entry for {}: {}", request.url(), err)
                }
            }
        }

        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        let page = loop {
            match strategy.fetch(request).await {
                Ok(page) => break page,
                Err(err) if err.is_transient() && attempt < attempts => {
                    engine_warn!(
                        "fetch {} failed (attempt {}/{}): {}; retrying in {:?}",
                        request.url(),
                        attempt,
                        attempts,
                        err,
                        self.policy.delay
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        if let Some(cache) = &self.cache {
            let entry = CachedResponse::from_page(&page, Utc::now());
            if let Err(err) = cache.write(&key, request, &entry) {
                engine_warn!("failed to cache {}: {}", request.url(), err);
            }
        }
        Ok(page)
    }
}
