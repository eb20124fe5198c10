use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harvester_engine::{
    CacheSettings, DiskCache, FailureKind, FetchError, FetchStrategy, FetchedPage,
    RequestIdentity, RetryPolicy, RetryingFetcher,
};
use tempfile::TempDir;

/// Fails with `failure` for the first `failures` calls, then serves a page.
struct FlakyStrategy {
    calls: AtomicUsize,
    failures: usize,
    failure: FailureKind,
}

impl FlakyStrategy {
    fn new(failures: usize, failure: FailureKind) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures,
            failure,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FetchStrategy for FlakyStrategy {
    fn request_identity(&self, url: &str) -> RequestIdentity {
        RequestIdentity::get(url)
    }

    async fn fetch(&self, request: &RequestIdentity) -> Result<FetchedPage, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(FetchError::new(self.failure.clone(), "stubbed failure"));
        }
        Ok(FetchedPage {
            status: 200,
            final_url: request.url().to_string(),
            headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
            body: format!("<h1>{}</h1>", request.url()).into_bytes(),
        })
    }
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(5),
    }
}

fn disk_cache(temp: &TempDir) -> Arc<DiskCache> {
    Arc::new(
        DiskCache::open(CacheSettings {
            directory: temp.path().to_path_buf(),
            ..CacheSettings::default()
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn two_transient_failures_then_success_takes_three_calls() {
    let strategy = FlakyStrategy::new(2, FailureKind::Timeout);
    let fetcher = RetryingFetcher::new(quick_policy());
    let request = strategy.request_identity("https://example.com/a");

    let page = fetcher.fetch(&request, &strategy).await.expect("third attempt succeeds");
    assert_eq!(page.body, b"<h1>https://example.com/a</h1>");
    assert_eq!(strategy.calls(), 3);
}

#[tokio::test]
async fn exhausted_attempts_return_the_last_error() {
    let strategy = FlakyStrategy::new(3, FailureKind::HttpStatus(502));
    let fetcher = RetryingFetcher::new(quick_policy());
    let request = strategy.request_identity("https://example.com/a");

    let err = fetcher.fetch(&request, &strategy).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::HttpStatus(502));
    assert_eq!(strategy.calls(), 3);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let strategy = FlakyStrategy::new(1, FailureKind::HttpStatus(404));
    let fetcher = RetryingFetcher::new(quick_policy());
    let request = strategy.request_identity("https://example.com/missing");

    let err = fetcher.fetch(&request, &strategy).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::HttpStatus(404));
    assert_eq!(strategy.calls(), 1);
}

#[tokio::test]
async fn cached_fetch_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let strategy = FlakyStrategy::new(0, FailureKind::Timeout);
    let fetcher = RetryingFetcher::new(quick_policy()).with_cache(disk_cache(&temp));
    let request = strategy.request_identity("https://example.com/a");

    let first = fetcher.fetch(&request, &strategy).await.unwrap();
    let second = fetcher.fetch(&request, &strategy).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(strategy.calls(), 1);
}

#[tokio::test]
async fn cache_survives_a_new_fetcher() {
    let temp = TempDir::new().unwrap();
    let request = RequestIdentity::get("https://example.com/a");

    let warm = FlakyStrategy::new(0, FailureKind::Timeout);
    RetryingFetcher::new(quick_policy())
        .with_cache(disk_cache(&temp))
        .fetch(&request, &warm)
        .await
        .unwrap();

    // Every call to this strategy would fail; the entry on disk must be used.
    let offline = FlakyStrategy::new(usize::MAX, FailureKind::Connect);
    let page = RetryingFetcher::new(quick_policy())
        .with_cache(disk_cache(&temp))
        .fetch(&request, &offline)
        .await
        .unwrap();
    assert_eq!(page.body, b"<h1>https://example.com/a</h1>");
    assert_eq!(offline.calls(), 0);
}

#[tokio::test]
async fn failures_are_never_cached() {
    let temp = TempDir::new().unwrap();
    let fetcher = RetryingFetcher::new(RetryPolicy {
        attempts: 1,
        delay: Duration::ZERO,
    })
    .with_cache(disk_cache(&temp));
    let strategy = FlakyStrategy::new(1, FailureKind::Network);
    let request = strategy.request_identity("https://example.com/a");

    assert!(fetcher.fetch(&request, &strategy).await.is_err());
    assert!(fetcher.fetch(&request, &strategy).await.is_ok());
    assert_eq!(strategy.calls(), 2);
}
