use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvester_core::{QueryMap, Stage};
use harvester_engine::{
    CacheSettings, DiskCache, FailureKind, FetchError, FetchStrategy, FetchedPage,
    HarvestProgress, HarvestSettings, Harvester, HtmlFieldExtractor, NullProgressSink,
    ProgressSink, QueryDialect, RequestIdentity, ResponseStore, RetryPolicy, RetryingFetcher,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// Serves canned pages; URLs without a page fail with 404. Tracks peak concurrency.
#[derive(Default)]
struct PageStub {
    pages: BTreeMap<String, String>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<tokio::time::Instant>>,
}

impl PageStub {
    fn new<const N: usize>(pages: [(&str, &str); N]) -> Self {
        Self {
            pages: pages
                .into_iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl FetchStrategy for PageStub {
    fn request_identity(&self, url: &str) -> RequestIdentity {
        RequestIdentity::get(url)
    }

    async fn fetch(&self, request: &RequestIdentity) -> Result<FetchedPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(tokio::time::Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.pages.get(request.url()) {
            Some(body) => Ok(FetchedPage {
                status: 200,
                final_url: request.url().to_string(),
                headers: BTreeMap::from([(
                    "content-type".to_string(),
                    "text/html; charset=utf-8".to_string(),
                )]),
                body: body.clone().into_bytes(),
            }),
            None => Err(FetchError::new(FailureKind::HttpStatus(404), "not found")),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<HarvestProgress>>,
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: HarvestProgress) {
        self.events.lock().unwrap().push(event);
    }
}

fn harvester(strategy: Arc<PageStub>, settings: HarvestSettings) -> Harvester {
    let fetcher = RetryingFetcher::new(RetryPolicy {
        attempts: 1,
        delay: Duration::ZERO,
    });
    Harvester::new(
        strategy,
        fetcher,
        Arc::new(HtmlFieldExtractor::new(QueryDialect::XPath)),
        settings,
    )
}

fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|url| url.to_string()).collect()
}

#[tokio::test]
async fn failing_url_is_isolated_from_the_rest() {
    let stub = Arc::new(PageStub::new([("https://a.test/", "<h1>A</h1>")]));
    let queries: QueryMap = [("t", "//h1")].into_iter().collect();

    let session = harvester(stub, HarvestSettings::default())
        .harvest(urls(&["https://a.test/", "https://b.test/"]), queries, &NullProgressSink)
        .await;

    let expected = BTreeMap::from([(
        "https://a.test/".to_string(),
        BTreeMap::from([("t".to_string(), vec!["A".to_string()])]),
    )]);
    assert_eq!(session.results(), &expected);
    assert_eq!(session.failures(), &["https://b.test/".to_string()]);
    assert!(session.is_complete());
}

#[tokio::test]
async fn every_url_ends_in_exactly_one_container() {
    let stub = Arc::new(PageStub::new([
        ("https://a.test/", "<h1>A</h1>"),
        ("https://c.test/", "<h1>C</h1><h1>D</h1>"),
    ]));
    let queries: QueryMap = [("t", "//h1")].into_iter().collect();
    let input = urls(&["https://a.test/", "https://b.test/", "https://c.test/", "https://d.test/"]);

    let session = harvester(stub, HarvestSettings::default())
        .harvest(input.clone(), queries, &NullProgressSink)
        .await;

    for url in &input {
        let succeeded = session.results().contains_key(url);
        let failed = session.failures().contains(url);
        assert!(succeeded != failed, "{url} must be in exactly one container");
    }
    assert_eq!(session.results()["https://c.test/"]["t"], vec!["C", "D"]);
}

#[tokio::test]
async fn empty_query_map_yields_empty_records() {
    let stub = Arc::new(PageStub::new([("https://a.test/", "<p>anything</p>")]));

    let session = harvester(stub, HarvestSettings::default())
        .harvest(urls(&["https://a.test/"]), QueryMap::new(), &NullProgressSink)
        .await;

    assert_eq!(session.results()["https://a.test/"], BTreeMap::new());
    assert!(session.failures().is_empty());
}

#[tokio::test]
async fn empty_url_list_finishes_immediately() {
    let stub = Arc::new(PageStub::default());
    let queries: QueryMap = [("t", "//h1")].into_iter().collect();

    let session = harvester(Arc::clone(&stub), HarvestSettings::default())
        .harvest(Vec::new(), queries, &NullProgressSink)
        .await;

    assert!(session.results().is_empty());
    assert!(session.failures().is_empty());
    assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn additional_fields_are_merged_into_each_record() {
    let stub = Arc::new(PageStub::new([("https://a.test/", "<h1>A</h1>")]));
    let queries: QueryMap = [("t", "//h1")].into_iter().collect();
    let settings = HarvestSettings {
        additional_fields: BTreeMap::from([("source".to_string(), "crawl-7".to_string())]),
        ..HarvestSettings::default()
    };

    let session = harvester(stub, settings)
        .harvest(urls(&["https://a.test/"]), queries, &NullProgressSink)
        .await;

    let record = &session.results()["https://a.test/"];
    assert_eq!(record["t"], vec!["A"]);
    assert_eq!(record["source"], vec!["crawl-7"]);
}

#[tokio::test]
async fn concurrency_limit_is_respected() {
    let pages: Vec<(String, String)> = (0..12)
        .map(|i| (format!("https://p{i}.test/"), format!("<h1>{i}</h1>")))
        .collect();
    let stub = Arc::new(PageStub {
        pages: pages.iter().cloned().collect(),
        delay: Duration::from_millis(20),
        ..PageStub::default()
    });
    let queries: QueryMap = [("t", "//h1")].into_iter().collect();
    let settings = HarvestSettings {
        concurrency: 3,
        ..HarvestSettings::default()
    };

    let session = harvester(Arc::clone(&stub), settings)
        .harvest(pages.into_iter().map(|(url, _)| url).collect(), queries, &NullProgressSink)
        .await;

    assert_eq!(session.results().len(), 12);
    assert!(stub.peak.load(Ordering::SeqCst) <= 3);
    assert!(stub.peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn settle_interval_keeps_the_worker_slot() {
    let stub = Arc::new(PageStub::new([
        ("https://a.test/", "<h1>A</h1>"),
        ("https://b.test/", "<h1>B</h1>"),
        ("https://c.test/", "<h1>C</h1>"),
        ("https://d.test/", "<h1>D</h1>"),
    ]));
    let settings = HarvestSettings {
        concurrency: 2,
        interval: Some(Duration::from_secs(5)),
        ..HarvestSettings::default()
    };
    let input = urls(&["https://a.test/", "https://b.test/", "https://c.test/", "https://d.test/"]);

    let begun = tokio::time::Instant::now();
    let session = harvester(stub.clone(), settings)
        .harvest(input, QueryMap::new(), &NullProgressSink)
        .await;

    assert_eq!(session.results().len(), 4);
    let mut offsets: Vec<Duration> = stub
        .started
        .lock()
        .unwrap()
        .iter()
        .map(|at| at.duration_since(begun))
        .collect();
    offsets.sort();
    // Two slots: the second pair only starts once the first pair has settled.
    assert!(offsets[1] < Duration::from_secs(5), "{offsets:?}");
    assert!(offsets[2] >= Duration::from_secs(5), "{offsets:?}");
    assert!(begun.elapsed() >= Duration::from_secs(10));
}

#[tokio::test]
async fn extraction_failure_fails_the_url_but_keeps_the_cached_body() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(
        DiskCache::open(CacheSettings {
            directory: temp.path().to_path_buf(),
            ..CacheSettings::default()
        })
        .unwrap(),
    );
    let stub = Arc::new(PageStub::new([("https://a.test/", "<h1>A</h1>")]));
    let queries: QueryMap = [("t", "//h1["), ("u", "//h1")].into_iter().collect();
    let fetcher = RetryingFetcher::new(RetryPolicy::default()).with_cache(cache.clone());
    let harvester = Harvester::new(
        stub,
        fetcher,
        Arc::new(HtmlFieldExtractor::default()),
        HarvestSettings::default(),
    );

    let session = harvester
        .harvest(urls(&["https://a.test/"]), queries, &NullProgressSink)
        .await;

    assert!(session.results().is_empty());
    assert_eq!(session.failures(), &["https://a.test/".to_string()]);
    let key = RequestIdentity::get("https://a.test/").cache_key();
    assert_eq!(cache.read(&key).unwrap().unwrap().body, b"<h1>A</h1>");
}

#[tokio::test]
async fn progress_is_reported_once_per_url() {
    let stub = Arc::new(PageStub::new([("https://a.test/", "<h1>A</h1>")]));
    let queries: QueryMap = [("t", "//h1")].into_iter().collect();
    let sink = RecordingSink::default();

    harvester(stub, HarvestSettings::default())
        .harvest(urls(&["https://a.test/", "https://b.test/"]), queries, &sink)
        .await;

    let mut events = sink.events.lock().unwrap().clone();
    events.sort_by_key(|event| event.job_id);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].stage, Stage::Done);
    assert_eq!(events[1].stage, Stage::Failed);
    assert!(events.iter().all(|event| event.total == 2));
    let mut completed: Vec<_> = events.iter().map(|event| event.completed).collect();
    completed.sort();
    assert_eq!(completed, vec![1, 2]);
}

/// `http://a` serves a heading; `http://b` times out on every attempt.
struct TransientB {
    b_calls: AtomicUsize,
}

#[async_trait::async_trait]
impl FetchStrategy for TransientB {
    fn request_identity(&self, url: &str) -> RequestIdentity {
        RequestIdentity::get(url)
    }

    async fn fetch(&self, request: &RequestIdentity) -> Result<FetchedPage, FetchError> {
        if request.url().starts_with("http://b") {
            self.b_calls.fetch_add(1, Ordering::SeqCst);
            return Err(FetchError::new(FailureKind::Timeout, "stubbed timeout"));
        }
        Ok(FetchedPage {
            status: 200,
            final_url: request.url().to_string(),
            headers: BTreeMap::new(),
            body: b"<h1>Hi</h1>".to_vec(),
        })
    }
}

#[tokio::test]
async fn transient_failures_exhaust_retries_for_one_url_only() {
    let strategy = Arc::new(TransientB {
        b_calls: AtomicUsize::new(0),
    });
    let fetcher = RetryingFetcher::new(RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(5),
    });
    let harvester = Harvester::new(
        strategy.clone(),
        fetcher,
        Arc::new(HtmlFieldExtractor::default()),
        HarvestSettings::default(),
    );
    let queries: QueryMap = [("h1", "//h1")].into_iter().collect();

    let session = harvester
        .harvest(urls(&["http://a", "http://b"]), queries, &NullProgressSink)
        .await;

    let expected = BTreeMap::from([(
        "http://a".to_string(),
        BTreeMap::from([("h1".to_string(), vec!["Hi".to_string()])]),
    )]);
    assert_eq!(session.results(), &expected);
    assert_eq!(session.failures(), &["http://b".to_string()]);
    assert_eq!(strategy.b_calls.load(Ordering::SeqCst), 3);
}
