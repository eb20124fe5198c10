use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use engine_logging::{engine_debug, engine_error, engine_info};
use harvester_core::{update, Effect, HarvestSession, JobId, Msg, QueryMap, ResultRecord, Stage};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::extract::{ExtractionError, FieldExtractor};
use crate::retry::RetryingFetcher;
use crate::{FetchError, FetchStrategy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestSettings {
    /// Upper bound on URLs being fetched or extracted at once.
    pub concurrency: usize,
    /// Settle delay after each URL, held while the worker slot is still taken.
    pub interval: Option<Duration>,
    /// Static fields merged into every record as one-element lists.
    pub additional_fields: BTreeMap<String, String>,
    /// Dump every record and fetched body at debug level.
    pub debug: bool,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            interval: None,
            additional_fields: BTreeMap::new(),
            debug: false,
        }
    }
}

/// Emitted once per URL when it reaches a terminal stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestProgress {
    pub job_id: JobId,
    pub url: String,
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: HarvestProgress);
}

pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: HarvestProgress) {}
}

#[derive(Debug, thiserror::Error)]
enum JobError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractionError),
}

/// Runs fetch, extract and record for every URL with bounded concurrency.
///
/// Workers report through a channel to a single aggregation loop that owns
/// the [`HarvestSession`]; a failing URL only ever produces its own
/// `Failed` message.
#[derive(Clone)]
pub struct Harvester {
    strategy: Arc<dyn FetchStrategy>,
    fetcher: RetryingFetcher,
    extractor: Arc<dyn FieldExtractor>,
    settings: HarvestSettings,
}

impl Harvester {
    pub fn new(
        strategy: Arc<dyn FetchStrategy>,
        fetcher: RetryingFetcher,
        extractor: Arc<dyn FieldExtractor>,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            strategy,
            fetcher,
            extractor,
            settings,
        }
    }

    pub fn settings(&self) -> &HarvestSettings {
        &self.settings
    }

    pub async fn harvest(
        &self,
        urls: Vec<String>,
        queries: QueryMap,
        sink: &dyn ProgressSink,
    ) -> HarvestSession {
        let mut session = HarvestSession::new(urls, queries);
        engine_info!(
            "harvesting {} urls, {} fields, concurrency {}",
            session.urls().len(),
            session.queries().len(),
            self.settings.concurrency.max(1)
        );

        let limit = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let queries = Arc::new(session.queries().clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for (job_id, url) in session.urls().iter().enumerate() {
            let worker = Worker {
                job_id,
                url: url.clone(),
                queries: Arc::clone(&queries),
                harvester: self.clone(),
                limit: Arc::clone(&limit),
                tx: tx.clone(),
            };
            tasks.spawn(worker.run());
        }
        drop(tx);

        // Ends once every worker has finished and dropped its sender.
        while let Some(msg) = rx.recv().await {
            let (next, effects) = update(session, msg);
            session = next;
            run_effects(effects, sink);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                engine_error!("harvest worker aborted: {}", err);
            }
        }
        for job_id in session.unfinished_jobs() {
            let msg = Msg::Failed {
                job_id,
                cause: "worker aborted before reporting".to_string(),
            };
            let (next, effects) = update(session, msg);
            session = next;
            run_effects(effects, sink);
        }

        let summary = session.summary();
        engine_info!(
            "harvest finished: {} succeeded, {} failed",
            summary.succeeded,
            summary.failed
        );
        session
    }

    async fn harvest_one(
        &self,
        job_id: JobId,
        url: &str,
        queries: &QueryMap,
        tx: &mpsc::UnboundedSender<Msg>,
    ) -> Result<ResultRecord, JobError> {
        let _ = tx.send(Msg::StageChanged {
            job_id,
            stage: Stage::Fetching,
        });
        let request = self.strategy.request_identity(url);
        let page = self.fetcher.fetch(&request, self.strategy.as_ref()).await?;

        let _ = tx.send(Msg::StageChanged {
            job_id,
            stage: Stage::Extracting,
        });
        let mut record = self
            .extractor
            .extract(&page.body, page.content_type(), queries)?;
        for (name, value) in &self.settings.additional_fields {
            record.insert(name.clone(), vec![value.clone()]);
        }

        if self.settings.debug {
            engine_debug!("{} -> {:?}", url, record);
            engine_debug!("{} body:\n{}", url, String::from_utf8_lossy(&page.body));
        }
        Ok(record)
    }
}

struct Worker {
    job_id: JobId,
    url: String,
    queries: Arc<QueryMap>,
    harvester: Harvester,
    limit: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Msg>,
}

impl Worker {
    async fn run(self) {
        let Ok(_permit) = self.limit.acquire_owned().await else {
            return;
        };
        let outcome = self
            .harvester
            .harvest_one(self.job_id, &self.url, &self.queries, &self.tx)
            .await;
        let msg = match outcome {
            Ok(record) => Msg::Harvested {
                job_id: self.job_id,
                record,
            },
            Err(err) => Msg::Failed {
                job_id: self.job_id,
                cause: err.to_string(),
            },
        };
        let _ = self.tx.send(msg);

        if let Some(interval) = self.harvester.settings.interval {
            tokio::time::sleep(interval).await;
        }
    }
}

fn run_effects(effects: Vec<Effect>, sink: &dyn ProgressSink) {
    for effect in effects {
        match effect {
            Effect::LogFailure { url, cause } => engine_error!("{}: {}", url, cause),
            Effect::Progress {
                job_id,
                url,
                stage,
                completed,
                total,
            } => sink.emit(HarvestProgress {
                job_id,
                url,
                stage,
                completed,
                total,
            }),
        }
    }
}
