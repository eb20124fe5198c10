use std::sync::Arc;

use anyhow::{Context, Result};
use engine_logging::{engine_info, engine_warn};
use harvester_core::{HarvestSession, SessionSummary};
use harvester_engine::{
    DiskCache, FetchStrategy, Harvester, HtmlFieldExtractor, NullProgressSink, ProgressSink,
    Reporter, ReqwestFetcher, RetryingFetcher, ScriptedFetcher, SessionGuard,
};

use crate::config::RunConfig;
use crate::progress::BarProgress;

/// Harvest every URL, then write results and the failure log.
///
/// Per-URL failures are reported, not returned; only setup and output errors fail the run.
pub async fn run(config: RunConfig) -> Result<SessionSummary> {
    let mut fetcher = RetryingFetcher::new(config.retry);
    if config.cache.enabled {
        let cache = DiskCache::open(config.cache.clone()).with_context(|| {
            format!("opening cache directory {}", config.cache.directory.display())
        })?;
        fetcher = fetcher.with_cache(Arc::new(cache));
    } else {
        engine_info!("response cache disabled");
    }
    let extractor = Arc::new(HtmlFieldExtractor::new(config.dialect));

    let bar = config.progress.then(|| BarProgress::new(config.urls.len()));
    let sink: &dyn ProgressSink = match &bar {
        Some(bar) => bar,
        None => &NullProgressSink,
    };

    let session = match &config.webdriver {
        Some(settings) => {
            let scripted = Arc::new(ScriptedFetcher::new(settings.clone(), config.actions.clone()));
            let guard = SessionGuard::new(scripted.clone());
            engine_info!("fetching through webdriver at {}", settings.endpoint);
            let session = harvest(&config, scripted, fetcher, extractor, sink).await;
            if let Err(err) = guard.close().await {
                engine_warn!("failed to close webdriver session: {}", err);
            }
            session
        }
        None => {
            let direct =
                ReqwestFetcher::new(config.fetch.clone()).context("building http client")?;
            harvest(&config, Arc::new(direct), fetcher, extractor, sink).await
        }
    };
    if let Some(bar) = &bar {
        bar.finish();
    }

    let extra_columns = config.harvest.additional_fields.keys().cloned().collect();
    let reporter = Reporter::new(config.report.clone()).with_extra_columns(extra_columns);
    reporter
        .write_results(&session)
        .context("writing harvest results")?;
    reporter
        .write_failures(&session)
        .context("writing failure log")?;

    Ok(session.summary())
}

async fn harvest(
    config: &RunConfig,
    strategy: Arc<dyn FetchStrategy>,
    fetcher: RetryingFetcher,
    extractor: Arc<HtmlFieldExtractor>,
    sink: &dyn ProgressSink,
) -> HarvestSession {
    let harvester = Harvester::new(strategy, fetcher, extractor, config.harvest.clone());
    harvester
        .harvest(config.urls.clone(), config.queries.clone(), sink)
        .await
}
