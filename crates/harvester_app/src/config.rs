use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use engine_logging::{engine_info, engine_warn};
use harvester_core::{parse_pair, QueryMap};
use harvester_engine::{
    ActionScript, CacheSettings, FetchSettings, HarvestSettings, OutputFormat, QueryDialect,
    ReportOptions, RetryPolicy, WebDriverSettings,
};
use serde::Deserialize;

use crate::cli::Cli;

/// Harvest inputs kept in a RON file, so long query lists need not live on the command line.
///
/// ```ron
/// (
///     urls: ["https://example.com/"],
///     queries: [("title", "//h1"), ("links", "//a/@href")],
///     headers: {"accept-language": "en"},
/// )
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunFile {
    pub urls: Vec<String>,
    /// Ordered, since query order is the TSV column order.
    pub queries: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub additional: BTreeMap<String, String>,
    pub actions: Vec<String>,
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading run file {}", path.display()))?;
        let run_file = ron::from_str(&content)
            .with_context(|| format!("parsing run file {}", path.display()))?;
        engine_info!("loaded run file {}", path.display());
        Ok(run_file)
    }
}

/// One URL per line; blank lines and `#` comments are ignored.
pub fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Everything a run needs, resolved from the CLI and the optional files.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub urls: Vec<String>,
    pub queries: QueryMap,
    pub dialect: QueryDialect,
    pub fetch: FetchSettings,
    /// Set when pages are loaded through a remote browser.
    pub webdriver: Option<WebDriverSettings>,
    pub actions: ActionScript,
    pub retry: RetryPolicy,
    pub cache: CacheSettings,
    pub harvest: HarvestSettings,
    pub report: ReportOptions,
    pub progress: bool,
}

impl RunConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let run_file = match &cli.config {
            Some(path) => RunFile::load(path)?,
            None => RunFile::default(),
        };
        let listed = match &cli.url_file {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("reading url file {}", path.display()))?;
                parse_url_list(&content)
            }
            None => Vec::new(),
        };
        Self::assemble(cli, run_file, listed)
    }

    /// Merge the run file, the URL list and CLI flags. CLI values win on equal keys.
    pub fn assemble(cli: &Cli, run_file: RunFile, listed_urls: Vec<String>) -> Result<Self> {
        let mut urls = run_file.urls;
        urls.extend(listed_urls);
        urls.extend(cli.urls.iter().cloned());
        if urls.is_empty() {
            bail!("no URLs given: pass them as arguments, with --url-file or in the run file");
        }

        let mut queries: QueryMap = run_file.queries.into_iter().collect();
        for (name, expression) in pairs(&cli.queries, "--xpaths")? {
            queries.insert(name, expression);
        }
        if queries.is_empty() {
            engine_warn!("no queries given; every record will be empty");
        }

        let headers = merged(run_file.headers, &cli.headers, "--headers")?;
        let cookies = merged(run_file.cookies, &cli.cookies, "--cookies")?;
        let additional = merged(run_file.additional, &cli.additional, "--additional-info")?;

        let mut steps = run_file.actions;
        steps.extend(cli.actions.iter().cloned());
        let actions = ActionScript::parse(&steps).context("invalid --actions step")?;

        let request_timeout = seconds(cli.timeout, "--timeout")?;
        let webdriver = (cli.host.is_some() || !actions.is_empty()).then(|| {
            let host = cli.host.as_deref().unwrap_or("localhost");
            WebDriverSettings {
                browser_name: cli.browser.clone(),
                browser_args: cli.browser_args.clone(),
                cookies: cookies.clone(),
                request_timeout: request_timeout.max(Duration::from_secs(60)),
                ..WebDriverSettings::remote(host, cli.port)
            }
        });
        if webdriver.is_some() && !headers.is_empty() {
            engine_warn!("request headers are not applied by the WebDriver fetcher");
        }

        let fetch = FetchSettings {
            request_timeout,
            headers,
            cookies,
            ..FetchSettings::default()
        };

        let retry = RetryPolicy {
            attempts: cli.retries.max(1),
            delay: seconds(cli.retry_delay, "--retry-delay")?,
        };
        let cache = CacheSettings {
            directory: cli.cache_dir.clone(),
            ttl: cli
                .cache_ttl
                .map(|ttl| seconds(ttl, "--cache-ttl"))
                .transpose()?,
            enabled: !cli.no_cache,
        };
        let harvest = HarvestSettings {
            concurrency: cli.concurrency.max(1),
            interval: cli
                .interval
                .map(|interval| seconds(interval, "--interval"))
                .transpose()?,
            additional_fields: additional,
            debug: cli.debug,
        };

        let format = if cli.json {
            Some(OutputFormat::Json)
        } else if cli.tab {
            Some(OutputFormat::Tsv)
        } else {
            None
        };
        let report = ReportOptions {
            format,
            out: cli.out.clone(),
            prefix: cli.prefix.clone(),
        };

        Ok(Self {
            urls,
            queries,
            dialect: cli.dialect.into(),
            fetch,
            webdriver,
            actions,
            retry,
            cache,
            harvest,
            report,
            progress: cli.progress,
        })
    }
}

fn pairs(raw: &[String], flag: &str) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|item| parse_pair(item).with_context(|| format!("invalid {flag} value")))
        .collect()
}

fn merged(
    mut base: BTreeMap<String, String>,
    raw: &[String],
    flag: &str,
) -> Result<BTreeMap<String, String>> {
    base.extend(pairs(raw, flag)?);
    Ok(base)
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{flag} must be a non-negative number of seconds"))
}
