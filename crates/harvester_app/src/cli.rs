use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use harvester_engine::QueryDialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    /// XPath path expressions.
    #[value(alias = "xpath2")]
    Xpath,
    /// CSS selectors.
    Css,
}

impl From<DialectArg> for QueryDialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Xpath => QueryDialect::XPath,
            DialectArg::Css => QueryDialect::Css,
        }
    }
}

/// Fetch web pages and extract named fields with path expressions.
///
/// Multi-value options take several values in one go, so put URLs first:
/// `harvest https://a.test https://b.test --xpaths title://h1 price://b`.
#[derive(Debug, Parser)]
#[command(name = "harvest", version)]
pub struct Cli {
    /// URLs to harvest.
    pub urls: Vec<String>,

    /// Fields to extract, as `name:expression`.
    #[arg(long = "xpaths", value_name = "NAME:EXPR", num_args = 1..)]
    pub queries: Vec<String>,

    /// Query language of the expressions.
    #[arg(long, value_enum, default_value_t = DialectArg::Xpath)]
    pub dialect: DialectArg,

    /// Request headers, as `name:value`.
    #[arg(long, value_name = "NAME:VALUE", num_args = 1..)]
    pub headers: Vec<String>,

    /// Cookies, as `name:value`.
    #[arg(long, value_name = "NAME:VALUE", num_args = 1..)]
    pub cookies: Vec<String>,

    /// Static fields added to every record, as `name:value`.
    #[arg(long = "additional-info", value_name = "NAME:VALUE", num_args = 1..)]
    pub additional: Vec<String>,

    /// Browser steps run on every page, as `verb:argument`. Implies the WebDriver fetcher.
    #[arg(long, value_name = "VERB:ARG", num_args = 1..)]
    pub actions: Vec<String>,

    /// WebDriver host. Selects the remote browser fetcher.
    #[arg(long)]
    pub host: Option<String>,

    /// WebDriver port.
    #[arg(long, default_value_t = 4444)]
    pub port: u16,

    /// Browser requested from the WebDriver endpoint.
    #[arg(long, default_value = "chrome")]
    pub browser: String,

    /// Extra browser command-line argument (repeatable).
    #[arg(long = "browser-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub browser_args: Vec<String>,

    /// Write JSON.
    #[arg(long, conflicts_with = "tab")]
    pub json: bool,

    /// Write tab-separated values.
    #[arg(long)]
    pub tab: bool,

    /// Output file; `.json` or `.tsv` selects the format.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Path stem: writes `<prefix>.json`, `<prefix>.tsv` and `<prefix>.log`.
    #[arg(long)]
    pub prefix: Option<PathBuf>,

    /// Show a progress bar.
    #[arg(long)]
    pub progress: bool,

    /// Seconds to wait after each page.
    #[arg(long, value_name = "SECONDS")]
    pub interval: Option<f64>,

    /// Debug logging, including every record and page body.
    #[arg(short = 'v', long)]
    pub debug: bool,

    /// Also write the log to this file.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Response cache directory.
    #[arg(long, default_value = "harvest_cache")]
    pub cache_dir: PathBuf,

    /// Always fetch; neither read nor write the cache.
    #[arg(long)]
    pub no_cache: bool,

    /// Maximum age of cached responses in seconds. Entries never expire by default.
    #[arg(long, value_name = "SECONDS")]
    pub cache_ttl: Option<f64>,

    /// Attempts per URL, including the first.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Seconds between attempts.
    #[arg(long, value_name = "SECONDS", default_value_t = 10.0)]
    pub retry_delay: f64,

    /// Pages processed at once.
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Per-request timeout in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 30.0)]
    pub timeout: f64,

    /// RON run file with urls, queries, headers, cookies, additional fields and actions.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// File with one URL per line; blank lines and `#` comments are skipped.
    #[arg(long, value_name = "PATH")]
    pub url_file: Option<PathBuf>,
}
