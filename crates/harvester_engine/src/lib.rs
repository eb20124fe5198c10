//! Harvester engine: fetch strategies, response cache, extraction and reporting.
mod action;
mod cache;
mod decode;
mod engine;
mod extract;
mod fetch;
mod persist;
mod report;
mod request;
mod retry;
mod scripted;
mod types;
mod webdriver;
mod xpath;

pub use action::{Action, ActionError, ActionParseError, ActionScript};
pub use cache::{CacheError, CacheSettings, CachedResponse, DiskCache, ResponseStore};
pub use decode::{decode_body, DecodeError};
pub use engine::{HarvestProgress, HarvestSettings, Harvester, NullProgressSink, ProgressSink};
pub use extract::{ExtractionError, FieldExtractor, HtmlFieldExtractor, QueryDialect};
pub use fetch::{FetchSettings, FetchStrategy, ReqwestFetcher};
pub use persist::{ensure_output_dir, write_file, AtomicFileWriter, PersistError};
pub use report::{
    render_failures, render_json, render_tsv, Destination, OutputFormat, ReportError,
    ReportOptions, ReportTarget, Reporter,
};
pub use request::{CacheKey, RequestIdentity};
pub use retry::{RetryPolicy, RetryingFetcher};
pub use scripted::{ScriptedFetcher, SessionGuard};
pub use types::{FailureKind, FetchError, FetchedPage};
pub use webdriver::{connect, WebDriverError, WebDriverSettings};
