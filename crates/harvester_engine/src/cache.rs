use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use engine_logging::engine_debug;
use serde::{Deserialize, Serialize};

use crate::persist::{AtomicFileWriter, PersistError};
use crate::request::{CacheKey, RequestIdentity};
use crate::FetchedPage;

const ENTRY_EXTENSION: &str = "entry";

/// A stored response. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub final_url: String,
    pub headers: BTreeMap<String, String>,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn from_page(page: &FetchedPage, fetched_at: DateTime<Utc>) -> Self {
        Self {
            status: page.status,
            final_url: page.final_url.clone(),
            headers: page.headers.clone(),
            fetched_at,
            body: page.body.clone(),
        }
    }

    pub fn into_page(self) -> FetchedPage {
        FetchedPage {
            status: self.status,
            final_url: self.final_url,
            headers: self.headers,
            body: self.body,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),
    #[error("cache write failed: {0}")]
    Persist(#[from] PersistError),
    #[error("corrupt cache entry {key}: {message}")]
    Corrupt { key: CacheKey, message: String },
}

/// Persistent key -> response store shared by all fetch tasks.
pub trait ResponseStore: Send + Sync {
    fn read(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError>;
    fn write(
        &self,
        key: &CacheKey,
        request: &RequestIdentity,
        response: &CachedResponse,
    ) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub directory: PathBuf,
    /// `None` keeps entries forever.
    pub ttl: Option<Duration>,
    /// When false the harvest runs without a store and always fetches.
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("harvest_cache"),
            ttl: None,
            enabled: true,
        }
    }
}

/// First line of an entry file; the raw body follows the newline.
#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    method: String,
    url: String,
    status: u16,
    final_url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    fetched_at: DateTime<Utc>,
}

/// One file per cache key under a directory, written atomically.
#[derive(Debug, Clone)]
pub struct DiskCache {
    writer: AtomicFileWriter,
    ttl: Option<Duration>,
}

impl DiskCache {
    pub fn open(settings: CacheSettings) -> Result<Self, CacheError> {
        crate::persist::ensure_output_dir(&settings.directory)?;
        Ok(Self {
            writer: AtomicFileWriter::new(settings.directory),
            ttl: settings.ttl,
        })
    }

    fn entry_name(key: &CacheKey) -> String {
        format!("{key}.{ENTRY_EXTENSION}")
    }

    fn is_expired(&self, fetched_at: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        // Entries stamped in the future (clock skew) count as fresh.
        (Utc::now() - fetched_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }
}

impl ResponseStore for DiskCache {
    fn read(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let path = self.writer.dir().join(Self::entry_name(key));
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let response = decode_entry(key, &bytes)?;
        if self.is_expired(response.fetched_at) {
            engine_debug!("cache entry {} expired", key);
            return Ok(None);
        }
        Ok(Some(response))
    }

    fn write(
        &self,
        key: &CacheKey,
        request: &RequestIdentity,
        response: &CachedResponse,
    ) -> Result<(), CacheError> {
        let header = EntryHeader {
            method: request.method().to_string(),
            url: request.url().to_string(),
            status: response.status,
            final_url: response.final_url.clone(),
            headers: response.headers.clone(),
            fetched_at: response.fetched_at,
        };
        let mut content = serde_json::to_vec(&header).map_err(|err| CacheError::Corrupt {
            key: key.clone(),
            message: err.to_string(),
        })?;
        content.push(b'\n');
        content.extend_from_slice(&response.body);
        self.writer.write(&Self::entry_name(key), &content)?;
        Ok(())
    }
}

fn decode_entry(key: &CacheKey, bytes: &[u8]) -> Result<CachedResponse, CacheError> {
    let corrupt = |message: String| CacheError::Corrupt {
        key: key.clone(),
        message,
    };
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing header line".into()))?;
    let header: EntryHeader =
        serde_json::from_slice(&bytes[..split]).map_err(|err| corrupt(err.to_string()))?;
    Ok(CachedResponse {
        status: header.status,
        final_url: header.final_url,
        headers: header.headers,
        fetched_at: header.fetched_at,
        body: bytes[split + 1..].to_vec(),
    })
}
