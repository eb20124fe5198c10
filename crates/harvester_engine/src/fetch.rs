use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, ETAG, LAST_MODIFIED};

use crate::{FailureKind, FetchError, FetchedPage, RequestIdentity};

/// Turns a URL into a raw document body.
///
/// Implementations decide which headers make two requests equivalent by
/// building the [`RequestIdentity`]; `fetch` must honor exactly that identity.
#[async_trait::async_trait]
pub trait FetchStrategy: Send + Sync {
    fn request_identity(&self, url: &str) -> RequestIdentity;

    async fn fetch(&self, request: &RequestIdentity) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub user_agent: Option<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            redirect_limit: 5,
            max_bytes: 5 * 1024 * 1024,
            allowed_content_types: vec![
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
                "application/xml".to_string(),
                "text/xml".to_string(),
            ],
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            user_agent: None,
        }
    }
}

/// Joins cookies into a single `Cookie` header value.
pub(crate) fn cookie_header(cookies: &BTreeMap<String, String>) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Direct strategy: one HTTP GET per fetch.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    settings: FetchSettings,
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(settings.redirect_limit));
        if let Some(agent) = settings.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        let client = builder
            .build()
            .map_err(|err| FetchError::new(FailureKind::InvalidRequest, err.to_string()))?;
        Ok(Self { settings, client })
    }

    fn is_content_type_allowed(&self, content_type: &str) -> bool {
        let ct = content_type.split(';').next().unwrap_or(content_type).trim();
        self.settings
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ct))
    }
}

#[async_trait::async_trait]
impl FetchStrategy for ReqwestFetcher {
    fn request_identity(&self, url: &str) -> RequestIdentity {
        let mut identity = RequestIdentity::get(url);
        for (name, value) in &self.settings.headers {
            identity = identity.with_header(name, value.clone());
        }
        if let Some(cookies) = cookie_header(&self.settings.cookies) {
            identity = identity.with_header("cookie", cookies);
        }
        identity
    }

    async fn fetch(&self, request: &RequestIdentity) -> Result<FetchedPage, FetchError> {
        let parsed = reqwest::Url::parse(request.url())
            .map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;
        let method = reqwest::Method::from_bytes(request.method().as_bytes())
            .map_err(|err| FetchError::new(FailureKind::InvalidRequest, err.to_string()))?;

        let mut builder = self.client.request(method, parsed);
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FailureKind::HttpStatus(status.as_u16()),
                format!("{} returned {}", request.url(), status),
            ));
        }

        if let Some(content_len) = response.content_length() {
            if content_len > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(content_len),
                    },
                    "response too large",
                ));
            }
        }

        let final_url = response.url().to_string();
        let mut headers = BTreeMap::new();
        for name in [CONTENT_TYPE, ETAG, LAST_MODIFIED] {
            if let Some(value) = response.headers().get(&name).and_then(|v| v.to_str().ok()) {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        if let Some(ct) = headers.get(CONTENT_TYPE.as_str()) {
            if !self.is_content_type_allowed(ct) {
                return Err(FetchError::new(
                    FailureKind::UnsupportedContentType {
                        content_type: ct.to_string(),
                    },
                    "unsupported content type",
                ));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = body.len() as u64 + chunk.len() as u64;
            if next_len > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(next_len),
                    },
                    "response too large",
                ));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            status: status.as_u16(),
            final_url,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_redirect() {
        return FetchError::new(FailureKind::RedirectLimitExceeded, err.to_string());
    }
    if err.is_builder() {
        return FetchError::new(FailureKind::InvalidRequest, err.to_string());
    }
    if err.is_connect() {
        return FetchError::new(FailureKind::Connect, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}
