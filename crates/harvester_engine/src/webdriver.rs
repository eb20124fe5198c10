//! Remote browser settings and error mapping over the `fantoccini` WebDriver client.

use std::collections::BTreeMap;
use std::time::Duration;

use engine_logging::engine_info;
use fantoccini::error::{CmdError, ErrorStatus};
use fantoccini::{Client, ClientBuilder};
use serde_json::{json, Map, Value};

use crate::{FailureKind, FetchError};

#[derive(Debug, Clone)]
pub struct WebDriverSettings {
    /// Base URL of the remote end, e.g. `http://localhost:4444/wd/hub`.
    pub endpoint: String,
    pub browser_name: String,
    /// Extra browser command-line arguments (`goog:chromeOptions`).
    pub browser_args: Vec<String>,
    /// Cookies added after each navigation.
    pub cookies: BTreeMap<String, String>,
    /// Budget for opening a session and for loading one page, excluding scripted waits.
    pub request_timeout: Duration,
}

impl WebDriverSettings {
    pub fn remote(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("http://{host}:{port}/wd/hub"),
            ..Self::default()
        }
    }

    pub fn capabilities(&self) -> Map<String, Value> {
        let mut capabilities = Map::new();
        capabilities.insert("browserName".to_string(), json!(self.browser_name));
        if !self.browser_args.is_empty() {
            capabilities.insert(
                "goog:chromeOptions".to_string(),
                json!({ "args": self.browser_args }),
            );
        }
        capabilities
    }
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4444/wd/hub".to_string(),
            browser_name: "chrome".to_string(),
            browser_args: Vec::new(),
            cookies: BTreeMap::new(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebDriverError {
    #[error("could not start a browser session: {0}")]
    SessionNotCreated(String),
    #[error("webdriver error `{code}`: {message}")]
    Protocol { code: String, message: String },
    #[error("webdriver connection failed: {0}")]
    Transport(String),
    #[error("webdriver did not answer within {0:?}")]
    Timeout(Duration),
}

impl WebDriverError {
    /// Errors caused by a missing, stale or unusable element rather than the session.
    pub fn is_element_error(&self) -> bool {
        match self {
            WebDriverError::Protocol { code, .. } => matches!(
                code.as_str(),
                "no such element"
                    | "stale element reference"
                    | "element not interactable"
                    | "element click intercepted"
                    | "invalid element state"
            ),
            _ => false,
        }
    }
}

impl From<CmdError> for WebDriverError {
    fn from(err: CmdError) -> Self {
        let code = if err.is_no_such_element() {
            Some("no such element".to_string())
        } else {
            match &err {
                CmdError::Standard(details) => Some(error_code(&details.error)),
                _ => None,
            }
        };
        match code {
            Some(code) => WebDriverError::Protocol {
                code,
                message: err.to_string(),
            },
            None => WebDriverError::Transport(err.to_string()),
        }
    }
}

impl From<WebDriverError> for FetchError {
    fn from(err: WebDriverError) -> Self {
        let message = err.to_string();
        match err {
            WebDriverError::SessionNotCreated(_) => FetchError::new(
                FailureKind::Automation {
                    error: "session not created".to_string(),
                },
                message,
            ),
            WebDriverError::Protocol { code, .. } => {
                FetchError::new(FailureKind::Automation { error: code }, message)
            }
            WebDriverError::Transport(_) => FetchError::new(FailureKind::Network, message),
            WebDriverError::Timeout(_) => FetchError::new(FailureKind::Timeout, message),
        }
    }
}

/// W3C error code for the statuses the harvester tells apart.
fn error_code(status: &ErrorStatus) -> String {
    let code = match status {
        ErrorStatus::NoSuchElement => "no such element",
        ErrorStatus::StaleElementReference => "stale element reference",
        ErrorStatus::ElementNotInteractable => "element not interactable",
        ErrorStatus::ElementClickIntercepted => "element click intercepted",
        ErrorStatus::InvalidElementState => "invalid element state",
        ErrorStatus::InvalidSessionId => "invalid session id",
        ErrorStatus::NoSuchWindow => "no such window",
        ErrorStatus::SessionNotCreated => "session not created",
        ErrorStatus::Timeout => "timeout",
        ErrorStatus::ScriptTimeout => "script timeout",
        ErrorStatus::UnknownError => "unknown error",
        other => return format!("{other:?}"),
    };
    code.to_string()
}

/// Open a new browser session at `settings.endpoint`.
pub async fn connect(settings: &WebDriverSettings) -> Result<Client, WebDriverError> {
    // Command paths are resolved relative to the endpoint, which therefore needs a trailing slash.
    let endpoint = format!("{}/", settings.endpoint.trim_end_matches('/'));
    let mut builder = ClientBuilder::native();
    builder.capabilities(settings.capabilities());

    let client = tokio::time::timeout(settings.request_timeout, builder.connect(&endpoint))
        .await
        .map_err(|_| WebDriverError::Timeout(settings.request_timeout))?
        .map_err(|err| WebDriverError::SessionNotCreated(err.to_string()))?;
    engine_info!("webdriver session opened at {}", settings.endpoint);
    Ok(client)
}
