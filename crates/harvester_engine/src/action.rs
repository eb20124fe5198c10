use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use engine_logging::{engine_debug, engine_warn};
use fantoccini::elements::Element;
use fantoccini::error::CmdError;
use fantoccini::{Client, Locator};

use crate::webdriver::WebDriverError;

const ENTER_KEY: &str = "\u{E007}";

/// One step of a browser interaction script, written as `verb` or `verb:argument`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    FindXPath(String),
    FindCss(String),
    Click,
    Clear,
    SendKeys(String),
    Submit,
    Back,
    Refresh,
    Navigate(String),
    Wait(Duration),
    /// Drop the current element and search from the document again.
    Root,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionParseError {
    #[error("unknown action `{0}`")]
    UnknownVerb(String),
    #[error("action `{verb}` needs an argument")]
    MissingArgument { verb: String },
    #[error("invalid wait duration `{0}`")]
    InvalidWait(String),
}

impl FromStr for Action {
    type Err = ActionParseError;

    fn from_str(step: &str) -> Result<Self, Self::Err> {
        let (verb, argument) = match step.split_once(':') {
            Some((verb, argument)) => (verb.trim(), argument),
            None => (step.trim(), ""),
        };
        let required = || {
            if argument.is_empty() {
                Err(ActionParseError::MissingArgument {
                    verb: verb.to_string(),
                })
            } else {
                Ok(argument.to_string())
            }
        };

        let action = match verb {
            "find_element" | "find_element_by_xpath" => Action::FindXPath(required()?),
            "find_element_by_css" | "find_element_by_css_selector" => Action::FindCss(required()?),
            "click" => Action::Click,
            "clear" => Action::Clear,
            "send_keys" => Action::SendKeys(required()?),
            "submit" => Action::Submit,
            "back" => Action::Back,
            "refresh" => Action::Refresh,
            "navigate" | "get" => Action::Navigate(required()?),
            "wait" | "sleep" => {
                let raw = required()?;
                let seconds: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| ActionParseError::InvalidWait(raw.clone()))?;
                let duration = Duration::try_from_secs_f64(seconds)
                    .map_err(|_| ActionParseError::InvalidWait(raw.clone()))?;
                Action::Wait(duration)
            }
            "root" | "reset" => Action::Root,
            other => return Err(ActionParseError::UnknownVerb(other.to_string())),
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::FindXPath(expression) => write!(f, "find_element:{expression}"),
            Action::FindCss(selector) => write!(f, "find_element_by_css:{selector}"),
            Action::Click => write!(f, "click"),
            Action::Clear => write!(f, "clear"),
            Action::SendKeys(text) => write!(f, "send_keys:{text}"),
            Action::Submit => write!(f, "submit"),
            Action::Back => write!(f, "back"),
            Action::Refresh => write!(f, "refresh"),
            Action::Navigate(url) => write!(f, "navigate:{url}"),
            Action::Wait(duration) => write!(f, "wait:{}", duration.as_secs_f64()),
            Action::Root => write!(f, "root"),
        }
    }
}

/// Ordered interaction steps run against every page before its source is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionScript {
    steps: Vec<Action>,
}

impl ActionScript {
    pub fn parse<S: AsRef<str>>(steps: &[S]) -> Result<Self, ActionParseError> {
        let steps = steps
            .iter()
            .map(|step| step.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Action] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Time the script spends in `wait` steps.
    pub fn total_wait(&self) -> Duration {
        self.steps
            .iter()
            .map(|step| match step {
                Action::Wait(duration) => *duration,
                _ => Duration::ZERO,
            })
            .sum()
    }
}

impl fmt::Display for ActionScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

/// A step that could not be applied to the page.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("`{verb}` needs a located element")]
    NoElement { verb: &'static str },
    #[error("element unavailable: {0}")]
    Element(WebDriverError),
    #[error(transparent)]
    Session(WebDriverError),
}

impl From<CmdError> for ActionError {
    fn from(err: CmdError) -> Self {
        WebDriverError::from(err).into()
    }
}

impl From<WebDriverError> for ActionError {
    fn from(err: WebDriverError) -> Self {
        if err.is_element_error() {
            ActionError::Element(err)
        } else {
            ActionError::Session(err)
        }
    }
}

/// Run every step of `script`. Element-level failures are logged and reset the
/// cursor to the document root; session failures abort the script.
pub(crate) async fn run_script(
    client: &Client,
    script: &ActionScript,
) -> Result<(), WebDriverError> {
    let mut cursor: Option<Element> = None;
    for action in script.steps() {
        engine_debug!("action {}", action);
        cursor = match run_step(client, cursor.as_ref(), action).await {
            Ok(next) => next,
            Err(ActionError::Session(err)) => return Err(err),
            Err(err) => {
                engine_warn!("action `{}` failed: {}; continuing from the page root", action, err);
                None
            }
        };
        // Clicks and submits may replace the page under the cursor.
        if let Some(element) = &cursor {
            if element.text().await.is_err() {
                engine_debug!("element went stale after `{}`; back to the page root", action);
                cursor = None;
            }
        }
    }
    Ok(())
}

fn require<'a>(
    cursor: Option<&'a Element>,
    verb: &'static str,
) -> Result<&'a Element, ActionError> {
    cursor.ok_or(ActionError::NoElement { verb })
}

async fn find(
    client: &Client,
    from: Option<&Element>,
    locator: Locator<'_>,
) -> Result<Element, ActionError> {
    let found = match from {
        Some(element) => element.find(locator).await?,
        None => client.find(locator).await?,
    };
    Ok(found)
}

async fn run_step(
    client: &Client,
    cursor: Option<&Element>,
    action: &Action,
) -> Result<Option<Element>, ActionError> {
    match action {
        Action::FindXPath(expression) => {
            Ok(Some(find(client, cursor, Locator::XPath(expression)).await?))
        }
        Action::FindCss(selector) => Ok(Some(find(client, cursor, Locator::Css(selector)).await?)),
        Action::Click => {
            let element = require(cursor, "click")?;
            element.click().await?;
            Ok(Some(element.clone()))
        }
        Action::Clear => {
            let element = require(cursor, "clear")?;
            element.clear().await?;
            Ok(Some(element.clone()))
        }
        Action::SendKeys(text) => {
            let element = require(cursor, "send_keys")?;
            element.send_keys(text).await?;
            Ok(Some(element.clone()))
        }
        Action::Submit => {
            let element = require(cursor, "submit")?;
            element.send_keys(ENTER_KEY).await?;
            Ok(Some(element.clone()))
        }
        Action::Back => {
            client.back().await?;
            Ok(None)
        }
        Action::Refresh => {
            client.refresh().await?;
            Ok(None)
        }
        Action::Navigate(url) => {
            client.goto(url).await?;
            Ok(None)
        }
        Action::Wait(duration) => {
            tokio::time::sleep(*duration).await;
            Ok(cursor.cloned())
        }
        Action::Root => Ok(None),
    }
}
