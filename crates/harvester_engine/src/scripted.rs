use std::collections::BTreeMap;
use std::sync::Arc;

use engine_logging::{engine_debug, engine_warn};
use fantoccini::cookies::Cookie;
use fantoccini::Client;
use tokio::sync::Mutex;

use crate::action::{run_script, ActionScript};
use crate::fetch::cookie_header;
use crate::webdriver::{connect, WebDriverError, WebDriverSettings};
use crate::{FetchError, FetchStrategy, FetchedPage, RequestIdentity};

const SCRIPT_HEADER: &str = "x-action-script";

/// Scripted strategy: loads each page in a remote browser, runs the action
/// script and returns the rendered page source.
///
/// One browser session serves all fetches, so scripted fetches run one at a
/// time regardless of the harvest concurrency. The session is opened on first
/// use, replaced after any failed page load, and released with
/// [`ScriptedFetcher::close`] or a [`SessionGuard`].
pub struct ScriptedFetcher {
    settings: WebDriverSettings,
    script: ActionScript,
    session: Mutex<Option<Client>>,
}

impl ScriptedFetcher {
    pub fn new(settings: WebDriverSettings, script: ActionScript) -> Self {
        Self {
            settings,
            script,
            session: Mutex::new(None),
        }
    }

    pub fn script(&self) -> &ActionScript {
        &self.script
    }

    /// Ends the browser session, if one is open.
    pub async fn close(&self) -> Result<(), FetchError> {
        let session = self.session.lock().await.take();
        match session {
            Some(client) => client
                .close()
                .await
                .map_err(|err| FetchError::from(WebDriverError::from(err))),
            None => Ok(()),
        }
    }

    async fn load(&self, client: &Client, url: &str) -> Result<FetchedPage, WebDriverError> {
        let budget = self.settings.request_timeout + self.script.total_wait();
        tokio::time::timeout(budget, self.load_page(client, url))
            .await
            .map_err(|_| WebDriverError::Timeout(budget))?
    }

    async fn load_page(&self, client: &Client, url: &str) -> Result<FetchedPage, WebDriverError> {
        client.goto(url).await?;
        if !self.settings.cookies.is_empty() {
            // Cookies bind to the current document's domain, so reload after setting them.
            for (name, value) in &self.settings.cookies {
                client
                    .add_cookie(Cookie::new(name.clone(), value.clone()))
                    .await?;
            }
            client.goto(url).await?;
        }
        run_script(client, &self.script).await?;

        let source = client.source().await?;
        let final_url = match client.current_url().await {
            Ok(current) => current.to_string(),
            Err(err) => {
                engine_warn!("could not read current url after {}: {}", url, err);
                url.to_string()
            }
        };
        let headers = BTreeMap::from([(
            "content-type".to_string(),
            "text/html; charset=utf-8".to_string(),
        )]);
        Ok(FetchedPage {
            status: 200,
            final_url,
            headers,
            body: source.into_bytes(),
        })
    }
}

#[async_trait::async_trait]
impl FetchStrategy for ScriptedFetcher {
    fn request_identity(&self, url: &str) -> RequestIdentity {
        let mut identity = RequestIdentity::new("WEBDRIVER", url);
        if let Some(cookies) = cookie_header(&self.settings.cookies) {
            identity = identity.with_header("cookie", cookies);
        }
        if !self.script.is_empty() {
            identity = identity.with_header(SCRIPT_HEADER, self.script.to_string());
        }
        identity
    }

    async fn fetch(&self, request: &RequestIdentity) -> Result<FetchedPage, FetchError> {
        let mut session = self.session.lock().await;
        let client = match session.take() {
            Some(client) => client,
            None => connect(&self.settings).await?,
        };
        engine_debug!("scripted fetch {}", request.url());

        match self.load(&client, request.url()).await {
            Ok(page) => {
                *session = Some(client);
                Ok(page)
            }
            Err(err) => {
                // The next fetch starts a fresh session.
                engine_warn!("discarding webdriver session after {}: {}", request.url(), err);
                if let Err(close_err) = client.close().await {
                    engine_debug!("closing the failed session: {}", close_err);
                }
                Err(err.into())
            }
        }
    }
}

/// Closes a fetcher's browser session when dropped, so the session is
/// released even when the harvest unwinds. [`SessionGuard::close`] does the
/// same on the normal path and reports the outcome.
pub struct SessionGuard {
    fetcher: Option<Arc<ScriptedFetcher>>,
}

impl SessionGuard {
    pub fn new(fetcher: Arc<ScriptedFetcher>) -> Self {
        Self {
            fetcher: Some(fetcher),
        }
    }

    pub async fn close(mut self) -> Result<(), FetchError> {
        match self.fetcher.take() {
            Some(fetcher) => fetcher.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(fetcher) = self.fetcher.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = fetcher.close().await {
                        engine_warn!("failed to close webdriver session: {}", err);
                    }
                });
            }
            Err(_) => engine_warn!("no runtime left to close the webdriver session"),
        }
    }
}
