//! Headless-render providers, used when static fetches hit client-side
//! rendering or bot walls.

use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument;
use headless_chrome::{Browser, LaunchOptions};
use tracing::{debug, warn};

use super::{shuffled_keys, FetchContext, FetchProvider, ProviderKind, SharedRng};
use crate::error::FetchError;
use crate::stealth;

const BROWSERLESS: &str = "browserless";
const CHROME: &str = "chrome";

/// Remote browser automation API (`POST {base}/content?token=T {"url": ...}`).
pub struct BrowserlessProvider {
    client: reqwest::Client,
    base_url: String,
    tokens: Vec<String>,
    rng: SharedRng,
}

impl BrowserlessProvider {
    pub fn new(
        base_url: &str,
        tokens: Vec<String>,
        timeout: Duration,
        rng: SharedRng,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                provider: BROWSERLESS,
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            rng,
        })
    }

    async fn content(&self, token: &str, url: &str) -> Result<String, FetchError> {
        let endpoint = format!("{}/content?token={}", self.base_url, urlencoding::encode(token));
        let resp = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(BROWSERLESS, url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                provider: BROWSERLESS,
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text()
            .await
            .map_err(|e| FetchError::from_reqwest(BROWSERLESS, url, e))
    }
}

#[async_trait]
impl FetchProvider for BrowserlessProvider {
    fn name(&self) -> &'static str {
        BROWSERLESS
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Render
    }

    async fn fetch_html(&self, url: &str, _ctx: &FetchContext) -> Result<String, FetchError> {
        if self.tokens.is_empty() {
            return Err(FetchError::NoKeys(BROWSERLESS));
        }
        let tokens = shuffled_keys(&self.tokens, &self.rng);
        for (i, token) in tokens.iter().enumerate() {
            match self.content(token, url).await {
                Ok(html) => return Ok(html),
                Err(e) => warn!(token_index = i, error = %e, "browserless token failed"),
            }
        }
        Err(FetchError::AllKeysFailed {
            provider: BROWSERLESS,
            tried: tokens.len(),
        })
    }
}

/// Local headless Chrome with the stealth script injected before navigation.
pub struct ChromeProvider {
    timeout: Duration,
    rng: SharedRng,
}

impl ChromeProvider {
    pub fn new(timeout: Duration, rng: SharedRng) -> Self {
        Self { timeout, rng }
    }
}

/// Hands a launched browser from the render thread to whoever gives up on it.
/// Once abandoned, nothing new is accepted and the held value is released.
struct LaunchSlot<T> {
    inner: Mutex<SlotState<T>>,
}

struct SlotState<T> {
    held: Option<T>,
    abandoned: bool,
}

impl<T> LaunchSlot<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                held: None,
                abandoned: false,
            }),
        }
    }

    fn install(&self, value: T) -> Result<(), T> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.abandoned {
            return Err(value);
        }
        state.held = Some(value);
        Ok(())
    }

    fn abandon(&self) -> Option<T> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.abandoned = true;
        state.held.take()
    }
}

fn render_blocking(
    url: &str,
    user_agent: &str,
    timeout: Duration,
    slot: &LaunchSlot<Browser>,
) -> anyhow::Result<String> {
    let owned_args = stealth::chrome_args(user_agent);
    let args: Vec<&OsStr> = owned_args.iter().map(OsStr::new).collect();

    let browser = Browser::new(LaunchOptions {
        headless: false, // new headless mode comes from args
        window_size: Some((1920, 1080)),
        idle_browser_timeout: timeout,
        args,
        ..Default::default()
    })?;

    let tab = browser.new_tab()?;
    // From here on the browser lives in the slot; dropping it kills Chrome and
    // fails any tab call still in progress.
    slot.install(browser)
        .map_err(|_| anyhow::anyhow!("render abandoned before navigation"))?;
    tab.set_default_timeout(timeout);
    tab.call_method(AddScriptToEvaluateOnNewDocument {
        source: stealth::get_stealth_script().to_string(),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })?;
    if let Err(e) = stealth::apply_locale_overrides(&tab, "America/New_York", "en-US") {
        debug!(error = %e, "locale override rejected");
    }

    tab.navigate_to(url)?;
    tab.wait_until_navigated()?;
    Ok(tab.get_content()?)
}

#[async_trait]
impl FetchProvider for ChromeProvider {
    fn name(&self) -> &'static str {
        CHROME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Render
    }

    async fn fetch_html(&self, url: &str, _ctx: &FetchContext) -> Result<String, FetchError> {
        let user_agent = match self.rng.lock() {
            Ok(mut rng) => stealth::random_user_agent(&mut *rng),
            Err(_) => stealth::USER_AGENTS[0],
        };
        let timeout = self.timeout;
        let target = url.to_string();

        let slot = Arc::new(LaunchSlot::new());
        let job_slot = slot.clone();
        let job = tokio::task::spawn_blocking(move || {
            render_blocking(&target, user_agent, timeout, &job_slot)
        });
        match tokio::time::timeout(timeout, job).await {
            Err(_) => {
                if let Some(browser) = slot.abandon() {
                    debug!("closing timed-out browser");
                    tokio::task::spawn_blocking(move || drop(browser));
                }
                Err(FetchError::Timeout {
                    provider: CHROME,
                    url: url.to_string(),
                })
            }
            Ok(Err(join_err)) => Err(FetchError::Render {
                provider: CHROME,
                message: join_err.to_string(),
            }),
            Ok(Ok(Err(e))) => Err(FetchError::Render {
                provider: CHROME,
                message: e.to_string(),
            }),
            Ok(Ok(Ok(html))) => Ok(html),
        }
    }
}
