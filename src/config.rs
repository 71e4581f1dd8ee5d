use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::providers::{
    BrowserlessProvider, ChromeProvider, DirectProvider, FetchProvider, ProviderSet,
    ScrapeApiProvider, ScrapeMode, SharedRng,
};
use crate::resolver::{ProxyPolicy, ResolverSettings};
use crate::store::{JsonFileStore, MemoryStore, RedisStore, StateStore};

pub const DEFAULT_CRON: &str = "0 */15 * * * *";

/// Load `.env` and install the fmt subscriber (`RUST_LOG`, default `info`).
/// Must run before `Config::from_env`, which reports bad values through it.
pub fn init_tracing() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderBackend {
    None,
    Browserless,
    Chrome,
}

impl FromStr for RenderBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(RenderBackend::None),
            "browserless" => Ok(RenderBackend::Browserless),
            "chrome" => Ok(RenderBackend::Chrome),
            other => Err(format!("unknown render backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    File,
    Redis,
    Memory,
}

impl FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StateBackend::File),
            "redis" => Ok(StateBackend::Redis),
            "memory" => Ok(StateBackend::Memory),
            other => Err(format!("unknown state backend: {}", other)),
        }
    }
}

impl FromStr for ProxyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(ProxyPolicy::Off),
            "optional" => Ok(ProxyPolicy::Optional),
            "required" => Ok(ProxyPolicy::Required),
            other => Err(format!("unknown proxy mode: {}", other)),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Holds secrets, so no `Debug`.
#[derive(Clone)]
pub struct Config {
    // Resolution
    pub source_url: String,
    pub anchor_selector: String,
    pub target_prefix: String,
    pub scrape_mode: ScrapeMode,
    pub retries: u32,
    pub request_timeout: Duration,

    // Providers
    pub scrape_api_url: String,
    pub scrape_api_keys: Vec<String>,
    pub render_backend: RenderBackend,
    pub browserless_url: String,
    pub browserless_tokens: Vec<String>,

    // Proxies
    pub proxy_policy: ProxyPolicy,
    pub proxy_list_url: String,

    // State
    pub state_backend: StateBackend,
    pub proxy_stats_path: PathBuf,
    pub proxy_blacklist_path: PathBuf,
    pub last_link_path: PathBuf,
    pub redis_url: String,

    // Scheduling
    pub check_cron: String,
    pub check_jitter_secs: u64,

    // Posting
    pub telegram_bot_token: Option<String>,
    pub telegram_channel_id: Option<String>,
    /// Chat that hears about scheduled checks that gave up.
    pub admin_chat_id: Option<String>,

    // Admin API
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults; invalid
    /// values are logged and replaced by the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| -> String {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let secret = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let list = |key: &str| split_list(get(key).as_deref().unwrap_or_default());

        Self {
            source_url: text("SOURCE_URL", "https://bingotingo.com/best-social-media-platforms/"),
            anchor_selector: text("REDIRECT_ANCHOR_SELECTOR", "a.su-button"),
            target_prefix: text("TARGET_LINK_PREFIX", "https://www.canva.com/brand/"),
            scrape_mode: parsed(&get, "SCRAPE_MODE", ScrapeMode::Both),
            retries: parsed::<u32, _>(&get, "RESOLVE_RETRIES", 3).max(1),
            request_timeout: Duration::from_secs(parsed::<u64, _>(&get, "REQUEST_TIMEOUT_SECS", 30).max(1)),

            scrape_api_url: text("SCRAPE_API_URL", "https://api.scrape.do/"),
            scrape_api_keys: list("SCRAPE_API_KEYS"),
            render_backend: parsed(&get, "RENDER_BACKEND", RenderBackend::None),
            browserless_url: text("BROWSERLESS_URL", "https://chrome.browserless.io"),
            browserless_tokens: list("BROWSERLESS_TOKENS"),

            proxy_policy: parsed(&get, "PROXY_MODE", ProxyPolicy::Optional),
            proxy_list_url: text("PROXY_LIST_URL", "https://free-proxy-list.net/"),

            state_backend: parsed(&get, "STATE_BACKEND", StateBackend::File),
            proxy_stats_path: PathBuf::from(text("PROXY_STATS_PATH", "proxy_stats.json")),
            proxy_blacklist_path: PathBuf::from(text("PROXY_BLACKLIST_PATH", "proxy_blacklist.json")),
            last_link_path: PathBuf::from(text("LAST_LINK_PATH", "last_link.json")),
            redis_url: text("REDIS_URL", "redis://127.0.0.1/"),

            check_cron: text("CHECK_CRON", DEFAULT_CRON),
            check_jitter_secs: parsed(&get, "CHECK_JITTER_SECS", 300),

            telegram_bot_token: secret("TELEGRAM_BOT_TOKEN"),
            telegram_channel_id: secret("TELEGRAM_CHANNEL_ID"),
            admin_chat_id: secret("ADMIN_CHAT_ID"),

            bind_addr: parsed(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            source_url: self.source_url.clone(),
            anchor_selector: self.anchor_selector.clone(),
            target_prefix: self.target_prefix.clone(),
            retries: self.retries,
            proxy_policy: self.proxy_policy,
            ..ResolverSettings::default()
        }
    }

    /// Adapters for every configured provider. The direct fetcher is always
    /// present; the scrape API needs keys; the renderer follows `RENDER_BACKEND`.
    pub fn provider_set(&self, rng: &SharedRng) -> anyhow::Result<ProviderSet> {
        let direct = DirectProvider::new(self.request_timeout, rng.clone())
            .context("building direct provider")?;

        let api: Option<Arc<dyn FetchProvider>> = if self.scrape_api_keys.is_empty() {
            if self.scrape_mode == ScrapeMode::Api {
                warn!("⚠️ SCRAPE_MODE=scrapedo but SCRAPE_API_KEYS is empty");
            }
            None
        } else {
            Some(Arc::new(
                ScrapeApiProvider::new(
                    &self.scrape_api_url,
                    self.scrape_api_keys.clone(),
                    self.request_timeout,
                    rng.clone(),
                )
                .context("building scrape API provider")?,
            ))
        };

        let render: Option<Arc<dyn FetchProvider>> = match self.render_backend {
            RenderBackend::None => None,
            RenderBackend::Browserless => Some(Arc::new(
                BrowserlessProvider::new(
                    &self.browserless_url,
                    self.browserless_tokens.clone(),
                    self.request_timeout,
                    rng.clone(),
                )
                .context("building browserless provider")?,
            )),
            RenderBackend::Chrome => Some(Arc::new(ChromeProvider::new(
                self.request_timeout,
                rng.clone(),
            ))),
        };

        Ok(ProviderSet {
            direct: Some(Arc::new(direct)),
            api,
            render,
        })
    }

    /// The configured state backend. An unreachable Redis degrades to
    /// process memory rather than stopping the service.
    pub async fn state_store(&self) -> Arc<dyn StateStore> {
        match self.state_backend {
            StateBackend::File => Arc::new(JsonFileStore::new(
                self.proxy_stats_path.clone(),
                self.proxy_blacklist_path.clone(),
                self.last_link_path.clone(),
            )),
            StateBackend::Redis => match RedisStore::connect(&self.redis_url).await {
                Ok(store) => {
                    info!("💾 Using redis state at {}", self.redis_url);
                    Arc::new(store)
                }
                Err(e) => {
                    error!("❌ Redis unavailable ({:#}), state will not survive restarts", e);
                    Arc::new(MemoryStore::new())
                }
            },
            StateBackend::Memory => Arc::new(MemoryStore::new()),
        }
    }

    /// Bot token and channel, when both are set.
    pub fn telegram(&self) -> Option<(&str, &str)> {
        match (&self.telegram_bot_token, &self.telegram_channel_id) {
            (Some(token), Some(channel)) => Some((token.as_str(), channel.as_str())),
            _ => None,
        }
    }

    /// Bot token and admin chat, when both are set.
    pub fn admin_alerts(&self) -> Option<(&str, &str)> {
        match (&self.telegram_bot_token, &self.admin_chat_id) {
            (Some(token), Some(chat)) => Some((token.as_str(), chat.as_str())),
            _ => None,
        }
    }
}

fn parsed<T, F>(get: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key).filter(|v| !v.trim().is_empty()) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("⚠️ Invalid {}={:?}, using default", key, raw);
            default
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
