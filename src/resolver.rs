//! Two-hop link resolution.
//!
//! Fetch the source page, follow its redirect anchor, and pull the first link
//! with the target prefix off the page it leads to. The whole sequence is
//! retried with a fresh provider and proxy selection on any failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{AttemptError, FetchError, ParseError, ResolutionError};
use crate::providers::{FetchContext, ModeCell, ProviderKind, ProviderSet, ScrapeMode, SharedRng};
use crate::proxy::{ProxyPool, ProxySource};

/// How the resolver treats the proxy pool for direct fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPolicy {
    Off,
    /// Use a proxy when one is available, otherwise go direct.
    Optional,
    /// Fail the attempt when no proxy is available.
    Required,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub source_url: String,
    pub anchor_selector: String,
    pub target_prefix: String,
    pub retries: u32,
    /// Pause between hop 1 and hop 2, in seconds.
    pub hop_delay: (f64, f64),
    /// Pause between failed attempts, in seconds.
    pub backoff: (f64, f64),
    pub proxy_policy: ProxyPolicy,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            source_url: "https://bingotingo.com/best-social-media-platforms/".to_string(),
            anchor_selector: "a.su-button".to_string(),
            target_prefix: "https://www.canva.com/brand/".to_string(),
            retries: 3,
            hop_delay: (1.0, 2.8),
            backoff: (2.0, 5.0),
            proxy_policy: ProxyPolicy::Optional,
        }
    }
}

/// Matches target links by prefix, in anchors first and then anywhere in the raw HTML.
pub struct TargetPattern {
    prefix: String,
    raw: Regex,
}

static ANCHOR_SELECTOR: once_cell::sync::Lazy<Selector> =
    once_cell::sync::Lazy::new(|| Selector::parse("a[href]").expect("static selector"));

impl TargetPattern {
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        let raw = Regex::new(&format!(r#"{}[^\s"'<>\\]*"#, regex::escape(prefix)))?;
        Ok(Self {
            prefix: prefix.to_string(),
            raw,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// First anchor href with the prefix, in document order; falls back to a
    /// scan of the raw markup for links embedded in scripts or attributes.
    pub fn find(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        let from_anchor = document
            .select(&ANCHOR_SELECTOR)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .find(|href| href.starts_with(&self.prefix))
            .map(str::to_string);

        from_anchor.or_else(|| {
            self.raw
                .find(html)
                .map(|m| m.as_str().replace("&amp;", "&"))
        })
    }
}

/// Absolute URL of the redirect anchor on the source page.
pub fn extract_redirect_url(
    html: &str,
    selector: &Selector,
    base_url: &str,
) -> Result<String, ParseError> {
    let document = Html::parse_document(html);
    let anchor = document
        .select(selector)
        .next()
        .ok_or(ParseError::RedirectAnchorNotFound)?;
    let href = anchor
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::RedirectHrefMissing)?;

    let resolved = Url::parse(base_url)
        .and_then(|base| base.join(href))
        .map_err(|_| ParseError::InvalidRedirectUrl(href.to_string()))?;
    match resolved.scheme() {
        "http" | "https" => Ok(resolved.to_string()),
        _ => Err(ParseError::InvalidRedirectUrl(href.to_string())),
    }
}

/// What happened to the proxy during one attempt.
#[derive(Default)]
struct ProxyUse {
    used: bool,
    failed: bool,
    reason: Option<String>,
}

pub struct Resolver {
    providers: ProviderSet,
    mode: ModeCell,
    pool: Option<Arc<ProxyPool>>,
    proxy_source: Option<Arc<dyn ProxySource>>,
    settings: ResolverSettings,
    anchor: Selector,
    target: TargetPattern,
    rng: SharedRng,
}

impl Resolver {
    pub fn new(
        providers: ProviderSet,
        mode: ModeCell,
        settings: ResolverSettings,
        rng: SharedRng,
    ) -> anyhow::Result<Self> {
        let anchor = Selector::parse(&settings.anchor_selector)
            .map_err(|e| anyhow!("invalid anchor selector {:?}: {:?}", settings.anchor_selector, e))?;
        let target = TargetPattern::new(&settings.target_prefix)?;
        Ok(Self {
            providers,
            mode,
            pool: None,
            proxy_source: None,
            settings,
            anchor,
            target,
            rng,
        })
    }

    pub fn with_proxy_pool(
        mut self,
        pool: Arc<ProxyPool>,
        source: Option<Arc<dyn ProxySource>>,
    ) -> Self {
        self.pool = Some(pool);
        self.proxy_source = source;
        self
    }

    pub fn mode(&self) -> &ModeCell {
        &self.mode
    }

    pub fn proxy_pool(&self) -> Option<&Arc<ProxyPool>> {
        self.pool.as_ref()
    }

    pub fn target_prefix(&self) -> &str {
        self.target.prefix()
    }

    /// Resolve the current target link, retrying up to the configured budget.
    pub async fn resolve_latest_target_link(&self) -> Result<String, ResolutionError> {
        let retries = self.settings.retries.max(1);

        if let (Some(pool), Some(source)) = (&self.pool, &self.proxy_source) {
            if self.settings.proxy_policy != ProxyPolicy::Off {
                pool.refresh(source.as_ref()).await;
            }
        }

        let mut last_error = None;
        for attempt in 1..=retries {
            let mode = self.mode.get();
            let mut proxy_use = ProxyUse::default();

            let result = match self.pick_proxy(mode).await {
                Ok(proxy) => {
                    let outcome = self
                        .attempt(attempt, mode, proxy.as_deref(), &mut proxy_use)
                        .await;
                    if let (Some(pool), Some(proxy)) = (&self.pool, proxy.as_deref()) {
                        if proxy_use.used {
                            let ok = outcome.is_ok() && !proxy_use.failed;
                            let reason = match &outcome {
                                Err(e) if proxy_use.reason.is_none() => Some(e.to_string()),
                                _ => proxy_use.reason.take(),
                            };
                            pool.report(proxy, ok, reason.as_deref()).await;
                        }
                    }
                    outcome
                }
                Err(e) => Err(AttemptError::from(e)),
            };

            match result {
                Ok(link) => {
                    info!(attempt, %mode, "✅ Resolved target link: {}", link);
                    return Ok(link);
                }
                Err(e) => {
                    warn!(attempt, retries, %mode, error = %e, "❌ Resolution attempt failed");
                    last_error = Some(e);
                    if attempt < retries {
                        self.pause(self.settings.backoff).await;
                    }
                }
            }
        }

        Err(ResolutionError {
            attempts: retries,
            last: last_error.unwrap_or(AttemptError::Fetch(FetchError::NoProvider(self.mode.get()))),
        })
    }

    async fn pick_proxy(&self, mode: ScrapeMode) -> Result<Option<String>, FetchError> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        if self.settings.proxy_policy == ProxyPolicy::Off
            || !mode.allows_direct()
            || self.providers.direct.is_none()
        {
            return Ok(None);
        }
        match pool.get_proxy().await {
            Some(proxy) => Ok(Some(proxy)),
            None if self.settings.proxy_policy == ProxyPolicy::Required => {
                Err(FetchError::NoProxyAvailable)
            }
            None => {
                info!("📡 No proxy available. Using direct connection.");
                Ok(None)
            }
        }
    }

    async fn attempt(
        &self,
        attempt: u32,
        mode: ScrapeMode,
        proxy: Option<&str>,
        proxy_use: &mut ProxyUse,
    ) -> Result<String, AttemptError> {
        let source_url = &self.settings.source_url;
        let source_html = self
            .fetch_via_chain(attempt, mode, source_url, proxy, proxy_use)
            .await?;
        let hop_url = extract_redirect_url(&source_html, &self.anchor, source_url)?;
        info!(attempt, "Found redirect link: {}", hop_url);

        self.pause(self.settings.hop_delay).await;

        let redirect_html = self
            .fetch_via_chain(attempt, mode, &hop_url, proxy, proxy_use)
            .await?;
        self.target
            .find(&redirect_html)
            .ok_or(AttemptError::Parse(ParseError::TargetLinkNotFound))
    }

    /// Try each provider of a freshly built chain; first success wins.
    async fn fetch_via_chain(
        &self,
        attempt: u32,
        mode: ScrapeMode,
        url: &str,
        proxy: Option<&str>,
        proxy_use: &mut ProxyUse,
    ) -> Result<String, FetchError> {
        let chain = self.providers.chain(mode, &self.rng);
        let mut last_error = None;

        for provider in chain {
            let ctx = FetchContext {
                proxy: match provider.kind() {
                    ProviderKind::Direct => proxy.map(str::to_string),
                    _ => None,
                },
            };
            let routed = ctx.proxy.is_some();
            proxy_use.used |= routed;

            match provider.fetch_html(url, &ctx).await {
                Ok(html) => {
                    info!(
                        attempt,
                        provider = provider.name(),
                        proxy = ?ctx.proxy,
                        bytes = html.len(),
                        "Fetched {}",
                        url
                    );
                    return Ok(html);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        provider = provider.name(),
                        proxy = ?ctx.proxy,
                        error = %e,
                        "⚠️ Fetch failed for {}",
                        url
                    );
                    if routed {
                        proxy_use.failed = true;
                        proxy_use.reason = Some(e.to_string());
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::NoProvider(mode)))
    }

    async fn pause(&self, (min, max): (f64, f64)) {
        if max <= 0.0 {
            return;
        }
        let secs = match self.rng.lock() {
            Ok(mut rng) if max > min => rng.gen_range(min..max),
            _ => min.max(0.0),
        };
        sleep(Duration::from_secs_f64(secs)).await;
    }
}
