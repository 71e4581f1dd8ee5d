//! Scored proxy pool for direct fetches
//!
//! Supports:
//! - Greedy selection of the most reliable-looking proxy
//! - Cooldown after any failure
//! - Permanent blacklist after repeated consecutive failures
//! - Periodic refresh from a public proxy list
//! - Persistence of scores and blacklist on every report

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::error::FetchError;
use crate::stealth;
use crate::store::{ProxySnapshot, StateStore};

pub const BLACKLIST_THRESHOLD: u32 = 3;
pub const COOLDOWN_SECS: f64 = 600.0;
pub const REFRESH_INTERVAL_SECS: f64 = 600.0;

/// Per-proxy score. Field names are the persisted format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProxyRecord {
    pub success: u64,
    pub fail: u64,
    /// Unix seconds of the most recent failure, 0 if never failed.
    pub last_fail: f64,
    #[serde(default)]
    pub consec_fail: u32,
}

/// Wall clock in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

/// Where the pool gets its candidate list from.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<String>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Available,
    CoolingDown,
    Blacklisted,
}

/// One row of the pool listing.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProxyInfo {
    #[schema(example = "http://1.2.3.4:8080")]
    pub address: String,
    pub state: ProxyState,
    pub record: ProxyRecord,
}

/// Aggregate stats for the proxy pool
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProxyStats {
    pub total_proxies: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub blacklisted: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_refresh: Option<f64>,
}

#[derive(Default)]
struct PoolState {
    proxies: Vec<String>,
    stats: HashMap<String, ProxyRecord>,
    blacklist: HashSet<String>,
    last_refresh: Option<f64>,
}

impl PoolState {
    fn record(&self, proxy: &str) -> ProxyRecord {
        self.stats.get(proxy).copied().unwrap_or_default()
    }

    fn state_of(&self, proxy: &str, now: f64, cooldown: f64) -> ProxyState {
        if self.blacklist.contains(proxy) {
            ProxyState::Blacklisted
        } else if self.record(proxy).fail > 0 && now - self.record(proxy).last_fail <= cooldown {
            ProxyState::CoolingDown
        } else {
            ProxyState::Available
        }
    }

    fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            stats: self.stats.clone(),
            blacklist: self.blacklist.clone(),
        }
    }
}

/// Proxy pool with scoring, cooldown and blacklist.
///
/// Every `report` updates the in-memory record and persists the full state
/// while holding the pool lock, so concurrent reports never lose updates.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    /// Held across the freshness check and the list fetch.
    refresh_guard: Mutex<()>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    cooldown: f64,
    refresh_interval: f64,
}

impl ProxyPool {
    /// Create a pool and load any persisted scores and blacklist.
    pub async fn load(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        let mut state = PoolState::default();
        match store.load_proxy_state().await {
            Ok(snapshot) => {
                info!(
                    "📡 Loaded proxy state: {} scored, {} blacklisted",
                    snapshot.stats.len(),
                    snapshot.blacklist.len()
                );
                state.stats = snapshot.stats;
                state.blacklist = snapshot.blacklist;
            }
            Err(e) => error!("[ProxyPool] Failed to load state: {:#}", e),
        }
        Self {
            state: Mutex::new(state),
            refresh_guard: Mutex::new(()),
            store,
            clock,
            cooldown: COOLDOWN_SECS,
            refresh_interval: REFRESH_INTERVAL_SECS,
        }
    }

    /// Re-fetch the candidate list unless it was refreshed within the window.
    /// A failed fetch keeps the previous list. Concurrent callers wait for the
    /// fetch in flight and then see it as fresh.
    pub async fn refresh(&self, source: &dyn ProxySource) {
        let _guard = self.refresh_guard.lock().await;
        {
            let state = self.state.lock().await;
            if let Some(last) = state.last_refresh {
                if self.clock.now() - last < self.refresh_interval && !state.proxies.is_empty() {
                    return;
                }
            }
        }

        match source.fetch().await {
            Ok(list) => {
                let mut state = self.state.lock().await;
                info!("[ProxyPool] Refreshed proxies: {} available.", list.len());
                state.proxies = list;
                state.last_refresh = Some(self.clock.now());
            }
            Err(e) => warn!("[ProxyPool] Proxy list refresh failed: {}", e),
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_proxies(&self, proxies: Vec<String>) {
        let mut state = self.state.lock().await;
        state.proxies = proxies;
        state.last_refresh = Some(self.clock.now());
    }

    /// Most reliable-looking proxy outside cooldown and blacklist.
    /// Ties keep list order.
    pub async fn get_proxy(&self) -> Option<String> {
        let state = self.state.lock().await;
        let now = self.clock.now();

        let mut candidates: Vec<&String> = state
            .proxies
            .iter()
            .filter(|p| state.state_of(p, now, self.cooldown) == ProxyState::Available)
            .collect();

        if candidates.is_empty() {
            warn!("[ProxyPool] No proxies available outside cooldown/blacklist.");
            return None;
        }

        candidates.sort_by_key(|p| {
            let r = state.record(p);
            (r.fail, std::cmp::Reverse(r.success))
        });
        let selected = candidates[0].clone();
        let r = state.record(&selected);
        info!(
            "[ProxyPool] Selected proxy: {} (fail={}, success={})",
            selected, r.fail, r.success
        );
        Some(selected)
    }

    /// Record the outcome of one request through `proxy` and persist.
    pub async fn report(&self, proxy: &str, success: bool, reason: Option<&str>) {
        if proxy.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let record = state.stats.entry(proxy.to_string()).or_default();

        if success {
            record.success += 1;
            record.consec_fail = 0;
            info!("[ProxyPool] Proxy {} succeeded.", proxy);
        } else {
            record.fail += 1;
            record.last_fail = now;
            record.consec_fail += 1;
            let consec = record.consec_fail;
            warn!(
                "[ProxyPool] Proxy {} failed. Reason: {}",
                proxy,
                reason.unwrap_or("unknown")
            );
            if consec >= BLACKLIST_THRESHOLD && state.blacklist.insert(proxy.to_string()) {
                warn!(
                    "🚫 [ProxyPool] Proxy {} permanently blacklisted after {} consecutive fails.",
                    proxy, consec
                );
            }
        }

        let snapshot = state.snapshot();
        if let Err(e) = self.store.save_proxy_state(&snapshot).await {
            error!("[ProxyPool] Failed to save state: {:#}", e);
        }
    }

    /// Clear the blacklist and consecutive-failure counters.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.blacklist.clear();
        for record in state.stats.values_mut() {
            record.consec_fail = 0;
        }
        info!("✅ [ProxyPool] Blacklist reset");
        let snapshot = state.snapshot();
        if let Err(e) = self.store.save_proxy_state(&snapshot).await {
            error!("[ProxyPool] Failed to save state: {:#}", e);
        }
    }

    #[cfg(test)]
    pub(crate) async fn record(&self, proxy: &str) -> Option<ProxyRecord> {
        self.state.lock().await.stats.get(proxy).copied()
    }

    #[cfg(test)]
    pub(crate) async fn is_blacklisted(&self, proxy: &str) -> bool {
        self.state.lock().await.blacklist.contains(proxy)
    }

    /// Every known proxy: the current list plus anything scored or blacklisted.
    pub async fn list_proxies(&self) -> Vec<ProxyInfo> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let mut seen = HashSet::new();
        state
            .proxies
            .iter()
            .chain(state.stats.keys())
            .chain(state.blacklist.iter())
            .filter(|p| seen.insert(p.as_str()))
            .map(|p| ProxyInfo {
                address: p.clone(),
                state: state.state_of(p, now, self.cooldown),
                record: state.record(p),
            })
            .collect()
    }

    pub async fn get_stats(&self) -> ProxyStats {
        let infos = self.list_proxies().await;
        let last_refresh = self.state.lock().await.last_refresh;
        let count = |s: ProxyState| infos.iter().filter(|i| i.state == s).count();
        ProxyStats {
            total_proxies: infos.len(),
            available: count(ProxyState::Available),
            cooling_down: count(ProxyState::CoolingDown),
            blacklisted: count(ProxyState::Blacklisted),
            total_successes: infos.iter().map(|i| i.record.success).sum(),
            total_failures: infos.iter().map(|i| i.record.fail).sum(),
            last_refresh,
        }
    }
}

// ============================================================================
// Public proxy list
// ============================================================================

static ROW_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table tbody tr").expect("static selector"));
static CELL_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("static selector"));

/// Parse a free-proxy-list style table (IP, Port, Code, Country, Anonymity,
/// Google, Https, Last Checked). Keeps HTTPS-capable rows as `http://ip:port`.
pub fn parse_proxy_table(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    document
        .select(&ROW_SELECTOR)
        .filter_map(|row| {
            let cells: Vec<String> = row
                .select(&CELL_SELECTOR)
                .map(|c| c.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() < 7 || !cells[6].eq_ignore_ascii_case("yes") {
                return None;
            }
            let ip = &cells[0];
            let port: u16 = cells[1].parse().ok()?;
            if ip.is_empty() || ip.parse::<std::net::IpAddr>().is_err() {
                return None;
            }
            Some(format!("http://{}:{}", ip, port))
        })
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Scrapes the public proxy listing page.
pub struct PublicProxyList {
    client: reqwest::Client,
    url: String,
}

impl PublicProxyList {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                provider: "proxy-list",
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ProxySource for PublicProxyList {
    async fn fetch(&self) -> Result<Vec<String>, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .headers(stealth::build_headers())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest("proxy-list", &self.url, e))?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                provider: "proxy-list",
                url: self.url.clone(),
                status: resp.status().as_u16(),
            });
        }
        let html = resp
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest("proxy-list", &self.url, e))?;
        Ok(parse_proxy_table(&html))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Settable clock in milliseconds.
    pub struct ManualClock(std::sync::atomic::AtomicI64);

    impl ManualClock {
        pub fn at(secs: f64) -> Arc<Self> {
            Arc::new(Self(std::sync::atomic::AtomicI64::new((secs * 1000.0) as i64)))
        }

        pub fn advance(&self, secs: f64) {
            self.0.fetch_add((secs * 1000.0) as i64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> f64 {
            self.0.load(Ordering::SeqCst) as f64 / 1000.0
        }
    }

    pub struct StaticSource {
        pub list: Vec<String>,
        pub fetches: AtomicUsize,
        pub delay: Duration,
    }

    impl StaticSource {
        pub fn new(list: &[&str]) -> Self {
            Self {
                list: list.iter().map(|s| s.to_string()).collect(),
                fetches: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl ProxySource for StaticSource {
        async fn fetch(&self) -> Result<Vec<String>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.list.clone())
        }
    }
}
