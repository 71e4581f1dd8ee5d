//! Fetch strategies that turn a URL into HTML.
//!
//! `ProviderSet::chain` decides, per fetch, which providers to try and in what
//! order, from the current `ScrapeMode`.

pub mod direct;
pub mod render;
pub mod scrape_api;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::FetchError;

pub use direct::DirectProvider;
pub use render::{BrowserlessProvider, ChromeProvider};
pub use scrape_api::ScrapeApiProvider;

/// Randomness shared by every component that picks providers, keys or delays.
pub type SharedRng = Arc<Mutex<StdRng>>;

pub fn seeded_rng(seed: Option<u64>) -> SharedRng {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Arc::new(Mutex::new(rng))
}

/// Which provider families the resolver may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    Direct,
    Api,
    Both,
}

impl Default for ScrapeMode {
    fn default() -> Self {
        ScrapeMode::Both
    }
}

impl fmt::Display for ScrapeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrapeMode::Direct => "direct",
            ScrapeMode::Api => "api",
            ScrapeMode::Both => "both",
        };
        f.write_str(s)
    }
}

impl FromStr for ScrapeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(ScrapeMode::Direct),
            "api" | "scrapedo" => Ok(ScrapeMode::Api),
            "both" => Ok(ScrapeMode::Both),
            other => Err(format!("unknown scrape mode: {}", other)),
        }
    }
}

impl ScrapeMode {
    pub fn allows_direct(self) -> bool {
        matches!(self, ScrapeMode::Direct | ScrapeMode::Both)
    }
}

/// Runtime-switchable mode, read once at the start of each attempt.
#[derive(Clone, Default)]
pub struct ModeCell(Arc<RwLock<ScrapeMode>>);

impl ModeCell {
    pub fn new(mode: ScrapeMode) -> Self {
        Self(Arc::new(RwLock::new(mode)))
    }

    pub fn get(&self) -> ScrapeMode {
        self.0.read().map(|m| *m).unwrap_or_default()
    }

    pub fn set(&self, mode: ScrapeMode) {
        if let Ok(mut guard) = self.0.write() {
            *guard = mode;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Direct,
    Api,
    Render,
}

/// Per-fetch context. Only direct providers route through `proxy`.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    pub proxy: Option<String>,
}

#[async_trait]
pub trait FetchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ProviderKind;

    async fn fetch_html(&self, url: &str, ctx: &FetchContext) -> Result<String, FetchError>;
}

/// The configured adapters, at most one per kind.
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub direct: Option<Arc<dyn FetchProvider>>,
    pub api: Option<Arc<dyn FetchProvider>>,
    pub render: Option<Arc<dyn FetchProvider>>,
}

impl ProviderSet {
    /// Ordered providers to try for one fetch. `Both` shuffles direct and api;
    /// the renderer, when present, is always the last resort.
    pub fn chain(&self, mode: ScrapeMode, rng: &SharedRng) -> Vec<Arc<dyn FetchProvider>> {
        let mut chain: Vec<Arc<dyn FetchProvider>> = Vec::new();
        match mode {
            ScrapeMode::Direct => chain.extend(self.direct.clone()),
            ScrapeMode::Api => chain.extend(self.api.clone()),
            ScrapeMode::Both => {
                chain.extend(self.direct.clone());
                chain.extend(self.api.clone());
                if let Ok(mut rng) = rng.lock() {
                    chain.shuffle(&mut *rng);
                }
            }
        }
        chain.extend(self.render.clone());
        chain
    }
}

/// Keys in a fresh random order; each is tried at most once per call.
pub(crate) fn shuffled_keys(keys: &[String], rng: &SharedRng) -> Vec<String> {
    let mut keys = keys.to_vec();
    if let Ok(mut rng) = rng.lock() {
        keys.shuffle(&mut *rng);
    }
    keys
}


#[cfg(test)]
mod tests {
    use super::testing::StubProvider;
    use super::*;

    fn full_set() -> ProviderSet {
        ProviderSet {
            direct: Some(Arc::new(StubProvider::new("direct", ProviderKind::Direct))),
            api: Some(Arc::new(StubProvider::new("api", ProviderKind::Api))),
            render: Some(Arc::new(StubProvider::new("render", ProviderKind::Render))),
        }
    }

    fn names(chain: &[Arc<dyn FetchProvider>]) -> Vec<&'static str> {
        chain.iter().map(|p| p.name()).collect()
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("direct".parse::<ScrapeMode>().unwrap(), ScrapeMode::Direct);
        assert_eq!("scrapedo".parse::<ScrapeMode>().unwrap(), ScrapeMode::Api);
        assert_eq!(" BOTH ".parse::<ScrapeMode>().unwrap(), ScrapeMode::Both);
        assert!("sometimes".parse::<ScrapeMode>().is_err());
    }

    #[test]
    fn test_single_family_chains() {
        let set = full_set();
        let rng = seeded_rng(Some(1));
        assert_eq!(names(&set.chain(ScrapeMode::Direct, &rng)), vec!["direct", "render"]);
        assert_eq!(names(&set.chain(ScrapeMode::Api, &rng)), vec!["api", "render"]);
    }

    #[test]
    fn test_both_mode_covers_both_orders() {
        let set = full_set();
        let rng = seeded_rng(Some(99));
        let mut orders = std::collections::HashSet::new();
        for _ in 0..64 {
            let chain = names(&set.chain(ScrapeMode::Both, &rng));
            assert_eq!(chain.len(), 3);
            assert_eq!(chain[2], "render");
            orders.insert((chain[0], chain[1]));
        }
        assert!(orders.contains(&("direct", "api")));
        assert!(orders.contains(&("api", "direct")));
    }

    #[test]
    fn test_missing_providers_are_skipped() {
        let set = ProviderSet {
            direct: Some(Arc::new(StubProvider::new("direct", ProviderKind::Direct))),
            api: None,
            render: None,
        };
        let rng = seeded_rng(Some(3));
        assert!(set.chain(ScrapeMode::Api, &rng).is_empty());
        assert_eq!(names(&set.chain(ScrapeMode::Both, &rng)), vec!["direct"]);
    }

    #[test]
    fn test_mode_cell_switches() {
        let cell = ModeCell::new(ScrapeMode::Direct);
        let shared = cell.clone();
        shared.set(ScrapeMode::Api);
        assert_eq!(cell.get(), ScrapeMode::Api);
    }

    #[test]
    fn test_shuffled_keys_keeps_every_key_once() {
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let rng = seeded_rng(Some(5));
        let mut shuffled = shuffled_keys(&keys, &rng);
        shuffled.sort();
        assert_eq!(shuffled, keys);
    }
}
