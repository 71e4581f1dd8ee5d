//! Resolve the current target link once and print it. Nothing is announced
//! and the last-link state is left alone.
//!
//! Usage: `resolve_once [direct|scrapedo|both]`

use std::sync::Arc;

use anyhow::{anyhow, Result};
use brandlink_watcher::{
    config::{init_tracing, Config},
    providers::{seeded_rng, ModeCell, ScrapeMode},
    proxy::{ProxyPool, ProxySource, PublicProxyList, SystemClock},
    resolver::{ProxyPolicy, Resolver},
    store::MemoryStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();

    let mode = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<ScrapeMode>()
            .map_err(|_| anyhow!("unknown mode {:?}, expected direct, scrapedo or both", arg))?,
        None => config.scrape_mode,
    };

    println!("🕵️ Resolving {} (mode: {})", config.source_url, mode);

    let rng = seeded_rng(None);
    let mut resolver = Resolver::new(
        config.provider_set(&rng)?,
        ModeCell::new(mode),
        config.resolver_settings(),
        rng,
    )?;

    // Scores from this run are thrown away.
    if config.proxy_policy != ProxyPolicy::Off {
        let pool = ProxyPool::load(Arc::new(MemoryStore::new()), Arc::new(SystemClock)).await;
        let source: Arc<dyn ProxySource> =
            Arc::new(PublicProxyList::new(&config.proxy_list_url, config.request_timeout)?);
        resolver = resolver.with_proxy_pool(Arc::new(pool), Some(source));
    }

    match resolver.resolve_latest_target_link().await {
        Ok(link) => {
            println!("✅ {}", link);
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            std::process::exit(1);
        }
    }
}
