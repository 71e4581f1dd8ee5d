use std::sync::{Arc, Mutex};

use brandlink_watcher::{
    announcer::{run_vote_poller, Announcer, LogAnnouncer, TelegramAlerts, TelegramAnnouncer},
    api::{self, AppState},
    config::{init_tracing, Config, DEFAULT_CRON},
    gate::LinkGate,
    providers::{seeded_rng, ModeCell},
    proxy::{ProxyPool, ProxySource, PublicProxyList, SystemClock},
    resolver::{ProxyPolicy, Resolver},
    scheduler::{CheckScheduler, ScheduleError},
    telegram::TelegramClient,
    votes::VoteLedger,
    watcher::LinkWatcher,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();

    info!("🚀 Starting brandlink-watcher");
    info!("   Source: {}", config.source_url);
    info!("   Target prefix: {}", config.target_prefix);
    info!("   Mode: {} | Proxies: {:?}", config.scrape_mode, config.proxy_policy);

    let store = config.state_store().await;
    let rng = seeded_rng(None);
    let mode = ModeCell::new(config.scrape_mode);
    let cancel = CancellationToken::new();

    let providers = config.provider_set(&rng)?;
    let mut resolver = Resolver::new(providers, mode.clone(), config.resolver_settings(), rng.clone())?;

    let pool = if config.proxy_policy == ProxyPolicy::Off {
        None
    } else {
        let pool = Arc::new(ProxyPool::load(store.clone(), Arc::new(SystemClock)).await);
        let source: Arc<dyn ProxySource> =
            Arc::new(PublicProxyList::new(&config.proxy_list_url, config.request_timeout)?);
        resolver = resolver.with_proxy_pool(pool.clone(), Some(source));
        Some(pool)
    };

    let gate = Arc::new(LinkGate::load(store.clone()).await);

    let telegram = match config.telegram_bot_token.as_deref() {
        Some(token) => Some(Arc::new(TelegramClient::new(token)?)),
        None => None,
    };

    let announcer: Arc<dyn Announcer> = match (&telegram, config.telegram()) {
        (Some(client), Some((_, channel))) => {
            let client = client.clone();
            let votes = Arc::new(Mutex::new(VoteLedger::default()));
            tokio::spawn(run_vote_poller(client.clone(), votes.clone(), cancel.clone()));
            info!("📣 Announcing to Telegram channel {}", channel);
            Arc::new(TelegramAnnouncer::new(client, channel.to_string(), votes, rng.clone()))
        }
        _ => {
            warn!("⚠️ TELEGRAM_BOT_TOKEN/TELEGRAM_CHANNEL_ID not set, announcements are logged only");
            Arc::new(LogAnnouncer)
        }
    };

    let mut watcher = LinkWatcher::new(Arc::new(resolver), gate, announcer, cancel.clone());
    match (&telegram, config.admin_alerts()) {
        (Some(client), Some((_, chat))) => {
            info!("🚨 Failed scheduled checks are reported to {}", chat);
            watcher = watcher.with_alerts(Arc::new(TelegramAlerts::new(client.clone(), chat.to_string())));
        }
        _ if config.admin_chat_id.is_some() => {
            warn!("⚠️ ADMIN_CHAT_ID is set but TELEGRAM_BOT_TOKEN is not, failure alerts disabled");
        }
        _ => {}
    }
    let watcher = Arc::new(watcher);

    let scheduler = match CheckScheduler::start(
        watcher.clone(),
        &config.check_cron,
        config.check_jitter_secs,
        rng.clone(),
        cancel.clone(),
    )
    .await
    {
        Ok(s) => s,
        Err(ScheduleError::InvalidCron(cron)) => {
            warn!("⚠️ Invalid CHECK_CRON {:?}, falling back to '{}'", cron, DEFAULT_CRON);
            CheckScheduler::start(
                watcher.clone(),
                DEFAULT_CRON,
                config.check_jitter_secs,
                rng.clone(),
                cancel.clone(),
            )
            .await?
        }
        Err(e) => return Err(e.into()),
    };
    let scheduler = Arc::new(scheduler);

    let state = Arc::new(AppState {
        watcher,
        scheduler: Some(scheduler.clone()),
        pool,
        mode,
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!("📖 Swagger UI at http://{}/swagger", config.bind_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("🛑 Shutting down");
            shutdown.cancel();
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
