//! One "check": resolve the current link, pass it through the gate, announce.
//!
//! Scheduled and on-demand checks both land here. Each check runs in its own
//! span with a fresh run id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::announcer::{AlertSink, Announcer};
use crate::gate::{GateDecision, LinkGate};
use crate::resolver::Resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    OnDemand,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Scheduled => "scheduled",
            Trigger::OnDemand => "on_demand",
        })
    }
}

/// Result of one check. "Nothing new" and "could not tell" stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Announced(String),
    Unchanged(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Announced,
    Unchanged,
    Failed,
}

impl CheckOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            CheckOutcome::Announced(_) => OutcomeKind::Announced,
            CheckOutcome::Unchanged(_) => OutcomeKind::Unchanged,
            CheckOutcome::Failed(_) => OutcomeKind::Failed,
        }
    }

    pub fn link(&self) -> Option<&str> {
        match self {
            CheckOutcome::Announced(l) | CheckOutcome::Unchanged(l) => Some(l),
            CheckOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            CheckOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// The most recent check, for the status view.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckRecord {
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    pub trigger: Trigger,
    pub outcome: OutcomeKind,
    pub link: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ManualAnnounceError {
    #[error("link must start with {0}")]
    PrefixMismatch(String),

    #[error(transparent)]
    Announce(#[from] anyhow::Error),
}

pub struct LinkWatcher {
    resolver: Arc<Resolver>,
    gate: Arc<LinkGate>,
    announcer: Arc<dyn Announcer>,
    alerts: Option<Arc<dyn AlertSink>>,
    cancel: CancellationToken,
    last_check: RwLock<Option<CheckRecord>>,
    checks_run: AtomicU64,
}

impl LinkWatcher {
    pub fn new(
        resolver: Arc<Resolver>,
        gate: Arc<LinkGate>,
        announcer: Arc<dyn Announcer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            gate,
            announcer,
            alerts: None,
            cancel,
            last_check: RwLock::new(None),
            checks_run: AtomicU64::new(0),
        }
    }

    /// Report scheduled checks that give up to `alerts`.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn gate(&self) -> &Arc<LinkGate> {
        &self.gate
    }

    pub async fn check(&self, trigger: Trigger) -> CheckOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("check", %run_id, %trigger);
        let outcome = self.run_check().instrument(span.clone()).await;

        if let (Trigger::Scheduled, Some(error)) = (trigger, outcome.error()) {
            if !self.cancel.is_cancelled() {
                self.alert_failure(run_id, error).instrument(span).await;
            }
        }

        self.checks_run.fetch_add(1, Ordering::Relaxed);
        let record = CheckRecord {
            run_id,
            at: Utc::now(),
            trigger,
            outcome: outcome.kind(),
            link: outcome.link().map(str::to_string),
            error: outcome.error().map(str::to_string),
        };
        if let Ok(mut last) = self.last_check.write() {
            *last = Some(record);
        }
        outcome
    }

    async fn run_check(&self) -> CheckOutcome {
        info!("🔍 Checking for a new link");

        // Dropping the resolution aborts any in-flight request before its
        // proxy outcome is reported.
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("Check cancelled");
                return CheckOutcome::Failed("cancelled".to_string());
            }
            res = self.resolver.resolve_latest_target_link() => res,
        };

        let link = match resolved {
            Ok(link) => link,
            Err(e) => {
                error!("❌ {}", e);
                return CheckOutcome::Failed(e.to_string());
            }
        };

        match self.gate.announce_if_new(&link, self.announcer.as_ref()).await {
            Ok(GateDecision::Announced) => CheckOutcome::Announced(link),
            Ok(GateDecision::Unchanged) => CheckOutcome::Unchanged(link),
            Err(e) => {
                error!("❌ Announcement failed: {:#}", e);
                CheckOutcome::Failed(format!("announcement failed: {:#}", e))
            }
        }
    }

    async fn alert_failure(&self, run_id: Uuid, error: &str) {
        let Some(alerts) = &self.alerts else {
            return;
        };
        let text = format!("⚠️ Scheduled link check failed (run {}): {}", run_id, error);
        if let Err(e) = alerts.alert(&text).await {
            warn!("Failed to send failure alert: {:#}", e);
        }
    }

    /// Post a supplied link, skipping resolution and the equality check.
    pub async fn announce_manual(&self, link: &str) -> Result<(), ManualAnnounceError> {
        let link = link.trim();
        let prefix = self.resolver.target_prefix();
        if !link.starts_with(prefix) {
            return Err(ManualAnnounceError::PrefixMismatch(prefix.to_string()));
        }
        info!("📣 Manual announce requested: {}", link);
        self.gate
            .announce_forced(link, self.announcer.as_ref())
            .await?;
        Ok(())
    }

    pub fn last_check(&self) -> Option<CheckRecord> {
        self.last_check.read().ok().and_then(|c| c.clone())
    }

    pub fn checks_run(&self) -> u64 {
        self.checks_run.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::announcer::testing::RecordingAnnouncer;
    use crate::providers::testing::StubProvider;
    use crate::providers::{seeded_rng, ModeCell, ProviderKind, ProviderSet, ScrapeMode};
    use crate::resolver::ResolverSettings;
    use crate::store::MemoryStore;

    pub const SOURCE: &str = "https://source.example/page";
    pub const HOP: &str = "https://redirect.example/x";
    pub const LINK: &str = "https://www.canva.com/brand/join?token=abc";

    pub fn serving_provider() -> StubProvider {
        StubProvider::new("direct", ProviderKind::Direct)
            .page(
                SOURCE,
                &format!(r#"<a class="su-button" href="{}">Get</a>"#, HOP),
            )
            .page(HOP, &format!(r#"<a href="{}">Join</a>"#, LINK))
    }

    pub fn watcher_with(
        provider: StubProvider,
        announcer: Arc<RecordingAnnouncer>,
        cancel: CancellationToken,
    ) -> LinkWatcher {
        let resolver = Resolver::new(
            ProviderSet {
                direct: Some(Arc::new(provider)),
                ..ProviderSet::default()
            },
            ModeCell::new(ScrapeMode::Direct),
            ResolverSettings {
                source_url: SOURCE.to_string(),
                retries: 2,
                hop_delay: (0.0, 0.0),
                backoff: (0.0, 0.0),
                ..ResolverSettings::default()
            },
            seeded_rng(Some(7)),
        )
        .unwrap();
        let gate = LinkGate::new(None, Arc::new(MemoryStore::new()));
        LinkWatcher::new(Arc::new(resolver), Arc::new(gate), announcer, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::announcer::testing::{RecordingAlerts, RecordingAnnouncer};
    use crate::providers::testing::StubProvider;
    use crate::providers::ProviderKind;

    #[tokio::test]
    async fn test_new_then_unchanged() {
        let announcer = Arc::new(RecordingAnnouncer::default());
        let watcher = watcher_with(serving_provider(), announcer.clone(), CancellationToken::new());

        assert_eq!(
            watcher.check(Trigger::OnDemand).await,
            CheckOutcome::Announced(LINK.to_string())
        );
        assert_eq!(
            watcher.check(Trigger::Scheduled).await,
            CheckOutcome::Unchanged(LINK.to_string())
        );
        assert_eq!(announcer.links(), vec![LINK.to_string()]);

        let last = watcher.last_check().unwrap();
        assert_eq!(last.trigger, Trigger::Scheduled);
        assert_eq!(last.outcome, OutcomeKind::Unchanged);
        assert_eq!(watcher.checks_run(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_distinct_from_unchanged() {
        let announcer = Arc::new(RecordingAnnouncer::default());
        let provider = StubProvider::new("direct", ProviderKind::Direct).failing();
        let watcher = watcher_with(provider, announcer.clone(), CancellationToken::new());

        let outcome = watcher.check(Trigger::Scheduled).await;
        assert_eq!(outcome.kind(), OutcomeKind::Failed);
        assert!(outcome.error().unwrap().contains("after 2 attempts"));
        assert!(announcer.links().is_empty());
        assert_eq!(watcher.last_check().unwrap().outcome, OutcomeKind::Failed);
    }

    #[tokio::test]
    async fn test_failed_announcement_is_a_failed_check() {
        let announcer = Arc::new(RecordingAnnouncer::failing());
        let watcher = watcher_with(serving_provider(), announcer, CancellationToken::new());
        let outcome = watcher.check(Trigger::OnDemand).await;
        assert_eq!(outcome.kind(), OutcomeKind::Failed);
        assert_eq!(watcher.gate().last().await, None);
    }

    #[tokio::test]
    async fn test_cancelled_check_does_not_announce() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let announcer = Arc::new(RecordingAnnouncer::default());
        let watcher = watcher_with(serving_provider(), announcer.clone(), cancel);

        assert_eq!(
            watcher.check(Trigger::Scheduled).await,
            CheckOutcome::Failed("cancelled".to_string())
        );
        assert!(announcer.links().is_empty());
    }

    #[tokio::test]
    async fn test_manual_announce() {
        let announcer = Arc::new(RecordingAnnouncer::default());
        let watcher = watcher_with(serving_provider(), announcer.clone(), CancellationToken::new());

        let err = watcher
            .announce_manual("https://example.org/brand/x")
            .await
            .unwrap_err();
        assert!(matches!(err, ManualAnnounceError::PrefixMismatch(_)));

        watcher.announce_manual(LINK).await.unwrap();
        assert_eq!(watcher.gate().last().await.as_deref(), Some(LINK));

        // A later scheduled check sees the manually posted link as old news.
        assert_eq!(
            watcher.check(Trigger::Scheduled).await,
            CheckOutcome::Unchanged(LINK.to_string())
        );
        assert_eq!(announcer.links(), vec![LINK.to_string()]);
    }

    #[tokio::test]
    async fn test_scheduled_failure_alerts_admin() {
        let alerts = Arc::new(RecordingAlerts::default());
        let provider = StubProvider::new("direct", ProviderKind::Direct).failing();
        let watcher = watcher_with(
            provider,
            Arc::new(RecordingAnnouncer::default()),
            CancellationToken::new(),
        )
        .with_alerts(alerts.clone());

        watcher.check(Trigger::Scheduled).await;
        let sent = alerts.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("⚠️ Scheduled link check failed"));
        assert!(sent[0].contains("after 2 attempts"));

        // On-demand callers already get the error back.
        watcher.check(Trigger::OnDemand).await;
        assert_eq!(alerts.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_successful_or_cancelled_checks_stay_quiet() {
        let alerts = Arc::new(RecordingAlerts::default());
        let watcher = watcher_with(
            serving_provider(),
            Arc::new(RecordingAnnouncer::default()),
            CancellationToken::new(),
        )
        .with_alerts(alerts.clone());
        watcher.check(Trigger::Scheduled).await;
        watcher.check(Trigger::Scheduled).await;
        assert!(alerts.sent().is_empty());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = watcher_with(
            serving_provider(),
            Arc::new(RecordingAnnouncer::default()),
            cancel,
        )
        .with_alerts(alerts.clone());
        cancelled.check(Trigger::Scheduled).await;
        assert!(alerts.sent().is_empty());
    }

    #[tokio::test]
    async fn test_alert_failure_does_not_change_outcome() {
        let alerts = Arc::new(RecordingAlerts::failing());
        let provider = StubProvider::new("direct", ProviderKind::Direct).failing();
        let watcher = watcher_with(
            provider,
            Arc::new(RecordingAnnouncer::default()),
            CancellationToken::new(),
        )
        .with_alerts(alerts.clone());

        let outcome = watcher.check(Trigger::Scheduled).await;
        assert_eq!(outcome.kind(), OutcomeKind::Failed);
        assert_eq!(alerts.sent().len(), 1);
        assert_eq!(watcher.last_check().unwrap().outcome, OutcomeKind::Failed);
    }
}
