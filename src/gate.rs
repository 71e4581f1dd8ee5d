//! Deduplication gate: only a changed link gets announced.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::announcer::Announcer;
use crate::store::StateStore;

/// `candidate` is worth announcing: non-empty and different from `last`.
/// No previous link means anything non-empty is new.
pub fn is_new(candidate: &str, last: Option<&str>) -> bool {
    !candidate.is_empty() && Some(candidate) != last
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Announced,
    Unchanged,
}

/// Holds the last announced link. The check, the announcement and the update
/// happen under one lock, so a link is announced at most once no matter how
/// many checks race on it.
pub struct LinkGate {
    last: Mutex<Option<String>>,
    store: Arc<dyn StateStore>,
}

impl LinkGate {
    pub fn new(initial: Option<String>, store: Arc<dyn StateStore>) -> Self {
        Self {
            last: Mutex::new(initial.filter(|l| !l.is_empty())),
            store,
        }
    }

    /// Start from the persisted link, or from nothing if it cannot be read.
    pub async fn load(store: Arc<dyn StateStore>) -> Self {
        let initial = match store.load_last_link().await {
            Ok(link) => {
                if let Some(link) = &link {
                    info!("💾 Last announced link: {}", link);
                }
                link
            }
            Err(e) => {
                error!("Failed to load last announced link: {:#}", e);
                None
            }
        };
        Self::new(initial, store)
    }

    pub async fn last(&self) -> Option<String> {
        self.last.lock().await.clone()
    }

    /// Announce `candidate` if it differs from the last announced link.
    /// The last link only moves once the announcement went through.
    pub async fn announce_if_new(
        &self,
        candidate: &str,
        announcer: &dyn Announcer,
    ) -> anyhow::Result<GateDecision> {
        let mut last = self.last.lock().await;
        if !is_new(candidate, last.as_deref()) {
            info!("No new link ({})", candidate);
            return Ok(GateDecision::Unchanged);
        }
        self.commit(&mut last, candidate, announcer).await?;
        Ok(GateDecision::Announced)
    }

    /// Announce `link` even if it equals the last one.
    pub async fn announce_forced(&self, link: &str, announcer: &dyn Announcer) -> anyhow::Result<()> {
        if link.is_empty() {
            anyhow::bail!("refusing to announce an empty link");
        }
        let mut last = self.last.lock().await;
        self.commit(&mut last, link, announcer).await
    }

    async fn commit(
        &self,
        last: &mut Option<String>,
        link: &str,
        announcer: &dyn Announcer,
    ) -> anyhow::Result<()> {
        announcer.announce(link).await?;
        *last = Some(link.to_string());
        info!("✅ Announced via {}: {}", announcer.name(), link);
        if let Err(e) = self.store.save_last_link(link).await {
            error!("Failed to persist last announced link: {:#}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcer::testing::RecordingAnnouncer;
    use crate::store::MemoryStore;

    const L: &str = "https://www.canva.com/brand/join?token=abc";
    const X: &str = "https://www.canva.com/brand/join?token=xyz";

    #[test]
    fn test_is_new() {
        assert!(!is_new(L, Some(L)));
        assert!(is_new(X, Some(L)));
        assert!(!is_new("", Some(L)));
        assert!(is_new(L, None));
        assert!(!is_new("", None));
    }

    #[tokio::test]
    async fn test_concurrent_checks_announce_once() {
        let gate = Arc::new(LinkGate::new(None, Arc::new(MemoryStore::new())));
        let announcer = Arc::new(RecordingAnnouncer::default());

        let mut handles = Vec::new();
        for _ in 0..2 {
            let gate = gate.clone();
            let announcer = announcer.clone();
            handles.push(tokio::spawn(async move {
                gate.announce_if_new(L, announcer.as_ref()).await.unwrap()
            }));
        }
        let mut decisions = Vec::new();
        for h in handles {
            decisions.push(h.await.unwrap());
        }

        assert_eq!(announcer.links(), vec![L.to_string()]);
        assert_eq!(
            decisions.iter().filter(|d| **d == GateDecision::Announced).count(),
            1
        );
        assert!(decisions.contains(&GateDecision::Unchanged));
    }

    #[tokio::test]
    async fn test_failed_announcement_keeps_last() {
        let store = Arc::new(MemoryStore::new());
        let gate = LinkGate::new(Some(L.to_string()), store.clone());

        let failing = RecordingAnnouncer::failing();
        assert!(gate.announce_if_new(X, &failing).await.is_err());
        assert_eq!(gate.last().await.as_deref(), Some(L));
        assert_eq!(store.load_last_link().await.unwrap(), None);

        // The next check retries the same link.
        let ok = RecordingAnnouncer::default();
        assert_eq!(
            gate.announce_if_new(X, &ok).await.unwrap(),
            GateDecision::Announced
        );
        assert_eq!(store.load_last_link().await.unwrap().as_deref(), Some(X));
    }

    #[tokio::test]
    async fn test_forced_announce_repeats_and_updates() {
        let gate = LinkGate::new(Some(L.to_string()), Arc::new(MemoryStore::new()));
        let announcer = RecordingAnnouncer::default();
        gate.announce_forced(L, &announcer).await.unwrap();
        assert_eq!(announcer.links(), vec![L.to_string()]);
        assert!(gate.announce_forced("", &announcer).await.is_err());
    }

    #[tokio::test]
    async fn test_load_restores_persisted_link() {
        let store = Arc::new(MemoryStore::new());
        store.save_last_link(L).await.unwrap();
        let gate = LinkGate::load(store).await;
        let announcer = RecordingAnnouncer::default();
        assert_eq!(
            gate.announce_if_new(L, &announcer).await.unwrap(),
            GateDecision::Unchanged
        );
        assert!(announcer.links().is_empty());
    }
}
