//! Durable state: proxy scores, the proxy blacklist and the last announced link.
//!
//! Backends: JSON files (default), Redis, or process memory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::proxy::ProxyRecord;

/// Everything the proxy pool persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxySnapshot {
    pub stats: HashMap<String, ProxyRecord>,
    pub blacklist: HashSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LastLinkRecord {
    link: String,
    announced_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_proxy_state(&self) -> Result<ProxySnapshot>;

    async fn save_proxy_state(&self, snapshot: &ProxySnapshot) -> Result<()>;

    async fn load_last_link(&self) -> Result<Option<String>>;

    async fn save_last_link(&self, link: &str) -> Result<()>;
}

fn sorted_blacklist(blacklist: &HashSet<String>) -> Vec<&String> {
    let mut list: Vec<&String> = blacklist.iter().collect();
    list.sort();
    list
}

// ============================================================================
// JSON files
// ============================================================================

pub struct JsonFileStore {
    stats_path: PathBuf,
    blacklist_path: PathBuf,
    last_link_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(
        stats_path: impl Into<PathBuf>,
        blacklist_path: impl Into<PathBuf>,
        last_link_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stats_path: stats_path.into(),
            blacklist_path: blacklist_path.into(),
            last_link_path: last_link_path.into(),
        }
    }

    /// All three files under one directory with their default names.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(
            dir.join("proxy_stats.json"),
            dir.join("proxy_blacklist.json"),
            dir.join("last_link.json"),
        )
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Write-then-rename so readers never see a half-written file.
    async fn write_atomic(path: &Path, contents: String) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_proxy_state(&self) -> Result<ProxySnapshot> {
        let mut snapshot = ProxySnapshot::default();
        if let Some(raw) = Self::read_optional(&self.stats_path).await? {
            snapshot.stats = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", self.stats_path.display()))?;
        }
        if let Some(raw) = Self::read_optional(&self.blacklist_path).await? {
            let list: Vec<String> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", self.blacklist_path.display()))?;
            snapshot.blacklist = list.into_iter().collect();
        }
        Ok(snapshot)
    }

    async fn save_proxy_state(&self, snapshot: &ProxySnapshot) -> Result<()> {
        let stats = serde_json::to_string(&snapshot.stats)?;
        let blacklist = serde_json::to_string(&sorted_blacklist(&snapshot.blacklist))?;
        Self::write_atomic(&self.stats_path, stats).await?;
        Self::write_atomic(&self.blacklist_path, blacklist).await
    }

    async fn load_last_link(&self) -> Result<Option<String>> {
        let Some(raw) = Self::read_optional(&self.last_link_path).await? else {
            return Ok(None);
        };
        let record: LastLinkRecord = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.last_link_path.display()))?;
        Ok(Some(record.link))
    }

    async fn save_last_link(&self, link: &str) -> Result<()> {
        let record = LastLinkRecord {
            link: link.to_string(),
            announced_at: Utc::now(),
        };
        Self::write_atomic(&self.last_link_path, serde_json::to_string(&record)?).await
    }
}

// ============================================================================
// Redis
// ============================================================================

const STATS_KEY: &str = "brandlink:proxy_stats";
const BLACKLIST_KEY: &str = "brandlink:proxy_blacklist";
const LAST_LINK_KEY: &str = "brandlink:last_link";

pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("connecting to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn load_proxy_state(&self) -> Result<ProxySnapshot> {
        let mut conn = self.conn.clone();
        let stats: Option<String> = conn.get(STATS_KEY).await?;
        let blacklist: Option<String> = conn.get(BLACKLIST_KEY).await?;

        let mut snapshot = ProxySnapshot::default();
        if let Some(raw) = stats {
            snapshot.stats = serde_json::from_str(&raw).context("parsing proxy stats")?;
        }
        if let Some(raw) = blacklist {
            let list: Vec<String> = serde_json::from_str(&raw).context("parsing blacklist")?;
            snapshot.blacklist = list.into_iter().collect();
        }
        Ok(snapshot)
    }

    async fn save_proxy_state(&self, snapshot: &ProxySnapshot) -> Result<()> {
        let stats = serde_json::to_string(&snapshot.stats)?;
        let blacklist = serde_json::to_string(&sorted_blacklist(&snapshot.blacklist))?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(STATS_KEY, stats)
            .ignore()
            .set(BLACKLIST_KEY, blacklist)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .context("saving proxy state to redis")?;
        Ok(())
    }

    async fn load_last_link(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(LAST_LINK_KEY).await?;
        match raw {
            Some(raw) => {
                let record: LastLinkRecord = serde_json::from_str(&raw)?;
                Ok(Some(record.link))
            }
            None => Ok(None),
        }
    }

    async fn save_last_link(&self, link: &str) -> Result<()> {
        let record = LastLinkRecord {
            link: link.to_string(),
            announced_at: Utc::now(),
        };
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(LAST_LINK_KEY, serde_json::to_string(&record)?)
            .await
            .context("saving last link to redis")?;
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Non-durable store: state lives as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    proxies: Mutex<ProxySnapshot>,
    last_link: Mutex<Option<String>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of proxy-state writes so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_proxy_state(&self) -> Result<ProxySnapshot> {
        Ok(self
            .proxies
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?
            .clone())
    }

    async fn save_proxy_state(&self, snapshot: &ProxySnapshot) -> Result<()> {
        *self
            .proxies
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))? = snapshot.clone();
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn load_last_link(&self) -> Result<Option<String>> {
        Ok(self
            .last_link
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?
            .clone())
    }

    async fn save_last_link(&self, link: &str) -> Result<()> {
        *self
            .last_link
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))? = Some(link.to_string());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("brandlink-test-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let store = JsonFileStore::in_dir(scratch_dir());
        assert_eq!(store.load_proxy_state().await.unwrap(), ProxySnapshot::default());
        assert_eq!(store.load_last_link().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_layout_matches_legacy_format() {
        let dir = scratch_dir();
        let store = JsonFileStore::in_dir(&dir);

        let mut snapshot = ProxySnapshot::default();
        snapshot.stats.insert(
            "http://1.2.3.4:8080".to_string(),
            ProxyRecord {
                success: 2,
                fail: 1,
                last_fail: 1700000000.5,
                consec_fail: 1,
            },
        );
        snapshot.blacklist.insert("http://5.6.7.8:3128".to_string());
        store.save_proxy_state(&snapshot).await.unwrap();

        let stats: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.join("proxy_stats.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            stats["http://1.2.3.4:8080"],
            serde_json::json!({"success": 2, "fail": 1, "last_fail": 1700000000.5, "consec_fail": 1})
        );
        let blacklist: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(dir.join("proxy_blacklist.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(blacklist, vec!["http://5.6.7.8:3128".to_string()]);

        assert_eq!(store.load_proxy_state().await.unwrap(), snapshot);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_stats_without_consecutive_field_load() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("proxy_stats.json"),
            r#"{"http://9.9.9.9:80": {"success": 1, "fail": 4, "last_fail": 0.0}}"#,
        )
        .unwrap();
        let store = JsonFileStore::in_dir(&dir);
        let snapshot = store.load_proxy_state().await.unwrap();
        assert_eq!(snapshot.stats["http://9.9.9.9:80"].consec_fail, 0);
        assert_eq!(snapshot.stats["http://9.9.9.9:80"].fail, 4);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_last_link_persists() {
        let dir = scratch_dir();
        let store = JsonFileStore::in_dir(&dir);
        store
            .save_last_link("https://www.canva.com/brand/join?token=abc")
            .await
            .unwrap();
        let reopened = JsonFileStore::in_dir(&dir);
        assert_eq!(
            reopened.load_last_link().await.unwrap().as_deref(),
            Some("https://www.canva.com/brand/join?token=abc")
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_memory_store_counts_saves() {
        let store = MemoryStore::new();
        store.save_proxy_state(&ProxySnapshot::default()).await.unwrap();
        store.save_proxy_state(&ProxySnapshot::default()).await.unwrap();
        assert_eq!(store.save_count(), 2);
    }
}
