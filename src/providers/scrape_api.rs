use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{shuffled_keys, FetchContext, FetchProvider, ProviderKind, SharedRng};
use crate::error::FetchError;

const NAME: &str = "scrape-api";

/// Delegates the fetch to a hosted scraping API (scrape.do style:
/// `GET {base}?token=KEY&url=ENCODED`), rotating across API keys.
pub struct ScrapeApiProvider {
    client: reqwest::Client,
    base_url: String,
    keys: Vec<String>,
    rng: SharedRng,
}

impl ScrapeApiProvider {
    pub fn new(
        base_url: &str,
        keys: Vec<String>,
        timeout: Duration,
        rng: SharedRng,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                provider: NAME,
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            keys,
            rng,
        })
    }

    fn endpoint(&self, key: &str, url: &str) -> String {
        format!(
            "{}/?token={}&url={}",
            self.base_url,
            urlencoding::encode(key),
            urlencoding::encode(url)
        )
    }

    async fn fetch_with_key(&self, key: &str, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(self.endpoint(key, url))
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(NAME, url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                provider: NAME,
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text()
            .await
            .map_err(|e| FetchError::from_reqwest(NAME, url, e))
    }
}

#[async_trait]
impl FetchProvider for ScrapeApiProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Api
    }

    async fn fetch_html(&self, url: &str, _ctx: &FetchContext) -> Result<String, FetchError> {
        if self.keys.is_empty() {
            return Err(FetchError::NoKeys(NAME));
        }

        let keys = shuffled_keys(&self.keys, &self.rng);
        for (i, key) in keys.iter().enumerate() {
            match self.fetch_with_key(key, url).await {
                Ok(html) => return Ok(html),
                Err(e) => warn!(key_index = i, error = %e, "scrape API key failed"),
            }
        }
        Err(FetchError::AllKeysFailed {
            provider: NAME,
            tried: keys.len(),
        })
    }
}
