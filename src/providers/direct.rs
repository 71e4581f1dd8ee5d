use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{FetchContext, FetchProvider, ProviderKind, SharedRng};
use crate::error::FetchError;
use crate::stealth;

const NAME: &str = "direct";

/// Plain GET with stealth headers, optional proxy and relaxed TLS verification.
pub struct DirectProvider {
    client: reqwest::Client,
    timeout: Duration,
    rng: SharedRng,
}

impl DirectProvider {
    pub fn new(timeout: Duration, rng: SharedRng) -> Result<Self, FetchError> {
        let client = Self::client_builder(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                provider: NAME,
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            timeout,
            rng,
        })
    }

    fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
        // Source pages are known to serve broken certificate chains.
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| FetchError::Transport {
            provider: NAME,
            message: format!("invalid proxy {}: {}", proxy, e),
        })?;
        Self::client_builder(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| FetchError::Transport {
                provider: NAME,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl FetchProvider for DirectProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Direct
    }

    async fn fetch_html(&self, url: &str, ctx: &FetchContext) -> Result<String, FetchError> {
        let client = self.client_for(ctx.proxy.as_deref())?;
        let headers = match self.rng.lock() {
            Ok(mut rng) => stealth::build_headers_with(&mut *rng),
            Err(_) => stealth::build_headers(),
        };

        debug!(url, proxy = ?ctx.proxy, "direct GET");
        let resp = client
            .get(url)
            .headers(headers)
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
