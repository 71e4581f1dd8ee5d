//! Error taxonomy for link resolution.
//!
//! Fetch and parse failures are recoverable inside the resolver's retry loop;
//! only `ResolutionError` ever leaves `resolve_latest_target_link`.

use thiserror::Error;

use crate::providers::ScrapeMode;

/// Transport, status or provider failure while turning a URL into HTML.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{provider}: HTTP {status} for {url}")]
    Status {
        provider: &'static str,
        url: String,
        status: u16,
    },

    #[error("{provider}: timed out fetching {url}")]
    Timeout { provider: &'static str, url: String },

    #[error("{provider}: transport error: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    #[error("{provider}: all {tried} API keys failed")]
    AllKeysFailed { provider: &'static str, tried: usize },

    #[error("{0}: no API keys configured")]
    NoKeys(&'static str),

    #[error("{provider}: render failed: {message}")]
    Render {
        provider: &'static str,
        message: String,
    },

    #[error("no proxy available and proxies are required")]
    NoProxyAvailable,

    #[error("no provider configured for mode {0}")]
    NoProvider(ScrapeMode),
}

impl FetchError {
    pub(crate) fn from_reqwest(provider: &'static str, url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                provider,
                url: url.to_string(),
            }
        } else if let Some(status) = err.status() {
            FetchError::Status {
                provider,
                url: url.to_string(),
                status: status.as_u16(),
            }
        } else {
            FetchError::Transport {
                provider,
                message: err.to_string(),
            }
        }
    }
}

/// Expected page structure was not found.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("redirect anchor not found")]
    RedirectAnchorNotFound,

    #[error("redirect anchor has no href")]
    RedirectHrefMissing,

    #[error("redirect href is not a usable URL: {0}")]
    InvalidRedirectUrl(String),

    #[error("target link not found on redirect page")]
    TargetLinkNotFound,
}

/// Why a single resolution attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Every attempt failed; carries the last failure.
#[derive(Debug, Error)]
#[error("link resolution failed after {attempts} attempts: {last}")]
pub struct ResolutionError {
    pub attempts: u32,
    pub last: AttemptError,
}
