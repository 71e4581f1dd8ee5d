//! Request stealth
//!
//! - Randomized per-request header sets for plain HTTP fetches
//! - Browser-side evasion script for the local Chrome renderer

use headless_chrome::protocol::cdp::Emulation::{SetLocaleOverride, SetTimezoneOverride};
use headless_chrome::Tab;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONNECTION, PRAGMA,
    REFERER, USER_AGENT,
};

/// Desktop and mobile agents across Chrome, Firefox, Safari and Edge.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Mobile/15E148 Safari/604.1",
];

const REFERER_URL: &str = "https://www.google.com/";

/// Fresh header set with a randomly chosen User-Agent.
pub fn build_headers() -> HeaderMap {
    build_headers_with(&mut rand::thread_rng())
}

pub fn build_headers_with<R: Rng + ?Sized>(rng: &mut R) -> HeaderMap {
    let user_agent = USER_AGENTS.choose(rng).copied().unwrap_or(USER_AGENTS[0]);

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(user_agent));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );
    headers
}

/// Chrome launch flags that hide the usual automation markers.
pub fn chrome_args(user_agent: &str) -> Vec<String> {
    vec![
        "--disable-blink-features=AutomationControlled".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-infobars".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--incognito".to_string(),
        "--headless=new".to_string(),
        format!("--user-agent={}", user_agent),
    ]
}

/// Injected before any page script runs (Page.addScriptToEvaluateOnNewDocument).
pub fn get_stealth_script() -> &'static str {
    r#"
        Object.defineProperty(navigator, 'webdriver', { get: () => undefined });

        Object.defineProperty(navigator, 'hardwareConcurrency', {
            get: () => 4 + Math.floor(Math.random() * 4) * 2,
        });

        Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });

        window.chrome = {
            runtime: {
                connect: function() {
                    return {
                        onMessage: { addListener: function() {}, removeListener: function() {} },
                        postMessage: function() {},
                        disconnect: function() {}
                    };
                },
                sendMessage: function() {},
                onMessage: { addListener: function() {}, removeListener: function() {} }
            },
            app: { isInstalled: false },
            csi: function() {},
            loadTimes: function() { return {}; }
        };

        const originalQuery = window.navigator.permissions.query;
        window.navigator.permissions.query = (parameters) => (
            parameters.name === 'notifications' ?
            Promise.resolve({ state: Notification.permission }) :
            originalQuery(parameters)
        );

        Object.defineProperty(navigator, 'plugins', {
            get: () => {
                const pdf = {
                    description: "Portable Document Format",
                    filename: "internal-pdf-viewer",
                    length: 1,
                    name: "Chrome PDF Plugin"
                };
                const p = [pdf, pdf, pdf];
                Object.setPrototypeOf(p, PluginArray.prototype);
                return p;
            }
        });
    "#
}

/// Pin timezone and locale so they agree with the advertised Accept-Language.
pub fn apply_locale_overrides(tab: &Tab, timezone_id: &str, locale: &str) -> anyhow::Result<()> {
    tab.call_method(SetTimezoneOverride {
        timezone_id: timezone_id.to_string(),
    })?;
    tab.call_method(SetLocaleOverride {
        locale: Some(locale.to_string()),
    })?;
    Ok(())
}

/// Random user agent for contexts that only take the UA string.
pub fn random_user_agent<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    USER_AGENTS.choose(rng).copied().unwrap_or(USER_AGENTS[0])
}
