//! Client settings.
//!
//! The settings map is fixed at construction time: the client deep-copies it
//! and never consults mutated state afterwards. Overlays merge header and
//! cookie maps into the defaults and replace every scalar they name, which
//! lets a TOML snippet tweak one knob without spelling out the rest.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/69.0.3497.100 Safari/537.36";

const DEFAULT_ACCEPT_LANGUAGE: &str =
    "en-US,en;q=0.9,zh-CN;q=0.8,zh;q=0.7,ja;q=0.6,zh-TW;q=0.5";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Total per-attempt timeout.
    #[serde(deserialize_with = "seconds")]
    pub timeout: Duration,

    /// Extra attempts after the first timed-out one.
    pub retry: u32,

    /// Pause between retry attempts.
    #[serde(deserialize_with = "seconds")]
    pub retry_interval: Duration,

    /// Global in-flight request cap.
    pub concurrency: usize,

    /// Per-host in-flight request cap.
    pub concurrency_per_host: usize,

    /// Cool-down after every request, successful or not.
    #[serde(deserialize_with = "seconds")]
    pub sleep_per_request: Duration,

    /// Default headers installed on the HTTP session.
    pub headers: BTreeMap<String, String>,

    /// Cookies preloaded into the session jar.
    pub cookies: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        let headers = [
            ("User-Agent", DEFAULT_USER_AGENT),
            ("Accept", "*/*"),
            ("Accept-Encoding", "gzip, deflate"),
            ("Accept-Language", DEFAULT_ACCEPT_LANGUAGE),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

        Self {
            timeout: Duration::from_secs(20),
            retry: 1,
            retry_interval: Duration::from_secs(1),
            concurrency: 4,
            concurrency_per_host: 2,
            sleep_per_request: Duration::from_secs(1),
            headers,
            cookies: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Apply a partial overlay on top of `self`.
    pub fn overlay(mut self, overlay: SettingsOverlay) -> Self {
        if let Some(timeout) = overlay.timeout {
            self.timeout = timeout;
        }
        if let Some(retry) = overlay.retry {
            self.retry = retry;
        }
        if let Some(retry_interval) = overlay.retry_interval {
            self.retry_interval = retry_interval;
        }
        if let Some(concurrency) = overlay.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(concurrency_per_host) = overlay.concurrency_per_host {
            self.concurrency_per_host = concurrency_per_host;
        }
        if let Some(sleep_per_request) = overlay.sleep_per_request {
            self.sleep_per_request = sleep_per_request;
        }
        self.headers.extend(overlay.headers);
        self.cookies.extend(overlay.cookies);
        self
    }
}

/// Partial settings, typically deserialized from a TOML file. Only the
/// recognized option names are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsOverlay {
    #[serde(deserialize_with = "opt_seconds")]
    pub timeout: Option<Duration>,
    pub retry: Option<u32>,
    #[serde(deserialize_with = "opt_seconds")]
    pub retry_interval: Option<Duration>,
    pub concurrency: Option<usize>,
    pub concurrency_per_host: Option<usize>,
    #[serde(deserialize_with = "opt_seconds")]
    pub sleep_per_request: Option<Duration>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom("duration must be non-negative"));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn opt_seconds<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer)?
        .map(|secs| {
            if !secs.is_finite() || secs < 0.0 {
                return Err(serde::de::Error::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(secs))
        })
        .transpose()
}
