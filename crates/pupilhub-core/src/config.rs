//! Runtime configuration for PupilHub.
//!
//! Endpoint paths, timing and response markers are configuration constants,
//! not part of the behavioural contract. Every field has a default so an
//! absent or partial `config.toml` is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36"
);

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub endpoints: EndpointConfig,
    pub timing: TimingConfig,
    pub markers: MarkerConfig,
    pub cache: CacheConfig,
}

/// Remote endpoints, as absolute base URLs plus paths relative to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Entry URL of the hub; answers with a redirect to the OAuth domain.
    pub hub_base_url: String,
    /// Modern domain the OAuth completion chain lands on.
    pub modern_base_url: String,
    /// Legacy credential endpoint on the secondary domain.
    pub legacy_login_url: String,
    /// Optional "activate PIN" interstitial shown after credentials.
    pub pin_page_url: String,
    pub oauth_login_path: String,
    pub landing_path: String,
    pub switch_path_prefix: String,
    pub timetable_path: String,
    pub time_registration_path: String,
    pub time_registration_calendar_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            hub_base_url: "https://hub.infomentor.se".to_string(),
            modern_base_url: "https://im.infomentor.se".to_string(),
            legacy_login_url: "https://infomentor.se/swedish/production/mentor/".to_string(),
            pin_page_url:
                "https://infomentor.se/Swedish/Production/mentor/Oryggi/PinLogin/EnablePin.aspx"
                    .to_string(),
            oauth_login_path: "/authentication/authentication/login?apitype=im1&forceOAuth=true"
                .to_string(),
            landing_path: "/".to_string(),
            switch_path_prefix: "/Account/PupilSwitcher/SwitchPupil/".to_string(),
            timetable_path: "/timetable/timetable/gettimetablelist".to_string(),
            time_registration_path: "/TimeRegistration/TimeRegistration/GetTimeRegistrations/"
                .to_string(),
            time_registration_calendar_path:
                "/TimeRegistration/TimeRegistration/GetCalendarData/".to_string(),
        }
    }
}

impl EndpointConfig {
    /// Joins a hub-relative path onto the hub base URL.
    pub fn hub_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.hub_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn oauth_login_url(&self) -> String {
        self.hub_url(&self.oauth_login_path)
    }

    pub fn landing_url(&self) -> String {
        self.hub_url(&self.landing_path)
    }

    /// URL that activates the identity behind `token`.
    pub fn switch_url(&self, token: &str) -> String {
        format!("{}{}", self.hub_url(&self.switch_path_prefix), token)
    }
}

/// Request pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Minimum delay inserted before every request.
    pub request_delay_ms: u64,
    /// Delay inserted before any retry or fallback request.
    pub retry_delay_ms: u64,
    /// Bounded per-request timeout.
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: 500,
            retry_delay_ms: 2000,
            request_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl TimingConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Response-body signatures, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub session_expired: Vec<String>,
    pub login_failure: Vec<String>,
    pub invalid_verb: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            session_expired: vec!["HandleUnauthorizedRequest".to_string()],
            login_failure: vec!["login_ascx".to_string()],
            invalid_verb: vec!["invalid verb".to_string(), "bad request".to_string()],
        }
    }
}

impl MarkerConfig {
    pub fn is_session_expired(&self, body: &str) -> bool {
        contains_any(body, &self.session_expired)
    }

    pub fn is_login_failure(&self, body: &str) -> bool {
        contains_any(body, &self.login_failure)
    }

    pub fn is_invalid_verb(&self, body: &str) -> bool {
        contains_any(body, &self.invalid_verb)
    }
}

fn contains_any(body: &str, markers: &[String]) -> bool {
    if markers.is_empty() {
        return false;
    }
    let lower = body.to_lowercase();
    markers
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
}

/// Persistence and cache scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key the account blob is stored under.
    pub storage_key: String,
    pub debounce_ms: u64,
    pub min_write_interval_secs: u64,
    pub error_log_cooldown_secs: u64,
    pub retention_days: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_key: "pupilhub_data".to_string(),
            debounce_ms: 2000,
            min_write_interval_secs: 60,
            error_log_cooldown_secs: 30,
            retention_days: 14,
        }
    }
}

impl CacheConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn min_write_interval(&self) -> Duration {
        Duration::from_secs(self.min_write_interval_secs)
    }

    pub fn error_log_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_log_cooldown_secs)
    }
}
