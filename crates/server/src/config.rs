use core::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_PORT: u16 = 8990;
pub const DEFAULT_ADDRS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
];

/// Option lookup prefixes, general to specific. A transport-scoped key such
/// as `long-polling.json.timeout` overrides the bare `timeout`.
pub const OPTION_PREFIXES: [&str; 2] = ["", "long-polling.json"];

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_addrs")]
    pub listen: Vec<SocketAddr>,

    #[serde(default)]
    pub long_polling: Option<LongPollingConfig>,

    #[serde(flatten)]
    pub options: Options,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_addrs(),
            long_polling: None,
            options: Options::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct LongPollingConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

pub fn default_addrs() -> Vec<SocketAddr> {
    DEFAULT_ADDRS
        .into_iter()
        .map(|addr| SocketAddr::from((addr, DEFAULT_PORT)))
        .collect()
}

fn bool_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl Display for SameSite {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        })
    }
}

/// Tunables of the Bayeux core. All durations are milliseconds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Max hold for a `/meta/connect`.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Advised pause between client connects.
    #[serde(default)]
    pub interval: u64,
    /// Grace before the sweeper expires a session.
    #[serde(default = "default_max_interval")]
    pub max_interval: u64,
    /// Sweeper tick.
    #[serde(default = "default_sweep_period")]
    pub sweep_period: u64,
    /// Cookie identifying a browser.
    #[serde(default = "default_browser_cookie_name")]
    pub browser_cookie_name: String,
    #[serde(default = "bool_true")]
    pub browser_cookie_http_only: bool,
    #[serde(default)]
    pub browser_cookie_secure: bool,
    #[serde(default)]
    pub browser_cookie_same_site: Option<SameSite>,
    /// Concurrent suspended connects per browser; -1 unlimited, 0 forbid.
    #[serde(default = "default_max_sessions_per_browser")]
    pub max_sessions_per_browser: i64,
    /// Retry hint when the browser cap is hit; 0 disables the hint.
    #[serde(default = "default_multi_session_interval")]
    pub multi_session_interval: i64,
    /// Status returned to a connect preempted by a newer one.
    #[serde(default = "default_duplicate_meta_connect_http_response_code")]
    pub duplicate_meta_connect_http_response_code: u16,
}

fn default_timeout() -> u64 {
    30_000
}

fn default_max_interval() -> u64 {
    10_000
}

fn default_sweep_period() -> u64 {
    997
}

fn default_browser_cookie_name() -> String {
    "BAYEUX_BROWSER".to_owned()
}

fn default_max_sessions_per_browser() -> i64 {
    1
}

fn default_multi_session_interval() -> i64 {
    2_000
}

fn default_duplicate_meta_connect_http_response_code() -> u16 {
    500
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            interval: 0,
            max_interval: default_max_interval(),
            sweep_period: default_sweep_period(),
            browser_cookie_name: default_browser_cookie_name(),
            browser_cookie_http_only: true,
            browser_cookie_secure: false,
            browser_cookie_same_site: None,
            max_sessions_per_browser: default_max_sessions_per_browser(),
            multi_session_interval: default_multi_session_interval(),
            duplicate_meta_connect_http_response_code:
                default_duplicate_meta_connect_http_response_code(),
        }
    }
}

impl Options {
    /// Resolves options from a raw key/value map whose keys may carry any of
    /// the [`OPTION_PREFIXES`]; a prefixed key wins over a bare one.
    pub fn from_raw(raw: &Map<String, Value>) -> Self {
        let lookup = |name: &str| {
            let mut found = None;
            for prefix in OPTION_PREFIXES {
                let key = if prefix.is_empty() {
                    name.to_owned()
                } else {
                    format!("{prefix}.{name}")
                };
                if let Some(value) = raw.get(&key) {
                    found = Some(value);
                }
            }
            found
        };
        let ms = |name: &str, default: u64| lookup(name).and_then(Value::as_u64).unwrap_or(default);

        let defaults = Self::default();
        Self {
            timeout: ms("timeout", defaults.timeout),
            interval: ms("interval", defaults.interval),
            max_interval: ms("maxInterval", defaults.max_interval),
            sweep_period: ms("sweepPeriod", defaults.sweep_period),
            browser_cookie_name: lookup("browserCookieName")
                .and_then(Value::as_str)
                .map_or(defaults.browser_cookie_name, str::to_owned),
            browser_cookie_http_only: lookup("browserCookieHttpOnly")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.browser_cookie_http_only),
            browser_cookie_secure: lookup("browserCookieSecure")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.browser_cookie_secure),
            browser_cookie_same_site: lookup("browserCookieSameSite")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .or(defaults.browser_cookie_same_site),
            max_sessions_per_browser: lookup("maxSessionsPerBrowser")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.max_sessions_per_browser),
            multi_session_interval: lookup("multiSessionInterval")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.multi_session_interval),
            duplicate_meta_connect_http_response_code: lookup(
                "duplicateMetaConnectHttpResponseCode",
            )
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(defaults.duplicate_meta_connect_http_response_code),
        }
    }
}
