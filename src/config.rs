//! Process settings, read once at startup from the environment.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `APIPROXY_CONFIG_FILE` | Path to the servers config file | `apiproxy.conf` |
//! | `APIPROXY_PORT` | Listen port | `8080` |
//! | `APIPROXY_PROXY_TIMEOUT` | Upstream-response timeout, ms | `10000` |
//! | `APIPROXY_TIMEOUT` | Upstream socket idle timeout, ms | `15000` |
//! | `APIPROXY_STATSD_HOST` / `APIPROXY_STATSD_PORT` | Optional statsd endpoint | unset |
//! | `MIN_CREDITOR_ID` / `MAX_CREDITOR_ID` | Both set selects creditors mode | unset |
//! | `MIN_DEBTOR_ID` / `MAX_DEBTOR_ID` | Both set selects debtors mode | unset |
//!
//! With neither id pair set the proxy runs in accounts mode. A partially
//! set pair, both pairs set, an unparsable id, or an empty interval is a
//! fatal startup error.

use crate::mode::Mode;
use crate::sharding::parse_i64;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "apiproxy.conf";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PROXY_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{min_name} and {max_name} must be set together")]
    PartialIdPair {
        min_name: &'static str,
        max_name: &'static str,
    },

    #[error("creditor and debtor id intervals can not both be set")]
    AmbiguousMode,

    #[error("{min_name} exceeds {max_name}")]
    EmptyIdInterval {
        min_name: &'static str,
        max_name: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub config_file: PathBuf,
    pub port: u16,
    pub proxy_timeout: Duration,
    pub socket_timeout: Duration,
    pub statsd: Option<(String, u16)>,
    pub mode: Mode,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable lookup (tests inject one).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let config_file = lookup("APIPROXY_CONFIG_FILE")
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string())
            .into();
        let port = parse_var(&lookup, "APIPROXY_PORT", DEFAULT_PORT)?;
        let proxy_timeout_ms =
            parse_var(&lookup, "APIPROXY_PROXY_TIMEOUT", DEFAULT_PROXY_TIMEOUT_MS)?;
        let socket_timeout_ms = parse_var(&lookup, "APIPROXY_TIMEOUT", DEFAULT_TIMEOUT_MS)?;

        let statsd = match lookup("APIPROXY_STATSD_HOST") {
            Some(host) => {
                let port = parse_var(&lookup, "APIPROXY_STATSD_PORT", 8125)?;
                Some((host, port))
            }
            None => None,
        };

        let creditors = id_interval(&lookup, "MIN_CREDITOR_ID", "MAX_CREDITOR_ID")?;
        let debtors = id_interval(&lookup, "MIN_DEBTOR_ID", "MAX_DEBTOR_ID")?;
        let mode = match (creditors, debtors) {
            (Some(_), Some(_)) => return Err(SettingsError::AmbiguousMode),
            (Some((min_id, max_id)), None) => Mode::Creditors { min_id, max_id },
            (None, Some((min_id, max_id))) => Mode::Debtors { min_id, max_id },
            (None, None) => Mode::Accounts,
        };

        Ok(Self {
            config_file,
            port,
            proxy_timeout: Duration::from_millis(proxy_timeout_ms),
            socket_timeout: Duration::from_millis(socket_timeout_ms),
            statsd,
            mode,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, SettingsError> {
    match lookup(name) {
        Some(value) => value
            .parse()
            .map_err(|_| SettingsError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

fn id_interval(
    lookup: &impl Fn(&str) -> Option<String>,
    min_name: &'static str,
    max_name: &'static str,
) -> Result<Option<(i64, i64)>, SettingsError> {
    let (min, max) = match (lookup(min_name), lookup(max_name)) {
        (None, None) => return Ok(None),
        (Some(min), Some(max)) => (min, max),
        _ => return Err(SettingsError::PartialIdPair { min_name, max_name }),
    };
    let min = parse_i64(&min).ok_or(SettingsError::InvalidValue {
        name: min_name,
        value: min.clone(),
    })?;
    let max = parse_i64(&max).ok_or(SettingsError::InvalidValue {
        name: max_name,
        value: max.clone(),
    })?;
    if min > max {
        return Err(SettingsError::EmptyIdInterval { min_name, max_name });
    }
    Ok(Some((min, max)))
}
