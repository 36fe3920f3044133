//! Configuration types.
//!
//! Everything is read from environment variables. Each config has a
//! `from_env()` constructor and a `from_lookup()` twin that takes the
//! variable source as a closure, so tests never touch the process env.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::channels::ChannelKind;
use crate::error::ConfigError;

/// Source of configuration values, keyed by variable name.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read a variable from the process environment. Blank values count as unset.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional variable.
pub fn parse_opt<T>(lookup: EnvLookup<'_>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Parse a variable, falling back to `default` when unset.
pub fn parse_or<T>(lookup: EnvLookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

/// Read a variable that must be present.
pub fn require(lookup: EnvLookup<'_>, key: &str, hint: &str) -> Result<String, ConfigError> {
    lookup(key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Channel used when a submission does not pick one.
    /// `None` means the first configured channel.
    pub default_channel: Option<ChannelKind>,
    /// Maximum accepted upload body.
    pub upload_max_bytes: usize,
    /// Waiting jobs older than this are failed. `None` disables expiry.
    pub job_max_age: Option<Duration>,
    /// How often the reaper looks for expired jobs.
    pub reaper_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            default_channel: None,
            upload_max_bytes: 50 * 1024 * 1024, // 50 MiB
            job_max_age: None,
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let job_max_age = match parse_opt::<u64>(lookup, "JOB_MAX_AGE_SECS")? {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        let reaper_secs = parse_or(lookup, "REAPER_INTERVAL_SECS", 60_u64)?;
        if reaper_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REAPER_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            port: parse_or(lookup, "PORT", defaults.port)?,
            default_channel: parse_opt(lookup, "DEFAULT_CHANNEL")?,
            upload_max_bytes: parse_or(lookup, "UPLOAD_MAX_BYTES", defaults.upload_max_bytes)?,
            job_max_age,
            reaper_interval: Duration::from_secs(reaper_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_env_empty() {
        let lookup = lookup_from(&[]);
        let config = AppConfig::from_lookup(&lookup).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.default_channel, None);
        assert_eq!(config.job_max_age, None);
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
    }

    #[test]
    fn reads_overrides() {
        let lookup = lookup_from(&[
            ("PORT", "8081"),
            ("DEFAULT_CHANNEL", "mail"),
            ("UPLOAD_MAX_BYTES", "1024"),
            ("JOB_MAX_AGE_SECS", "3600"),
        ]);
        let config = AppConfig::from_lookup(&lookup).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.default_channel, Some(ChannelKind::Mail));
        assert_eq!(config.upload_max_bytes, 1024);
        assert_eq!(config.job_max_age, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn zero_max_age_disables_expiry() {
        let lookup = lookup_from(&[("JOB_MAX_AGE_SECS", "0")]);
        assert_eq!(AppConfig::from_lookup(&lookup).unwrap().job_max_age, None);
    }

    #[test]
    fn invalid_port_is_reported_with_key() {
        let lookup = lookup_from(&[("PORT", "eighty")]);
        let err = AppConfig::from_lookup(&lookup).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "PORT"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_default_channel_rejected() {
        let lookup = lookup_from(&[("DEFAULT_CHANNEL", "pigeon")]);
        assert!(AppConfig::from_lookup(&lookup).is_err());
    }

    #[test]
    fn require_reports_hint() {
        let lookup = lookup_from(&[]);
        let err = require(&lookup, "EMAIL_TO_ADDRESS", "Set the agent's mailbox").unwrap_err();
        assert!(err.to_string().contains("EMAIL_TO_ADDRESS"));
        assert!(err.to_string().contains("agent's mailbox"));
    }
}
