use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime};

use crate::limits::DEFAULT_COMMIT_TIMEOUT;

/// Process configuration, read once from `ROOMKEEPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// How long a `booked` schedule may sit past its start before it is a no-show.
    pub grace: Duration,
    pub auto_cancel_interval: Duration,
    pub convert_interval: Duration,
    /// Local time of day at which the business day closes.
    pub day_cutoff: NaiveTime,
    pub utc_offset: FixedOffset,
    pub lock_timeout: Duration,
    pub commit_timeout: Duration,
    pub commit_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: String,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

const PREFIX: &str = "ROOMKEEPER_";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys take their defaults; present
    /// but unparseable values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(&format!("{PREFIX}{name}"));

        let day_cutoff = match get("DAY_CUTOFF") {
            Some(v) => NaiveTime::parse_from_str(v.trim(), "%H:%M").map_err(|e| ConfigError {
                var: format!("{PREFIX}DAY_CUTOFF"),
                value: v.clone(),
                reason: e.to_string(),
            })?,
            None => NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
        };

        let offset_minutes: i32 = parse(&get, "UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| ConfigError {
            var: format!("{PREFIX}UTC_OFFSET_MINUTES"),
            value: offset_minutes.to_string(),
            reason: "offset must be within ±24h".into(),
        })?;

        let max_connections: usize = parse(&get, "MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError {
                var: format!("{PREFIX}MAX_CONNECTIONS"),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            port: parse(&get, "PORT", 7411)?,
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "roomkeeper".into()),
            max_connections,
            compact_threshold: parse(&get, "COMPACT_THRESHOLD", 1000)?,
            metrics_port: match get("METRICS_PORT") {
                Some(_) => Some(parse(&get, "METRICS_PORT", 0)?),
                None => None,
            },
            grace: Duration::from_secs(60 * parse::<u64>(&get, "GRACE_MINUTES", 15)?),
            auto_cancel_interval: secs(parse(&get, "AUTO_CANCEL_INTERVAL_SECS", 60)?),
            convert_interval: secs(parse(&get, "CONVERT_INTERVAL_SECS", 30)?),
            day_cutoff,
            utc_offset,
            lock_timeout: Duration::from_millis(parse(&get, "LOCK_TIMEOUT_MS", 500)?),
            commit_timeout: Duration::from_millis(parse(&get, "COMMIT_TIMEOUT_MS", DEFAULT_COMMIT_TIMEOUT.as_millis() as u64)?),
            commit_retries: parse(&get, "COMMIT_RETRIES", 3)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomkeeper.wal")
    }
}

/// Intervals of zero would spin; they are clamped to one second.
fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError {
            var: format!("{PREFIX}{name}"),
            value: v.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = from(&[]).unwrap();
        assert_eq!(c.port, 7411);
        assert_eq!(c.addr(), "0.0.0.0:7411");
        assert_eq!(c.grace, Duration::from_secs(15 * 60));
        assert_eq!(c.day_cutoff, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(c.utc_offset.local_minus_utc(), 0);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.commit_retries, 3);
        assert_eq!(c.commit_timeout, Duration::from_secs(5));
        assert_eq!(c.wal_path(), PathBuf::from("./data/roomkeeper.wal"));
    }

    #[test]
    fn overrides() {
        let c = from(&[
            ("ROOMKEEPER_PORT", "9000"),
            ("ROOMKEEPER_DAY_CUTOFF", "05:30"),
            ("ROOMKEEPER_UTC_OFFSET_MINUTES", "540"),
            ("ROOMKEEPER_METRICS_PORT", "9100"),
            ("ROOMKEEPER_GRACE_MINUTES", "10"),
            ("ROOMKEEPER_COMMIT_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.day_cutoff, NaiveTime::from_hms_opt(5, 30, 0).unwrap());
        assert_eq!(c.utc_offset.local_minus_utc(), 9 * 3600);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.grace, Duration::from_secs(600));
        assert_eq!(c.commit_timeout, Duration::from_millis(250));
    }

    #[test]
    fn garbage_is_an_error_not_a_default() {
        let err = from(&[("ROOMKEEPER_PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "ROOMKEEPER_PORT");
        assert!(from(&[("ROOMKEEPER_DAY_CUTOFF", "6am")]).is_err());
        assert!(from(&[("ROOMKEEPER_UTC_OFFSET_MINUTES", "100000")]).is_err());
        assert!(from(&[("ROOMKEEPER_MAX_CONNECTIONS", "0")]).is_err());
    }
}
