use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::PoolSettings;
use crate::gateway::GatewaySettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub worker_pool_size: usize,
    pub topic_capacity: usize,
    pub heartbeat_interval: Duration,
    pub scan_delay: Duration,
    pub token_ttl_minutes: i64,
    pub token_gc_interval: Duration,
    pub password_hash_cost: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            database_path: "fuzzy_search.db".to_string(),
            worker_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            topic_capacity: 100,
            heartbeat_interval: Duration::from_secs(5),
            scan_delay: Duration::from_millis(100),
            token_ttl_minutes: 30,
            token_gc_interval: Duration::from_secs(60 * 60),
            password_hash_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let worker_pool_size = parse_or(&lookup, "WORKER_POOL_SIZE", defaults.worker_pool_size)?;
        let topic_capacity = parse_or(&lookup, "TOPIC_CAPACITY", defaults.topic_capacity)?;
        let heartbeat_secs = parse_or(
            &lookup,
            "HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        let scan_delay_ms = parse_or(
            &lookup,
            "SCAN_DELAY_MS",
            defaults.scan_delay.as_millis() as u64,
        )?;
        let token_ttl_minutes = parse_or(
            &lookup,
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            defaults.token_ttl_minutes,
        )?;
        let token_gc_secs = parse_or(
            &lookup,
            "TOKEN_GC_INTERVAL_SECS",
            defaults.token_gc_interval.as_secs(),
        )?;
        let password_hash_cost = parse_or(&lookup, "BCRYPT_COST", defaults.password_hash_cost)?;
        if !(4..=31).contains(&password_hash_cost) {
            return Err(ConfigError::Invalid {
                key: "BCRYPT_COST",
                value: password_hash_cost.to_string(),
            });
        }

        Ok(Config {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            database_path: lookup("DATABASE_PATH").unwrap_or(defaults.database_path),
            worker_pool_size: positive(worker_pool_size, "WORKER_POOL_SIZE")?,
            topic_capacity: positive(topic_capacity, "TOPIC_CAPACITY")?,
            heartbeat_interval: Duration::from_secs(positive(
                heartbeat_secs,
                "HEARTBEAT_INTERVAL_SECS",
            )?),
            scan_delay: Duration::from_millis(scan_delay_ms),
            token_ttl_minutes: positive(token_ttl_minutes, "ACCESS_TOKEN_EXPIRE_MINUTES")?,
            token_gc_interval: Duration::from_secs(positive(
                token_gc_secs,
                "TOKEN_GC_INTERVAL_SECS",
            )?),
            password_hash_cost,
        })
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            pool_size: self.worker_pool_size,
            scan_delay: self.scan_delay,
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            heartbeat_interval: self.heartbeat_interval,
            ..GatewaySettings::default()
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn positive<T: PartialOrd + Default + ToString>(
    value: T,
    key: &'static str,
) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.topic_capacity, 100);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.token_ttl_minutes, 30);
        assert_eq!(config.password_hash_cost, bcrypt::DEFAULT_COST);
        assert!(config.worker_pool_size >= 1);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("PORT", "9100"),
            ("DATABASE_PATH", "/tmp/search.db"),
            ("WORKER_POOL_SIZE", "2"),
            ("HEARTBEAT_INTERVAL_SECS", "30"),
            ("SCAN_DELAY_MS", "0"),
        ])
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.database_path, "/tmp/search.db");
        assert_eq!(config.pool_settings().pool_size, 2);
        assert_eq!(config.gateway_settings().heartbeat_interval, Duration::from_secs(30));
        assert!(config.scan_delay.is_zero());
    }

    #[test]
    fn test_rejects_garbage_and_zero() {
        let err = from_pairs(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));

        let err = from_pairs(&[("WORKER_POOL_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WORKER_POOL_SIZE", .. }));

        let err = from_pairs(&[("BCRYPT_COST", "3")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "BCRYPT_COST", .. }));
    }
}
