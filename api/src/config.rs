//! Process configuration, read once at startup from the environment.

use std::str::FromStr;
use std::time::Duration;

use tees_core::abuse::AbuseKind;

use crate::abuse::AbusePolicy;
use crate::limiter::RateLimitPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{key}: {source}")]
    UnknownKind {
        key: &'static str,
        source: tees_core::abuse::UnknownAbuseKind,
    },
    #[error("REDIS_URL must be set when RATE_LIMIT_STORE=redis")]
    MissingRedisUrl,
    #[error("invalid policy: {0}")]
    Policy(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
    Disabled,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    /// Per-call budget; an elapsed call degrades the limiter to pass-through.
    pub timeout: Duration,
    pub memory_max_keys: usize,
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: None,
            timeout: Duration::from_millis(100),
            memory_max_keys: 100_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Policy("store timeout must be positive".to_string()));
        }
        if self.memory_max_keys == 0 {
            return Err(ConfigError::Policy(
                "memory store max keys must be positive".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Policy("memory sweep interval must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub rate_limit: RateLimitPolicy,
    pub abuse: AbusePolicy,
    pub store: StoreConfig,
    /// Honor `X-Forwarded-For` / `X-Real-IP`. Only enable behind a proxy that
    /// overwrites them.
    pub trust_proxy: bool,
    pub jwt_secret: Option<String>,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = parse_or(&get, "PORT", 3000u16, "a port number")?;

        let rate_limit = RateLimitPolicy {
            window: Duration::from_secs(parse_or(
                &get,
                "RATE_LIMIT_WINDOW_SECS",
                900u64,
                "a positive number of seconds",
            )?),
            max_requests: parse_or(
                &get,
                "RATE_LIMIT_MAX_REQUESTS",
                100u64,
                "a positive integer",
            )?,
            exempt_paths: get("RATE_LIMIT_EXEMPT_PATHS")
                .map(|raw| split_list(&raw))
                .unwrap_or_else(|| vec!["/health".to_string(), "/readiness".to_string()]),
        };
        rate_limit.validate()?;

        let mut abuse = AbusePolicy::default();
        abuse.window = Duration::from_secs(parse_or(
            &get,
            "ABUSE_WINDOW_SECS",
            3600u64,
            "a positive number of seconds",
        )?);
        abuse.score_limit = parse_or(&get, "ABUSE_SCORE_LIMIT", 100u64, "a positive integer")?;
        if let Some(raw) = get("ABUSE_WEIGHTS") {
            for (kind, weight) in parse_kind_table("ABUSE_WEIGHTS", &raw)? {
                abuse.set_weight(kind, weight);
            }
        }
        if let Some(raw) = get("ABUSE_THRESHOLDS") {
            for (kind, threshold) in parse_kind_table("ABUSE_THRESHOLDS", &raw)? {
                abuse.set_threshold(kind, threshold);
            }
        }
        abuse.validate()?;

        let backend = match get("RATE_LIMIT_STORE") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "RATE_LIMIT_STORE",
                value: raw,
                expected: "one of memory, redis, disabled",
            })?,
            None => StoreBackend::Memory,
        };
        let redis_url = get("REDIS_URL");
        if backend == StoreBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl);
        }
        let store = StoreConfig {
            backend,
            redis_url,
            timeout: Duration::from_millis(parse_or(
                &get,
                "STORE_TIMEOUT_MS",
                100u64,
                "a positive number of milliseconds",
            )?),
            memory_max_keys: parse_or(
                &get,
                "MEMORY_STORE_MAX_KEYS",
                100_000usize,
                "a positive integer",
            )?,
            sweep_interval: Duration::from_secs(parse_or(
                &get,
                "MEMORY_SWEEP_SECS",
                60u64,
                "a positive number of seconds",
            )?),
        };
        store.validate()?;

        let trust_proxy = match get("TRUST_PROXY") {
            Some(raw) => parse_bool("TRUST_PROXY", &raw)?,
            None => false,
        };

        let cors_origins = get("TEES_CORS_ORIGINS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|| vec!["http://localhost:5173".to_string()]);

        Ok(Self {
            port,
            rate_limit,
            abuse,
            store,
            trust_proxy,
            jwt_secret: get("JWT_SECRET"),
            cors_origins,
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw,
            expected,
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            expected: "a boolean",
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse `kind=value,kind=value` overrides.
fn parse_kind_table(key: &'static str, raw: &str) -> Result<Vec<(AbuseKind, u64)>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|pair| {
            let invalid = || ConfigError::Invalid {
                key,
                value: pair.clone(),
                expected: "a list of kind=number pairs",
            };
            let (kind, value) = pair.split_once('=').ok_or_else(invalid)?;
            let kind = kind
                .parse::<AbuseKind>()
                .map_err(|source| ConfigError::UnknownKind { key, source })?;
            let value = value.trim().parse::<u64>().map_err(|_| invalid())?;
            Ok((kind, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use tees_core::abuse::AbuseKind;

    use super::{Config, ConfigError, StoreBackend};

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = config_from(&[]).expect("defaults should be valid");
        assert_eq!(config.port, 3000);
        assert_eq!(config.rate_limit.window, Duration::from_secs(900));
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.exempt_paths, vec!["/health", "/readiness"]);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.abuse.window, Duration::from_secs(3600));
        assert_eq!(config.abuse.kind(AbuseKind::GenericAbuse).threshold, 10);
        assert!(!config.trust_proxy);
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn exempt_paths_and_kind_overrides_are_parsed() {
        let config = config_from(&[
            ("RATE_LIMIT_EXEMPT_PATHS", " /health, /metrics ,"),
            ("ABUSE_WEIGHTS", "login_failure=4, 4xx_error=2"),
            ("ABUSE_THRESHOLDS", "generic_abuse=30"),
            ("TRUST_PROXY", "true"),
        ])
        .expect("config should parse");

        assert_eq!(config.rate_limit.exempt_paths, vec!["/health", "/metrics"]);
        assert_eq!(config.abuse.kind(AbuseKind::LoginFailure).weight, 4);
        assert_eq!(config.abuse.kind(AbuseKind::ClientError).weight, 2);
        assert_eq!(config.abuse.kind(AbuseKind::GenericAbuse).threshold, 30);
        assert!(config.trust_proxy);
    }

    #[test]
    fn unknown_abuse_kind_is_rejected() {
        let err = config_from(&[("ABUSE_WEIGHTS", "brute_force=3")])
            .expect_err("unknown kind should fail");
        assert!(matches!(err, ConfigError::UnknownKind { key: "ABUSE_WEIGHTS", .. }));
    }

    #[test]
    fn zero_weight_is_rejected() {
        let err = config_from(&[("ABUSE_WEIGHTS", "auth_failure=0")])
            .expect_err("zero weight should fail");
        assert!(matches!(err, ConfigError::Policy(_)));
    }

    #[test]
    fn zero_max_requests_is_rejected() {
        let err = config_from(&[("RATE_LIMIT_MAX_REQUESTS", "0")])
            .expect_err("zero limit should fail");
        assert!(matches!(err, ConfigError::Policy(_)));
    }

    #[test]
    fn zero_store_settings_are_rejected() {
        for key in ["STORE_TIMEOUT_MS", "MEMORY_STORE_MAX_KEYS", "MEMORY_SWEEP_SECS"] {
            let err = config_from(&[(key, "0")]).expect_err("zero should fail");
            assert!(matches!(err, ConfigError::Policy(_)), "{key}");
        }
    }

    #[test]
    fn malformed_numbers_name_the_offending_key() {
        let err = config_from(&[("RATE_LIMIT_WINDOW_SECS", "fifteen")])
            .expect_err("non-numeric window should fail");
        assert_eq!(
            err.to_string(),
            "RATE_LIMIT_WINDOW_SECS must be a positive number of seconds, got 'fifteen'"
        );
    }

    #[test]
    fn redis_backend_requires_url() {
        let err = config_from(&[("RATE_LIMIT_STORE", "redis")])
            .expect_err("redis without url should fail");
        assert!(matches!(err, ConfigError::MissingRedisUrl));

        let config = config_from(&[
            ("RATE_LIMIT_STORE", "redis"),
            ("REDIS_URL", "redis://127.0.0.1:6379"),
        ])
        .expect("redis config should parse");
        assert_eq!(config.store.backend, StoreBackend::Redis);
    }

    #[test]
    fn unknown_store_backend_is_rejected() {
        assert!(config_from(&[("RATE_LIMIT_STORE", "memcached")]).is_err());
        let config = config_from(&[("RATE_LIMIT_STORE", "disabled")]).expect("disabled parses");
        assert_eq!(config.store.backend, StoreBackend::Disabled);
    }
}
