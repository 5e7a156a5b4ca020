//! Controller configuration loaded from environment variables

use parapet_common::{constants, AddressSetRef, PolicyRef, Scope};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Protection policy the controller manages
    pub policy: PolicyRef,

    /// Name of the rate-based rule inside the policy
    pub rate_rule_name: String,

    /// Address set that receives blocked sources
    pub address_set: AddressSetRef,

    /// Blocked-request count above which the blocklist is grown
    pub block_count_threshold: u64,

    /// Lower saturation bound for the rate limit
    pub min_rate_limit: u64,

    /// Upper saturation bound for the rate limit
    pub max_rate_limit: u64,

    /// Block ratio above which the limit is raised
    pub increase_threshold: f64,

    /// Block ratio below which the limit is tightened
    pub decrease_threshold: f64,

    /// Multiplier applied when raising the limit
    pub increase_factor: f64,

    /// Multiplier applied when tightening the limit
    pub decrease_factor: f64,

    /// Observation window in seconds
    pub window_secs: u64,

    /// Upper bound on sampled requests fetched per cycle
    pub sample_max_items: u32,

    /// Base URL of the filtering engine's management API
    pub filter_api_url: String,

    /// Bearer token for the filtering engine API
    pub filter_api_token: Option<String>,

    /// Redis connection string (metrics backend)
    pub redis_url: String,

    /// Namespace for published telemetry
    pub metric_namespace: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            policy: PolicyRef {
                id: required("POLICY_ID")?,
                name: required("POLICY_NAME")?,
                scope: scope_var("POLICY_SCOPE")?,
            },
            rate_rule_name: env::var("RATE_RULE_NAME")
                .unwrap_or_else(|_| "rate-based-protection".to_string()),
            address_set: AddressSetRef {
                id: required("ADDRESS_SET_ID")?,
                name: required("ADDRESS_SET_NAME")?,
                scope: scope_var("ADDRESS_SET_SCOPE")?,
            },
            block_count_threshold: u64_var(
                "BLOCK_COUNT_THRESHOLD",
                constants::BLOCK_COUNT_THRESHOLD,
            )?,
            min_rate_limit: u64_var("MIN_RATE_LIMIT", constants::MIN_RATE_LIMIT)?,
            max_rate_limit: u64_var("MAX_RATE_LIMIT", constants::MAX_RATE_LIMIT)?,
            increase_threshold: f64_var(
                "RATE_INCREASE_THRESHOLD",
                constants::RATE_INCREASE_THRESHOLD,
            )?,
            decrease_threshold: f64_var(
                "RATE_DECREASE_THRESHOLD",
                constants::RATE_DECREASE_THRESHOLD,
            )?,
            increase_factor: f64_var("RATE_INCREASE_FACTOR", constants::RATE_INCREASE_FACTOR)?,
            decrease_factor: f64_var("RATE_DECREASE_FACTOR", constants::RATE_DECREASE_FACTOR)?,
            window_secs: u64_var("WINDOW_SECONDS", constants::WINDOW_SECONDS)?,
            sample_max_items: u64_var("SAMPLE_MAX_ITEMS", constants::SAMPLE_MAX_ITEMS as u64)?
                as u32,
            filter_api_url: env::var("FILTER_API_URL")
                .unwrap_or_else(|_| "http://localhost:9080".to_string()),
            filter_api_token: env::var("FILTER_API_TOKEN").ok(),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            metric_namespace: env::var("METRIC_NAMESPACE")
                .unwrap_or_else(|_| constants::METRIC_NAMESPACE.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants before any remote call is made
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_rate_limit == 0 || self.min_rate_limit > self.max_rate_limit {
            return Err(ConfigError::InvalidBounds(format!(
                "rate limit bounds must satisfy 0 < min <= max, got {}..{}",
                self.min_rate_limit, self.max_rate_limit
            )));
        }
        if self.decrease_threshold >= self.increase_threshold {
            return Err(ConfigError::InvalidBounds(format!(
                "decrease threshold {} must be below increase threshold {}",
                self.decrease_threshold, self.increase_threshold
            )));
        }
        if self.increase_factor <= 1.0 {
            return Err(ConfigError::InvalidBounds(format!(
                "increase factor must be above 1.0, got {}",
                self.increase_factor
            )));
        }
        if self.decrease_factor <= 0.0 || self.decrease_factor >= 1.0 {
            return Err(ConfigError::InvalidBounds(format!(
                "decrease factor must be in (0, 1), got {}",
                self.decrease_factor
            )));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::InvalidBounds(
                "observation window must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingEnv(name))
}

fn u64_var(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

fn f64_var(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

fn scope_var(name: &'static str) -> Result<Scope, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidScope(name, raw)),
        Err(_) => Ok(Scope::Regional),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),

    #[error("Invalid scope for {0}: {1}")]
    InvalidScope(&'static str, String),

    #[error("Invalid control bounds: {0}")]
    InvalidBounds(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            policy: PolicyRef {
                id: "p-1".to_string(),
                name: "edge".to_string(),
                scope: Scope::Regional,
            },
            rate_rule_name: "rate-based-protection".to_string(),
            address_set: AddressSetRef {
                id: "as-1".to_string(),
                name: "blocked".to_string(),
                scope: Scope::Regional,
            },
            block_count_threshold: 100,
            min_rate_limit: 1000,
            max_rate_limit: 10000,
            increase_threshold: 0.8,
            decrease_threshold: 0.2,
            increase_factor: 1.5,
            decrease_factor: 0.8,
            window_secs: 3600,
            sample_max_items: 500,
            filter_api_url: "http://localhost:9080".to_string(),
            filter_api_token: None,
            redis_url: "redis://localhost:6379".to_string(),
            metric_namespace: "parapet/controller".to_string(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut config = base_config();
        config.min_rate_limit = 20000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBounds(_))
        ));
    }

    #[test]
    fn test_crossed_thresholds_rejected() {
        let mut config = base_config();
        config.decrease_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_factors_on_wrong_side_of_one_rejected() {
        let mut config = base_config();
        config.increase_factor = 0.9;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.decrease_factor = 1.2;
        assert!(config.validate().is_err());
    }
}
