//! Runtime configuration with environment-variable overrides.
//!
//! Every tunable documented here can be overridden from the process
//! environment; unset variables fall back to the defaults baked into
//! `RuntimeConfig::default()`.

use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the whole runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of simultaneously active agents (`MAX_CONCURRENT_AGENTS`).
    pub max_concurrent_agents: usize,
    /// Predictive cache capacity in entries (`CACHE_CAPACITY`).
    pub cache_capacity: usize,
    /// Short-term memory capacity in entries (`SHORT_TERM_CAPACITY`).
    pub short_term_capacity: usize,
    /// Interval between health sweeps (`HEALTH_SWEEP_SECS`).
    pub health_interval: Duration,
    /// Interval between dead-letter drains (`DEAD_LETTER_DRAIN_SECS`).
    pub dead_letter_interval: Duration,
    /// Interval between expired-message sweeps (`EXPIRY_SWEEP_SECS`).
    pub expiry_sweep_interval: Duration,
    /// Retention period per data class, in days (`RETENTION_DAYS_<CLASS>`).
    pub retention_days: HashMap<String, i64>,
    /// Retention for data classes without an explicit policy.
    pub default_retention_days: i64,
    /// Quality threshold overrides per agent role (`QUALITY_THRESHOLD_<ROLE>`).
    pub quality_thresholds: HashMap<String, f64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut retention_days = HashMap::new();
        retention_days.insert("gdpr_personal_data".to_string(), 365);
        retention_days.insert("system_logs".to_string(), 90);
        retention_days.insert("research_data".to_string(), 1825);

        Self {
            max_concurrent_agents: 50,
            cache_capacity: 10_000,
            short_term_capacity: 1_000,
            health_interval: Duration::from_secs(30),
            dead_letter_interval: Duration::from_secs(60),
            expiry_sweep_interval: Duration::from_secs(300),
            retention_days,
            default_retention_days: 90,
            quality_thresholds: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from the process environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_parse::<usize>("MAX_CONCURRENT_AGENTS") {
            config.max_concurrent_agents = value;
        }
        if let Some(value) = env_parse::<usize>("CACHE_CAPACITY") {
            config.cache_capacity = value;
        }
        if let Some(value) = env_parse::<usize>("SHORT_TERM_CAPACITY") {
            config.short_term_capacity = value;
        }
        if let Some(value) = env_parse::<u64>("HEALTH_SWEEP_SECS") {
            config.health_interval = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u64>("DEAD_LETTER_DRAIN_SECS") {
            config.dead_letter_interval = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u64>("EXPIRY_SWEEP_SECS") {
            config.expiry_sweep_interval = Duration::from_secs(value);
        }

        for (key, value) in std::env::vars() {
            if let Some(class) = key.strip_prefix("RETENTION_DAYS_") {
                if let Ok(days) = value.parse::<i64>() {
                    config
                        .retention_days
                        .insert(class.to_lowercase(), days);
                }
            } else if let Some(role) = key.strip_prefix("QUALITY_THRESHOLD_") {
                if let Ok(threshold) = value.parse::<f64>() {
                    config
                        .quality_thresholds
                        .insert(role.to_lowercase(), threshold);
                }
            }
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_concurrent_agents, 50);
        assert_eq!(config.cache_capacity, 10_000);
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.retention_days["gdpr_personal_data"], 365);
        assert_eq!(config.retention_days["research_data"], 1825);
        assert_eq!(config.default_retention_days, 90);
    }
}
