//! Operator configuration read from the environment

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 2;
pub const DEFAULT_REQUEUE_DELAY_SECS: u64 = 1;
pub const DEFAULT_EVENT_DEDUP_WINDOW_SECS: u64 = 300;
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Size of the reconcile worker pool
    pub max_concurrent_reconciles: usize,
    /// Delay before re-running a group that has not converged
    pub requeue_delay: Duration,
    /// Window in which identical events are suppressed
    pub event_dedup_window: Duration,
    pub health_port: u16,
    /// Watch a single namespace instead of the whole cluster
    pub watch_namespace: Option<String>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            requeue_delay: Duration::from_secs(DEFAULT_REQUEUE_DELAY_SECS),
            event_dedup_window: Duration::from_secs(DEFAULT_EVENT_DEDUP_WINDOW_SECS),
            health_port: DEFAULT_HEALTH_PORT,
            watch_namespace: None,
            pod_name: None,
            pod_namespace: None,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let max_concurrent_reconciles: usize = parse(&text, "MAX_CONCURRENT_RECONCILES")?
            .unwrap_or(defaults.max_concurrent_reconciles);
        if max_concurrent_reconciles == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_CONCURRENT_RECONCILES",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            max_concurrent_reconciles,
            requeue_delay: parse(&text, "REQUEUE_DELAY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.requeue_delay),
            event_dedup_window: parse(&text, "EVENT_DEDUP_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.event_dedup_window),
            health_port: parse(&text, "HEALTH_PORT")?.unwrap_or(defaults.health_port),
            watch_namespace: text("WATCH_NAMESPACE"),
            pod_name: text("POD_NAME"),
            pod_namespace: text("POD_NAMESPACE"),
        })
    }
}

fn parse<T, F>(text: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    text(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    name,
                    value: value.clone(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}
