use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read from `FULFILLMENT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub scylla_node: String,
    pub keyspace: String,
    pub metrics_port: u16,
    pub gateway_timeout: Duration,
    pub auto_confirm_days: i64,
    pub drain_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scylla_node: "127.0.0.1:9042".to_string(),
            keyspace: "fulfillment_ks".to_string(),
            metrics_port: 9090,
            gateway_timeout: Duration::from_millis(5000),
            auto_confirm_days: 7,
            drain_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let keyspace = lookup("FULFILLMENT_KEYSPACE").unwrap_or(defaults.keyspace);
        if keyspace.is_empty() || !keyspace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("FULFILLMENT_KEYSPACE must be a plain identifier, got {:?}", keyspace);
        }

        Ok(Self {
            scylla_node: lookup("FULFILLMENT_SCYLLA_NODE").unwrap_or(defaults.scylla_node),
            keyspace,
            metrics_port: parse(&lookup, "FULFILLMENT_METRICS_PORT")?.unwrap_or(defaults.metrics_port),
            gateway_timeout: parse(&lookup, "FULFILLMENT_GATEWAY_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.gateway_timeout),
            auto_confirm_days: parse(&lookup, "FULFILLMENT_AUTO_CONFIRM_DAYS")?.unwrap_or(defaults.auto_confirm_days),
            drain_interval: parse(&lookup, "FULFILLMENT_DRAIN_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_interval),
            sweep_interval: parse(&lookup, "FULFILLMENT_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}
