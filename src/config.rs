use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Top-level configuration for the tracker service.
///
/// Populated from environment variables matching the deployment surface
/// (`ADDR`, `BROKER_ADDRS`, `MYSQL_*`, ...). All parsing happens in
/// [`Config::from_env`]; cross-field rules live in [`Config::validate`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the health/metrics HTTP server. Required.
    pub addr: String,

    /// Broker endpoints. Required, comma-separated in `BROKER_ADDRS`.
    pub broker_addrs: Vec<String>,

    /// Which broker backend to consume from. Default: kafka.
    pub broker_impl: BrokerImpl,

    /// Topic carrying tracked events. Default: "tracker_events".
    pub broker_topic: String,

    /// Kafka consumer group id. Default: "tracker".
    pub kafka_group_id: String,

    /// Relational store connection settings. All required.
    pub mysql: MysqlConfig,

    /// Internal-host allow-list. Empty means no host filtering.
    pub internal_hosts: Vec<String>,

    /// Per-session accumulated time ceiling in seconds. 0 disables the cap.
    pub timespent_limit: u64,

    /// Close sessions idle for this many seconds. 0 means never.
    pub session_idle_timeout: u64,

    /// Flush the write batch once it reaches this many records. Default: 256.
    pub flush_batch_size: usize,

    /// Maximum time between write-batch flushes. Default: 1s.
    pub flush_interval: Duration,

    /// Number of aggregation state shards. Default: 16.
    pub aggregation_shards: usize,

    /// GCP project, required when `broker_impl` is pubsub.
    pub pubsub_project_id: String,

    /// Pub/Sub topic, required when `broker_impl` is pubsub.
    pub pubsub_topic_id: String,

    /// Pub/Sub subscription. Defaults to "<topic>-tracker".
    pub pubsub_subscription_id: String,

    /// Verbose diagnostics toggle.
    pub debug: bool,
}

/// Relational store connection settings.
#[derive(Debug, Clone, Default)]
pub struct MysqlConfig {
    /// Transport: "tcp" or "unix".
    pub net: String,
    /// "host:port" for tcp, socket path for unix.
    pub addr: String,
    pub user: String,
    pub passwd: String,
    pub dbname: String,
}

/// Broker backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerImpl {
    Kafka,
    PubSub,
}

impl BrokerImpl {
    /// Returns the canonical configuration/log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::PubSub => "pubsub",
        }
    }

    /// Convert from the configuration label.
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "kafka" => Some(Self::Kafka),
            "pubsub" => Some(Self::PubSub),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Config {
    /// Reads configuration from the process environment and validates it.
    pub fn from_env() -> Result<Self> {
        let broker_impl_raw = env_or("BROKER_IMPL", "kafka");
        let broker_impl = BrokerImpl::from_str(&broker_impl_raw)
            .with_context(|| format!("unknown BROKER_IMPL: {broker_impl_raw:?}"))?;

        let pubsub_topic_id = env_or("PUBSUB_TOPIC_ID", "");
        let pubsub_subscription_id = match env::var("PUBSUB_SUBSCRIPTION_ID") {
            Ok(v) => v,
            Err(_) => default_subscription_id(&pubsub_topic_id),
        };

        let debug_raw = env_or("DEBUG", "");

        let cfg = Self {
            addr: env_required("ADDR")?,
            broker_addrs: split_list(&env_required("BROKER_ADDRS")?),
            broker_impl,
            broker_topic: env_or("BROKER_TOPIC", "tracker_events"),
            kafka_group_id: env_or("KAFKA_GROUP_ID", "tracker"),
            mysql: MysqlConfig {
                net: env_required("MYSQL_NET")?,
                addr: env_required("MYSQL_ADDR")?,
                user: env_required("MYSQL_USER")?,
                passwd: env_required("MYSQL_PASSWD")?,
                dbname: env_required("MYSQL_DBNAME")?,
            },
            internal_hosts: split_list(&env_or("INTERNAL_HOSTS", "")),
            timespent_limit: env_parse("TIMESPENT_LIMIT", 0)?,
            session_idle_timeout: env_parse("SESSION_IDLE_TIMEOUT", 0)?,
            flush_batch_size: env_parse("FLUSH_BATCH_SIZE", default_flush_batch_size())?,
            flush_interval: Duration::from_secs(env_parse("FLUSH_INTERVAL", 1)?),
            aggregation_shards: env_parse("AGGREGATION_SHARDS", default_aggregation_shards())?,
            pubsub_project_id: env_or("PUBSUB_PROJECT_ID", ""),
            pubsub_topic_id,
            pubsub_subscription_id,
            debug: debug_raw == "true" || debug_raw == "1",
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field rules. A violation is fatal: the service refuses
    /// to start on bad configuration rather than limping along.
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            bail!("ADDR is required");
        }

        if self.broker_addrs.is_empty() {
            bail!("BROKER_ADDRS is required");
        }

        if self.broker_topic.is_empty() {
            bail!("BROKER_TOPIC must not be empty");
        }

        match self.mysql.net.as_str() {
            "tcp" | "unix" => {}
            other => bail!("MYSQL_NET must be tcp or unix, got {other:?}"),
        }

        for (key, value) in [
            ("MYSQL_ADDR", &self.mysql.addr),
            ("MYSQL_USER", &self.mysql.user),
            ("MYSQL_DBNAME", &self.mysql.dbname),
        ] {
            if value.is_empty() {
                bail!("{key} is required");
            }
        }

        if self.broker_impl == BrokerImpl::PubSub {
            if self.pubsub_project_id.is_empty() {
                bail!("PUBSUB_PROJECT_ID is required when BROKER_IMPL=pubsub");
            }
            if self.pubsub_topic_id.is_empty() {
                bail!("PUBSUB_TOPIC_ID is required when BROKER_IMPL=pubsub");
            }
        }

        if self.flush_batch_size == 0 {
            bail!("FLUSH_BATCH_SIZE must be positive");
        }

        if self.flush_interval.is_zero() {
            bail!("FLUSH_INTERVAL must be positive");
        }

        if self.aggregation_shards == 0 {
            bail!("AGGREGATION_SHARDS must be positive");
        }

        Ok(())
    }
}

fn env_required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("{key} is required"),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().with_context(|| format!("parsing {key}={v:?}")),
        _ => Ok(default),
    }
}

/// Splits a comma-separated list, dropping empty segments.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// --- Default value functions ---

fn default_flush_batch_size() -> usize {
    256
}

fn default_aggregation_shards() -> usize {
    16
}

fn default_subscription_id(topic_id: &str) -> String {
    if topic_id.is_empty() {
        String::new()
    } else {
        format!("{topic_id}-tracker")
    }
}
