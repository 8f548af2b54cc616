pub mod kafka;
pub mod pubsub;

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::warn;

use crate::config::{BrokerImpl, Config};

use self::kafka::KafkaSource;
use self::pubsub::PubSubSource;

/// Connection attempts allowed while the service is starting. Once the
/// first connection succeeds, steady-state failures retry indefinitely.
const STARTUP_ATTEMPTS: u32 = 5;

/// Base and ceiling for the reconnect backoff schedule.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Broker failures, split by whether retrying can help.
///
/// Transient failures (connection loss, rebalance, timeout) are retried with
/// backoff; fatal ones (authentication, authorization, bad configuration)
/// terminate the service.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transient broker failure: {0}")]
    Transient(anyhow::Error),

    #[error("fatal broker failure: {0}")]
    Fatal(anyhow::Error),
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Backend-specific position of a consumed message.
///
/// Held by the service until the records derived from the message are
/// durably stored, then handed back via [`Broker::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePosition {
    Kafka {
        topic: String,
        partition: i32,
        offset: i64,
    },
    PubSub {
        /// Handle into the source's pending-ack table; the real ack id
        /// stays inside the backend message it refers to.
        token: u64,
    },
}

/// A raw broker message before decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Vec<u8>,
    pub position: MessagePosition,
}

/// Polymorphic broker consumer.
///
/// Enum dispatch over the backends rather than trait objects, matching the
/// exporter dispatch pattern: the backend is picked once at startup and the
/// service never branches on its identity again.
pub enum Broker {
    Kafka(KafkaSource),
    PubSub(PubSubSource),
}

impl Broker {
    /// Connects to the configured backend, retrying transient failures
    /// with backoff up to the startup budget.
    pub async fn connect(cfg: &Config) -> Result<Self, BrokerError> {
        let mut attempt: u32 = 0;
        loop {
            let result = match cfg.broker_impl {
                BrokerImpl::Kafka => KafkaSource::connect(cfg).map(Self::Kafka),
                BrokerImpl::PubSub => PubSubSource::connect(cfg).await.map(Self::PubSub),
            };

            match result {
                Ok(broker) => return Ok(broker),
                Err(e @ BrokerError::Fatal(_)) => return Err(e),
                Err(BrokerError::Transient(e)) => {
                    attempt += 1;
                    if attempt >= STARTUP_ATTEMPTS {
                        return Err(BrokerError::Fatal(e.context(format!(
                            "broker unreachable after {STARTUP_ATTEMPTS} startup attempts"
                        ))));
                    }
                    let delay = backoff_delay(attempt);
                    warn!(
                        backend = cfg.broker_impl.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker connect failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Returns the backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kafka(_) => "kafka",
            Self::PubSub(_) => "pubsub",
        }
    }

    /// Pulls the next raw message.
    pub async fn next(&mut self) -> Result<RawMessage, BrokerError> {
        match self {
            Self::Kafka(s) => s.next().await,
            Self::PubSub(s) => s.next().await,
        }
    }

    /// Advances the backend cursor for the given positions.
    ///
    /// Called only after the store acknowledged every record derived from
    /// the messages at these positions.
    pub async fn commit(&mut self, positions: &[MessagePosition]) -> Result<(), BrokerError> {
        match self {
            Self::Kafka(s) => s.commit(positions),
            Self::PubSub(s) => s.commit(positions).await,
        }
    }
}

/// Exponential backoff delay for the given attempt number, capped.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_is_bounded() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(2));
        assert_eq!(backoff_delay(7), Duration::from_secs(30));
        assert_eq!(backoff_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_error_classification() {
        assert!(BrokerError::Fatal(anyhow::anyhow!("bad auth")).is_fatal());
        assert!(!BrokerError::Transient(anyhow::anyhow!("timeout")).is_fatal());
    }
}
