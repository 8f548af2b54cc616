use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::anyhow;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::subscription::Subscription;
use tracing::debug;

use crate::config::Config;

use super::{BrokerError, MessagePosition, RawMessage};

/// Messages requested per pull.
const PULL_BATCH: i32 = 100;

/// Wait between empty pulls so an idle subscription does not spin.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(500);

/// Pub/Sub pull subscriber.
///
/// Exposes the same pull-and-commit surface as the Kafka source: pulled
/// messages are parked in a pending table and acknowledged only when the
/// service commits their positions after a durable write.
pub struct PubSubSource {
    subscription: Subscription,
    queue: VecDeque<RawMessage>,
    pending: HashMap<u64, google_cloud_pubsub::subscriber::ReceivedMessage>,
    next_token: u64,
}

impl PubSubSource {
    /// Authenticates against GCP and binds to the configured subscription.
    pub async fn connect(cfg: &Config) -> Result<Self, BrokerError> {
        let client_config = ClientConfig {
            project_id: Some(cfg.pubsub_project_id.clone()),
            ..Default::default()
        }
        .with_auth()
        .await
        // Credential problems cannot be fixed by retrying.
        .map_err(|e| BrokerError::Fatal(anyhow!(e).context("pubsub authentication")))?;

        let client = Client::new(client_config)
            .await
            .map_err(|e| BrokerError::Transient(anyhow!(e).context("pubsub client")))?;

        let subscription = client.subscription(&cfg.pubsub_subscription_id);

        let exists = subscription
            .exists(None)
            .await
            .map_err(|e| BrokerError::Transient(anyhow!(e).context("checking subscription")))?;
        if !exists {
            return Err(BrokerError::Fatal(anyhow!(
                "pubsub subscription {:?} does not exist in project {:?}",
                cfg.pubsub_subscription_id,
                cfg.pubsub_project_id,
            )));
        }

        debug!(
            project = %cfg.pubsub_project_id,
            subscription = %cfg.pubsub_subscription_id,
            "pubsub subscriber bound",
        );

        Ok(Self {
            subscription,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            next_token: 0,
        })
    }

    /// Pulls the next message, polling the subscription as needed.
    pub async fn next(&mut self) -> Result<RawMessage, BrokerError> {
        loop {
            if let Some(raw) = self.queue.pop_front() {
                return Ok(raw);
            }

            let messages = self
                .subscription
                .pull(PULL_BATCH, None)
                .await
                .map_err(|e| BrokerError::Transient(anyhow!(e).context("pubsub pull")))?;

            if messages.is_empty() {
                tokio::time::sleep(IDLE_POLL_DELAY).await;
                continue;
            }

            for message in messages {
                let token = self.next_token;
                self.next_token += 1;

                self.queue.push_back(RawMessage {
                    payload: message.message.data.clone(),
                    position: MessagePosition::PubSub { token },
                });
                self.pending.insert(token, message);
            }
        }
    }

    /// Acknowledges the pending messages behind the given positions.
    pub async fn commit(&mut self, positions: &[MessagePosition]) -> Result<(), BrokerError> {
        for position in positions {
            let MessagePosition::PubSub { token } = position else {
                return Err(BrokerError::Fatal(anyhow!(
                    "non-pubsub position handed to pubsub subscriber"
                )));
            };

            let Some(message) = self.pending.remove(token) else {
                // Already acknowledged on a previous commit attempt.
                continue;
            };

            if let Err(e) = message.ack().await {
                // Leave the message out of the pending table; an unacked
                // message is simply redelivered after the deadline, which
                // at-least-once delivery already tolerates.
                return Err(BrokerError::Transient(anyhow!(e).context("pubsub ack")));
            }
        }

        Ok(())
    }
}
