use std::collections::HashMap;

use anyhow::anyhow;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::debug;

use crate::config::Config;

use super::{BrokerError, MessagePosition, RawMessage};

/// Kafka pull consumer with manual offset management.
///
/// Auto-commit is disabled: offsets advance only through [`commit`], after
/// the service confirms the derived records are durable.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    /// Creates the consumer and subscribes to the configured topic.
    pub fn connect(cfg: &Config) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", cfg.broker_addrs.join(","))
            .set("group.id", &cfg.kafka_group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(classify)?;

        consumer
            .subscribe(&[cfg.broker_topic.as_str()])
            .map_err(classify)?;

        debug!(
            brokers = %cfg.broker_addrs.join(","),
            topic = %cfg.broker_topic,
            group = %cfg.kafka_group_id,
            "kafka consumer subscribed",
        );

        Ok(Self { consumer })
    }

    /// Pulls the next message from the subscribed topic.
    pub async fn next(&mut self) -> Result<RawMessage, BrokerError> {
        let message = self.consumer.recv().await.map_err(classify)?;

        Ok(RawMessage {
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            position: MessagePosition::Kafka {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }

    /// Commits the high-water mark per partition for the given positions.
    pub fn commit(&mut self, positions: &[MessagePosition]) -> Result<(), BrokerError> {
        let mut high_water: HashMap<(&str, i32), i64> = HashMap::new();
        for position in positions {
            let MessagePosition::Kafka {
                topic,
                partition,
                offset,
            } = position
            else {
                return Err(BrokerError::Fatal(anyhow!(
                    "non-kafka position handed to kafka consumer"
                )));
            };
            let slot = high_water.entry((topic.as_str(), *partition)).or_insert(*offset);
            *slot = (*slot).max(*offset);
        }

        if high_water.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in high_water {
            // Committed offset is the next offset to consume.
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
                .map_err(classify)?;
        }

        self.consumer.commit(&tpl, CommitMode::Async).map_err(classify)
    }
}

/// Splits Kafka errors into transient and fatal per the retry contract.
fn classify(err: KafkaError) -> BrokerError {
    let fatal = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
                | RDKafkaErrorCode::UnknownTopicOrPartition
        )
    ) || matches!(err, KafkaError::ClientConfig(..) | KafkaError::ClientCreation(..));

    if fatal {
        BrokerError::Fatal(anyhow!(err))
    } else {
        BrokerError::Transient(anyhow!(err))
    }
}
