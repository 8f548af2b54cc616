use std::collections::HashMap;
use std::mem;

use crate::broker::MessagePosition;

/// Ties consumed broker positions to the durability of the records derived
/// from them, so the cursor never advances past a message whose time is not
/// yet persisted.
///
/// Positions move through three pools:
/// - held: the message fed a still-open session. Never committed; a restart
///   replays these messages to rebuild the session.
/// - awaiting write: the session closed, but its record is not durable yet.
/// - ready: committable in principle. Kafka positions additionally wait until
///   no held or awaiting position sits at a lower offset on the same
///   partition, because a Kafka commit advances the whole partition cursor.
///   Pub/Sub acks are per-message and carry no such constraint.
pub(super) struct PositionLedger {
    held: HashMap<String, Vec<MessagePosition>>,
    awaiting_write: Vec<MessagePosition>,
    ready: Vec<MessagePosition>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            held: HashMap::new(),
            awaiting_write: Vec::new(),
            ready: Vec::new(),
        }
    }

    /// The message produced no session activity: decode failure, filtered
    /// host, or a session-end with nothing open.
    pub fn record_bypass(&mut self, position: MessagePosition) {
        self.ready.push(position);
    }

    /// The message fed a session that stays open.
    pub fn record_open(&mut self, entity_id: &str, position: MessagePosition) {
        self.held
            .entry(entity_id.to_string())
            .or_default()
            .push(position);
    }

    /// The entity's session closed. Its held positions, plus the closing
    /// message's own position if any, now wait on the record's write.
    pub fn record_close(&mut self, entity_id: &str, position: Option<MessagePosition>) {
        let mut positions = self.held.remove(entity_id).unwrap_or_default();
        positions.extend(position);
        self.awaiting_write.append(&mut positions);
    }

    /// The pending batch was durably written; everything waiting on it
    /// becomes committable.
    pub fn mark_written(&mut self) {
        self.ready.append(&mut self.awaiting_write);
    }

    /// Drops held positions for entities that no longer have an open
    /// session and produced no record, freeing their partitions. Happens
    /// when an idle sweep evicts a session that accumulated no time.
    pub fn release_stale(&mut self, is_open: impl Fn(&str) -> bool) {
        let stale: Vec<String> = self
            .held
            .keys()
            .filter(|entity| !is_open(entity))
            .cloned()
            .collect();
        for entity in stale {
            if let Some(positions) = self.held.remove(&entity) {
                self.ready.extend(positions);
            }
        }
    }

    /// Drains the positions that are safe to commit right now.
    ///
    /// Kafka positions stay back unless they sit below every held or
    /// still-unwritten offset on their partition; Pub/Sub positions are
    /// always taken. What is not taken remains for a later call.
    pub fn take_committable(&mut self) -> Vec<MessagePosition> {
        let mut floors: HashMap<(&str, i32), i64> = HashMap::new();
        for position in self.held.values().flatten().chain(&self.awaiting_write) {
            if let MessagePosition::Kafka {
                topic,
                partition,
                offset,
            } = position
            {
                let slot = floors.entry((topic.as_str(), *partition)).or_insert(*offset);
                *slot = (*slot).min(*offset);
            }
        }

        let mut committable = Vec::new();
        let mut kept = Vec::new();
        for position in mem::take(&mut self.ready) {
            let clear = match &position {
                MessagePosition::Kafka {
                    topic,
                    partition,
                    offset,
                } => match floors.get(&(topic.as_str(), *partition)) {
                    Some(floor) => offset < floor,
                    None => true,
                },
                MessagePosition::PubSub { .. } => true,
            };
            if clear {
                committable.push(position);
            } else {
                kept.push(position);
            }
        }
        self.ready = kept;

        committable
    }

    /// Re-files positions after a failed commit attempt.
    pub fn restore(&mut self, positions: Vec<MessagePosition>) {
        self.ready.extend(positions);
    }

    /// Positions consumed but not yet committed, across all pools.
    pub fn uncommitted(&self) -> usize {
        self.held.values().map(Vec::len).sum::<usize>()
            + self.awaiting_write.len()
            + self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka(offset: i64) -> MessagePosition {
        kafka_at(0, offset)
    }

    fn kafka_at(partition: i32, offset: i64) -> MessagePosition {
        MessagePosition::Kafka {
            topic: "tracker_events".to_string(),
            partition,
            offset,
        }
    }

    fn pubsub(token: u64) -> MessagePosition {
        MessagePosition::PubSub { token }
    }

    #[test]
    fn test_bypass_commits_when_partition_is_clear() {
        let mut ledger = PositionLedger::new();
        ledger.record_bypass(kafka(3));

        assert_eq!(ledger.take_committable(), vec![kafka(3)]);
        assert_eq!(ledger.uncommitted(), 0);
    }

    #[test]
    fn test_open_session_withholds_its_partition() {
        let mut ledger = PositionLedger::new();
        ledger.record_open("u1", kafka(5));
        // A filtered message at a higher offset must not drag the partition
        // cursor past the open session's events.
        ledger.record_bypass(kafka(6));

        assert!(ledger.take_committable().is_empty());
        assert_eq!(ledger.uncommitted(), 2);

        ledger.record_close("u1", Some(kafka(7)));
        // Closed, but the record is not durable yet.
        assert!(ledger.take_committable().is_empty());

        ledger.mark_written();
        assert_eq!(ledger.take_committable().len(), 3);
        assert_eq!(ledger.uncommitted(), 0);
    }

    #[test]
    fn test_positions_wait_for_the_write() {
        let mut ledger = PositionLedger::new();
        ledger.record_open("u1", kafka(0));
        ledger.record_close("u1", Some(kafka(1)));

        // Write failed (or has not happened): nothing may be committed.
        assert!(ledger.take_committable().is_empty());

        ledger.mark_written();
        assert_eq!(ledger.take_committable().len(), 2);
    }

    #[test]
    fn test_bypass_below_open_session_commits() {
        let mut ledger = PositionLedger::new();
        ledger.record_bypass(kafka(3));
        ledger.record_open("u1", kafka(5));

        // Offset 3 sits below the held floor at 5, so it is safe.
        assert_eq!(ledger.take_committable(), vec![kafka(3)]);
        assert_eq!(ledger.uncommitted(), 1);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut ledger = PositionLedger::new();
        ledger.record_open("u1", kafka_at(0, 5));
        ledger.record_bypass(kafka_at(1, 9));

        assert_eq!(ledger.take_committable(), vec![kafka_at(1, 9)]);
    }

    #[test]
    fn test_pubsub_acks_are_per_message() {
        let mut ledger = PositionLedger::new();
        ledger.record_open("u1", pubsub(1));
        ledger.record_bypass(pubsub(2));

        // No partition cursor: the bypass ack is independent, the held one
        // stays back until its session closes and the record is durable.
        assert_eq!(ledger.take_committable(), vec![pubsub(2)]);

        ledger.record_close("u1", None);
        ledger.mark_written();
        assert_eq!(ledger.take_committable(), vec![pubsub(1)]);
    }

    #[test]
    fn test_restore_after_failed_commit() {
        let mut ledger = PositionLedger::new();
        ledger.record_bypass(kafka(1));

        let taken = ledger.take_committable();
        assert_eq!(taken.len(), 1);
        assert_eq!(ledger.uncommitted(), 0);

        ledger.restore(taken);
        assert_eq!(ledger.take_committable(), vec![kafka(1)]);
    }

    #[test]
    fn test_release_stale_frees_evicted_entities() {
        let mut ledger = PositionLedger::new();
        ledger.record_open("gone", kafka(2));
        ledger.record_open("alive", kafka(4));

        ledger.release_stale(|entity| entity == "alive");

        // "gone" was evicted without a record; its position commits, while
        // "alive" keeps holding the floor at 4.
        assert_eq!(ledger.take_committable(), vec![kafka(2)]);
        assert_eq!(ledger.uncommitted(), 1);
    }
}
