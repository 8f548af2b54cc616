use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::event::{Event, EventKind};

/// Per-entity session accumulation state.
///
/// Exists only while a session is open; closing a session evicts the state,
/// so a late event for a closed session starts a fresh one.
#[derive(Debug, Clone)]
struct SessionState {
    accumulated: Duration,
    last_event: DateTime<Utc>,
    window_start: DateTime<Utc>,
}

/// A finished per-entity time-spent window, ready for persistence.
///
/// `(entity_id, window_start)` is the idempotency key: redelivered input
/// regenerates an identical record and the store upserts it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRecord {
    pub entity_id: String,
    pub total: Duration,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// One arena of session state. Every entity maps to exactly one shard,
/// so shards never share or lock state.
#[derive(Debug, Default)]
struct Shard {
    sessions: HashMap<String, SessionState>,
}

/// Accumulates per-entity elapsed time across events of the same session.
///
/// Sessions close on an explicit [`EventKind::SessionEnd`], on reaching the
/// configured ceiling, or (when enabled) after the idle timeout. The caller
/// must feed events for one entity in arrival order; out-of-order timestamps
/// are tolerated but contribute zero elapsed time.
pub struct ShardedAggregator {
    shards: Vec<Shard>,
    /// Ceiling on accumulated time. `None` disables the cap.
    limit: Option<Duration>,
}

impl ShardedAggregator {
    /// Creates an aggregator with `shard_count` arenas.
    ///
    /// `limit_secs` of 0 disables the ceiling, matching the optional
    /// `TIMESPENT_LIMIT` setting.
    pub fn new(shard_count: usize, limit_secs: u64) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, Shard::default);

        Self {
            shards,
            limit: (limit_secs > 0).then(|| Duration::from_secs(limit_secs)),
        }
    }

    /// Feeds one accepted event into its entity's session.
    ///
    /// Returns an [`AggregateRecord`] when this event closes the session,
    /// either by explicit end or by reaching the ceiling.
    pub fn observe(&mut self, event: &Event) -> Option<AggregateRecord> {
        let limit = self.limit;
        let shard = self.shard_for(&event.entity_id);

        let Some(state) = shard.sessions.get_mut(&event.entity_id) else {
            // A session-end without an open session carries no time; opening
            // a zero-duration window for it would only produce noise rows.
            if event.kind == EventKind::SessionEnd {
                return None;
            }

            shard.sessions.insert(
                event.entity_id.clone(),
                SessionState {
                    accumulated: Duration::ZERO,
                    last_event: event.time,
                    window_start: event.time,
                },
            );
            return None;
        };

        // Clock skew and duplicate delivery can move timestamps backwards;
        // those events contribute zero elapsed time instead of a negative delta.
        if event.time > state.last_event {
            let delta = (event.time - state.last_event)
                .to_std()
                .unwrap_or(Duration::ZERO);
            state.accumulated += delta;
            state.last_event = event.time;
        }

        let closes = event.kind == EventKind::SessionEnd
            || limit.is_some_and(|limit| state.accumulated >= limit);
        if !closes {
            return None;
        }

        let total = match limit {
            // The ceiling binds both closure paths: the window may span
            // longer, the billed time may not.
            Some(limit) => state.accumulated.min(limit),
            None => state.accumulated,
        };
        let record = AggregateRecord {
            entity_id: event.entity_id.clone(),
            total,
            window_start: state.window_start,
            window_end: state.last_event,
        };
        shard.sessions.remove(&event.entity_id);

        Some(record)
    }

    /// Closes every session whose last event is older than `idle_timeout`
    /// and returns their records.
    pub fn close_idle(&mut self, now: DateTime<Utc>, idle_timeout: Duration) -> Vec<AggregateRecord> {
        let Ok(idle_timeout) = chrono::Duration::from_std(idle_timeout) else {
            return Vec::new();
        };
        let cutoff = now - idle_timeout;

        let mut closed = Vec::new();
        for shard in &mut self.shards {
            shard.sessions.retain(|entity_id, state| {
                if state.last_event > cutoff {
                    return true;
                }
                // Single-event sessions accumulated nothing; evict them
                // without producing a zero-duration row.
                if !state.accumulated.is_zero() {
                    closed.push(AggregateRecord {
                        entity_id: entity_id.clone(),
                        total: state.accumulated,
                        window_start: state.window_start,
                        window_end: state.last_event,
                    });
                }
                false
            });
        }
        closed
    }

    /// Number of currently open sessions across all shards.
    pub fn open_sessions(&self) -> usize {
        self.shards.iter().map(|s| s.sessions.len()).sum()
    }

    /// Whether the entity currently has an open session.
    pub fn has_session(&self, entity_id: &str) -> bool {
        self.shards[self.shard_index(entity_id)]
            .sessions
            .contains_key(entity_id)
    }

    fn shard_index(&self, entity_id: &str) -> usize {
        (fnv1a(entity_id.as_bytes()) % self.shards.len() as u64) as usize
    }

    fn shard_for(&mut self, entity_id: &str) -> &mut Shard {
        let idx = self.shard_index(entity_id);
        &mut self.shards[idx]
    }
}

/// Stable 64-bit FNV-1a. Entity-to-shard routing must not depend on the
/// process-random std hasher so tests and restarts shard identically.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(entity: &str, unix: i64) -> Event {
        Event {
            entity_id: entity.to_string(),
            host_id: "h".to_string(),
            time: DateTime::from_timestamp(unix, 0).expect("valid timestamp"),
            kind: EventKind::Activity,
            payload: serde_json::Value::Null,
        }
    }

    fn session_end(entity: &str, unix: i64) -> Event {
        Event {
            kind: EventKind::SessionEnd,
            ..activity(entity, unix)
        }
    }

    #[test]
    fn test_first_event_opens_with_zero_accumulation() {
        let mut agg = ShardedAggregator::new(4, 0);
        assert_eq!(agg.observe(&activity("u1", 100)), None);
        assert_eq!(agg.open_sessions(), 1);
    }

    #[test]
    fn test_accumulates_consecutive_deltas() {
        let mut agg = ShardedAggregator::new(4, 0);
        agg.observe(&activity("u1", 0));
        agg.observe(&activity("u1", 10));
        agg.observe(&activity("u1", 25));

        let record = agg.observe(&session_end("u1", 40)).expect("closes");
        assert_eq!(record.total, Duration::from_secs(40));
        assert_eq!(record.window_start.timestamp(), 0);
        assert_eq!(record.window_end.timestamp(), 40);
        assert_eq!(agg.open_sessions(), 0);
    }

    #[test]
    fn test_out_of_order_timestamp_contributes_zero() {
        let mut agg = ShardedAggregator::new(4, 0);
        agg.observe(&activity("u1", 100));
        agg.observe(&activity("u1", 50));
        agg.observe(&activity("u1", 110));

        let record = agg.observe(&session_end("u1", 110)).expect("closes");
        // 100 -> 50 adds nothing, 100 -> 110 adds 10.
        assert_eq!(record.total, Duration::from_secs(10));
        assert_eq!(record.window_end.timestamp(), 110);
    }

    #[test]
    fn test_limit_caps_emitted_total() {
        // Events at t=0,10,25,60 with a 30s ceiling.
        let mut agg = ShardedAggregator::new(4, 30);
        assert_eq!(agg.observe(&activity("u1", 0)), None);
        assert_eq!(agg.observe(&activity("u1", 10)), None);
        assert_eq!(agg.observe(&activity("u1", 25)), None);

        let record = agg.observe(&activity("u1", 60)).expect("limit reached");
        assert_eq!(record.total, Duration::from_secs(30));
        assert_eq!(record.window_start.timestamp(), 0);
        assert_eq!(agg.open_sessions(), 0);

        // A further event starts a fresh session from zero.
        assert_eq!(agg.observe(&activity("u1", 70)), None);
        let record = agg.observe(&session_end("u1", 75)).expect("closes");
        assert_eq!(record.total, Duration::from_secs(5));
        assert_eq!(record.window_start.timestamp(), 70);
    }

    #[test]
    fn test_limit_exact_boundary_closes() {
        let mut agg = ShardedAggregator::new(4, 30);
        agg.observe(&activity("u1", 0));
        let record = agg.observe(&activity("u1", 30)).expect("closes at limit");
        assert_eq!(record.total, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_limit_never_caps() {
        let mut agg = ShardedAggregator::new(4, 0);
        agg.observe(&activity("u1", 0));
        assert_eq!(agg.observe(&activity("u1", 1_000_000)), None);
        assert_eq!(agg.open_sessions(), 1);
    }

    #[test]
    fn test_session_end_without_open_session_is_noop() {
        let mut agg = ShardedAggregator::new(4, 0);
        assert_eq!(agg.observe(&session_end("ghost", 10)), None);
        assert_eq!(agg.open_sessions(), 0);
    }

    #[test]
    fn test_close_idle_sweeps_stale_sessions() {
        let mut agg = ShardedAggregator::new(4, 0);
        agg.observe(&activity("old", 0));
        agg.observe(&activity("old", 20));
        agg.observe(&activity("fresh", 95));

        let now = DateTime::from_timestamp(100, 0).expect("valid timestamp");
        let mut closed = agg.close_idle(now, Duration::from_secs(60));

        assert_eq!(closed.len(), 1);
        let record = closed.pop().expect("one record");
        assert_eq!(record.entity_id, "old");
        assert_eq!(record.total, Duration::from_secs(20));
        assert_eq!(record.window_end.timestamp(), 20);
        assert_eq!(agg.open_sessions(), 1);
    }

    #[test]
    fn test_close_idle_skips_zero_accumulation_sessions() {
        let mut agg = ShardedAggregator::new(4, 0);
        agg.observe(&activity("one_shot", 0));
        agg.observe(&activity("busy", 0));
        agg.observe(&activity("busy", 30));

        let now = DateTime::from_timestamp(200, 0).expect("valid timestamp");
        let closed = agg.close_idle(now, Duration::from_secs(60));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].entity_id, "busy");
        assert_eq!(closed[0].total, Duration::from_secs(30));

        // The zero-duration session is still evicted, just not reported.
        assert!(!agg.has_session("one_shot"));
        assert_eq!(agg.open_sessions(), 0);
    }

    #[test]
    fn test_entities_are_independent() {
        let mut agg = ShardedAggregator::new(2, 0);
        for entity in ["a", "b", "c", "d", "e"] {
            agg.observe(&activity(entity, 0));
            agg.observe(&activity(entity, 5));
        }
        assert_eq!(agg.open_sessions(), 5);

        let record = agg.observe(&session_end("c", 7)).expect("closes c");
        assert_eq!(record.total, Duration::from_secs(7));
        assert_eq!(agg.open_sessions(), 4);
    }

    #[test]
    fn test_shard_routing_is_stable() {
        // Same entity must land in the same shard across instances.
        assert_eq!(fnv1a(b"u1"), fnv1a(b"u1"));
        assert_ne!(fnv1a(b"u1"), fnv1a(b"u2"));
    }
}
