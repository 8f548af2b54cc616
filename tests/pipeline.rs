use std::time::Duration;

use serde_json::json;

use tracker::aggregate::{AggregateRecord, ShardedAggregator};
use tracker::event::{decode, DecodeError};
use tracker::filter::HostFilter;

fn activity_payload(entity: &str, host: &str, unix: i64) -> Vec<u8> {
    json!({
        "entity_id": entity,
        "host": host,
        "time": unix,
    })
    .to_string()
    .into_bytes()
}

fn session_end_payload(entity: &str, host: &str, unix: i64) -> Vec<u8> {
    json!({
        "entity_id": entity,
        "host": host,
        "time": unix,
        "kind": "session_end",
    })
    .to_string()
    .into_bytes()
}

/// Drives raw payloads through decode, filter, and aggregation the way the
/// consumer loop does, collecting emitted records and drop counts.
fn run_pipeline(
    filter: &HostFilter,
    aggregator: &mut ShardedAggregator,
    payloads: &[Vec<u8>],
) -> (Vec<AggregateRecord>, usize, usize) {
    let mut records = Vec::new();
    let mut decode_failures = 0;
    let mut filtered = 0;

    for payload in payloads {
        let event = match decode(payload) {
            Ok(event) => event,
            Err(_) => {
                decode_failures += 1;
                continue;
            }
        };

        if !filter.is_internal(&event.host_id) {
            filtered += 1;
            continue;
        }

        if let Some(record) = aggregator.observe(&event) {
            records.push(record);
        }
    }

    (records, decode_failures, filtered)
}

#[test]
fn pipeline_blackbox_correctness() {
    let filter = HostFilter::new(["dennikn.sk", "newsfilter.sk"]);
    let mut aggregator = ShardedAggregator::new(16, 30);

    let payloads = vec![
        // u1 walks into the 30s ceiling: events at 0, 10, 25, 60.
        activity_payload("u1", "dennikn.sk", 1_000),
        activity_payload("u1", "dennikn.sk", 1_010),
        activity_payload("u1", "dennikn.sk", 1_025),
        activity_payload("u1", "dennikn.sk", 1_060),
        // u2 ends explicitly after 15s.
        activity_payload("u2", "newsfilter.sk", 1_000),
        activity_payload("u2", "newsfilter.sk", 1_015),
        session_end_payload("u2", "newsfilter.sk", 1_015),
        // External traffic never reaches the aggregator.
        activity_payload("u3", "crawler.example.com", 1_000),
        activity_payload("u3", "crawler.example.com", 1_500),
        // Malformed input is dropped without disturbing open sessions.
        b"not json at all".to_vec(),
        activity_payload("", "dennikn.sk", 1_000),
        // u1's fresh session after the capped close.
        activity_payload("u1", "dennikn.sk", 1_070),
        session_end_payload("u1", "dennikn.sk", 1_082),
    ];

    let (records, decode_failures, filtered) =
        run_pipeline(&filter, &mut aggregator, &payloads);

    assert_eq!(decode_failures, 2);
    assert_eq!(filtered, 2);
    assert_eq!(records.len(), 3);

    // Ceiling close: total is exactly the limit even though the window spans 60s.
    assert_eq!(records[0].entity_id, "u1");
    assert_eq!(records[0].total, Duration::from_secs(30));
    assert_eq!(records[0].window_start.timestamp(), 1_000);
    assert_eq!(records[0].window_end.timestamp(), 1_060);

    // Explicit close: actual elapsed time.
    assert_eq!(records[1].entity_id, "u2");
    assert_eq!(records[1].total, Duration::from_secs(15));

    // Fresh session after the cap starts from zero.
    assert_eq!(records[2].entity_id, "u1");
    assert_eq!(records[2].total, Duration::from_secs(12));
    assert_eq!(records[2].window_start.timestamp(), 1_070);

    assert_eq!(aggregator.open_sessions(), 0);
}

#[test]
fn pipeline_survives_malformed_bursts() {
    let filter = HostFilter::new(["internal.example"]);
    let mut aggregator = ShardedAggregator::new(4, 0);

    let mut payloads = vec![activity_payload("u1", "internal.example", 0)];
    for _ in 0..50 {
        payloads.push(b"{\"broken\":".to_vec());
    }
    payloads.push(activity_payload("u1", "internal.example", 20));
    payloads.push(session_end_payload("u1", "internal.example", 20));

    let (records, decode_failures, _) = run_pipeline(&filter, &mut aggregator, &payloads);

    assert_eq!(decode_failures, 50);
    assert_eq!(records.len(), 1);
    // Garbage in between must not distort the elapsed-time accounting.
    assert_eq!(records[0].total, Duration::from_secs(20));
}

#[test]
fn pipeline_empty_allow_list_accepts_all_hosts() {
    let filter = HostFilter::new(std::iter::empty::<String>());
    let mut aggregator = ShardedAggregator::new(4, 0);

    let payloads = vec![
        activity_payload("u1", "anything.example", 0),
        session_end_payload("u1", "anything.example", 9),
    ];

    let (records, _, filtered) = run_pipeline(&filter, &mut aggregator, &payloads);

    assert_eq!(filtered, 0);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].total, Duration::from_secs(9));
}

#[test]
fn decode_rejects_are_classified() {
    assert!(matches!(decode(b"{}"), Err(DecodeError::Json(_))));
    assert!(matches!(
        decode(br#"{"entity_id":"u1","host":"h","time":"later"}"#),
        Err(DecodeError::BadTimestamp(_)),
    ));
}
