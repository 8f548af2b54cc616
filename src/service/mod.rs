mod ledger;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::ShardedAggregator;
use crate::broker::{backoff_delay, Broker, BrokerError, MessagePosition, RawMessage};
use crate::config::Config;
use crate::event::{self, EventKind};
use crate::filter::HostFilter;
use crate::health::HealthMetrics;
use crate::store::MysqlWriter;

use self::ledger::PositionLedger;

/// Write attempts per batch before the flush is reported failed and
/// left pending (offsets withheld, retried on the next tick).
const MAX_WRITE_ATTEMPTS: u32 = 4;

/// Pending records beyond this multiple of the batch size throttle
/// broker pulls until a flush drains the backlog.
const BACKPRESSURE_FACTOR: usize = 4;

/// Cadence of the idle-session sweep when an idle timeout is configured.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum spacing between decode-failure log lines; failures in between
/// are counted and reported in the next line instead of logged one by one.
const DECODE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence of the throughput progress line.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

/// TrackerService supervises the pipeline:
/// broker -> decode -> filter -> aggregate -> store, committing broker
/// positions only after the derived records are durably written.
pub struct TrackerService {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    /// Cancelled by the run task when the pipeline exits on its own,
    /// so the caller can react to fatal errors without polling.
    finished: CancellationToken,
    run_task: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl TrackerService {
    /// Creates a new service, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new(&cfg.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            run_task: None,
        })
    }

    /// Starts all components and begins consuming.
    pub async fn start(&mut self) -> Result<()> {
        // Health server first so probes respond during broker/store connect.
        self.health.start().await.context("starting health server")?;

        let mut writer = MysqlWriter::new(self.cfg.mysql.clone());
        writer.start().await.context("starting MySQL writer")?;

        let broker = Broker::connect(&self.cfg)
            .await
            .map_err(|e| anyhow!(e).context("connecting to broker"))?;

        let filter = HostFilter::new(self.cfg.internal_hosts.iter().cloned());
        if filter.is_empty() {
            info!("internal host filtering disabled (no allow-list configured)");
        }

        info!(
            backend = broker.name(),
            topic = %self.cfg.broker_topic,
            internal_hosts = filter.len(),
            timespent_limit = self.cfg.timespent_limit,
            "tracker pipeline starting",
        );

        let pipeline = Pipeline {
            cfg: self.cfg.clone(),
            health: Arc::clone(&self.health),
            broker,
            writer,
            filter,
            aggregator: ShardedAggregator::new(
                self.cfg.aggregation_shards,
                self.cfg.timespent_limit,
            ),
            pending_records: Vec::new(),
            ledger: PositionLedger::new(),
            broker_retry_attempt: 0,
            decode_drops_since_log: 0,
            last_decode_log: Instant::now()
                .checked_sub(DECODE_LOG_INTERVAL)
                .unwrap_or_else(Instant::now),
            last_reported_received: 0,
        };

        let cancel = self.cancel.child_token();
        let finished = self.finished.clone();
        self.run_task = Some(tokio::spawn(async move {
            let result = pipeline.run(cancel).await;
            if let Err(e) = &result {
                error!(error = %e, "pipeline terminated");
            }
            finished.cancel();
            result
        }));

        Ok(())
    }

    /// Completes when the pipeline exits on its own (fatal error).
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Gracefully stops the service: no new pulls, one final flush of
    /// already-closed aggregates, then teardown.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        let result = match self.run_task.take() {
            Some(task) => task.await.context("joining pipeline task")?,
            None => Ok(()),
        };

        self.health.stop().await?;

        info!("tracker stopped");

        result
    }
}

/// The consumer loop state. Owned by a single task: per-entity ordering is
/// preserved by construction and the aggregator shards need no locking.
struct Pipeline {
    cfg: Config,
    health: Arc<HealthMetrics>,
    broker: Broker,
    writer: MysqlWriter,
    filter: HostFilter,
    aggregator: ShardedAggregator,

    /// Records closed but not yet durably written.
    pending_records: Vec<crate::aggregate::AggregateRecord>,
    /// Consumed positions, staged against record durability.
    ledger: PositionLedger,

    broker_retry_attempt: u32,
    decode_drops_since_log: u64,
    last_decode_log: Instant,

    /// Snapshot of the received counter at the last progress line.
    last_reported_received: u64,
}

impl Pipeline {
    async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut flush_ticker = tokio::time::interval(self.cfg.flush_interval);
        flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut idle_ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut progress_ticker = tokio::time::interval(PROGRESS_INTERVAL);
        progress_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Backpressure: while the store is behind, stop pulling instead
            // of buffering without bound.
            let throttled =
                self.pending_records.len() >= self.cfg.flush_batch_size * BACKPRESSURE_FACTOR;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = flush_ticker.tick() => {
                    self.flush().await?;
                }
                _ = idle_ticker.tick() => {
                    self.sweep_idle();
                }
                _ = progress_ticker.tick() => {
                    self.report_progress();
                }
                msg = self.broker.next(), if !throttled => {
                    self.handle_message(msg).await?;
                }
            }
        }

        self.shutdown().await
    }

    /// Processes one pull result from the broker.
    async fn handle_message(&mut self, msg: Result<RawMessage, BrokerError>) -> Result<()> {
        let raw = match msg {
            Ok(raw) => raw,
            Err(BrokerError::Fatal(e)) => {
                return Err(e.context("broker failure"));
            }
            Err(BrokerError::Transient(e)) => {
                self.broker_retry_attempt += 1;
                self.health.broker_reconnects.inc();
                let delay = backoff_delay(self.broker_retry_attempt);
                warn!(
                    backend = self.broker.name(),
                    attempt = self.broker_retry_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient broker failure, backing off",
                );
                // Steady-state transient failures retry indefinitely; only
                // the delay is bounded.
                tokio::time::sleep(delay).await;
                return Ok(());
            }
        };

        self.broker_retry_attempt = 0;
        self.health.events_received.inc();

        let event = match event::decode(&raw.payload) {
            Ok(event) => event,
            Err(e) => {
                // Dropped, never retried: re-decoding malformed input cannot
                // succeed, so the position is free to commit once its
                // partition is clear.
                self.health.decode_failures.inc();
                self.log_decode_failure(&e, &raw.position);
                self.ledger.record_bypass(raw.position);
                return Ok(());
            }
        };

        if !self.filter.is_internal(&event.host_id) {
            self.health.events_filtered.inc();
            self.ledger.record_bypass(raw.position);
            return Ok(());
        }

        match self.aggregator.observe(&event) {
            Some(record) => {
                let closed_by = if event.kind == EventKind::SessionEnd {
                    "session_end"
                } else {
                    "limit"
                };
                debug!(
                    entity = %record.entity_id,
                    total_secs = record.total.as_secs(),
                    closed_by,
                    "session closed",
                );
                self.health.records_emitted.inc();
                self.ledger.record_close(&record.entity_id, Some(raw.position));
                self.pending_records.push(record);
            }
            // A session-end with nothing open produced no state to replay.
            None if event.kind == EventKind::SessionEnd => {
                self.ledger.record_bypass(raw.position);
            }
            // The session stays open: its record is not durable yet, so the
            // message must survive a restart and be redelivered.
            None => {
                self.ledger.record_open(&event.entity_id, raw.position);
            }
        }

        self.health
            .open_sessions
            .set(self.aggregator.open_sessions() as f64);

        if self.pending_records.len() >= self.cfg.flush_batch_size {
            self.flush().await?;
        }

        Ok(())
    }

    /// Writes pending records and, on success, commits the positions the
    /// ledger deems safe.
    ///
    /// A transiently failing batch stays pending with its positions
    /// withheld; redelivery plus the store's upsert key keeps the result
    /// correct. Positions held by open sessions are never committed here.
    /// Fatal store errors terminate the pipeline.
    async fn flush(&mut self) -> Result<()> {
        let mut attempt: u32 = 0;
        while !self.pending_records.is_empty() {
            match self.writer.write_batch(&self.pending_records).await {
                Ok(()) => {
                    self.health.batches_written.inc();
                    debug!(records = self.pending_records.len(), "batch written");
                    self.pending_records.clear();
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    self.health.batch_errors.inc();
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        warn!(
                            records = self.pending_records.len(),
                            attempts = attempt,
                            error = %e,
                            "batch write failed, offsets withheld until retry",
                        );
                        return Ok(());
                    }
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "batch write failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(anyhow!(e).context("writing aggregate batch"));
                }
            }
        }

        self.ledger.mark_written();

        let committable = self.ledger.take_committable();
        if committable.is_empty() {
            return Ok(());
        }

        match self.broker.commit(&committable).await {
            Ok(()) => {
                self.health
                    .offsets_committed
                    .inc_by(committable.len() as f64);
            }
            Err(BrokerError::Fatal(e)) => return Err(e.context("committing positions")),
            Err(BrokerError::Transient(e)) => {
                // Safe to defer: recommitting already-written records is
                // absorbed by the upsert key.
                warn!(error = %e, "position commit failed, will retry");
                self.ledger.restore(committable);
            }
        }

        Ok(())
    }

    /// Closes sessions idle past the configured timeout, if any.
    fn sweep_idle(&mut self) {
        if self.cfg.session_idle_timeout == 0 {
            return;
        }

        let timeout = Duration::from_secs(self.cfg.session_idle_timeout);
        let closed = self.aggregator.close_idle(Utc::now(), timeout);
        if closed.is_empty() {
            return;
        }

        info!(sessions = closed.len(), "closed idle sessions");
        self.health.records_emitted.inc_by(closed.len() as f64);
        for record in &closed {
            self.ledger.record_close(&record.entity_id, None);
        }
        self.pending_records.extend(closed);

        // Sessions evicted with zero accumulation produce no record; free
        // their held positions so the partition cursor can move again.
        let aggregator = &self.aggregator;
        self.ledger
            .release_stale(|entity| aggregator.has_session(entity));

        self.health
            .open_sessions
            .set(self.aggregator.open_sessions() as f64);
    }

    /// One throughput line per interval instead of per-message logging.
    fn report_progress(&mut self) {
        let received = self.health.events_received.get() as u64;
        let window = received.saturating_sub(self.last_reported_received);
        self.last_reported_received = received;

        info!(
            events = window,
            decode_failures = self.health.decode_failures.get() as u64,
            filtered = self.health.events_filtered.get() as u64,
            open_sessions = self.aggregator.open_sessions(),
            pending_records = self.pending_records.len(),
            uncommitted_positions = self.ledger.uncommitted(),
            "progress",
        );
    }

    /// Rate-limited decode failure logging: one line per interval carrying
    /// the count of failures suppressed since the previous line.
    fn log_decode_failure(&mut self, err: &event::DecodeError, position: &MessagePosition) {
        if self.last_decode_log.elapsed() >= DECODE_LOG_INTERVAL {
            warn!(
                error = %err,
                position = ?position,
                suppressed = self.decode_drops_since_log,
                "dropping undecodable message",
            );
            self.decode_drops_since_log = 0;
            self.last_decode_log = Instant::now();
        } else {
            self.decode_drops_since_log += 1;
        }
    }

    /// Final flush on shutdown. Open sessions stay open: truncating
    /// in-progress sessions would understate their time, and redelivery
    /// after restart rebuilds them.
    async fn shutdown(mut self) -> Result<()> {
        let open = self.aggregator.open_sessions();

        self.flush().await?;

        if !self.pending_records.is_empty() {
            warn!(
                records = self.pending_records.len(),
                "unwritten records at shutdown, will be rebuilt from redelivery",
            );
        }
        if open > 0 {
            // Their positions were never committed, so the broker redelivers
            // every message that fed them.
            info!(
                sessions = open,
                withheld_positions = self.ledger.uncommitted(),
                "open sessions left for redelivery after restart",
            );
        }

        self.writer.stop().await?;

        Ok(())
    }
}
