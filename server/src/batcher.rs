//! Per-identity coalescing of event-driven score updates.
//!
//! Updates pushed outside the tick (e.g. a statistic-changed callback) are
//! queued per identity and flushed once the queue reaches the batch size or
//! its oldest update reaches the batch timeout. A flush is gated twice:
//!
//! - one scoreboard-class unit for the flush as a whole; a denial drains
//!   nothing,
//! - one general-class unit per update, in FIFO order; the first denial stops
//!   the drain and everything after it stays queued.
//!
//! Only the sent prefix leaves the queue, so throttling delays updates but
//! never drops them.

use crate::clock::Clock;
use crate::config::BatchConfig;
use crate::error::{Rejection, SyncError};
use crate::host::{LivenessOracle, Transport};
use crate::rate_limiter::{RateLimiter, TrafficClass};
use dashmap::DashMap;
use log::{debug, error};
use shared::{Identity, ScoreUpdate};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct QueuedUpdate {
    update: ScoreUpdate,
    enqueued_at: u64,
}

/// Pending updates for one identity, oldest first.
#[derive(Debug, Default)]
pub struct PendingBatch {
    events: VecDeque<QueuedUpdate>,
}

impl PendingBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn oldest_age(&self, now: u64) -> Option<u64> {
        self.events
            .front()
            .map(|queued| now.saturating_sub(queued.enqueued_at))
    }

    fn is_timed_out(&self, now: u64, config: &BatchConfig) -> bool {
        self.oldest_age(now)
            .is_some_and(|age| age >= config.batch_timeout_ms)
    }

    fn is_due(&self, now: u64, config: &BatchConfig) -> bool {
        self.len() >= config.max_batch_size || self.is_timed_out(now, config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Updates handed to the transport, in send order.
    pub sent: Vec<ScoreUpdate>,
    /// Updates still queued afterwards.
    pub remaining: usize,
    /// True when the whole flush was refused by the scoreboard gate.
    pub gated: bool,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub flushed: Vec<(Identity, FlushOutcome)>,
    pub failures: Vec<(Identity, SyncError)>,
    /// Identities whose queues were dropped because they disconnected.
    pub reaped: usize,
}

pub struct UpdateBatcher {
    config: BatchConfig,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    pending: DashMap<Identity, PendingBatch>,
}

impl UpdateBatcher {
    pub fn new(
        config: BatchConfig,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            limiter,
            transport,
            clock,
            pending: DashMap::new(),
        }
    }

    /// Queues `update` and flushes straight away if the queue became due.
    /// Returns the flush outcome when a flush was attempted.
    pub fn enqueue(
        &self,
        identity: Identity,
        update: ScoreUpdate,
    ) -> Result<Option<FlushOutcome>, SyncError> {
        let now = self.clock.now_ms();
        {
            let mut batch = self.pending.entry(identity).or_default();
            if batch.len() >= self.config.max_pending {
                return Err(Rejection::QueueFull {
                    identity,
                    limit: self.config.max_pending,
                }
                .into());
            }
            batch.events.push_back(QueuedUpdate {
                update,
                enqueued_at: now,
            });
            if !batch.is_due(now, &self.config) {
                return Ok(None);
            }
        }
        self.flush(identity).map(Some)
    }

    /// Sends as much of the identity's queue as the limiter allows.
    ///
    /// On a transport failure the failing update is dropped (the transport
    /// owns retries), the sent prefix is gone from the queue, and the error is
    /// returned.
    pub fn flush(&self, identity: Identity) -> Result<FlushOutcome, SyncError> {
        let Some(mut batch) = self.pending.get_mut(&identity) else {
            return Ok(FlushOutcome::default());
        };
        if batch.is_empty() {
            return Ok(FlushOutcome::default());
        }

        if !self.limiter.try_consume(identity, TrafficClass::Scoreboard) {
            debug!(
                "Cannot flush batch for {} due to rate limit ({} queued)",
                identity,
                batch.len()
            );
            return Ok(FlushOutcome {
                sent: Vec::new(),
                remaining: batch.len(),
                gated: true,
            });
        }

        let mut sent = Vec::new();
        while !batch.is_empty() {
            if !self.limiter.try_consume(identity, TrafficClass::General) {
                break;
            }
            let Some(queued) = batch.events.pop_front() else {
                break;
            };
            if let Err(e) = self.transport.send(identity, &queued.update) {
                error!("Failed to send batched update to {}: {}", identity, e);
                return Err(e);
            }
            sent.push(queued.update);
        }

        debug!(
            "Flushed batch for {}: {} updates sent, {} still queued",
            identity,
            sent.len(),
            batch.len()
        );
        Ok(FlushOutcome {
            sent,
            remaining: batch.len(),
            gated: false,
        })
    }

    /// Flushes every timed-out queue of a connected identity and drops the
    /// queues of identities that are gone. Called once per tick.
    pub fn periodic_sweep(&self, liveness: &dyn LivenessOracle) -> SweepReport {
        let now = self.clock.now_ms();
        let mut due = Vec::new();
        let mut stale = Vec::new();

        // Collect first: flushing re-locks the map.
        for entry in self.pending.iter() {
            let identity = *entry.key();
            if !liveness.is_connected(identity) {
                stale.push(identity);
            } else if entry.value().is_timed_out(now, &self.config) {
                due.push(identity);
            }
        }

        let mut report = SweepReport::default();
        for identity in stale {
            if self.pending.remove(&identity).is_some() {
                report.reaped += 1;
            }
        }
        for identity in due {
            match self.flush(identity) {
                Ok(outcome) => report.flushed.push((identity, outcome)),
                Err(e) => report.failures.push((identity, e)),
            }
        }
        report
    }

    pub fn pending_len(&self, identity: Identity) -> usize {
        self.pending
            .get(&identity)
            .map(|batch| batch.len())
            .unwrap_or(0)
    }

    pub fn clear_identity(&self, identity: Identity) {
        self.pending.remove(&identity);
    }

    pub fn tracks(&self, identity: Identity) -> bool {
        self.pending.contains_key(&identity)
    }

    pub fn tracked_identities(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{LimiterConfig, LoadConfig};
    use crate::host::test_support::RecordingTransport;
    use crate::load_monitor::LoadMonitor;
    use std::sync::atomic::Ordering;

    const ALICE: Identity = Identity(1);
    const BOB: Identity = Identity(2);

    struct Fixture {
        clock: Arc<ManualClock>,
        limiter: Arc<RateLimiter>,
        transport: Arc<RecordingTransport>,
        batcher: UpdateBatcher,
    }

    fn fixture(limiter_config: LimiterConfig, batch_config: BatchConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(50_000));
        let load_config = LoadConfig {
            baseline_units_per_sec: 1_000_000,
            ..LoadConfig::default()
        };
        let load = Arc::new(LoadMonitor::new(load_config, clock.clone()));
        let limiter = Arc::new(RateLimiter::new(limiter_config, load, clock.clone()));
        let transport = Arc::new(RecordingTransport::default());
        let batcher = UpdateBatcher::new(
            batch_config,
            limiter.clone(),
            transport.clone(),
            clock.clone(),
        );
        Fixture {
            clock,
            limiter,
            transport,
            batcher,
        }
    }

    fn generous() -> LimiterConfig {
        LimiterConfig {
            general_baseline: 1_000,
            scoreboard_baseline: 1_000,
            ..LimiterConfig::default()
        }
    }

    fn update(i: usize) -> ScoreUpdate {
        ScoreUpdate::change("kills", &format!("player{}", i), i as i32)
    }

    fn always_connected(_: Identity) -> bool {
        true
    }

    #[test]
    fn test_below_batch_size_waits() {
        let f = fixture(generous(), BatchConfig::default());
        for i in 0..19 {
            assert_eq!(f.batcher.enqueue(ALICE, update(i)).unwrap(), None);
        }
        let report = f.batcher.periodic_sweep(&always_connected);
        assert!(report.flushed.is_empty());
        assert_eq!(f.transport.count(), 0);
        assert_eq!(f.batcher.pending_len(ALICE), 19);
    }

    #[test]
    fn test_full_batch_flushes_immediately() {
        let f = fixture(generous(), BatchConfig::default());
        for i in 0..19 {
            f.batcher.enqueue(ALICE, update(i)).unwrap();
        }
        let outcome = f.batcher.enqueue(ALICE, update(19)).unwrap().unwrap();
        assert_eq!(outcome.sent.len(), 20);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(f.transport.count(), 20);
        assert_eq!(f.batcher.pending_len(ALICE), 0);
    }

    #[test]
    fn test_timeout_flush_on_sweep() {
        let f = fixture(generous(), BatchConfig::default());
        f.batcher.enqueue(ALICE, update(0)).unwrap();

        f.clock.advance(99);
        assert!(f.batcher.periodic_sweep(&always_connected).flushed.is_empty());

        f.clock.advance(1);
        let report = f.batcher.periodic_sweep(&always_connected);
        assert_eq!(report.flushed.len(), 1);
        assert_eq!(report.flushed[0].0, ALICE);
        assert_eq!(f.transport.sent_to(ALICE), vec![update(0)]);
    }

    #[test]
    fn test_aged_queue_flushes_on_next_enqueue() {
        let f = fixture(generous(), BatchConfig::default());
        f.batcher.enqueue(ALICE, update(0)).unwrap();
        f.clock.advance(150);
        let outcome = f.batcher.enqueue(ALICE, update(1)).unwrap().unwrap();
        assert_eq!(outcome.sent, vec![update(0), update(1)]);
    }

    #[test]
    fn test_gate_denial_drains_nothing() {
        let f = fixture(
            LimiterConfig {
                scoreboard_baseline: 1,
                general_baseline: 1_000,
                ..LimiterConfig::default()
            },
            BatchConfig::default(),
        );
        assert!(f.limiter.try_consume(ALICE, TrafficClass::Scoreboard));

        for i in 0..5 {
            f.batcher.enqueue(ALICE, update(i)).unwrap();
        }
        let outcome = f.batcher.flush(ALICE).unwrap();
        assert!(outcome.gated);
        assert!(outcome.sent.is_empty());
        assert_eq!(outcome.remaining, 5);
        assert_eq!(f.transport.count(), 0);
    }

    #[test]
    fn test_partial_drain_keeps_tail_in_order() {
        let f = fixture(
            LimiterConfig {
                general_baseline: 5,
                general_floor: 1,
                scoreboard_baseline: 100,
                ..LimiterConfig::default()
            },
            BatchConfig::default(),
        );
        for i in 0..19 {
            f.batcher.enqueue(ALICE, update(i)).unwrap();
        }
        let outcome = f.batcher.enqueue(ALICE, update(19)).unwrap().unwrap();
        assert_eq!(outcome.sent, (0..5).map(update).collect::<Vec<_>>());
        assert_eq!(outcome.remaining, 15);

        f.clock.advance(1_000);
        let outcome = f.batcher.flush(ALICE).unwrap();
        assert_eq!(outcome.sent, (5..10).map(update).collect::<Vec<_>>());
        assert_eq!(outcome.remaining, 10);
        assert_eq!(f.transport.count(), 10);
    }

    #[test]
    fn test_queue_cap_rejects_without_mutation() {
        let f = fixture(
            LimiterConfig {
                scoreboard_baseline: 1,
                ..generous()
            },
            BatchConfig {
                max_pending: 20,
                ..BatchConfig::default()
            },
        );
        assert!(f.limiter.try_consume(ALICE, TrafficClass::Scoreboard));
        for i in 0..20 {
            f.batcher.enqueue(ALICE, update(i)).unwrap();
        }
        let err = f.batcher.enqueue(ALICE, update(20)).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Rejected(Rejection::QueueFull { limit: 20, .. })
        ));
        assert_eq!(f.batcher.pending_len(ALICE), 20);
    }

    #[test]
    fn test_sweep_reaps_disconnected_identities() {
        let f = fixture(generous(), BatchConfig::default());
        f.batcher.enqueue(ALICE, update(0)).unwrap();
        f.batcher.enqueue(BOB, update(1)).unwrap();
        f.clock.advance(200);

        let only_bob = |identity: Identity| identity == BOB;
        let report = f.batcher.periodic_sweep(&only_bob);
        assert_eq!(report.reaped, 1);
        assert_eq!(report.flushed.len(), 1);
        assert!(!f.batcher.tracks(ALICE));
        assert!(f.transport.sent_to(ALICE).is_empty());
        assert_eq!(f.transport.sent_to(BOB), vec![update(1)]);
    }

    #[test]
    fn test_transport_failure_drops_failing_update_only() {
        let f = fixture(generous(), BatchConfig::default());
        for i in 0..3 {
            f.batcher.enqueue(ALICE, update(i)).unwrap();
        }
        f.transport.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.batcher.flush(ALICE),
            Err(SyncError::TransportClosed)
        ));
        assert_eq!(f.batcher.pending_len(ALICE), 2);

        f.transport.failing.store(false, Ordering::SeqCst);
        let outcome = f.batcher.flush(ALICE).unwrap();
        assert_eq!(outcome.sent, vec![update(1), update(2)]);
    }

    #[test]
    fn test_flush_unknown_identity_is_noop() {
        let f = fixture(generous(), BatchConfig::default());
        assert_eq!(f.batcher.flush(BOB).unwrap(), FlushOutcome::default());
        assert!(!f.limiter.tracks(BOB));
    }

    #[test]
    fn test_clear_identity() {
        let f = fixture(generous(), BatchConfig::default());
        f.batcher.enqueue(ALICE, update(0)).unwrap();
        f.batcher.clear_identity(ALICE);
        assert!(!f.batcher.tracks(ALICE));
        assert_eq!(f.batcher.tracked_identities(), 0);
    }
}
