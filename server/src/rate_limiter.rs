//! Per-identity send gates whose caps follow the global load level.
//!
//! Two traffic classes share the same mechanism: a one-second window counter
//! per identity, compared against a cap that is recomputed from the
//! [`LoadMonitor`] before every check. The recomputation is global, so a load
//! spike tightens every identity at once.
//!
//! A denial is a control-flow signal ("stop sending for now"), never an error.
//!
//! Discrete user actions (opening a menu, running a command) are throttled by
//! a separate cooldown gate, since rejecting one action is a different failure
//! mode from delaying a stream.

use crate::clock::Clock;
use crate::config::{LimiterConfig, LoadDivisors};
use crate::load_monitor::{LoadLevel, LoadMonitor};
use dashmap::DashMap;
use log::trace;
use shared::Identity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    /// One unit per score line sent.
    General,
    /// One unit per coarse scoreboard send decision (e.g. a batch flush).
    Scoreboard,
}

/// Cap for one class at one load level. Never below `floor`.
pub fn effective_cap(baseline: u32, floor: u32, level: LoadLevel, divisors: &LoadDivisors) -> u32 {
    let divisor = match level {
        LoadLevel::Low => divisors.low,
        LoadLevel::Medium => divisors.medium,
        LoadLevel::High => divisors.high,
        LoadLevel::Critical => divisors.critical,
    }
    .max(1);
    (baseline / divisor).max(floor)
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: u64,
    count: u32,
}

impl WindowCounter {
    fn new(now: u64) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Increments and returns the post-increment count, restarting the window
    /// first if it has aged out.
    fn hit(&mut self, now: u64, window_ms: u64) -> u32 {
        if now.saturating_sub(self.window_start) >= window_ms {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count
    }

    fn current(&self, now: u64, window_ms: u64) -> u32 {
        if now.saturating_sub(self.window_start) >= window_ms {
            0
        } else {
            self.count
        }
    }
}

#[derive(Debug)]
struct IdentityWindows {
    general: WindowCounter,
    scoreboard: WindowCounter,
}

impl IdentityWindows {
    fn new(now: u64) -> Self {
        Self {
            general: WindowCounter::new(now),
            scoreboard: WindowCounter::new(now),
        }
    }

    fn counter(&self, class: TrafficClass) -> &WindowCounter {
        match class {
            TrafficClass::General => &self.general,
            TrafficClass::Scoreboard => &self.scoreboard,
        }
    }

    fn counter_mut(&mut self, class: TrafficClass) -> &mut WindowCounter {
        match class {
            TrafficClass::General => &mut self.general,
            TrafficClass::Scoreboard => &mut self.scoreboard,
        }
    }
}

pub struct RateLimiter {
    config: LimiterConfig,
    load: Arc<LoadMonitor>,
    clock: Arc<dyn Clock>,
    general_cap: AtomicU32,
    scoreboard_cap: AtomicU32,
    windows: DashMap<Identity, IdentityWindows>,
    cooldowns: DashMap<Identity, HashMap<String, u64>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, load: Arc<LoadMonitor>, clock: Arc<dyn Clock>) -> Self {
        let limiter = Self {
            general_cap: AtomicU32::new(config.general_baseline),
            scoreboard_cap: AtomicU32::new(config.scoreboard_baseline),
            config,
            load,
            clock,
            windows: DashMap::new(),
            cooldowns: DashMap::new(),
        };
        limiter.recompute_caps();
        limiter
    }

    /// Re-derives both caps from the current load level.
    pub fn recompute_caps(&self) -> LoadLevel {
        let level = self.load.current_load_level();
        let config = &self.config;
        self.general_cap.store(
            effective_cap(config.general_baseline, config.general_floor, level, &config.divisors),
            Ordering::Relaxed,
        );
        self.scoreboard_cap.store(
            effective_cap(
                config.scoreboard_baseline,
                config.scoreboard_floor,
                level,
                &config.divisors,
            ),
            Ordering::Relaxed,
        );
        level
    }

    pub fn cap(&self, class: TrafficClass) -> u32 {
        match class {
            TrafficClass::General => self.general_cap.load(Ordering::Relaxed),
            TrafficClass::Scoreboard => self.scoreboard_cap.load(Ordering::Relaxed),
        }
    }

    /// Returns `(general, scoreboard)` caps as last computed.
    pub fn caps(&self) -> (u32, u32) {
        (self.cap(TrafficClass::General), self.cap(TrafficClass::Scoreboard))
    }

    /// Counts one unit for `identity` and reports whether it fits under the
    /// class cap. Admitted units are reported to the load monitor.
    pub fn try_consume(&self, identity: Identity, class: TrafficClass) -> bool {
        self.recompute_caps();
        let cap = self.cap(class);
        let now = self.clock.now_ms();

        let count = {
            let mut windows = self
                .windows
                .entry(identity)
                .or_insert_with(|| IdentityWindows::new(now));
            windows.counter_mut(class).hit(now, self.config.window_ms)
        };

        let allowed = count <= cap;
        if allowed {
            self.load.record_unit_sent(self.config.estimated_packet_size);
        } else {
            trace!("{} throttled on {:?} ({} > {})", identity, class, count, cap);
        }
        allowed
    }

    /// Units counted for `identity` in its current window.
    pub fn current_count(&self, identity: Identity, class: TrafficClass) -> u32 {
        let now = self.clock.now_ms();
        self.windows
            .get(&identity)
            .map(|windows| windows.counter(class).current(now, self.config.window_ms))
            .unwrap_or(0)
    }

    /// Cooldown gate for discrete actions, independent of packet traffic.
    pub fn try_perform_action(&self, identity: Identity, action: &str, cooldown_ms: u64) -> bool {
        let now = self.clock.now_ms();
        let mut actions = self.cooldowns.entry(identity).or_default();
        let ready = actions
            .get(action)
            .map_or(true, |&last| now.saturating_sub(last) >= cooldown_ms);
        if ready {
            actions.insert(action.to_string(), now);
        }
        ready
    }

    pub fn clear_identity(&self, identity: Identity) {
        self.windows.remove(&identity);
        self.cooldowns.remove(&identity);
    }

    pub fn clear_all(&self) {
        self.windows.clear();
        self.cooldowns.clear();
    }

    pub fn tracks(&self, identity: Identity) -> bool {
        self.windows.contains_key(&identity) || self.cooldowns.contains_key(&identity)
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len().max(self.cooldowns.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LoadConfig;

    const ALICE: Identity = Identity(1);
    const BOB: Identity = Identity(2);

    /// Limiter whose load monitor never leaves LOW.
    fn quiet_limiter(config: LimiterConfig) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(1_000));
        let load_config = LoadConfig {
            baseline_units_per_sec: 1_000_000,
            ..LoadConfig::default()
        };
        let load = Arc::new(LoadMonitor::new(load_config, clock.clone()));
        (clock.clone(), RateLimiter::new(config, load, clock))
    }

    #[test]
    fn test_caps_are_monotonic_and_floored() {
        let config = LimiterConfig::default();
        let d = &config.divisors;
        for (baseline, floor) in [(50, 5), (10, 1), (3, 1), (1000, 7)] {
            let low = effective_cap(baseline, floor, LoadLevel::Low, d);
            let medium = effective_cap(baseline, floor, LoadLevel::Medium, d);
            let high = effective_cap(baseline, floor, LoadLevel::High, d);
            let critical = effective_cap(baseline, floor, LoadLevel::Critical, d);

            assert_eq!(low, baseline);
            assert!(critical <= high && high <= medium && medium <= low);
            assert!(critical >= floor && floor > 0);
        }
    }

    #[test]
    fn test_default_cap_table() {
        let d = LoadDivisors::default();
        assert_eq!(effective_cap(50, 5, LoadLevel::Medium, &d), 25);
        assert_eq!(effective_cap(50, 5, LoadLevel::High, &d), 16);
        assert_eq!(effective_cap(50, 5, LoadLevel::Critical, &d), 5);
        assert_eq!(effective_cap(10, 1, LoadLevel::Critical, &d), 1);
        assert_eq!(effective_cap(10, 1, LoadLevel::High, &d), 3);
    }

    #[test]
    fn test_consume_up_to_cap() {
        let (_clock, limiter) = quiet_limiter(LimiterConfig::default());
        for _ in 0..10 {
            assert!(limiter.try_consume(ALICE, TrafficClass::Scoreboard));
        }
        assert!(!limiter.try_consume(ALICE, TrafficClass::Scoreboard));
        assert_eq!(limiter.current_count(ALICE, TrafficClass::Scoreboard), 11);

        // The general class and other identities are unaffected.
        assert!(limiter.try_consume(ALICE, TrafficClass::General));
        assert!(limiter.try_consume(BOB, TrafficClass::Scoreboard));
    }

    #[test]
    fn test_window_resets_after_one_second() {
        let (clock, limiter) = quiet_limiter(LimiterConfig::default());
        for _ in 0..50 {
            assert!(limiter.try_consume(ALICE, TrafficClass::General));
        }
        assert!(!limiter.try_consume(ALICE, TrafficClass::General));

        clock.advance(999);
        assert!(!limiter.try_consume(ALICE, TrafficClass::General));

        clock.advance(1);
        assert_eq!(limiter.current_count(ALICE, TrafficClass::General), 0);
        assert!(limiter.try_consume(ALICE, TrafficClass::General));
        assert_eq!(limiter.current_count(ALICE, TrafficClass::General), 1);
    }

    #[test]
    fn test_only_admitted_units_reach_load_monitor() {
        let (_clock, limiter) = quiet_limiter(LimiterConfig {
            scoreboard_baseline: 2,
            ..LimiterConfig::default()
        });
        for _ in 0..5 {
            limiter.try_consume(ALICE, TrafficClass::Scoreboard);
        }
        assert_eq!(limiter.load.window_units(), 2);
        assert_eq!(limiter.load.statistics().total_units, 2);
    }

    #[test]
    fn test_critical_load_tightens_every_identity() {
        let clock = Arc::new(ManualClock::new(0));
        let load = Arc::new(LoadMonitor::new(LoadConfig::default(), clock.clone()));
        let limiter = RateLimiter::new(LimiterConfig::default(), load.clone(), clock.clone());
        assert_eq!(limiter.caps(), (50, 10));

        for _ in 0..100 {
            load.record_unit_sent(64);
        }
        clock.advance(1_000);
        assert_eq!(limiter.recompute_caps(), LoadLevel::Critical);
        assert_eq!(limiter.caps(), (5, 1));

        assert!(limiter.try_consume(BOB, TrafficClass::Scoreboard));
        assert!(!limiter.try_consume(BOB, TrafficClass::Scoreboard));
    }

    #[test]
    fn test_cooldown_gate() {
        let (clock, limiter) = quiet_limiter(LimiterConfig::default());
        assert!(limiter.try_perform_action(ALICE, "gui", 1_000));
        assert!(!limiter.try_perform_action(ALICE, "gui", 1_000));

        // Independent per action kind and per identity.
        assert!(limiter.try_perform_action(ALICE, "command", 500));
        assert!(limiter.try_perform_action(BOB, "gui", 1_000));

        clock.advance(999);
        assert!(!limiter.try_perform_action(ALICE, "gui", 1_000));
        clock.advance(1);
        assert!(limiter.try_perform_action(ALICE, "gui", 1_000));
    }

    #[test]
    fn test_clear_identity_removes_everything() {
        let (_clock, limiter) = quiet_limiter(LimiterConfig::default());
        limiter.try_consume(ALICE, TrafficClass::General);
        limiter.try_perform_action(ALICE, "gui", 1_000);
        limiter.try_consume(BOB, TrafficClass::General);
        assert!(limiter.tracks(ALICE));

        limiter.clear_identity(ALICE);
        assert!(!limiter.tracks(ALICE));
        assert!(limiter.tracks(BOB));
        assert_eq!(limiter.current_count(ALICE, TrafficClass::General), 0);
        assert!(limiter.try_perform_action(ALICE, "gui", 1_000));
    }

    #[test]
    fn test_concurrent_consumers_never_exceed_cap() {
        let (_clock, limiter) = quiet_limiter(LimiterConfig::default());
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| limiter.try_consume(ALICE, TrafficClass::General))
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
