//! Process-wide outbound load measurement.
//!
//! The monitor counts units (packets) sent in a sliding window and turns the
//! observed rate into a coarse [`LoadLevel`]. The rate is computed over the
//! *elapsed* part of the window, so a fresh window reads 0% and ramps up
//! instead of spiking. All state is atomic; callers on any thread may record
//! and read concurrently.

use crate::clock::Clock;
use crate::config::LoadConfig;
use log::info;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_TPS: u32 = 20;

/// The window lives in one word: start (ms since the monitor was built) in
/// the high bits, unit count in the low ones. Restarting a window and
/// counting into it are then a single atomic step.
const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

fn pack_window(start: u64, units: u64) -> u64 {
    (start << COUNT_BITS) | units.min(COUNT_MASK)
}

fn unpack_window(word: u64) -> (u64, u64) {
    (word >> COUNT_BITS, word & COUNT_MASK)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadLevel::Low => "LOW",
            LoadLevel::Medium => "MEDIUM",
            LoadLevel::High => "HIGH",
            LoadLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Maps a load percentage onto a level using the configured thresholds.
pub fn level_for(percentage: u8, config: &LoadConfig) -> LoadLevel {
    if percentage >= config.critical_threshold {
        LoadLevel::Critical
    } else if percentage >= config.high_threshold {
        LoadLevel::High
    } else if percentage >= config.medium_threshold {
        LoadLevel::Medium
    } else {
        LoadLevel::Low
    }
}

/// Point-in-time view of the monitor, used for periodic log lines.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadStatistics {
    pub load_percentage: u8,
    pub level: LoadLevel,
    pub total_units: u64,
    pub estimated_kib: u64,
    pub last_tps: u32,
}

impl fmt::Display for LoadStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Network Load: {}% | Load Level: {} | Total Packets: {} | Estimated Bytes: {}KB | TPS: {}",
            self.load_percentage, self.level, self.total_units, self.estimated_kib, self.last_tps
        )
    }
}

pub struct LoadMonitor {
    config: LoadConfig,
    clock: Arc<dyn Clock>,
    origin: u64,
    window: AtomicU64,
    total_units: AtomicU64,
    total_bytes: AtomicU64,
    last_tps: AtomicU32,
}

impl LoadMonitor {
    pub fn new(config: LoadConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            config,
            clock,
            origin: now,
            window: AtomicU64::new(pack_window(0, 0)),
            total_units: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_tps: AtomicU32::new(DEFAULT_TPS),
        }
    }

    /// Counts one sent unit. An expired window restarts at `now` holding
    /// just this unit.
    pub fn record_unit_sent(&self, estimated_size: u64) {
        self.total_units.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(estimated_size, Ordering::Relaxed);

        let now = self.now_offset();
        let window_ms = self.config.window_ms;
        let _ = self
            .window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (start, units) = unpack_window(word);
                if now.saturating_sub(start) > window_ms {
                    Some(pack_window(now, 1))
                } else {
                    Some(pack_window(start, units + 1))
                }
            });
    }

    /// Observed rate over the elapsed part of the current window.
    pub fn units_per_second(&self) -> f64 {
        let age = self.window_age_ms();
        if age == 0 || age > self.config.window_ms {
            return 0.0;
        }
        self.window_units() as f64 / (age as f64 / 1000.0)
    }

    pub fn current_load_percentage(&self) -> u8 {
        let rate = self.units_per_second();
        let percentage = rate * 100.0 / self.config.baseline_units_per_sec as f64;
        percentage.clamp(0.0, 100.0) as u8
    }

    pub fn current_load_level(&self) -> LoadLevel {
        level_for(self.current_load_percentage(), &self.config)
    }

    /// Feeds the host's health signal (ticks per second). A struggling host
    /// counts as load: a zero-byte unit keeps the window live.
    pub fn notify_external_throughput_signal(&self, tps: u32) {
        self.last_tps.store(tps, Ordering::Relaxed);
        if tps < self.config.tps_floor {
            self.record_unit_sent(0);
        }
    }

    /// Restarts an expired window empty. Called once per tick.
    pub fn refresh(&self) {
        let now = self.now_offset();
        let window_ms = self.config.window_ms;
        let _ = self
            .window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (start, _) = unpack_window(word);
                (now.saturating_sub(start) > window_ms).then(|| pack_window(now, 0))
            });
    }

    pub fn window_units(&self) -> u64 {
        unpack_window(self.window.load(Ordering::Acquire)).1
    }

    pub fn window_start_ms(&self) -> u64 {
        self.origin + unpack_window(self.window.load(Ordering::Acquire)).0
    }

    fn now_offset(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.origin)
    }

    pub fn statistics(&self) -> LoadStatistics {
        let load_percentage = self.current_load_percentage();
        LoadStatistics {
            load_percentage,
            level: level_for(load_percentage, &self.config),
            total_units: self.total_units.load(Ordering::Relaxed),
            estimated_kib: self.total_bytes.load(Ordering::Relaxed) / 1024,
            last_tps: self.last_tps.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        self.total_units.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.window
            .store(pack_window(self.now_offset(), 0), Ordering::Release);
        info!("Network statistics reset");
    }

    fn window_age_ms(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.window_start_ms())
    }
}
