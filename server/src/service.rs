//! The sync service: one object owning every per-identity table.
//!
//! `ScoreboardSync` wires the load monitor, rate limiter, batcher, sync engine
//! and priority classifier together around injected host collaborators. The
//! host drives it with [`ScoreboardSync::tick`] at a fixed rate and forwards
//! session lifecycle and event-driven score changes to it from any thread.

use crate::batcher::UpdateBatcher;
use crate::clock::Clock;
use crate::config::{AutoTransformConfig, SyncConfig};
use crate::custom::{CustomSidebar, CustomSidebars};
use crate::error::{Rejection, SyncError};
use crate::host::{LivenessOracle, SnapshotSource, Transport};
use crate::load_monitor::{LoadLevel, LoadMonitor};
use crate::priority::{Priority, PriorityClassifier};
use crate::rate_limiter::RateLimiter;
use crate::sync_engine::DifferentialSyncEngine;
use crate::transform::TransformRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use shared::{is_valid_entry_name, is_valid_leaderboard_name, Identity, ScoreUpdate};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

pub const GUI_ACTION: &str = "gui";

/// Leaderboards one identity follows. The displayed one is always followed.
#[derive(Debug, Default)]
struct Subscriptions {
    displayed: Option<String>,
    leaderboards: BTreeSet<String>,
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub load_percent: u8,
    pub level: LoadLevel,
    /// Pairs diffed this tick.
    pub synced: usize,
    /// Pairs shed by priority before their snapshot was read.
    pub skipped: usize,
    /// Pairs whose leaderboard does not exist.
    pub missing: usize,
    pub updates: usize,
    pub removals: usize,
    pub throttled: usize,
    /// Batched updates sent by the sweep.
    pub flushed: usize,
    pub reaped: usize,
}

pub struct ScoreboardSync {
    config: SyncConfig,
    load: Arc<LoadMonitor>,
    limiter: Arc<RateLimiter>,
    batcher: UpdateBatcher,
    engine: DifferentialSyncEngine,
    priorities: PriorityClassifier,
    transforms: TransformRegistry,
    auto_transform: RwLock<AutoTransformConfig>,
    custom: CustomSidebars,
    transport: Arc<dyn Transport>,
    source: Arc<dyn SnapshotSource>,
    liveness: Arc<dyn LivenessOracle>,
    subscriptions: DashMap<Identity, Subscriptions>,
}

fn check_identity(identity: Identity) -> Result<(), Rejection> {
    if identity.is_valid() {
        Ok(())
    } else {
        Err(Rejection::InvalidIdentity(identity))
    }
}

fn check_leaderboard(leaderboard: &str) -> Result<(), Rejection> {
    if is_valid_leaderboard_name(leaderboard) {
        Ok(())
    } else {
        Err(Rejection::InvalidLeaderboard(leaderboard.to_string()))
    }
}

impl ScoreboardSync {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn SnapshotSource>,
        liveness: Arc<dyn LivenessOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let load = Arc::new(LoadMonitor::new(config.load.clone(), clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            config.limiter.clone(),
            load.clone(),
            clock.clone(),
        ));
        let batcher = UpdateBatcher::new(
            config.batch.clone(),
            limiter.clone(),
            transport.clone(),
            clock,
        );
        let engine =
            DifferentialSyncEngine::new(config.sync.clone(), limiter.clone(), transport.clone());
        let priorities = PriorityClassifier::new(config.priority.clone());
        let auto_transform = RwLock::new(config.auto_transform.clone());

        Self {
            config,
            load,
            limiter,
            batcher,
            engine,
            priorities,
            transforms: TransformRegistry::new(),
            auto_transform,
            custom: CustomSidebars::new(),
            transport,
            source,
            liveness,
            subscriptions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn load(&self) -> &LoadMonitor {
        &self.load
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn engine(&self) -> &DifferentialSyncEngine {
        &self.engine
    }

    pub fn batcher(&self) -> &UpdateBatcher {
        &self.batcher
    }

    /// Starts a session. Anything left over under the same identity is
    /// dropped so the first sync is a full resync. Configured transform rules
    /// are handed out here when they apply to new players.
    pub fn connect(&self, identity: Identity) -> Result<(), Rejection> {
        check_identity(identity)?;
        if self.residual_state(identity) {
            warn!("{} connected with residual state; purging", identity);
        }
        self.purge(identity);

        let auto = self.auto_transform();
        if auto.applies_on_connect() {
            self.apply_rules(identity, &auto);
        }
        info!("{} connected", identity);
        Ok(())
    }

    /// Ends a session and releases every table entry keyed by it.
    pub fn disconnect(&self, identity: Identity) {
        self.purge(identity);
        info!("{} disconnected; sync state released", identity);
    }

    fn purge(&self, identity: Identity) {
        self.limiter.clear_identity(identity);
        self.batcher.clear_identity(identity);
        self.engine.clear_identity(identity);
        self.subscriptions.remove(&identity);
        self.transforms.clear_identity(identity);
        self.priorities.clear_identity(identity);
        self.custom.clear_identity(identity);
    }

    /// True while any component still holds state for `identity`.
    pub fn residual_state(&self, identity: Identity) -> bool {
        self.limiter.tracks(identity)
            || self.batcher.tracks(identity)
            || self.engine.tracks(identity)
            || self.subscriptions.contains_key(&identity)
            || self.transforms.tracks(identity)
            || self.priorities.tracks(identity)
            || self.custom.tracks(identity)
    }

    /// Follows `leaderboard` without changing what the sidebar shows.
    pub fn subscribe(&self, identity: Identity, leaderboard: &str) -> Result<(), Rejection> {
        check_identity(identity)?;
        check_leaderboard(leaderboard)?;
        if !self.liveness.is_connected(identity) {
            return Ok(());
        }

        // Check and insert under one entry guard so racing calls cannot
        // overshoot the cap.
        let limit = self.config.sync.max_subscriptions;
        match self.subscriptions.entry(identity) {
            Entry::Occupied(mut entry) => {
                let subs = entry.get_mut();
                if subs.leaderboards.contains(leaderboard) {
                    return Ok(());
                }
                if subs.leaderboards.len() >= limit {
                    return Err(Rejection::TooManySubscriptions { identity, limit });
                }
                subs.leaderboards.insert(leaderboard.to_string());
            }
            Entry::Vacant(entry) => {
                entry.insert(Subscriptions {
                    displayed: None,
                    leaderboards: BTreeSet::from([leaderboard.to_string()]),
                });
            }
        }

        self.engine.invalidate(identity, leaderboard);
        debug!("{} subscribed to {}", identity, leaderboard);
        Ok(())
    }

    pub fn unsubscribe(&self, identity: Identity, leaderboard: &str) {
        let removed = self
            .subscriptions
            .get_mut(&identity)
            .map(|mut subs| {
                if subs.displayed.as_deref() == Some(leaderboard) {
                    subs.displayed = None;
                }
                subs.leaderboards.remove(leaderboard)
            })
            .unwrap_or(false);
        self.subscriptions
            .remove_if(&identity, |_, subs| subs.leaderboards.is_empty());
        if removed {
            self.engine.invalidate(identity, leaderboard);
            debug!("{} unsubscribed from {}", identity, leaderboard);
        }
    }

    pub fn subscriptions(&self, identity: Identity) -> Vec<String> {
        self.subscriptions
            .get(&identity)
            .map(|subs| subs.leaderboards.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn displayed(&self, identity: Identity) -> Option<String> {
        self.subscriptions
            .get(&identity)
            .and_then(|subs| subs.displayed.clone())
    }

    /// Switches the sidebar to `leaderboard`, or clears it with `None`.
    ///
    /// The previously displayed leaderboard is unfollowed and its cache
    /// dropped. The new one starts from an empty cache and the client is told
    /// to reset its lines, so the next tick is a full resync with no stale
    /// entries left behind, even when the board did not change.
    ///
    /// While the identity has a custom sidebar the request only changes
    /// which board comes back once that sidebar is disabled.
    pub fn set_display(
        &self,
        identity: Identity,
        leaderboard: Option<&str>,
    ) -> Result<(), SyncError> {
        check_identity(identity)?;
        if let Some(name) = leaderboard {
            check_leaderboard(name)?;
        }
        if !self.liveness.is_connected(identity) {
            return Ok(());
        }
        if self.custom.set_replaced(identity, leaderboard) {
            debug!("{} keeps its custom sidebar; {:?} queued behind it", identity, leaderboard);
            return Ok(());
        }
        self.switch_display(identity, leaderboard)
    }

    fn switch_display(&self, identity: Identity, leaderboard: Option<&str>) -> Result<(), SyncError> {
        let limit = self.config.sync.max_subscriptions;
        let previous = {
            let mut subs = self.subscriptions.entry(identity).or_default();
            if let Some(name) = leaderboard {
                let replaced = subs.displayed.as_deref().is_some_and(|old| old != name);
                if !subs.leaderboards.contains(name)
                    && subs.leaderboards.len() - usize::from(replaced) >= limit
                {
                    drop(subs);
                    self.subscriptions
                        .remove_if(&identity, |_, subs| subs.leaderboards.is_empty());
                    return Err(Rejection::TooManySubscriptions { identity, limit }.into());
                }
            }
            let previous = subs.displayed.clone();
            if let Some(old) = previous.as_deref() {
                subs.leaderboards.remove(old);
            }
            subs.displayed = leaderboard.map(str::to_string);
            if let Some(name) = leaderboard {
                subs.leaderboards.insert(name.to_string());
            }
            previous
        };
        self.subscriptions
            .remove_if(&identity, |_, subs| subs.leaderboards.is_empty());

        if let Some(old) = previous.as_deref() {
            self.engine.invalidate(identity, old);
        }
        match leaderboard {
            Some(name) => {
                self.engine.invalidate(identity, name);
                let title = self.title_for(identity, name);
                self.transport.display(identity, Some(name), &title, true)?;
                info!("{} now displays {}", identity, name);
            }
            None => {
                self.transport.display(identity, None, "", true)?;
                info!("{} cleared its sidebar", identity);
            }
        }
        Ok(())
    }

    /// Event-driven path: queues one line for `identity` through the batcher.
    ///
    /// Lines sent by a resulting flush are folded into the sync cache. A
    /// transport failure leaves the client's view unknown, so all of the
    /// identity's caches are dropped before the error is returned.
    pub fn push_update(&self, identity: Identity, update: ScoreUpdate) -> Result<(), SyncError> {
        check_identity(identity)?;
        check_leaderboard(&update.leaderboard)?;
        if !is_valid_entry_name(&update.entry) {
            return Err(Rejection::InvalidEntry(update.entry).into());
        }
        if !self.liveness.is_connected(identity) {
            return Ok(());
        }

        let mut update = update;
        update.value = self.transforms.transform_value(
            identity,
            &update.leaderboard,
            &update.entry,
            update.value,
        );

        match self.batcher.enqueue(identity, update) {
            Ok(Some(outcome)) => {
                for sent in &outcome.sent {
                    self.engine.record_sent(identity, sent);
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e @ SyncError::Rejected(_)) => Err(e),
            Err(e) => {
                self.engine.clear_identity(identity);
                Err(e)
            }
        }
    }

    /// Drops every cache built for a leaderboard the host deleted.
    pub fn on_leaderboard_removed(&self, leaderboard: &str) {
        self.engine.invalidate_leaderboard(leaderboard);
        info!("Leaderboard {} removed; caches dropped", leaderboard);
    }

    pub fn notify_tps(&self, tps: u32) {
        self.load.notify_external_throughput_signal(tps);
    }

    pub fn try_perform_action(&self, identity: Identity, action: &str, cooldown_ms: u64) -> bool {
        self.limiter.try_perform_action(identity, action, cooldown_ms)
    }

    /// Cooldown for a named client action: the GUI one, or the command one
    /// for everything else.
    pub fn action_cooldown_ms(&self, action: &str) -> u64 {
        if action == GUI_ACTION {
            self.config.cooldowns.gui_ms
        } else {
            self.config.cooldowns.command_ms
        }
    }

    pub fn set_priority(&self, identity: Identity, priority: Priority) -> Result<(), Rejection> {
        self.priorities.set_override(identity, priority)
    }

    pub fn classify(&self, leaderboard: &str, identity: Identity) -> Priority {
        self.priorities.classify(leaderboard, identity)
    }

    pub fn set_display_name(
        &self,
        identity: Identity,
        leaderboard: &str,
        title: &str,
    ) -> Result<(), SyncError> {
        self.transforms.set_display_name(identity, leaderboard, title)?;
        self.redisplay(identity, leaderboard, false)
    }

    pub fn set_score_offset(
        &self,
        identity: Identity,
        leaderboard: &str,
        entry: &str,
        offset: i32,
    ) -> Result<(), Rejection> {
        self.transforms.set_offset(identity, leaderboard, entry, offset)
    }

    pub fn set_transform_enabled(&self, identity: Identity, enabled: bool) -> Result<(), SyncError> {
        self.transforms.set_enabled(identity, enabled)?;
        if let Some(displayed) = self.displayed(identity) {
            self.redisplay(identity, &displayed, false)?;
        }
        Ok(())
    }

    /// Removes the identity's transform and resyncs everything it follows.
    pub fn clear_transform(&self, identity: Identity) -> Result<(), SyncError> {
        if !self.transforms.clear_identity(identity) {
            return Ok(());
        }
        for leaderboard in self.subscriptions(identity) {
            self.engine.invalidate(identity, &leaderboard);
        }
        if let Some(displayed) = self.displayed(identity) {
            self.redisplay(identity, &displayed, true)?;
        }
        Ok(())
    }

    /// Resends the sidebar header. `reset` must be set whenever the pair's
    /// cache was dropped, since the client may hold lines the next full
    /// resync will not mention.
    fn redisplay(&self, identity: Identity, leaderboard: &str, reset: bool) -> Result<(), SyncError> {
        if self.displayed(identity).as_deref() != Some(leaderboard) {
            return Ok(());
        }
        let title = self.title_for(identity, leaderboard);
        self.transport
            .display(identity, Some(leaderboard), &title, reset)
    }

    fn title_for(&self, identity: Identity, leaderboard: &str) -> String {
        self.custom
            .title(identity, leaderboard)
            .unwrap_or_else(|| self.transforms.title_for(identity, leaderboard))
    }

    pub fn auto_transform(&self) -> AutoTransformConfig {
        self.auto_transform
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_rules(&self, identity: Identity, auto: &AutoTransformConfig) {
        for rule in &auto.rules {
            match self.transforms.apply_rule(identity, rule) {
                Ok(()) => debug!("Applied transform rule for {} to {}", rule.leaderboard, identity),
                Err(e) => warn!("Skipping transform rule for {}: {}", rule.leaderboard, e),
            }
        }
    }

    /// Swaps in new transform rules and, when they apply to new players,
    /// hands them to every identity in `online` as well. Rules merge into
    /// existing transforms. The first display failure is returned after all
    /// identities were handled.
    pub fn reload_auto_transforms(
        &self,
        config: AutoTransformConfig,
        online: &[Identity],
    ) -> Result<(), SyncError> {
        *self
            .auto_transform
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config.clone();
        info!("Reloaded auto transforms ({} rules)", config.rules.len());
        if !config.applies_on_connect() {
            return Ok(());
        }

        let mut first_failure = None;
        for &identity in online {
            if !self.liveness.is_connected(identity) {
                continue;
            }
            self.apply_rules(identity, &config);
            if let Some(displayed) = self.displayed(identity) {
                if let Err(e) = self.redisplay(identity, &displayed, false) {
                    error!("Redisplay for {} failed: {}", identity, e);
                    first_failure.get_or_insert(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shows a sidebar only `identity` sees, ahead of any server board.
    ///
    /// A new sidebar, or one under a new name, is displayed with a reset;
    /// changing just the title keeps the client's lines.
    pub fn set_custom_sidebar(
        &self,
        identity: Identity,
        leaderboard: &str,
        title: &str,
    ) -> Result<(), SyncError> {
        check_identity(identity)?;
        if !self.liveness.is_connected(identity) {
            return Ok(());
        }
        let shown = self.displayed(identity);
        let previous = self.custom.set(identity, leaderboard, title, shown)?;
        if previous
            .as_ref()
            .is_some_and(|old| old.leaderboard == leaderboard)
        {
            return self.redisplay(identity, leaderboard, false);
        }

        if let Err(e) = self.switch_display(identity, Some(leaderboard)) {
            if self.displayed(identity).as_deref() != Some(leaderboard) {
                self.custom.clear_identity(identity);
            }
            return Err(e);
        }
        info!("{} now shows custom sidebar {}", identity, leaderboard);
        Ok(())
    }

    /// Sets a line of the identity's custom sidebar; it reaches the client on
    /// the next tick. Returns false when no custom sidebar is set.
    pub fn set_custom_score(
        &self,
        identity: Identity,
        entry: &str,
        value: i32,
    ) -> Result<bool, Rejection> {
        self.custom.set_score(identity, entry, value)
    }

    pub fn remove_custom_score(&self, identity: Identity, entry: &str) -> bool {
        self.custom.remove_score(identity, entry)
    }

    pub fn custom_sidebar(&self, identity: Identity) -> Option<CustomSidebar> {
        self.custom.get(identity)
    }

    /// Drops the custom sidebar and brings back the board it covered, or an
    /// empty sidebar when there was none.
    pub fn disable_custom_sidebar(&self, identity: Identity) -> Result<(), SyncError> {
        let Some(sidebar) = self.custom.disable(identity) else {
            return Ok(());
        };
        self.engine.invalidate(identity, &sidebar.leaderboard);
        info!("{} disabled custom sidebar {}", identity, sidebar.leaderboard);
        if self.displayed(identity).as_deref() == Some(sidebar.leaderboard.as_str()) {
            self.switch_display(identity, sidebar.replaced.as_deref())?;
        }
        Ok(())
    }

    /// One pass of the sync driver.
    ///
    /// Refreshes the load window and caps, then diffs every followed pair
    /// whose priority survives the current load, then sweeps the batcher.
    /// A transport failure drops that identity's caches and skips its other
    /// pairs for this pass; every other identity is still synced and the
    /// sweep still runs. The first failure is returned at the end.
    pub fn tick(&self) -> Result<TickReport, SyncError> {
        self.load.refresh();
        let level = self.limiter.recompute_caps();
        let load_percent = self.load.current_load_percentage();
        let mut report = TickReport {
            load_percent,
            level,
            ..TickReport::default()
        };

        let pairs: Vec<(Identity, String)> = self
            .subscriptions
            .iter()
            .flat_map(|entry| {
                let identity = *entry.key();
                entry
                    .value()
                    .leaderboards
                    .iter()
                    .map(move |leaderboard| (identity, leaderboard.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut failed: HashSet<Identity> = HashSet::new();
        let mut first_failure = None;

        for (identity, leaderboard) in pairs {
            if failed.contains(&identity) || !self.liveness.is_connected(identity) {
                continue;
            }
            if self
                .priorities
                .should_skip(&leaderboard, identity, load_percent)
            {
                report.skipped += 1;
                continue;
            }
            let Some(mut snapshot) = self
                .custom
                .snapshot(identity, &leaderboard)
                .or_else(|| self.source.snapshot(&leaderboard))
            else {
                report.missing += 1;
                continue;
            };
            self.transforms.apply(identity, &leaderboard, &mut snapshot);

            let delta = match self.engine.sync(identity, &leaderboard, &snapshot) {
                Ok(delta) => delta,
                Err(e) => {
                    error!("Sync of {} for {} failed: {}", leaderboard, identity, e);
                    self.engine.clear_identity(identity);
                    failed.insert(identity);
                    first_failure.get_or_insert(e);
                    continue;
                }
            };
            report.synced += 1;
            report.updates += delta.updates.len();
            report.removals += delta.removals.len();
            report.throttled += delta.throttled;
        }

        let sweep = self.batcher.periodic_sweep(self.liveness.as_ref());
        report.reaped = sweep.reaped;
        for (identity, outcome) in &sweep.flushed {
            for sent in &outcome.sent {
                self.engine.record_sent(*identity, sent);
            }
            report.flushed += outcome.sent.len();
        }

        for (identity, e) in sweep.failures {
            error!("Batched send to {} failed: {}", identity, e);
            self.engine.clear_identity(identity);
            first_failure.get_or_insert(e);
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
