//! Recording replay through `adb shell input`
//!
//! `Idle -> LaunchTarget -> Replaying -> Closing -> Done`. Launch failures
//! and failed commands are warnings; a partial replay still tells you
//! something. The target package is force-stopped at the end no matter how
//! the replay went.

use crate::events::{parse_timestamp_ms, EventKind, FinishedRecord};
use droidscope_core::apps::{self, AppContext, LaunchStrategy, UNKNOWN};
use droidscope_core::device::Device;
use droidscope_core::input;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Fixed pause between records
    pub inter_event_delay_ms: u64,
    /// Pause after each tap
    pub settle_delay_ms: u64,
    /// Use recorded timestamp gaps instead of the fixed pause
    pub use_original_timing: bool,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Wait after each launch attempt before checking the foreground app
    pub launch_wait_ms: u64,
    pub command_timeout_ms: u64,
    pub context_timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            inter_event_delay_ms: 50,
            settle_delay_ms: 100,
            use_original_timing: false,
            min_delay_ms: 50,
            max_delay_ms: 2000,
            launch_wait_ms: 2000,
            command_timeout_ms: 5000,
            context_timeout_ms: 3000,
        }
    }
}

impl ReplayConfig {
    /// Pause before replaying `next`.
    pub fn delay_between(&self, prev: &FinishedRecord, next: &FinishedRecord) -> Duration {
        let fixed = Duration::from_millis(self.inter_event_delay_ms);
        if !self.use_original_timing {
            return fixed;
        }
        let (Some(a), Some(b)) = (
            parse_timestamp_ms(&prev.timestamp),
            parse_timestamp_ms(&next.timestamp),
        ) else {
            return fixed;
        };
        let mut gap = b as i64 - a as i64;
        if gap < 0 {
            // crossed midnight
            gap += DAY_MS;
        }
        let lo = self.min_delay_ms.min(self.max_delay_ms);
        Duration::from_millis((gap as u64).clamp(lo, self.max_delay_ms))
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Idle,
    LaunchTarget,
    Replaying,
    Closing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    /// First record has no known package
    NoTarget,
    AlreadyForeground,
    /// `exact` is false when the package came up on a different activity
    Launched { strategy: LaunchStrategy, exact: bool },
    Failed { found: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub taps: usize,
    pub keys: usize,
    pub motions: usize,
    pub skipped: usize,
    pub failed_commands: usize,
    pub launch: Option<LaunchOutcome>,
    pub cancelled: bool,
}

/// Replay recorded sessions
pub struct Replayer {
    device: Arc<dyn Device>,
    config: ReplayConfig,
    cancel: Arc<AtomicBool>,
    state: ReplayState,
}

impl Replayer {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self::with_config(device, ReplayConfig::default())
    }

    pub fn with_config(device: Arc<dyn Device>, config: ReplayConfig) -> Self {
        Self {
            device,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            state: ReplayState::Idle,
        }
    }

    /// Set to stop before the next record. A command already running
    /// finishes first.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    fn enter(&mut self, state: ReplayState) {
        debug!(from = ?self.state, to = ?state, "replay state");
        self.state = state;
    }

    /// Replay `records` in stored order.
    pub fn play(&mut self, records: &[FinishedRecord]) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let Some(first) = records.first() else {
            self.enter(ReplayState::Done);
            return stats;
        };
        let target = AppContext::new(&first.package, &first.activity);

        self.enter(ReplayState::LaunchTarget);
        stats.launch = Some(self.launch_target(&target, &mut stats));

        self.enter(ReplayState::Replaying);
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                std::thread::sleep(self.config.delay_between(&records[i - 1], record));
            }
            // checked after the wait, which can run to max_delay_ms
            if self.cancel.load(Ordering::SeqCst) {
                info!(replayed = i, total = records.len(), "replay cancelled");
                stats.cancelled = true;
                break;
            }
            self.replay_one(record, &mut stats);
        }

        self.enter(ReplayState::Closing);
        if target.package != UNKNOWN {
            if let Err(e) = apps::force_stop(self.device.as_ref(), &target.package, self.config.command_timeout()) {
                warn!(package = %target.package, error = %e, "force-stop failed");
            }
        }

        self.enter(ReplayState::Done);
        info!(
            taps = stats.taps,
            keys = stats.keys,
            skipped = stats.skipped,
            failed = stats.failed_commands,
            "replay finished"
        );
        stats
    }

    fn launch_target(&self, target: &AppContext, stats: &mut ReplayStats) -> LaunchOutcome {
        if target.package == UNKNOWN {
            warn!("first record has no package, not launching anything");
            return LaunchOutcome::NoTarget;
        }
        let device = self.device.as_ref();

        if let Some(current) = self.foreground() {
            if current.matches(target) {
                info!(app = %target, "target already in foreground");
                return LaunchOutcome::AlreadyForeground;
            }
        }

        let mut last_seen = None;
        for strategy in LaunchStrategy::ALL {
            if let Err(e) = apps::launch_app(device, target, strategy, self.config.command_timeout()) {
                warn!(?strategy, error = %e, "launch attempt failed");
                stats.failed_commands += 1;
                continue;
            }
            std::thread::sleep(Duration::from_millis(self.config.launch_wait_ms));

            let current = self.foreground();
            if let Some(current) = &current {
                if current.matches(target) {
                    info!(app = %target, ?strategy, "target launched");
                    return LaunchOutcome::Launched { strategy, exact: true };
                }
                debug!(?strategy, found = %current, "launch landed elsewhere");
            }
            last_seen = current.map(|c| (strategy, c));
        }

        match last_seen {
            Some((strategy, current)) if current.package == target.package => {
                warn!(expected = %target, found = %current, "target package up on a different activity");
                LaunchOutcome::Launched { strategy, exact: false }
            }
            other => {
                let found = other.map(|(_, c)| c.to_string()).unwrap_or_else(|| UNKNOWN.to_string());
                let e = droidscope_core::Error::launch_failed(&target.package, &target.activity, &found);
                warn!(error = %e, "continuing replay anyway");
                LaunchOutcome::Failed { found }
            }
        }
    }

    fn foreground(&self) -> Option<AppContext> {
        match apps::query_app_context(self.device.as_ref(), self.config.context_timeout()) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                debug!(error = %e, "foreground query failed");
                None
            }
        }
    }

    fn replay_one(&self, record: &FinishedRecord, stats: &mut ReplayStats) {
        let device = self.device.as_ref();
        let timeout = self.config.command_timeout();

        match record.event_type {
            EventKind::TouchDown => {
                let Some((x, y)) = record.coordinates.point() else {
                    warn!(event_id = record.event_id, "touch without coordinates, skipping");
                    stats.skipped += 1;
                    return;
                };
                match input::tap(device, x, y, timeout) {
                    Ok(()) => {
                        debug!(event_id = record.event_id, x, y, target = %record.resource_id, "tap");
                        stats.taps += 1;
                        std::thread::sleep(Duration::from_millis(self.config.settle_delay_ms));
                    }
                    Err(e) => {
                        warn!(event_id = record.event_id, error = %e, "tap failed");
                        stats.failed_commands += 1;
                    }
                }
            }
            // the tap already lifted
            EventKind::TouchUp => {}
            EventKind::Motion => {
                debug!(event_id = record.event_id, "motion not replayed");
                stats.motions += 1;
            }
            EventKind::KeyDown | EventKind::KeyUp => {
                let Some(code) = record.key_name().and_then(input::key_code) else {
                    warn!(event_id = record.event_id, key = %record.extra_info, "unmapped key, skipping");
                    stats.skipped += 1;
                    return;
                };
                match input::key_event(device, code, timeout) {
                    Ok(()) => stats.keys += 1,
                    Err(e) => {
                        warn!(event_id = record.event_id, error = %e, "keyevent failed");
                        stats.failed_commands += 1;
                    }
                }
            }
        }
    }
}
