//! Worker load estimation
//!
//! If a worker spends `t` ms of a `T` ms period inside its blocking wait,
//! its load for that period is `100 * (T - t) / T`: 0 for a worker that
//! never leaves `epoll_wait`, 100 for one that never enters it. Periods are
//! fixed at one second; completed periods cascade into the minute and hour
//! tiers of a running-average tree.

use relayd_core::average::{cascade, Average, Singleton, Windowed};

/// Load reporting scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    OneSecond,
    OneMinute,
    OneHour,
}

/// Length of one load accounting period.
pub const GRANULARITY_MS: u64 = 1000;

/// Per-worker load bookkeeping. Fed by the worker loop; mutation is
/// owner-thread only.
#[derive(Debug)]
pub struct LoadTracker {
    /// When the current 1-second period started.
    period_start_ms: u64,
    /// When the worker entered its wait.
    wait_start_ms: u64,
    /// Wait time accumulated in the current period.
    wait_time_ms: u64,
    second: Singleton,
    minute: Windowed<60>,
    hour: Windowed<60>,
}

impl LoadTracker {
    pub fn new(now: u64) -> Self {
        Self {
            period_start_ms: now,
            wait_start_ms: now,
            wait_time_ms: 0,
            second: Singleton::new(),
            minute: Windowed::new(),
            hour: Windowed::new(),
        }
    }

    /// Restart accounting; call right before entering the wait loop.
    pub fn reset(&mut self, now: u64) {
        self.period_start_ms = now;
        self.wait_start_ms = now;
        self.wait_time_ms = 0;
    }

    /// The worker is about to enter its wait.
    pub fn about_to_wait(&mut self, now: u64) {
        self.wait_start_ms = now;
    }

    /// The worker returned from its wait. Closes the wait interval and,
    /// when a full period has elapsed, folds its load into the tree.
    pub fn about_to_work(&mut self, now: u64) {
        self.wait_time_ms += now.saturating_sub(self.wait_start_ms);

        let elapsed = now.saturating_sub(self.period_start_ms);
        if elapsed >= GRANULARITY_MS {
            let busy = elapsed.saturating_sub(self.wait_time_ms);
            let load = (100 * busy / elapsed).min(100) as u8;

            let fed = self.second.append(load);
            let fed = cascade(fed, &mut self.minute);
            let _ = cascade(fed, &mut self.hour);

            self.period_start_ms = now;
            self.wait_time_ms = 0;
        }
    }

    /// Last computed load at the given scale, 0–100.
    pub fn percentage(&self, granularity: Granularity) -> u8 {
        match granularity {
            Granularity::OneSecond => self.second.value(),
            Granularity::OneMinute => self.minute.value(),
            Granularity::OneHour => self.hour.value(),
        }
    }

    /// All three scales at once, for publishing to readers.
    pub fn values(&self) -> (u8, u8, u8) {
        (
            self.second.value(),
            self.minute.value(),
            self.hour.value(),
        )
    }

    /// Start of the current period.
    pub fn period_start(&self) -> u64 {
        self.period_start_ms
    }
}
