use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

use exam_core::model::SessionSettings;

use super::store::{SessionStore, TickOutcome};
use crate::error::TimerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Running,
    Paused,
    /// Terminal. Reached on forced submit or an explicit stop.
    Stopped,
}

/// A warning threshold that was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWarning {
    pub minutes: u32,
    pub remaining: u32,
}

/// What one poll of the timer did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReport {
    pub charged_secs: u32,
    pub remaining: u32,
    /// The gap since the last tick was larger than a normal scheduling
    /// delay, typically because the process was suspended.
    pub resumed_from_background: bool,
    pub warning: Option<TimeWarning>,
    pub forced_submit: bool,
}

/// Drives the attempt countdown from wall-clock time.
///
/// The controller never counts ticks. Each poll charges the real time elapsed
/// since the last charge, so a suspended process is billed for the gap.
#[derive(Debug, Clone)]
pub struct TimerController {
    state: TimerState,
    cadence_secs: u32,
    background_jump_secs: u32,
    thresholds: Vec<u32>,
    fired: BTreeSet<u32>,
    last_tick_at: DateTime<Utc>,
}

impl TimerController {
    /// Start counting from `now` for an attempt with `remaining` seconds left.
    ///
    /// Thresholds already at or above the remaining time count as fired, so a
    /// resumed attempt does not replay warnings for time already spent.
    #[must_use]
    pub fn start(settings: &SessionSettings, remaining: u32, now: DateTime<Utc>) -> Self {
        let thresholds = settings.warning_minutes().to_vec();
        let fired = thresholds
            .iter()
            .copied()
            .filter(|minutes| minutes.saturating_mul(60) >= remaining)
            .collect();
        Self {
            state: TimerState::Running,
            cadence_secs: settings.tick_cadence_secs().max(1),
            background_jump_secs: settings.background_jump_secs(),
            thresholds,
            fired,
            last_tick_at: now,
        }
    }

    /// Timer for an attempt that is not running yet.
    #[must_use]
    pub fn paused(settings: &SessionSettings, remaining: u32, now: DateTime<Utc>) -> Self {
        let mut timer = Self::start(settings, remaining, now);
        timer.state = TimerState::Paused;
        timer
    }

    /// Timer for an attempt that can no longer run.
    #[must_use]
    pub fn stopped(settings: &SessionSettings, now: DateTime<Utc>) -> Self {
        let mut timer = Self::start(settings, 0, now);
        timer.state = TimerState::Stopped;
        timer
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        self.state
    }

    #[must_use]
    pub fn cadence(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.cadence_secs))
    }

    /// Charge the time elapsed since the last tick against `store`.
    ///
    /// Returns `Ok(None)` when paused or when less than one cadence passed.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::Stopped` once the timer is stopped.
    pub fn poll(
        &mut self,
        store: &mut SessionStore,
        now: DateTime<Utc>,
    ) -> Result<Option<TimerReport>, TimerError> {
        match self.state {
            TimerState::Stopped => return Err(TimerError::Stopped),
            TimerState::Paused => return Ok(None),
            TimerState::Running => {}
        }

        let elapsed = (now - self.last_tick_at).num_seconds();
        if elapsed < 0 {
            // wall clock moved backwards; restart the measurement
            self.last_tick_at = now;
            return Ok(None);
        }
        let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
        if elapsed < self.cadence_secs {
            return Ok(None);
        }

        let resumed_from_background = elapsed > self.background_jump_secs;
        let charged_secs = if resumed_from_background {
            elapsed
        } else {
            elapsed - elapsed % self.cadence_secs
        };
        self.last_tick_at += Duration::seconds(i64::from(charged_secs));

        let mut report = TimerReport {
            charged_secs,
            remaining: 0,
            resumed_from_background,
            warning: None,
            forced_submit: false,
        };
        match store.tick(charged_secs) {
            TickOutcome::Running { remaining } => {
                report.remaining = remaining;
                report.warning = self.crossed_warning(remaining);
            }
            TickOutcome::ForcedSubmit => {
                self.state = TimerState::Stopped;
                report.forced_submit = true;
            }
            TickOutcome::Idle => {
                // attempt left the running state behind our back
                self.state = TimerState::Stopped;
                report.charged_secs = 0;
                report.remaining = store.session().time_remaining();
            }
        }
        Ok(Some(report))
    }

    /// Marks every threshold at or above `remaining` as fired and returns the
    /// most urgent newly crossed one.
    fn crossed_warning(&mut self, remaining: u32) -> Option<TimeWarning> {
        let mut crossed = None;
        for &minutes in &self.thresholds {
            if minutes.saturating_mul(60) >= remaining && self.fired.insert(minutes) {
                crossed = Some(match crossed {
                    Some(current) if current < minutes => current,
                    _ => minutes,
                });
            }
        }
        crossed.map(|minutes| TimeWarning { minutes, remaining })
    }

    /// # Errors
    ///
    /// Returns `TimerError::Stopped` once the timer is stopped.
    pub fn pause(&mut self) -> Result<(), TimerError> {
        if self.state == TimerState::Stopped {
            return Err(TimerError::Stopped);
        }
        self.state = TimerState::Paused;
        Ok(())
    }

    /// Time spent paused is not charged.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::Stopped` once the timer is stopped.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TimerError> {
        match self.state {
            TimerState::Stopped => Err(TimerError::Stopped),
            TimerState::Running => Ok(()),
            TimerState::Paused => {
                self.state = TimerState::Running;
                self.last_tick_at = now;
                Ok(())
            }
        }
    }

    pub fn stop(&mut self) {
        self.state = TimerState::Stopped;
    }
}
