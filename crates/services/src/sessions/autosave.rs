use chrono::{DateTime, Duration, Utc};

/// Events that may cause state to be pushed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// Periodic check driven by the session timer.
    Interval,
    Navigation,
    FocusLost,
    /// Explicit user request. Flushes even when nothing changed.
    Manual,
    /// Connectivity came back.
    Reconnect,
    /// Last flush before submission.
    Final,
}

impl SaveTrigger {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SaveTrigger::Interval => "interval",
            SaveTrigger::Navigation => "navigation",
            SaveTrigger::FocusLost => "focus_lost",
            SaveTrigger::Manual => "manual",
            SaveTrigger::Reconnect => "reconnect",
            SaveTrigger::Final => "final",
        }
    }
}

/// What the caller should do about a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    Flush,
    Skip,
    /// Offline with pending work; one flush runs when connectivity returns.
    Queued,
}

/// Save indicator shown next to the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Saved { at: Option<DateTime<Utc>> },
    Unsaved { last_error: Option<String> },
    Offline,
}

/// Why a flush did not reach the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFailure {
    pub message: String,
    pub transient: bool,
}

/// Handle for one in-flight flush.
///
/// `seq` orders flushes; `revision` is the store revision the payload carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTicket {
    pub seq: u64,
    pub revision: u64,
}

/// How a completed flush was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushApplied {
    Saved,
    Failed,
    /// A newer flush was started after this one; its result is ignored.
    Superseded,
}

/// Decides when the session is flushed and keeps the save indicator.
///
/// Pure bookkeeping: no I/O happens here. The coordinator asks
/// [`AutoSavePolicy::decide`], runs the flush, then reports back through
/// [`AutoSavePolicy::complete`].
#[derive(Debug, Clone)]
pub struct AutoSavePolicy {
    interval: Duration,
    interval_anchor: DateTime<Utc>,
    last_save_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    online: bool,
    queued: bool,
    next_seq: u64,
    in_flight: Option<u64>,
}

impl AutoSavePolicy {
    #[must_use]
    pub fn new(interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            interval,
            interval_anchor: now,
            last_save_time: None,
            last_error: None,
            online: true,
            queued: false,
            next_seq: 1,
            in_flight: None,
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    #[must_use]
    pub fn last_save_time(&self) -> Option<DateTime<Utc>> {
        self.last_save_time
    }

    /// Decide whether `trigger` should flush given the store's dirty flag.
    pub fn decide(&mut self, trigger: SaveTrigger, dirty: bool, now: DateTime<Utc>) -> FlushDecision {
        let wants_flush = match trigger {
            SaveTrigger::Manual | SaveTrigger::Final => true,
            SaveTrigger::Interval => dirty && now - self.interval_anchor >= self.interval,
            SaveTrigger::Navigation | SaveTrigger::FocusLost => dirty,
            SaveTrigger::Reconnect => dirty || self.queued,
        };

        if !wants_flush {
            return FlushDecision::Skip;
        }
        if !self.online {
            self.queued = true;
            return FlushDecision::Queued;
        }
        FlushDecision::Flush
    }

    /// Register a flush about to start. Any earlier in-flight flush is superseded.
    pub fn begin(&mut self, revision: u64) -> FlushTicket {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some(seq);
        self.queued = false;
        FlushTicket { seq, revision }
    }

    /// Apply the outcome of the flush behind `ticket`.
    pub fn complete(
        &mut self,
        ticket: FlushTicket,
        result: Result<(), SaveFailure>,
        now: DateTime<Utc>,
    ) -> FlushApplied {
        if self.in_flight != Some(ticket.seq) {
            return FlushApplied::Superseded;
        }
        self.in_flight = None;
        match result {
            Ok(()) => {
                self.last_save_time = Some(now);
                self.interval_anchor = now;
                self.last_error = None;
                FlushApplied::Saved
            }
            Err(failure) => {
                // interval retries wait a full period; event triggers retry at once
                self.interval_anchor = now;
                self.queued = failure.transient;
                self.last_error = Some(failure.message);
                FlushApplied::Failed
            }
        }
    }

    /// Record a connectivity change.
    ///
    /// Returns true when the session just came back online and a reconnect
    /// flush should be attempted.
    pub fn set_online(&mut self, online: bool) -> bool {
        let reconnected = online && !self.online;
        self.online = online;
        reconnected
    }

    #[must_use]
    pub fn status(&self, dirty: bool) -> SaveStatus {
        if !self.online {
            SaveStatus::Offline
        } else if dirty || self.last_error.is_some() {
            SaveStatus::Unsaved {
                last_error: self.last_error.clone(),
            }
        } else {
            SaveStatus::Saved {
                at: self.last_save_time,
            }
        }
    }
}
