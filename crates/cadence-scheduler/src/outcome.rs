use std::time::Duration;

use cadence_core::ObjectKey;
use chrono::{DateTime, Utc};

use crate::types::Outcome;

/// A problem that was logged and skipped without failing the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The scheduled-at annotation on an execution could not be parsed.
    MalformedScheduledTime {
        execution: ObjectKey,
        value: String,
        error: String,
    },
    /// Deleting an execution past its retention limit failed.
    PruneFailed {
        execution: ObjectKey,
        outcome: Outcome,
        error: String,
    },
}

/// Where a reconcile pass stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The schedule no longer exists.
    ScheduleGone,
    /// Status was refreshed; launching is paused.
    Suspended,
    /// The cron expression is unusable until the schedule is edited.
    InvalidSchedule { reason: String },
    /// Too many occurrences were missed to walk them safely.
    TooManyMissedRuns,
    /// Nothing is due yet.
    Waiting,
    /// The due run is older than the starting deadline.
    DeadlineExceeded { scheduled_time: DateTime<Utc> },
    /// `Forbid` policy: an execution is still active.
    Skipped { scheduled_time: DateTime<Utc>, active: usize },
    /// The execution could not be linked to its schedule.
    ConstructionFailed { scheduled_time: DateTime<Utc>, reason: String },
    /// A record for this nominal time already exists.
    AlreadyLaunched { execution: String, scheduled_time: DateTime<Utc> },
    /// A new execution was created.
    Created {
        execution: String,
        scheduled_time: DateTime<Utc>,
        replaced: usize,
    },
}

/// Result of one successful reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub action: Action,
    /// When to reconcile again; `None` waits for the next change event.
    pub requeue_after: Option<Duration>,
    pub warnings: Vec<Warning>,
}

impl ReconcileOutcome {
    pub fn done(action: Action) -> Self {
        Self {
            action,
            requeue_after: None,
            warnings: Vec::new(),
        }
    }

    pub fn requeue(action: Action, after: Duration) -> Self {
        Self {
            action,
            requeue_after: Some(after),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<Warning>) -> Self {
        self.warnings = warnings;
        self
    }
}
