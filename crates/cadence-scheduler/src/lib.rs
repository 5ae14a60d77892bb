//! `cadence-scheduler` — level-triggered controller for recurring executions.
//!
//! # Overview
//!
//! A [`types::ScheduleResource`] declares a cron expression and an execution
//! template. Each [`controller::ReconcileController::reconcile`] pass reads the
//! schedule and its owned executions from an [`store::ObjectStore`], rebuilds
//! the status, and launches at most one execution for the most recent missed
//! occurrence. Passes are driven by [`driver::ReconcileDriver`], which feeds a
//! deduplicating [`queue::WorkQueue`] from store change events and requeue
//! delays.
//!
//! # Concurrency policies
//!
//! | Policy    | Behaviour when an execution is still active          |
//! |-----------|------------------------------------------------------|
//! | `Allow`   | Launch alongside it                                  |
//! | `Forbid`  | Skip this occurrence                                 |
//! | `Replace` | Delete the active executions, then launch            |

pub mod clock;
pub mod concurrency;
pub mod controller;
pub mod driver;
pub mod error;
pub mod factory;
pub mod history;
pub mod outcome;
pub mod queue;
pub mod schedule;
pub mod status;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use controller::{ReconcileController, ReconcileOptions};
pub use driver::ReconcileDriver;
pub use error::{ReconcileError, Result, ScheduleError, StoreError};
pub use outcome::{Action, ReconcileOutcome, Warning};
pub use schedule::{next_schedule, CronSchedule, ScheduleTimes, MAX_MISSED_RUNS};
pub use store::{MemoryStore, ObjectStore, StoreEvent};
pub use types::{ConcurrencyPolicy, ExecutionRecord, ScheduleResource, ScheduleSpec};
