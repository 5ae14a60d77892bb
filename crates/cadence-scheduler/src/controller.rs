use std::sync::Arc;

use cadence_core::{config::ControllerConfig, ObjectKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    clock::Clock,
    concurrency::{enforce, Admission},
    error::{ReconcileError, Result, ScheduleError, StoreError},
    factory::build_execution,
    history::prune,
    outcome::{Action, ReconcileOutcome},
    schedule::{next_schedule, CronSchedule},
    status::reconstruct_status,
    store::{cancellable, ObjectStore},
    types::Outcome,
};

/// Knobs the reconciler takes from configuration.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Full annotation key carrying the nominal scheduled time.
    pub annotation_key: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ReconcileOptions {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            annotation_key: config.scheduled_at_annotation(),
        }
    }
}

/// Drives one schedule toward its declared state, one pass per call.
///
/// Every pass recomputes everything from the store, so running it twice, or
/// after a stale read, is harmless.
pub struct ReconcileController {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    options: ReconcileOptions,
}

/// Map a store failure to a pass error, keeping cancellation distinct.
fn store_failure(e: StoreError, wrap: impl FnOnce(StoreError) -> ReconcileError) -> ReconcileError {
    match e {
        StoreError::Cancelled => ReconcileError::Cancelled,
        other => wrap(other),
    }
}

impl ReconcileController {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, options: ReconcileOptions) -> Self {
        Self {
            store,
            clock,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Run one reconcile pass for `key`.
    ///
    /// `Ok` means the pass reached a stopping point the driver should not
    /// retry early; `requeue_after` says when the next occurrence is due.
    /// `Err` asks the driver to retry with backoff.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let store = self.store.as_ref();

        // 1: load the schedule
        let mut schedule = match cancellable(cancel, store.get_schedule(key)).await {
            Ok(schedule) => schedule,
            Err(StoreError::NotFound { .. }) => {
                debug!(schedule = %key, "schedule not found, waiting for next event");
                return Ok(ReconcileOutcome::done(Action::ScheduleGone));
            }
            Err(e) => {
                error!(schedule = %key, "unable to fetch schedule: {e}");
                return Err(store_failure(e, |source| ReconcileError::Fetch {
                    key: key.clone(),
                    source,
                }));
            }
        };

        // 2: list owned executions and rebuild status
        let executions = cancellable(cancel, store.list_executions(&key.namespace, &key.name))
            .await
            .map_err(|e| {
                error!(schedule = %key, "unable to list executions: {e}");
                store_failure(e, |source| ReconcileError::List {
                    key: key.clone(),
                    source,
                })
            })?;

        let rebuilt = reconstruct_status(&executions, &self.options.annotation_key);
        debug!(
            schedule = %key,
            active = rebuilt.active.len(),
            succeeded = rebuilt.succeeded.len(),
            failed = rebuilt.failed.len(),
            "execution count"
        );
        let mut warnings = rebuilt.warnings;

        // 3: persist the status
        schedule.status = rebuilt.status;
        let schedule = cancellable(cancel, store.update_status(&schedule))
            .await
            .map_err(|e| {
                error!(schedule = %key, "unable to update schedule status: {e}");
                store_failure(e, |source| ReconcileError::UpdateStatus {
                    key: key.clone(),
                    source,
                })
            })?;

        // 4: suspended schedules only get their status refreshed
        if schedule.spec.suspend {
            debug!(schedule = %key, "schedule suspended, skipping");
            return Ok(ReconcileOutcome::done(Action::Suspended).with_warnings(warnings));
        }

        // 5: work out what is due; `now` is read once for the whole pass
        let now = self.clock.now();
        let (times, deadline) = match CronSchedule::parse(&schedule.spec.schedule).and_then(|cron| {
            let deadline = schedule.spec.starting_deadline()?;
            let earliest = schedule
                .status
                .last_schedule_time
                .or(schedule.metadata.creation_timestamp)
                .unwrap_or(now);
            next_schedule(&cron, earliest, deadline, now).map(|times| (times, deadline))
        }) {
            Ok(found) => found,
            Err(e) => {
                // retrying will not help until the schedule is edited
                error!(schedule = %key, code = e.code(), "unable to figure out schedule: {e}");
                let action = match e {
                    ScheduleError::TooManyMissedRuns { .. } => Action::TooManyMissedRuns,
                    ScheduleError::InvalidSchedule { reason, .. } => {
                        Action::InvalidSchedule { reason }
                    }
                };
                return Ok(ReconcileOutcome::done(action).with_warnings(warnings));
            }
        };

        // 6: every exit from here requeues for the next occurrence
        let requeue_after = times.requeue_after(now);

        // 7: nothing missed
        let Some(scheduled_time) = times.last_missed else {
            debug!(schedule = %key, %now, next_run = %times.next, "no upcoming scheduled times, sleeping until next");
            return Ok(ReconcileOutcome::requeue(Action::Waiting, requeue_after).with_warnings(warnings));
        };

        // 8: too late to start this one
        if let Some(deadline) = deadline {
            // past the end of time means never too late
            let too_late = scheduled_time
                .checked_add_signed(deadline)
                .is_some_and(|limit| limit < now);
            if too_late {
                debug!(
                    schedule = %key,
                    current_run = %scheduled_time,
                    next_run = %times.next,
                    "missed starting deadline for last run, sleeping till next"
                );
                return Ok(ReconcileOutcome::requeue(
                    Action::DeadlineExceeded { scheduled_time },
                    requeue_after,
                )
                .with_warnings(warnings));
            }
        }

        // 9: concurrency policy
        let admission = enforce(
            store,
            schedule.spec.concurrency_policy,
            &rebuilt.active,
            cancel,
        )
        .await?;
        let replaced = match admission {
            Admission::Skip { active } => {
                return Ok(ReconcileOutcome::requeue(
                    Action::Skipped {
                        scheduled_time,
                        active,
                    },
                    requeue_after,
                )
                .with_warnings(warnings));
            }
            Admission::Replace { victims } => victims.len(),
            Admission::Proceed => 0,
        };

        // 10: build and create the execution
        let record = match build_execution(
            &schedule,
            scheduled_time,
            &self.options.annotation_key,
            store,
        ) {
            Ok(record) => record,
            Err(e) => {
                // not retried until the next occurrence
                error!(schedule = %key, current_run = %scheduled_time, "unable to construct execution from template: {e}");
                return Ok(ReconcileOutcome::requeue(
                    Action::ConstructionFailed {
                        scheduled_time,
                        reason: e.to_string(),
                    },
                    requeue_after,
                )
                .with_warnings(warnings));
            }
        };
        let execution_key = record.key();

        let action = match cancellable(cancel, store.create_execution(record)).await {
            Ok(created) => {
                info!(
                    schedule = %key,
                    execution = %created.key(),
                    current_run = %scheduled_time,
                    next_run = %times.next,
                    "created execution for scheduled run"
                );
                Action::Created {
                    execution: created.metadata.name,
                    scheduled_time,
                    replaced,
                }
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(schedule = %key, execution = %execution_key, "execution for this run already exists");
                Action::AlreadyLaunched {
                    execution: execution_key.name,
                    scheduled_time,
                }
            }
            Err(e) => {
                error!(schedule = %key, execution = %execution_key, "unable to create execution: {e}");
                return Err(store_failure(e, |source| ReconcileError::Create {
                    key: execution_key,
                    source,
                }));
            }
        };

        // 11: retention; failures never change the result
        let spec = &schedule.spec;
        let pruned_ok = prune(
            store,
            &rebuilt.succeeded,
            spec.successful_jobs_history_limit,
            Outcome::Succeeded,
            cancel,
        )
        .await;
        let pruned_failed = prune(
            store,
            &rebuilt.failed,
            spec.failed_jobs_history_limit,
            Outcome::Failed,
            cancel,
        )
        .await;
        warnings.extend(pruned_ok.warnings);
        warnings.extend(pruned_failed.warnings);

        // 12: wake up for the next occurrence
        Ok(ReconcileOutcome::requeue(action, requeue_after).with_warnings(warnings))
    }
}
