use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    outcome::Warning,
    types::{ExecutionRecord, Outcome, ScheduleStatus},
};

/// Executions split by completion state, plus the status derived from them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub status: ScheduleStatus,
    pub active: Vec<ExecutionRecord>,
    pub succeeded: Vec<ExecutionRecord>,
    pub failed: Vec<ExecutionRecord>,
    pub warnings: Vec<Warning>,
}

/// Nominal scheduled time stamped on an execution.
///
/// `Ok(None)` when the annotation is absent, `Err` when it is present but not
/// RFC 3339.
pub fn scheduled_time(
    record: &ExecutionRecord,
    annotation_key: &str,
) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    match record.metadata.annotations.get(annotation_key) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw).map(|t| Some(t.with_timezone(&Utc))),
    }
}

/// Rebuild a schedule's status from the executions it owns.
///
/// `last_schedule_time` is the latest nominal time over every execution,
/// finished or not. Executions with an unreadable annotation are still
/// classified, but ignored for the timestamp and reported as warnings.
pub fn reconstruct_status(records: &[ExecutionRecord], annotation_key: &str) -> Reconstruction {
    let mut out = Reconstruction::default();
    let mut most_recent: Option<DateTime<Utc>> = None;

    for record in records {
        match record.outcome() {
            Outcome::Active => out.active.push(record.clone()),
            Outcome::Succeeded => out.succeeded.push(record.clone()),
            Outcome::Failed => out.failed.push(record.clone()),
        }

        match scheduled_time(record, annotation_key) {
            Ok(Some(t)) => {
                if most_recent.map_or(true, |m| m < t) {
                    most_recent = Some(t);
                }
            }
            Ok(None) => {}
            Err(e) => {
                let value = record
                    .metadata
                    .annotations
                    .get(annotation_key)
                    .cloned()
                    .unwrap_or_default();
                warn!(execution = %record.key(), %value, "unable to parse scheduled time: {e}");
                out.warnings.push(Warning::MalformedScheduledTime {
                    execution: record.key(),
                    value,
                    error: e.to_string(),
                });
            }
        }
    }

    out.status = ScheduleStatus {
        active: out.active.iter().map(ExecutionRecord::object_reference).collect(),
        last_schedule_time: most_recent,
    };
    out
}
