use chrono::{DateTime, SecondsFormat, Utc};

use crate::{
    error::OwnerLinkError,
    store::OwnerLinker,
    types::{ExecutionRecord, ExecutionStatus, ObjectMeta, ScheduleResource},
};

/// Deterministic execution name: `{schedule}-{unix seconds of nominal time}`.
///
/// Two passes racing for the same nominal time produce the same name, so
/// the store rejects the second create.
pub fn execution_name(schedule_name: &str, scheduled_time: DateTime<Utc>) -> String {
    format!("{}-{}", schedule_name, scheduled_time.timestamp())
}

/// Build the execution for `scheduled_time` from the schedule's template.
///
/// Template labels and annotations are copied, then the scheduled-at
/// annotation is set to the nominal time (not the wall-clock time).
pub fn build_execution<L>(
    schedule: &ScheduleResource,
    scheduled_time: DateTime<Utc>,
    annotation_key: &str,
    linker: &L,
) -> Result<ExecutionRecord, OwnerLinkError>
where
    L: OwnerLinker + ?Sized,
{
    let template = &schedule.spec.job_template;

    let mut annotations = template.annotations.clone();
    annotations.insert(
        annotation_key.to_string(),
        scheduled_time.to_rfc3339_opts(SecondsFormat::Secs, true),
    );

    let mut record = ExecutionRecord {
        metadata: ObjectMeta {
            name: execution_name(&schedule.metadata.name, scheduled_time),
            namespace: schedule.metadata.namespace.clone(),
            labels: template.labels.clone(),
            annotations,
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: ExecutionStatus::default(),
    };
    linker.establish_owner_link(schedule, &mut record)?;
    Ok(record)
}
