use std::cmp::Ordering;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    error::StoreError,
    outcome::Warning,
    store::{cancellable, ObjectStore, PropagationPolicy},
    types::{ExecutionRecord, Outcome},
};

/// What a pruning round did for one outcome class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub warnings: Vec<Warning>,
}

/// Oldest first; an execution that never started sorts before any that did.
/// Name breaks ties so the order is total.
fn by_start_time(a: &ExecutionRecord, b: &ExecutionRecord) -> Ordering {
    match (a.status.start_time, b.status.start_time) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
    .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// Executions beyond the newest `limit`, oldest first. `None` keeps all.
pub fn select_for_pruning(records: &[ExecutionRecord], limit: Option<u32>) -> Vec<&ExecutionRecord> {
    let Some(limit) = limit else {
        return Vec::new();
    };
    let mut sorted: Vec<&ExecutionRecord> = records.iter().collect();
    sorted.sort_by(|a, b| by_start_time(a, b));

    let excess = sorted.len().saturating_sub(limit as usize);
    sorted.truncate(excess);
    sorted
}

/// Delete finished executions past the retention limit.
///
/// Best-effort: an execution that is already gone counts as deleted, any
/// other failure is logged and reported as a warning. Nothing is retried.
pub async fn prune<S>(
    store: &S,
    records: &[ExecutionRecord],
    limit: Option<u32>,
    outcome: Outcome,
    cancel: &CancellationToken,
) -> PruneReport
where
    S: ObjectStore + ?Sized,
{
    let mut report = PruneReport::default();
    for record in select_for_pruning(records, limit) {
        let key = record.key();
        match cancellable(
            cancel,
            store.delete_execution(&key, PropagationPolicy::Background),
        )
        .await
        {
            Ok(()) | Err(StoreError::NotFound { .. }) => {
                info!(execution = %key, %outcome, "deleted old execution");
                report.deleted.push(key.name);
            }
            Err(e) => {
                error!(execution = %key, %outcome, "unable to delete old execution: {e}");
                report.warnings.push(Warning::PruneFailed {
                    execution: key,
                    outcome,
                    error: e.to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{
        ConditionStatus, ExecutionCondition, ExecutionStatus, ObjectMeta, CONDITION_FAILED,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
    }

    fn failed(name: &str, started: Option<DateTime<Utc>>) -> ExecutionRecord {
        ExecutionRecord {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: serde_json::Value::Null,
            status: ExecutionStatus {
                start_time: started,
                conditions: vec![ExecutionCondition::new(CONDITION_FAILED, ConditionStatus::True)],
            },
        }
    }

    fn names(records: &[&ExecutionRecord]) -> Vec<String> {
        records.iter().map(|r| r.name().to_string()).collect()
    }

    #[test]
    fn unlimited_keeps_everything() {
        let records = vec![failed("a", None), failed("b", Some(t0()))];
        assert!(select_for_pruning(&records, None).is_empty());
    }

    #[test]
    fn keeps_newest_by_start_time() {
        // deliberately out of order
        let records = vec![
            failed("mid", Some(t0() + Duration::minutes(5))),
            failed("new", Some(t0() + Duration::minutes(10))),
            failed("old", Some(t0())),
        ];
        assert_eq!(names(&select_for_pruning(&records, Some(1))), vec!["old", "mid"]);
        assert_eq!(names(&select_for_pruning(&records, Some(2))), vec!["old"]);
        assert!(select_for_pruning(&records, Some(3)).is_empty());
        assert!(select_for_pruning(&records, Some(10)).is_empty());
        assert_eq!(select_for_pruning(&records, Some(0)).len(), 3);
    }

    #[test]
    fn never_started_is_pruned_first() {
        let records = vec![
            failed("started", Some(t0())),
            failed("pending-b", None),
            failed("pending-a", None),
        ];
        assert_eq!(
            names(&select_for_pruning(&records, Some(1))),
            vec!["pending-a", "pending-b"]
        );
    }

    #[tokio::test]
    async fn prunes_two_oldest_of_three_failed() {
        let store = MemoryStore::new();
        let records: Vec<ExecutionRecord> = [0, 1, 2]
            .iter()
            .map(|i| {
                store
                    .insert_execution(failed(
                        &format!("f{i}"),
                        Some(t0() + Duration::minutes(*i)),
                    ))
                    .unwrap()
            })
            .collect();

        let report = prune(
            &store,
            &records,
            Some(1),
            Outcome::Failed,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(report.deleted, vec!["f0".to_string(), "f1".to_string()]);
        assert!(report.warnings.is_empty());
        let left: Vec<String> = store.executions().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(left, vec!["f2".to_string()]);
    }

    #[tokio::test]
    async fn already_deleted_is_not_a_warning() {
        let store = MemoryStore::new();
        let records = vec![failed("gone", Some(t0())), failed("kept", Some(t0() + Duration::hours(1)))];
        let report = prune(
            &store,
            &records,
            Some(1),
            Outcome::Failed,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(report.deleted, vec!["gone".to_string()]);
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn cancelled_deletes_become_warnings() {
        let store = MemoryStore::new();
        let records = vec![
            store.insert_execution(failed("a", Some(t0()))).unwrap(),
            store.insert_execution(failed("b", Some(t0() + Duration::minutes(1)))).unwrap(),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = prune(&store, &records, Some(0), Outcome::Failed, &cancel).await;
        assert!(report.deleted.is_empty());
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(store.executions().len(), 2);
    }
}
