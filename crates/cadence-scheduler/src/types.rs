use std::collections::BTreeMap;

use cadence_core::{ObjectKey, Uid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

pub const API_VERSION: &str = "batch.cadence.dev/v1";
pub const SCHEDULE_KIND: &str = "CronSchedule";
pub const EXECUTION_KIND: &str = "Execution";

pub const CONDITION_COMPLETE: &str = "Complete";
pub const CONDITION_FAILED: &str = "Failed";

/// Metadata common to schedules and execution records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: Uid,
    /// Assigned by the store on create.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token; bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl ObjectMeta {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// The owner reference flagged as the managing controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// Weak back-reference from a child to its owner (name + uid, never a pointer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uid,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

/// Pointer to an object, as stored in `ScheduleStatus::active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: Uid,
    pub resource_version: u64,
}

/// How overlapping executions of one schedule are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    /// Runs may overlap.
    #[default]
    Allow,
    /// A due run is dropped while any execution is still active.
    Forbid,
    /// Active executions are deleted before the due run is launched.
    Replace,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConcurrencyPolicy::Allow => "Allow",
            ConcurrencyPolicy::Forbid => "Forbid",
            ConcurrencyPolicy::Replace => "Replace",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConcurrencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Allow" => Ok(ConcurrencyPolicy::Allow),
            "Forbid" => Ok(ConcurrencyPolicy::Forbid),
            "Replace" => Ok(ConcurrencyPolicy::Replace),
            other => Err(format!("unknown concurrency policy: {other}")),
        }
    }
}

/// Labels, annotations and payload copied onto every execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Opaque payload for the job runtime; never interpreted here.
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// User-declared desired state of a schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Cron expression, see [`crate::schedule::CronSchedule::parse`].
    pub schedule: String,
    /// Late runs older than this many seconds are abandoned.
    #[serde(default)]
    pub starting_deadline_seconds: Option<i64>,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    /// Stops future launches; running executions are left alone.
    #[serde(default)]
    pub suspend: bool,
    pub job_template: ExecutionTemplate,
    /// `None` keeps every succeeded execution.
    #[serde(default)]
    pub successful_jobs_history_limit: Option<u32>,
    /// `None` keeps every failed execution.
    #[serde(default)]
    pub failed_jobs_history_limit: Option<u32>,
}

impl ScheduleSpec {
    /// Starting deadline as a duration. Values past what a duration can
    /// hold saturate; negative values are rejected.
    pub fn starting_deadline(&self) -> Result<Option<chrono::Duration>, ScheduleError> {
        let Some(seconds) = self.starting_deadline_seconds else {
            return Ok(None);
        };
        if seconds < 0 {
            return Err(ScheduleError::InvalidSchedule {
                expression: self.schedule.clone(),
                reason: format!("startingDeadlineSeconds must not be negative, got {seconds}"),
            });
        }
        Ok(Some(
            chrono::Duration::try_seconds(seconds).unwrap_or_else(chrono::Duration::max_value),
        ))
    }
}

/// Observed state, rebuilt from child executions on every pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    #[serde(default)]
    pub active: Vec<ObjectReference>,
    #[serde(default)]
    pub last_schedule_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResource {
    pub metadata: ObjectMeta,
    pub spec: ScheduleSpec,
    #[serde(default)]
    pub status: ScheduleStatus,
}

impl ScheduleResource {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A condition written by the job runtime (`Complete`, `Failed`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ExecutionCondition {
    pub fn new(kind: &str, status: ConditionStatus) -> Self {
        Self {
            kind: kind.to_string(),
            status,
            last_transition_time: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<ExecutionCondition>,
}

/// Completion state derived from an execution's conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Neither `Complete` nor `Failed` is true yet.
    Active,
    Succeeded,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Active => "active",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One concrete run launched for a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: ExecutionStatus,
}

impl ExecutionRecord {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// First condition that is `Complete=True` or `Failed=True` wins.
    pub fn outcome(&self) -> Outcome {
        for c in &self.status.conditions {
            if c.status != ConditionStatus::True {
                continue;
            }
            match c.kind.as_str() {
                CONDITION_COMPLETE => return Outcome::Succeeded,
                CONDITION_FAILED => return Outcome::Failed,
                _ => {}
            }
        }
        Outcome::Active
    }

    pub fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: API_VERSION.to_string(),
            kind: EXECUTION_KIND.to_string(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            resource_version: self.metadata.resource_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(conditions: Vec<ExecutionCondition>) -> ExecutionRecord {
        ExecutionRecord {
            metadata: ObjectMeta {
                name: "nightly-1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: serde_json::Value::Null,
            status: ExecutionStatus {
                start_time: None,
                conditions,
            },
        }
    }

    #[test]
    fn outcome_follows_true_conditions_only() {
        assert_eq!(record_with(vec![]).outcome(), Outcome::Active);
        assert_eq!(
            record_with(vec![ExecutionCondition::new(CONDITION_COMPLETE, ConditionStatus::False)])
                .outcome(),
            Outcome::Active
        );
        assert_eq!(
            record_with(vec![ExecutionCondition::new(CONDITION_COMPLETE, ConditionStatus::True)])
                .outcome(),
            Outcome::Succeeded
        );
        assert_eq!(
            record_with(vec![
                ExecutionCondition::new("Suspended", ConditionStatus::True),
                ExecutionCondition::new(CONDITION_FAILED, ConditionStatus::True),
            ])
            .outcome(),
            Outcome::Failed
        );
    }

    #[test]
    fn policy_literals_round_trip() {
        for policy in [
            ConcurrencyPolicy::Allow,
            ConcurrencyPolicy::Forbid,
            ConcurrencyPolicy::Replace,
        ] {
            let parsed: ConcurrencyPolicy = policy.to_string().parse().unwrap();
            assert_eq!(parsed, policy);
        }
        assert!("allow".parse::<ConcurrencyPolicy>().is_err());
    }

    #[test]
    fn schedule_deserializes_camel_case_with_defaults() {
        let json = r#"{
            "metadata": { "name": "report" },
            "spec": {
                "schedule": "*/5 * * * *",
                "concurrencyPolicy": "Forbid",
                "startingDeadlineSeconds": 30,
                "jobTemplate": { "labels": { "app": "report" } }
            }
        }"#;
        let schedule: ScheduleResource = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.metadata.namespace, "default");
        assert_eq!(schedule.spec.concurrency_policy, ConcurrencyPolicy::Forbid);
        assert_eq!(
            schedule.spec.starting_deadline(),
            Ok(Some(chrono::Duration::seconds(30)))
        );
        assert!(!schedule.spec.suspend);
        assert_eq!(schedule.spec.successful_jobs_history_limit, None);
        assert_eq!(schedule.status, ScheduleStatus::default());
    }

    #[test]
    fn starting_deadline_saturates_and_rejects_negative() {
        let mut spec = ScheduleSpec {
            schedule: "* * * * *".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.starting_deadline(), Ok(None));

        spec.starting_deadline_seconds = Some(i64::MAX);
        assert_eq!(
            spec.starting_deadline(),
            Ok(Some(chrono::Duration::max_value()))
        );

        spec.starting_deadline_seconds = Some(10_000_000_000_000);
        assert!(spec.starting_deadline().unwrap().is_some());

        spec.starting_deadline_seconds = Some(-1);
        assert_eq!(spec.starting_deadline().unwrap_err().code(), "INVALID_SCHEDULE");
    }
}
