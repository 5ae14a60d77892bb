use cadence_core::ObjectKey;
use thiserror::Error;

/// Errors from parsing a cron expression or walking its occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The expression cannot be parsed, or never fires again.
    #[error("Invalid schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// More occurrences were missed than the controller is willing to walk.
    #[error(
        "Too many missed start times (> {limit}). Set or decrease startingDeadlineSeconds or check clock skew"
    )]
    TooManyMissedRuns { limit: usize },
}

impl ScheduleError {
    pub fn code(&self) -> &'static str {
        match self {
            ScheduleError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            ScheduleError::TooManyMissedRuns { .. } => "TOO_MANY_MISSED_RUNS",
        }
    }
}

/// Outcome of a failed call into the object store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Object not found: {key}")]
    NotFound { key: ObjectKey },

    #[error("Object already exists: {key}")]
    AlreadyExists { key: ObjectKey },

    /// The write was based on a stale `resource_version`.
    #[error("Conflict writing {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::AlreadyExists { .. } => "ALREADY_EXISTS",
            StoreError::Conflict { .. } => "CONFLICT",
            StoreError::Cancelled => "CANCELLED",
            StoreError::Backend(_) => "BACKEND_ERROR",
        }
    }
}

/// The owner link between a schedule and a new execution could not be set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OwnerLinkError {
    #[error("Owner {owner} has no uid; it was never persisted")]
    MissingOwnerUid { owner: ObjectKey },

    #[error("Owner {owner} is in namespace {owner_namespace}, child is in {child_namespace}")]
    CrossNamespace {
        owner: ObjectKey,
        owner_namespace: String,
        child_namespace: String,
    },

    #[error("{child} is already controlled by {kind} {name}")]
    AlreadyControlled {
        child: ObjectKey,
        kind: String,
        name: String,
    },

    #[error("Unregistered owner kind: {0}")]
    UnknownKind(String),
}

/// Failures that end a reconcile pass and ask the driver to retry with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Unable to fetch schedule {key}: {source}")]
    Fetch { key: ObjectKey, source: StoreError },

    #[error("Unable to list executions of {key}: {source}")]
    List { key: ObjectKey, source: StoreError },

    #[error("Unable to update status of {key}: {source}")]
    UpdateStatus { key: ObjectKey, source: StoreError },

    #[error("Unable to delete active execution {key}: {source}")]
    DeleteActive { key: ObjectKey, source: StoreError },

    #[error("Unable to create execution {key}: {source}")]
    Create { key: ObjectKey, source: StoreError },

    #[error("Reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::Fetch { .. } => "FETCH_FAILED",
            ReconcileError::List { .. } => "LIST_FAILED",
            ReconcileError::UpdateStatus { .. } => "STATUS_UPDATE_FAILED",
            ReconcileError::DeleteActive { .. } => "DELETE_ACTIVE_FAILED",
            ReconcileError::Create { .. } => "CREATE_FAILED",
            ReconcileError::Cancelled => "CANCELLED",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
