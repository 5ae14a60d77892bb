use cadence_core::ObjectKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{ReconcileError, StoreError},
    store::{cancellable, ObjectStore, PropagationPolicy},
    types::{ConcurrencyPolicy, ExecutionRecord},
};

/// Whether a due run may be launched next to the executions still active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Launch alongside whatever is running.
    Proceed,
    /// `Forbid`: drop this run, something is still active.
    Skip { active: usize },
    /// `Replace`: these executions must go before the launch.
    Replace { victims: Vec<ObjectKey> },
}

/// Decide what `policy` demands given the active executions.
pub fn admit(policy: ConcurrencyPolicy, active: &[ExecutionRecord]) -> Admission {
    match policy {
        ConcurrencyPolicy::Allow => Admission::Proceed,
        ConcurrencyPolicy::Forbid if !active.is_empty() => Admission::Skip {
            active: active.len(),
        },
        ConcurrencyPolicy::Forbid => Admission::Proceed,
        ConcurrencyPolicy::Replace if !active.is_empty() => Admission::Replace {
            victims: active.iter().map(ExecutionRecord::key).collect(),
        },
        ConcurrencyPolicy::Replace => Admission::Proceed,
    }
}

/// Apply `policy`, deleting active executions when it says `Replace`.
///
/// An execution that is already gone counts as deleted. Any other delete
/// failure aborts with an error so nothing is launched on top of a run that
/// could not be removed.
pub async fn enforce<S>(
    store: &S,
    policy: ConcurrencyPolicy,
    active: &[ExecutionRecord],
    cancel: &CancellationToken,
) -> Result<Admission, ReconcileError>
where
    S: ObjectStore + ?Sized,
{
    let admission = admit(policy, active);
    match &admission {
        Admission::Proceed => {}
        Admission::Skip { active } => {
            debug!(active, "concurrency policy blocks concurrent runs, skipping");
        }
        Admission::Replace { victims } => {
            for key in victims {
                match cancellable(
                    cancel,
                    store.delete_execution(key, PropagationPolicy::Background),
                )
                .await
                {
                    Ok(()) => info!(execution = %key, "deleted active execution for replacement"),
                    Err(StoreError::NotFound { .. }) => {
                        debug!(execution = %key, "active execution already gone")
                    }
                    Err(StoreError::Cancelled) => return Err(ReconcileError::Cancelled),
                    Err(source) => {
                        error!(execution = %key, "unable to delete active execution: {source}");
                        return Err(ReconcileError::DeleteActive {
                            key: key.clone(),
                            source,
                        });
                    }
                }
            }
        }
    }
    Ok(admission)
}
