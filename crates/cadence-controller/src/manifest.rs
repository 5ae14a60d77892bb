use std::path::Path;

use cadence_core::CadenceError;
use cadence_scheduler::{schedule::CronSchedule, MemoryStore, ScheduleResource};
use tracing::{info, warn};

/// Parse a manifest: a JSON array of schedule resources, or a single one.
pub fn parse(text: &str, path: &str) -> Result<Vec<ScheduleResource>, CadenceError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| CadenceError::Manifest {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    let resources = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|one| vec![one])
    };
    resources.map_err(|e| CadenceError::Manifest {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

pub fn load(path: &Path) -> Result<Vec<ScheduleResource>, CadenceError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, &path.display().to_string())
}

/// Apply every resource to `store`. Returns how many were applied.
///
/// Schedules with an unparseable expression are still applied; the
/// reconciler reports them on its first pass.
pub fn seed(store: &MemoryStore, resources: Vec<ScheduleResource>) -> usize {
    let count = resources.len();
    for resource in resources {
        if let Err(e) = CronSchedule::parse(&resource.spec.schedule) {
            warn!(schedule = %resource.key(), "schedule will not run: {e}");
        }
        let stored = store.apply_schedule(resource);
        info!(
            schedule = %stored.key(),
            expression = %stored.spec.schedule,
            policy = %stored.spec.concurrency_policy,
            "schedule loaded"
        );
    }
    count
}
