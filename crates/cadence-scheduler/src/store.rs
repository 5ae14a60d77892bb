//! Object-store seam and an in-process implementation of it.
//!
//! The reconciler only talks to storage through [`ObjectStore`]. Production
//! deployments plug in their own backend; [`MemoryStore`] backs the
//! controller binary and the test-suite.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use cadence_core::{ObjectKey, Uid};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    clock::{Clock, SystemClock},
    error::{OwnerLinkError, StoreError},
    types::{
        ExecutionRecord, ExecutionStatus, OwnerReference, ScheduleResource, API_VERSION,
        SCHEDULE_KIND,
    },
};

const EVENT_CAPACITY: usize = 1024;

/// What happens to an object's dependents when it is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Delete the object now, collect dependents afterwards.
    Background,
}

/// Sets the owner link on a freshly built execution.
///
/// The default implementation writes a controller [`OwnerReference`]
/// pointing at the schedule; stores with a type registry can override it to
/// reject kinds they do not know.
pub trait OwnerLinker {
    fn establish_owner_link(
        &self,
        owner: &ScheduleResource,
        child: &mut ExecutionRecord,
    ) -> Result<(), OwnerLinkError> {
        set_controller_reference(owner, child)
    }
}

/// Storage operations the reconciler depends on.
#[async_trait]
pub trait ObjectStore: OwnerLinker + Send + Sync {
    async fn get_schedule(&self, key: &ObjectKey) -> Result<ScheduleResource, StoreError>;

    /// Executions in `namespace` whose controller is the schedule `owner_name`.
    async fn list_executions(
        &self,
        namespace: &str,
        owner_name: &str,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] when the name is taken.
    async fn create_execution(&self, record: ExecutionRecord)
        -> Result<ExecutionRecord, StoreError>;

    async fn delete_execution(
        &self,
        key: &ObjectKey,
        propagation: PropagationPolicy,
    ) -> Result<(), StoreError>;

    /// Write `resource.status`; fails with [`StoreError::Conflict`] when
    /// `resource.metadata.resource_version` is stale.
    async fn update_status(&self, resource: &ScheduleResource)
        -> Result<ScheduleResource, StoreError>;
}

/// Run a store call under `cancel`: fail fast if it is already cancelled,
/// abandon the call if it is cancelled midway.
pub async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        result = call => result,
    }
}

/// Point `child` at `owner` as its managing controller.
pub fn set_controller_reference(
    owner: &ScheduleResource,
    child: &mut ExecutionRecord,
) -> Result<(), OwnerLinkError> {
    let owner_meta = &owner.metadata;
    if owner_meta.uid.is_empty() {
        return Err(OwnerLinkError::MissingOwnerUid { owner: owner.key() });
    }
    if owner_meta.namespace != child.metadata.namespace {
        return Err(OwnerLinkError::CrossNamespace {
            owner: owner.key(),
            owner_namespace: owner_meta.namespace.clone(),
            child_namespace: child.metadata.namespace.clone(),
        });
    }
    if let Some(existing) = child.metadata.controller_ref() {
        if existing.uid != owner_meta.uid {
            return Err(OwnerLinkError::AlreadyControlled {
                child: child.key(),
                kind: existing.kind.clone(),
                name: existing.name.clone(),
            });
        }
    }

    child
        .metadata
        .owner_references
        .retain(|r| r.uid != owner_meta.uid);
    child.metadata.owner_references.push(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: SCHEDULE_KIND.to_string(),
        name: owner_meta.name.clone(),
        uid: owner_meta.uid.clone(),
        controller: true,
        block_owner_deletion: true,
    });
    Ok(())
}

/// Key of the schedule controlling `record`, used for the owner index and
/// for routing execution events back to their schedule.
pub fn schedule_owner(record: &ExecutionRecord) -> Option<ObjectKey> {
    let owner = record.metadata.controller_ref()?;
    if owner.api_version != API_VERSION || owner.kind != SCHEDULE_KIND {
        return None;
    }
    Some(ObjectKey::new(&record.metadata.namespace, &owner.name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

/// Change notification published by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Schedule {
        key: ObjectKey,
        change: ChangeKind,
    },
    Execution {
        key: ObjectKey,
        owner: Option<ObjectKey>,
        change: ChangeKind,
    },
}

/// In-memory object store with an owner index and a change feed.
pub struct MemoryStore {
    schedules: DashMap<ObjectKey, ScheduleResource>,
    executions: DashMap<ObjectKey, ExecutionRecord>,
    /// schedule key -> names of the executions it controls
    owner_index: DashMap<ObjectKey, BTreeSet<String>>,
    revision: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creation timestamps are taken from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            schedules: DashMap::new(),
            executions: DashMap::new(),
            owner_index: DashMap::new(),
            revision: AtomicU64::new(0),
            events,
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event: StoreEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create or replace a schedule's metadata and spec, keeping its
    /// identity and status.
    pub fn apply_schedule(&self, mut resource: ScheduleResource) -> ScheduleResource {
        let key = resource.key();
        let revision = self.next_revision();
        let stored = match self.schedules.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get_mut();
                current.metadata.labels = resource.metadata.labels;
                current.metadata.annotations = resource.metadata.annotations;
                current.spec = resource.spec;
                current.metadata.resource_version = revision;
                current.clone()
            }
            Entry::Vacant(slot) => {
                if resource.metadata.uid.is_empty() {
                    resource.metadata.uid = Uid::new();
                }
                if resource.metadata.creation_timestamp.is_none() {
                    resource.metadata.creation_timestamp = Some(self.clock.now());
                }
                resource.metadata.resource_version = revision;
                slot.insert(resource.clone());
                resource
            }
        };
        debug!(schedule = %key, revision, "schedule applied");
        self.publish(StoreEvent::Schedule {
            key,
            change: ChangeKind::Applied,
        });
        stored
    }

    /// Remove a schedule and, like owner-based garbage collection, every
    /// execution it controls.
    pub fn delete_schedule(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let (_, removed) = self
            .schedules
            .remove(key)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;

        let owned: Vec<ObjectKey> = self
            .executions
            .iter()
            .filter(|e| {
                e.metadata
                    .controller_ref()
                    .is_some_and(|r| r.uid == removed.metadata.uid)
            })
            .map(|e| e.key().clone())
            .collect();
        for child in owned {
            self.remove_execution(&child);
        }

        self.publish(StoreEvent::Schedule {
            key: key.clone(),
            change: ChangeKind::Deleted,
        });
        Ok(())
    }

    /// Store an execution as-is (status included). Used to seed state and
    /// by [`ObjectStore::create_execution`].
    pub fn insert_execution(&self, mut record: ExecutionRecord) -> Result<ExecutionRecord, StoreError> {
        let key = record.key();
        let revision = self.next_revision();
        match self.executions.entry(key.clone()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists { key }),
            Entry::Vacant(slot) => {
                if record.metadata.uid.is_empty() {
                    record.metadata.uid = Uid::new();
                }
                if record.metadata.creation_timestamp.is_none() {
                    record.metadata.creation_timestamp = Some(self.clock.now());
                }
                record.metadata.resource_version = revision;
                slot.insert(record.clone());
            }
        }

        let owner = schedule_owner(&record);
        if let Some(owner) = &owner {
            self.owner_index
                .entry(owner.clone())
                .or_default()
                .insert(record.metadata.name.clone());
        }
        self.publish(StoreEvent::Execution {
            key,
            owner,
            change: ChangeKind::Applied,
        });
        Ok(record)
    }

    /// Overwrite an execution's status, as the job runtime would.
    pub fn set_execution_status(
        &self,
        key: &ObjectKey,
        status: ExecutionStatus,
    ) -> Result<ExecutionRecord, StoreError> {
        let revision = self.next_revision();
        let updated = {
            let mut record = self
                .executions
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
            record.status = status;
            record.metadata.resource_version = revision;
            record.clone()
        };
        self.publish(StoreEvent::Execution {
            key: key.clone(),
            owner: schedule_owner(&updated),
            change: ChangeKind::Applied,
        });
        Ok(updated)
    }

    pub fn execution(&self, key: &ObjectKey) -> Option<ExecutionRecord> {
        self.executions.get(key).map(|r| r.clone())
    }

    /// Every execution, ordered by key.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        let mut all: Vec<ExecutionRecord> = self.executions.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|r| r.key());
        all
    }

    pub fn schedule(&self, key: &ObjectKey) -> Option<ScheduleResource> {
        self.schedules.get(key).map(|r| r.clone())
    }

    pub fn schedule_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.schedules.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    fn remove_execution(&self, key: &ObjectKey) -> Option<ExecutionRecord> {
        let (_, removed) = self.executions.remove(key)?;
        let owner = schedule_owner(&removed);
        if let Some(owner) = &owner {
            if let Some(mut names) = self.owner_index.get_mut(owner) {
                names.remove(&removed.metadata.name);
            }
        }
        self.publish(StoreEvent::Execution {
            key: key.clone(),
            owner,
            change: ChangeKind::Deleted,
        });
        Some(removed)
    }
}

impl OwnerLinker for MemoryStore {}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_schedule(&self, key: &ObjectKey) -> Result<ScheduleResource, StoreError> {
        self.schedule(key)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn list_executions(
        &self,
        namespace: &str,
        owner_name: &str,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let owner = ObjectKey::new(namespace, owner_name);
        let names: Vec<String> = self
            .owner_index
            .get(&owner)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default();

        Ok(names
            .into_iter()
            .filter_map(|name| self.execution(&ObjectKey::new(namespace, name)))
            .collect())
    }

    async fn create_execution(
        &self,
        record: ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError> {
        self.insert_execution(record)
    }

    async fn delete_execution(
        &self,
        key: &ObjectKey,
        propagation: PropagationPolicy,
    ) -> Result<(), StoreError> {
        debug!(execution = %key, ?propagation, "deleting execution");
        self.remove_execution(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn update_status(
        &self,
        resource: &ScheduleResource,
    ) -> Result<ScheduleResource, StoreError> {
        let key = resource.key();
        let updated = {
            let mut current = self
                .schedules
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
            let actual = current.metadata.resource_version;
            if actual != resource.metadata.resource_version {
                return Err(StoreError::Conflict {
                    key,
                    expected: resource.metadata.resource_version,
                    actual,
                });
            }
            // an unchanged status is a no-op: no new version, no event
            if current.status == resource.status {
                return Ok(current.clone());
            }
            current.status = resource.status.clone();
            current.metadata.resource_version = self.next_revision();
            current.clone()
        };
        self.publish(StoreEvent::Schedule {
            key,
            change: ChangeKind::Applied,
        });
        Ok(updated)
    }
}
