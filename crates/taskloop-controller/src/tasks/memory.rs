//! In-process [`RunStore`]
//!
//! Behaves like a small API server: objects get a uid, creation timestamp and
//! resource version on create, lists honour equality label selectors, status
//! updates are checked against the resource version, and every call is
//! recorded in an action log. Faults can be queued per verb and resource.

use crate::crds::{Run, RunStatus, TaskLoop, TaskRun, TASKRUN_SPEC_STATUS_CANCELLED};
use crate::tasks::store::{selector_matches, RunStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Store operations, as recorded in the action log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    UpdateStatus,
    Patch,
}

/// Resource kinds held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Run,
    TaskLoop,
    TaskRun,
}

impl Resource {
    fn kind(self) -> &'static str {
        match self {
            Self::Run => "Run",
            Self::TaskLoop => "TaskLoop",
            Self::TaskRun => "TaskRun",
        }
    }
}

/// One recorded store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAction {
    pub verb: Verb,
    pub resource: Resource,
    pub namespace: String,
    /// Empty for lists
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    /// The call fails without touching the store
    Fail,
    /// The call is applied but the caller sees an error
    LoseResponse,
}

#[derive(Debug, Clone)]
struct Fault {
    verb: Verb,
    resource: Resource,
    kind: FaultKind,
    message: String,
}

type Key = (String, String);

#[derive(Default)]
struct State {
    runs: BTreeMap<Key, Run>,
    task_loops: BTreeMap<Key, TaskLoop>,
    task_runs: BTreeMap<Key, TaskRun>,
    actions: Vec<StoreAction>,
    faults: Vec<Fault>,
    version: u64,
}

impl State {
    fn record(&mut self, verb: Verb, resource: Resource, namespace: &str, name: &str) {
        self.actions.push(StoreAction {
            verb,
            resource,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    fn take_fault(&mut self, verb: Verb, resource: Resource) -> Option<Fault> {
        let index = self
            .faults
            .iter()
            .position(|f| f.verb == verb && f.resource == resource)?;
        Some(self.faults.remove(index))
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Fill in server-assigned metadata on create
    fn admit(&mut self, meta: &mut ObjectMeta, namespace: &str) {
        meta.namespace = Some(namespace.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(Uuid::new_v4().to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        meta.resource_version = Some(self.next_version());
    }
}

fn not_found(resource: Resource, namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        kind: resource.kind(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// [`RunStore`] kept entirely in memory
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a Run. Server metadata is assigned when missing.
    pub async fn insert_run(&self, mut run: Run) -> Run {
        let mut state = self.state.lock().await;
        let namespace = run.metadata.namespace.clone().unwrap_or_default();
        let name = run.metadata.name.clone().unwrap_or_default();
        state.admit(&mut run.metadata, &namespace);
        state.runs.insert(key(&namespace, &name), run.clone());
        run
    }

    pub async fn insert_task_loop(&self, mut task_loop: TaskLoop) -> TaskLoop {
        let mut state = self.state.lock().await;
        let namespace = task_loop.metadata.namespace.clone().unwrap_or_default();
        let name = task_loop.metadata.name.clone().unwrap_or_default();
        state.admit(&mut task_loop.metadata, &namespace);
        state
            .task_loops
            .insert(key(&namespace, &name), task_loop.clone());
        task_loop
    }

    pub async fn insert_task_run(&self, mut task_run: TaskRun) -> TaskRun {
        let mut state = self.state.lock().await;
        let namespace = task_run.metadata.namespace.clone().unwrap_or_default();
        let name = task_run.metadata.name.clone().unwrap_or_default();
        state.admit(&mut task_run.metadata, &namespace);
        state
            .task_runs
            .insert(key(&namespace, &name), task_run.clone());
        task_run
    }

    pub async fn run(&self, namespace: &str, name: &str) -> Option<Run> {
        self.state.lock().await.runs.get(&key(namespace, name)).cloned()
    }

    pub async fn task_run(&self, namespace: &str, name: &str) -> Option<TaskRun> {
        self.state
            .lock()
            .await
            .task_runs
            .get(&key(namespace, name))
            .cloned()
    }

    /// All TaskRuns in a namespace, ordered by name
    pub async fn task_runs(&self, namespace: &str) -> Vec<TaskRun> {
        self.state
            .lock()
            .await
            .task_runs
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, tr)| tr.clone())
            .collect()
    }

    /// Replace a stored object wholesale, the way another controller would
    pub async fn put_run(&self, mut run: Run) {
        let mut state = self.state.lock().await;
        let namespace = run.metadata.namespace.clone().unwrap_or_default();
        let name = run.metadata.name.clone().unwrap_or_default();
        run.metadata.resource_version = Some(state.next_version());
        state.runs.insert(key(&namespace, &name), run);
    }

    pub async fn put_task_run(&self, mut task_run: TaskRun) {
        let mut state = self.state.lock().await;
        let namespace = task_run.metadata.namespace.clone().unwrap_or_default();
        let name = task_run.metadata.name.clone().unwrap_or_default();
        task_run.metadata.resource_version = Some(state.next_version());
        state.task_runs.insert(key(&namespace, &name), task_run);
    }

    pub async fn delete_task_loop(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .await
            .task_loops
            .remove(&key(namespace, name));
    }

    pub async fn actions(&self) -> Vec<StoreAction> {
        self.state.lock().await.actions.clone()
    }

    /// Recorded calls matching a verb and resource
    pub async fn actions_for(&self, verb: Verb, resource: Resource) -> Vec<StoreAction> {
        self.state
            .lock()
            .await
            .actions
            .iter()
            .filter(|a| a.verb == verb && a.resource == resource)
            .cloned()
            .collect()
    }

    pub async fn clear_actions(&self) {
        self.state.lock().await.actions.clear();
    }

    /// Fail the next matching call without applying it
    pub async fn fail_next(&self, verb: Verb, resource: Resource, message: &str) {
        self.state.lock().await.faults.push(Fault {
            verb,
            resource,
            kind: FaultKind::Fail,
            message: message.to_string(),
        });
    }

    /// Apply the next matching call but report an error to the caller
    pub async fn lose_next_response(&self, verb: Verb, resource: Resource) {
        self.state.lock().await.faults.push(Fault {
            verb,
            resource,
            kind: FaultKind::LoseResponse,
            message: "response lost".to_string(),
        });
    }

    /// Returns `Err` when the call must fail before being applied, and the
    /// pending lost-response fault otherwise
    fn check_fault(
        state: &mut State,
        verb: Verb,
        resource: Resource,
    ) -> StoreResult<Option<Fault>> {
        match state.take_fault(verb, resource) {
            Some(fault) if fault.kind == FaultKind::Fail => {
                Err(StoreError::Unavailable(fault.message))
            }
            other => Ok(other),
        }
    }

    fn finish<T>(lost: Option<Fault>, value: T) -> StoreResult<T> {
        match lost {
            Some(fault) => Err(StoreError::Unavailable(fault.message)),
            None => Ok(value),
        }
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn get_run(&self, namespace: &str, name: &str) -> StoreResult<Run> {
        let mut state = self.state.lock().await;
        state.record(Verb::Get, Resource::Run, namespace, name);
        let lost = Self::check_fault(&mut state, Verb::Get, Resource::Run)?;
        let run = state
            .runs
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found(Resource::Run, namespace, name))?;
        Self::finish(lost, run)
    }

    async fn get_task_loop(&self, namespace: &str, name: &str) -> StoreResult<TaskLoop> {
        let mut state = self.state.lock().await;
        state.record(Verb::Get, Resource::TaskLoop, namespace, name);
        let lost = Self::check_fault(&mut state, Verb::Get, Resource::TaskLoop)?;
        let task_loop = state
            .task_loops
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found(Resource::TaskLoop, namespace, name))?;
        Self::finish(lost, task_loop)
    }

    async fn list_task_runs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<TaskRun>> {
        let mut state = self.state.lock().await;
        state.record(Verb::List, Resource::TaskRun, namespace, "");
        let lost = Self::check_fault(&mut state, Verb::List, Resource::TaskRun)?;
        let items = state
            .task_runs
            .iter()
            .filter(|((ns, _), tr)| {
                ns == namespace && selector_matches(selector, tr.metadata.labels.as_ref())
            })
            .map(|(_, tr)| tr.clone())
            .collect();
        Self::finish(lost, items)
    }

    async fn create_task_run(&self, namespace: &str, task_run: &TaskRun) -> StoreResult<TaskRun> {
        let mut state = self.state.lock().await;
        let name = task_run.metadata.name.clone().unwrap_or_default();
        state.record(Verb::Create, Resource::TaskRun, namespace, &name);
        let lost = Self::check_fault(&mut state, Verb::Create, Resource::TaskRun)?;

        if state.task_runs.contains_key(&key(namespace, &name)) {
            return Err(StoreError::AlreadyExists {
                kind: "TaskRun",
                namespace: namespace.to_string(),
                name,
            });
        }

        let mut created = task_run.clone();
        state.admit(&mut created.metadata, namespace);
        state
            .task_runs
            .insert(key(namespace, &name), created.clone());
        Self::finish(lost, created)
    }

    async fn update_task_run_status(
        &self,
        namespace: &str,
        task_run: &TaskRun,
    ) -> StoreResult<TaskRun> {
        let mut state = self.state.lock().await;
        let name = task_run.metadata.name.clone().unwrap_or_default();
        state.record(Verb::UpdateStatus, Resource::TaskRun, namespace, &name);
        let lost = Self::check_fault(&mut state, Verb::UpdateStatus, Resource::TaskRun)?;

        let version = state.next_version();
        let stored = state
            .task_runs
            .get_mut(&key(namespace, &name))
            .ok_or_else(|| not_found(Resource::TaskRun, namespace, &name))?;

        if let Some(expected) = &task_run.metadata.resource_version {
            if stored.metadata.resource_version.as_ref() != Some(expected) {
                return Err(StoreError::Conflict {
                    kind: "TaskRun",
                    namespace: namespace.to_string(),
                    name,
                    message: "the object has been modified".to_string(),
                });
            }
        }

        stored.status = task_run.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        Self::finish(lost, updated)
    }

    async fn cancel_task_run(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.record(Verb::Patch, Resource::TaskRun, namespace, name);
        let lost = Self::check_fault(&mut state, Verb::Patch, Resource::TaskRun)?;

        let version = state.next_version();
        let stored = state
            .task_runs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found(Resource::TaskRun, namespace, name))?;
        stored.spec.status = Some(TASKRUN_SPEC_STATUS_CANCELLED.to_string());
        stored.metadata.resource_version = Some(version);
        Self::finish(lost, ())
    }

    async fn patch_run_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.record(Verb::Patch, Resource::Run, namespace, name);
        let lost = Self::check_fault(&mut state, Verb::Patch, Resource::Run)?;

        let version = state.next_version();
        let stored = state
            .runs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found(Resource::Run, namespace, name))?;
        stored
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        stored
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        stored.metadata.resource_version = Some(version);
        Self::finish(lost, ())
    }

    async fn update_run_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RunStatus,
    ) -> StoreResult<Run> {
        let mut state = self.state.lock().await;
        state.record(Verb::UpdateStatus, Resource::Run, namespace, name);
        let lost = Self::check_fault(&mut state, Verb::UpdateStatus, Resource::Run)?;

        let version = state.next_version();
        let stored = state
            .runs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found(Resource::Run, namespace, name))?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        Self::finish(lost, updated)
    }
}
