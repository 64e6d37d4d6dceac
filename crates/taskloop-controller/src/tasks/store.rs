//! Resource store seam
//!
//! The reconciler reads and writes `Run`, `TaskLoop` and `TaskRun` objects only
//! through [`RunStore`]. [`KubeStore`] talks to the API server; the in-memory
//! implementation lives in [`crate::tasks::memory`].

use crate::crds::{Run, RunStatus, TaskLoop, TaskRun, TASKRUN_SPEC_STATUS_CANCELLED};
use async_trait::async_trait;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Error as KubeError};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("conflict updating {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] KubeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(KubeError::Api(err)) => err.code == 404,
            _ => false,
        }
    }

    fn from_kube(err: KubeError, kind: &'static str, namespace: &str, name: &str) -> Self {
        match err {
            KubeError::Api(ref api) if api.code == 404 => Self::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            KubeError::Api(ref api) if api.code == 409 => {
                if api.reason == "AlreadyExists" {
                    Self::AlreadyExists {
                        kind,
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    }
                } else {
                    Self::Conflict {
                        kind,
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        message: api.message.clone(),
                    }
                }
            }
            other => Self::Kube(other),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Render a label map as a Kubernetes equality selector
#[must_use]
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` satisfies every pair in `selector`
#[must_use]
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Namespaced, versioned access to the objects the TaskLoop reconciler touches
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, namespace: &str, name: &str) -> StoreResult<Run>;

    async fn get_task_loop(&self, namespace: &str, name: &str) -> StoreResult<TaskLoop>;

    async fn list_task_runs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<TaskRun>>;

    async fn create_task_run(&self, namespace: &str, task_run: &TaskRun) -> StoreResult<TaskRun>;

    /// Replace the status of a TaskRun. The object's resource version, when
    /// set, must match the stored one.
    async fn update_task_run_status(
        &self,
        namespace: &str,
        task_run: &TaskRun,
    ) -> StoreResult<TaskRun>;

    /// Request cancellation by setting `spec.status`
    async fn cancel_task_run(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Merge labels and annotations into the stored Run
    async fn patch_run_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> StoreResult<()>;

    async fn update_run_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RunStatus,
    ) -> StoreResult<Run>;
}

/// [`RunStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn runs(&self, namespace: &str) -> Api<Run> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn task_runs(&self, namespace: &str) -> Api<TaskRun> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RunStore for KubeStore {
    async fn get_run(&self, namespace: &str, name: &str) -> StoreResult<Run> {
        self.runs(namespace)
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, "Run", namespace, name))
    }

    async fn get_task_loop(&self, namespace: &str, name: &str) -> StoreResult<TaskLoop> {
        let api: Api<TaskLoop> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, "TaskLoop", namespace, name))
    }

    async fn list_task_runs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<TaskRun>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let list = self.task_runs(namespace).list(&params).await?;
        debug!(
            namespace = %namespace,
            count = list.items.len(),
            "Listed TaskRuns"
        );
        Ok(list.items)
    }

    async fn create_task_run(&self, namespace: &str, task_run: &TaskRun) -> StoreResult<TaskRun> {
        let name = task_run.metadata.name.clone().unwrap_or_default();
        self.task_runs(namespace)
            .create(&PostParams::default(), task_run)
            .await
            .map_err(|e| StoreError::from_kube(e, "TaskRun", namespace, &name))
    }

    async fn update_task_run_status(
        &self,
        namespace: &str,
        task_run: &TaskRun,
    ) -> StoreResult<TaskRun> {
        let name = task_run.metadata.name.clone().unwrap_or_default();
        let body = serde_json::to_vec(task_run)?;
        self.task_runs(namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| StoreError::from_kube(e, "TaskRun", namespace, &name))
    }

    async fn cancel_task_run(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let patch = json!({ "spec": { "status": TASKRUN_SPEC_STATUS_CANCELLED } });
        self.task_runs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, "TaskRun", namespace, name))?;
        Ok(())
    }

    async fn patch_run_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> StoreResult<()> {
        let patch = json!({
            "metadata": {
                "labels": labels,
                "annotations": annotations,
            }
        });
        self.runs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, "Run", namespace, name))?;
        Ok(())
    }

    async fn update_run_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RunStatus,
    ) -> StoreResult<Run> {
        let patch = json!({ "status": status });
        self.runs(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, "Run", namespace, name))
    }
}
