//! Retrying failed iterations in place

use crate::crds::{ConditionStatus, TaskLoopSpec, TaskRun, TaskRunStatus};
use crate::tasks::store::{RunStore, StoreError};
use kube::ResourceExt;
use tracing::info;

/// Whether a failed child still has retry budget
#[must_use]
pub fn should_retry(task_run: &TaskRun, spec: &TaskLoopSpec) -> bool {
    task_run.retries_attempted() < spec.retry_budget()
}

/// Reset a child's status for another attempt, keeping the finished attempt
/// in `retriesStatus`
#[must_use]
pub fn prepare_retry(task_run: &TaskRun) -> TaskRun {
    let mut retried = task_run.clone();
    let status = retried.status.get_or_insert_with(TaskRunStatus::default);

    let mut attempt = status.clone();
    attempt.retries_status.clear();
    status.retries_status.push(attempt);

    status.start_time = None;
    status.completion_time = None;
    status.pod_name = None;
    status.set_succeeded(ConditionStatus::Unknown, "", "");
    retried
}

/// Issue the status update that starts the next attempt
pub async fn retry(store: &dyn RunStore, task_run: &TaskRun) -> Result<TaskRun, StoreError> {
    let retried = prepare_retry(task_run);
    let namespace = task_run.namespace().unwrap_or_default();
    info!(
        taskrun = %task_run.name_any(),
        attempt = retried.retries_attempted(),
        "Retrying TaskRun"
    );
    store.update_task_run_status(&namespace, &retried).await
}
