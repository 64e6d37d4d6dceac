//! Propagates a Run cancellation to its unfinished children

use super::progress::Progress;
use crate::crds::Run;
use crate::tasks::store::{RunStore, StoreError};
use kube::ResourceExt;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("Failed to patch TaskRun `{name}` with cancellation: {source}")]
pub struct CancelError {
    pub name: String,
    #[source]
    pub source: StoreError,
}

/// Request cancellation of every child that is neither done nor already
/// cancelled. Returns the number of children patched.
pub async fn cancel_unfinished(
    store: &dyn RunStore,
    run: &Run,
    progress: &Progress,
) -> Result<usize, CancelError> {
    let namespace = run.namespace().unwrap_or_default();
    let mut patched = 0;

    for (iteration, task_run) in progress.unfinished() {
        if task_run.is_cancel_requested() {
            continue;
        }
        let name = task_run.name_any();
        info!(
            run = %run.name_any(),
            iteration = iteration,
            "Run is cancelled, cancelling TaskRun {}",
            name
        );
        store
            .cancel_task_run(&namespace, &name)
            .await
            .map_err(|source| CancelError { name, source })?;
        patched += 1;
    }

    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ConditionStatus, RunSpec, TaskRun, TaskRunSpec, TaskRunStatus};
    use crate::tasks::memory::{InMemoryStore, Resource, Verb};
    use std::collections::BTreeMap;

    fn child(name: &str, status: ConditionStatus) -> TaskRun {
        let mut tr = TaskRun::new(name, TaskRunSpec::default());
        tr.metadata.namespace = Some("foo".to_string());
        let mut tr_status = TaskRunStatus::default();
        tr_status.set_succeeded(status, "x", "");
        tr.status = Some(tr_status);
        tr
    }

    fn run() -> Run {
        let mut run = Run::new("run-a", RunSpec::default());
        run.metadata.namespace = Some("foo".to_string());
        run
    }

    #[tokio::test]
    async fn only_unfinished_children_are_patched() {
        let store = InMemoryStore::new();
        let done = store.insert_task_run(child("a-1", ConditionStatus::True)).await;
        let running = store
            .insert_task_run(child("a-2", ConditionStatus::Unknown))
            .await;
        let mut already = child("a-3", ConditionStatus::Unknown);
        already.spec.status = Some("TaskRunCancelled".to_string());
        let already = store.insert_task_run(already).await;

        let progress = Progress::from_children(BTreeMap::from([
            (1, done),
            (2, running),
            (3, already),
        ]));

        let patched = cancel_unfinished(&store, &run(), &progress).await.unwrap();
        assert_eq!(patched, 1);
        assert!(store.task_run("foo", "a-2").await.unwrap().is_cancel_requested());
        assert!(!store.task_run("foo", "a-1").await.unwrap().is_cancel_requested());
        assert_eq!(store.actions_for(Verb::Patch, Resource::TaskRun).await.len(), 1);
    }

    #[tokio::test]
    async fn patch_failure_names_the_child() {
        let store = InMemoryStore::new();
        let running = store
            .insert_task_run(child("a-1", ConditionStatus::Unknown))
            .await;
        store.fail_next(Verb::Patch, Resource::TaskRun, "denied").await;

        let progress = Progress::from_children(BTreeMap::from([(1, running)]));
        let err = cancel_unfinished(&store, &run(), &progress)
            .await
            .unwrap_err();
        assert_eq!(err.name, "a-1");
        assert!(err.to_string().contains("denied"));
    }
}
