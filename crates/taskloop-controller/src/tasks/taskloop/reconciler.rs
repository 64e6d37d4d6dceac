//! Reconciliation of a single Run that references a TaskLoop
//!
//! Every pass rebuilds its view of the Run from the objects in the store:
//! the TaskLoop (or the spec snapshot taken on the first pass), the Run's
//! params, and the child TaskRuns that currently exist. Nothing is cached
//! between passes, so a pass can be repeated at any time without creating a
//! second child for an iteration.

use super::cancel::cancel_unfinished;
use super::factory::{create_child, FactoryError};
use super::labels::propagate_task_loop_metadata;
use super::planner::compute_iterations;
use super::progress::{track_progress, Progress, ProgressError};
use super::retry::{retry, should_retry};
use super::status::TaskLoopRunStatus;
use crate::crds::{
    Condition, Run, RunStatus, TaskLoopRunReason, TaskLoopSpec, TASKLOOP_API_VERSION,
    TASKLOOP_KIND,
};
use crate::tasks::events::{condition_event, EventRecorder};
use crate::tasks::store::RunStore;
use crate::tasks::types::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Drives Runs of kind TaskLoop through their iterations
#[derive(Clone)]
pub struct TaskLoopRunReconciler {
    store: Arc<dyn RunStore>,
    recorder: Arc<dyn EventRecorder>,
}

/// Human-readable list of failed children
fn failure_message(names: &[String]) -> String {
    match names {
        [one] => format!("TaskRun {one} has failed"),
        many => format!("TaskRuns {} have failed", many.join(", ")),
    }
}

fn run_key(run: &Run) -> String {
    format!("{}/{}", run.namespace().unwrap_or_default(), run.name_any())
}

impl TaskLoopRunReconciler {
    pub fn new(store: Arc<dyn RunStore>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { store, recorder }
    }

    /// Load a Run from the store and reconcile it
    pub async fn reconcile_key(&self, namespace: &str, name: &str) -> Result<Run> {
        let mut run = match self.store.get_run(namespace, name).await {
            Ok(run) => run,
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, name = %name, "Run no longer exists");
                return Err(Error::StoreError(e));
            }
            Err(e) => return Err(Error::transient(format!("getting Run {namespace}/{name}"), e)),
        };
        self.reconcile_kind(&mut run).await?;
        Ok(run)
    }

    /// Advance `run` by one reconciliation pass.
    ///
    /// Permanent failures are recorded on the Run's condition and return
    /// `Ok`. Transient failures are returned after the Run status has been
    /// written, so the caller can requeue.
    #[instrument(skip(self, run), fields(run = %run.name_any(), namespace = ?run.namespace()))]
    pub async fn reconcile_kind(&self, run: &mut Run) -> Result<()> {
        if !run.references(TASKLOOP_API_VERSION, TASKLOOP_KIND) {
            debug!("Run does not reference a TaskLoop, ignoring");
            return Ok(());
        }

        let original_status = run.status.clone();
        let mut before: Option<Condition> = run.succeeded_condition().cloned();

        if !run.has_started() {
            info!("Starting new Run");
            run.initialize_conditions(TaskLoopRunReason::Started.as_str());
            clamp_start_time(run);
            self.emit_condition_event(run, before.as_ref()).await;
            before = run.succeeded_condition().cloned();
        }

        if run.is_done() {
            info!("Run is done");
            return self.persist(run, original_status.as_ref(), Vec::new()).await;
        }

        let mut errors = Vec::new();
        match TaskLoopRunStatus::decode(run) {
            Ok(mut status) => {
                if let Err(e) = self.reconcile(run, &mut status).await {
                    error!(error = %e, "TaskLoop Run reconcile error");
                    errors.push(e);
                }
                if let Err(e) = status.encode(run) {
                    run.mark_failed(
                        TaskLoopRunReason::InternalError.as_str(),
                        format!("Internal error encoding extra fields: {e}"),
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to decode Run status");
                run.mark_failed(
                    TaskLoopRunReason::InternalError.as_str(),
                    format!("Internal error decoding extra fields: {e}"),
                );
            }
        }

        if let Err(e) = self.update_labels_and_annotations(run).await {
            warn!(error = %e, "Failed to update Run labels and annotations");
            errors.push(e);
        }

        let result = self.persist(run, original_status.as_ref(), errors).await;
        self.emit_condition_event(run, before.as_ref()).await;
        result
    }

    /// Core state machine. Permanent failures are recorded on `run`.
    async fn reconcile(&self, run: &mut Run, status: &mut TaskLoopRunStatus) -> Result<()> {
        let Some(spec) = self.resolve_spec(run, status).await? else {
            return Ok(());
        };

        if let Err(e) = spec.validate() {
            run.mark_failed(
                TaskLoopRunReason::FailedValidation.as_str(),
                format!(
                    "TaskLoop {} can't be Run; it has an invalid spec: {e}",
                    task_loop_key(run)
                ),
            );
            return Ok(());
        }

        let total = match compute_iterations(run, &spec) {
            Ok(total) => total,
            Err(e) => {
                run.mark_failed(
                    TaskLoopRunReason::FailedValidation.as_str(),
                    format!("Cannot determine number of iterations: {e}"),
                );
                return Ok(());
            }
        };

        let mut progress = match track_progress(self.store.as_ref(), run, status).await {
            Ok(progress) => progress,
            Err(ProgressError::List(source)) => {
                return Err(Error::transient(
                    format!("listing TaskRuns for Run {}", run_key(run)),
                    source,
                ));
            }
            Err(e) => {
                run.mark_failed(TaskLoopRunReason::FailedValidation.as_str(), e.to_string());
                return Ok(());
            }
        };

        if run.is_cancelled() {
            return self.reconcile_cancellation(run, &progress).await;
        }

        self.retry_failed(&spec, &mut progress, status).await?;

        let highest = progress.highest_iteration();
        let unfinished = progress.unfinished_count();
        let failed: Vec<String> = progress.failed().map(|(_, tr)| tr.name_any()).collect();

        if highest as usize >= total || !failed.is_empty() {
            if unfinished > 0 {
                run.mark_running(
                    TaskLoopRunReason::Running.as_str(),
                    iterations_completed(highest, unfinished),
                );
            } else if failed.is_empty() {
                run.mark_succeeded(
                    TaskLoopRunReason::Succeeded.as_str(),
                    "All TaskRuns completed successfully",
                );
            } else {
                run.mark_failed(TaskLoopRunReason::Failed.as_str(), failure_message(&failed));
            }
            return Ok(());
        }

        let limit = spec.concurrency_limit();
        let mut next = highest + 1;
        let mut running = unfinished;
        while next as usize <= total && limit.map_or(true, |limit| running < limit) {
            let task_run = match create_child(self.store.as_ref(), &spec, run, next).await {
                Ok(task_run) => task_run,
                Err(FactoryError::Create { name, source }) => {
                    return Err(Error::transient(format!("creating TaskRun {name}"), source));
                }
                Err(FactoryError::Plan(e)) => {
                    run.mark_failed(TaskLoopRunReason::FailedValidation.as_str(), e.to_string());
                    return Ok(());
                }
            };
            status.record(&task_run.name_any(), next, task_run.status.clone());
            progress.replace(next, task_run);
            running += 1;
            next += 1;
        }

        run.mark_running(
            TaskLoopRunReason::Running.as_str(),
            iterations_completed(next - 1, running),
        );
        Ok(())
    }

    /// Resolve the TaskLoop for `run` and return the spec in effect.
    ///
    /// `None` means the Run has been marked failed.
    async fn resolve_spec(
        &self,
        run: &mut Run,
        status: &mut TaskLoopRunStatus,
    ) -> Result<Option<TaskLoopSpec>> {
        let name = run
            .spec
            .reference
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_default();

        if name.is_empty() {
            let message = if run.spec.spec.is_some() {
                format!("Embedded TaskLoop specs are not supported, Run {}", run_key(run))
            } else {
                format!("Missing spec.ref.name for Run {}", run_key(run))
            };
            run.mark_failed(TaskLoopRunReason::CouldntGetTaskLoop.as_str(), message);
            return Ok(None);
        }

        let namespace = run.namespace().unwrap_or_default();
        let metadata: Option<ObjectMeta> = match self.store.get_task_loop(&namespace, &name).await {
            Ok(task_loop) => {
                status.snapshot_spec(task_loop.spec);
                Some(task_loop.metadata)
            }
            Err(e) if e.is_not_found() && status.task_loop_spec.is_some() => {
                warn!(
                    task_loop = %name,
                    "TaskLoop no longer exists, continuing with the captured spec"
                );
                None
            }
            Err(e) if e.is_not_found() => {
                run.mark_failed(
                    TaskLoopRunReason::CouldntGetTaskLoop.as_str(),
                    format!("Error retrieving TaskLoop for Run {}: {e}", run_key(run)),
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::transient(
                    format!("getting TaskLoop {namespace}/{name}"),
                    e,
                ));
            }
        };

        if let Some(metadata) = &metadata {
            propagate_task_loop_metadata(run, metadata);
        }

        Ok(status.task_loop_spec.clone())
    }

    async fn reconcile_cancellation(&self, run: &mut Run, progress: &Progress) -> Result<()> {
        if let Err(e) = cancel_unfinished(self.store.as_ref(), run, progress).await {
            run.mark_running(TaskLoopRunReason::CouldntCancel.as_str(), e.to_string());
            return Err(Error::transient(format!("cancelling TaskRun {}", e.name), e.source));
        }

        if progress.unfinished_count() == 0 {
            info!("Run is cancelled and no TaskRuns are running");
            run.mark_failed(
                TaskLoopRunReason::Cancelled.as_str(),
                format!("Run {} was cancelled", run_key(run)),
            );
        } else {
            run.mark_running(TaskLoopRunReason::Running.as_str(), "Cancelling TaskRuns");
        }
        Ok(())
    }

    /// Retry failed children with budget left. Retried children count as
    /// unfinished afterwards.
    async fn retry_failed(
        &self,
        spec: &TaskLoopSpec,
        progress: &mut Progress,
        status: &mut TaskLoopRunStatus,
    ) -> Result<()> {
        let candidates: Vec<_> = progress
            .failed()
            .filter(|(_, tr)| should_retry(tr, spec))
            .map(|(iteration, tr)| (iteration, tr.clone()))
            .collect();

        for (iteration, task_run) in candidates {
            let name = task_run.name_any();
            let retried = retry(self.store.as_ref(), &task_run)
                .await
                .map_err(|e| Error::transient(format!("retrying TaskRun {name}"), e))?;
            status.record(&name, iteration, retried.status.clone());
            progress.replace(iteration, retried);
        }
        Ok(())
    }

    /// Patch the stored Run when its labels or annotations differ from ours
    async fn update_labels_and_annotations(&self, run: &Run) -> Result<()> {
        let namespace = run.namespace().unwrap_or_default();
        let name = run.name_any();
        let stored = self
            .store
            .get_run(&namespace, &name)
            .await
            .map_err(|e| Error::transient(format!("getting Run {namespace}/{name}"), e))?;

        if stored.labels() == run.labels() && stored.annotations() == run.annotations() {
            return Ok(());
        }

        debug!("Updating Run labels and annotations");
        self.store
            .patch_run_metadata(&namespace, &name, run.labels(), run.annotations())
            .await
            .map_err(|e| Error::transient(format!("patching Run {namespace}/{name}"), e))
    }

    /// Write the Run status if it changed, then fold in the pass's errors
    async fn persist(
        &self,
        run: &Run,
        original: Option<&RunStatus>,
        mut errors: Vec<Error>,
    ) -> Result<()> {
        if let Some(status) = run.status.as_ref().filter(|s| Some(*s) != original) {
            let namespace = run.namespace().unwrap_or_default();
            let name = run.name_any();
            if let Err(e) = self.store.update_run_status(&namespace, &name, status).await {
                error!(error = %e, "Failed to update Run status");
                errors.push(Error::transient(
                    format!("updating status of Run {namespace}/{name}"),
                    e,
                ));
            }
        }
        Error::aggregate(errors)
    }

    async fn emit_condition_event(&self, run: &Run, before: Option<&Condition>) {
        let Some(event) = condition_event(before, run.succeeded_condition()) else {
            return;
        };
        if let Err(e) = self.recorder.publish(run, event).await {
            warn!(error = %e, "Failed to record event for Run");
        }
    }
}

/// The start time never precedes the Run's creation
fn clamp_start_time(run: &mut Run) {
    let Some(created) = run.creation_timestamp() else {
        return;
    };
    let status = run.status_mut();
    if status.start_time.as_ref().is_some_and(|start| start.0 < created.0) {
        status.start_time = Some(created);
    }
}

fn iterations_completed(highest: u32, unfinished: usize) -> String {
    let highest = highest as usize;
    format!(
        "Iterations completed: {}",
        highest.saturating_sub(unfinished)
    )
}

fn task_loop_key(run: &Run) -> String {
    let name = run
        .spec
        .reference
        .as_ref()
        .map(|r| r.name.as_str())
        .unwrap_or_default();
    format!("{}/{name}", run.namespace().unwrap_or_default())
}
