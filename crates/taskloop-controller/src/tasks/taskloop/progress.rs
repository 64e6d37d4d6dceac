//! Rebuilds the progress of a Run from the children that exist right now

use super::labels::{child_selector, iteration_of};
use super::status::TaskLoopRunStatus;
use crate::crds::{Run, TaskRun};
use crate::tasks::store::{RunStore, StoreError};
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to list TaskRuns: {0}")]
    List(#[source] StoreError),

    #[error("TaskRun {name} is missing the custom.tekton.dev/taskLoopIteration label")]
    MissingIteration { name: String },

    #[error("TaskRun {name} has an invalid custom.tekton.dev/taskLoopIteration label {value:?}")]
    MalformedIteration { name: String, value: String },
}

/// Children of a Run keyed by iteration
#[derive(Debug, Clone, Default)]
pub struct Progress {
    children: BTreeMap<u32, TaskRun>,
    /// Extra children found for an iteration that already has one
    duplicates: Vec<(u32, TaskRun)>,
}

impl Progress {
    /// Highest iteration that has a child, 0 when none has been created
    #[must_use]
    pub fn highest_iteration(&self) -> u32 {
        self.children.keys().next_back().copied().unwrap_or(0)
    }

    /// Child of the highest iteration
    #[must_use]
    pub fn frontier(&self) -> Option<&TaskRun> {
        self.children.values().next_back()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = (u32, &TaskRun)> {
        self.children.iter().map(|(i, tr)| (*i, tr))
    }

    /// Children that have not reached a terminal condition, duplicates
    /// included
    pub fn unfinished(&self) -> impl Iterator<Item = (u32, &TaskRun)> {
        self.children()
            .chain(self.duplicates.iter().map(|(i, tr)| (*i, tr)))
            .filter(|(_, tr)| !tr.is_done())
    }

    #[must_use]
    pub fn unfinished_count(&self) -> usize {
        self.unfinished().count()
    }

    /// Children that are done without succeeding
    pub fn failed(&self) -> impl Iterator<Item = (u32, &TaskRun)> {
        self.children()
            .filter(|(_, tr)| tr.is_done() && !tr.is_successful())
    }

    pub fn replace(&mut self, iteration: u32, task_run: TaskRun) {
        self.children.insert(iteration, task_run);
    }

    pub(crate) fn from_children(children: BTreeMap<u32, TaskRun>) -> Self {
        Self {
            children,
            duplicates: Vec::new(),
        }
    }
}

/// Earlier of the two timestamps by creation time, then name
fn created_before(a: &TaskRun, b: &TaskRun) -> bool {
    (a.creation_timestamp(), a.name_any()) < (b.creation_timestamp(), b.name_any())
}

/// List the children of `run`, record each in `status`, and index them by
/// iteration.
///
/// A child created before the Run's recorded start time moves the start
/// time back to the child's creation time. When an iteration has more than
/// one child the earliest created is tracked; the others still count as
/// unfinished until they are done.
pub async fn track_progress(
    store: &dyn RunStore,
    run: &mut Run,
    status: &mut TaskLoopRunStatus,
) -> Result<Progress, ProgressError> {
    let namespace = run.namespace().unwrap_or_default();
    let task_runs = store
        .list_task_runs(&namespace, &child_selector(&run.name_any()))
        .await
        .map_err(ProgressError::List)?;

    let mut children: BTreeMap<u32, TaskRun> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for task_run in task_runs {
        let name = task_run.name_any();
        let iteration = iteration_of(task_run.labels()).map_err(|value| match value {
            None => ProgressError::MissingIteration { name: name.clone() },
            Some(value) => ProgressError::MalformedIteration {
                name: name.clone(),
                value,
            },
        })?;

        if let Some(created) = task_run.creation_timestamp() {
            let run_status = run.status_mut();
            if run_status.start_time.as_ref().is_some_and(|start| created.0 < start.0) {
                debug!(taskrun = %name, "Moving Run start time back to TaskRun creation time");
                run_status.start_time = Some(created);
            }
        }

        status.record(&name, iteration, task_run.status.clone());

        let keep_existing = children
            .get(&iteration)
            .is_some_and(|existing| created_before(existing, &task_run));
        let ignored = if keep_existing {
            Some(task_run)
        } else {
            children.insert(iteration, task_run)
        };
        if let Some(ignored) = ignored {
            warn!(
                iteration = iteration,
                kept = %children[&iteration].name_any(),
                ignored = %ignored.name_any(),
                "Found more than one TaskRun for an iteration"
            );
            duplicates.push((iteration, ignored));
        }
    }

    Ok(Progress {
        children,
        duplicates,
    })
}
