//! Label and annotation conventions shared by Runs and their TaskRuns

use crate::crds::Run;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Run name on every child TaskRun
pub const RUN_LABEL: &str = "tekton.dev/run";

/// TaskLoop name on the Run
pub const TASKLOOP_LABEL: &str = "custom.tekton.dev/taskLoop";

/// 1-based iteration number on every child TaskRun
pub const ITERATION_LABEL: &str = "custom.tekton.dev/taskLoopIteration";

/// Selector for the children of a Run
#[must_use]
pub fn child_selector(run_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(RUN_LABEL.to_string(), run_name.to_string())])
}

/// Run labels plus the run and iteration labels
#[must_use]
pub fn child_labels(run: &Run, iteration: u32) -> BTreeMap<String, String> {
    let mut labels = run.labels().clone();
    labels.insert(RUN_LABEL.to_string(), run.name_any());
    labels.insert(ITERATION_LABEL.to_string(), iteration.to_string());
    labels
}

#[must_use]
pub fn child_annotations(run: &Run) -> BTreeMap<String, String> {
    run.annotations().clone()
}

/// Copy the TaskLoop's labels and annotations onto the Run and label it with
/// the TaskLoop name. Existing keys are overwritten.
pub fn propagate_task_loop_metadata(run: &mut Run, task_loop: &ObjectMeta) {
    let labels = run.labels_mut();
    if let Some(source) = &task_loop.labels {
        labels.extend(source.clone());
    }
    if let Some(name) = &task_loop.name {
        labels.insert(TASKLOOP_LABEL.to_string(), name.clone());
    }

    if let Some(source) = &task_loop.annotations {
        run.annotations_mut().extend(source.clone());
    }
}

/// Parse the iteration label of a child
pub fn iteration_of(labels: &BTreeMap<String, String>) -> Result<u32, Option<String>> {
    let Some(value) = labels.get(ITERATION_LABEL) else {
        return Err(None);
    };
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Some(value.clone())),
    }
}
