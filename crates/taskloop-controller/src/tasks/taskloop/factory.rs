//! Construction and creation of child TaskRuns

use super::labels::{child_annotations, child_labels};
use super::planner::{iteration_params, PlanError};
use crate::crds::{Run, TaskLoopSpec, TaskRef, TaskRun, TaskRunSpec};
use crate::tasks::store::{RunStore, StoreError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use rand::Rng;
use thiserror::Error;
use tracing::info;

/// Longest name Kubernetes accepts for labels and most resources
const MAX_NAME_LENGTH: usize = 63;
const RANDOM_SUFFIX_LENGTH: usize = 5;
const MAX_BASE_LENGTH: usize = MAX_NAME_LENGTH - RANDOM_SUFFIX_LENGTH - 1;

/// Consonants and digits only, so generated suffixes never spell words
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("failed to create TaskRun {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: StoreError,
    },
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_SUFFIX_LENGTH)
        .map(|_| char::from(SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())]))
        .collect()
}

/// `{run}-{iteration:05}-{suffix}`, with the prefix truncated so the whole
/// name fits in 63 characters
#[must_use]
pub fn child_name(run_name: &str, iteration: u32) -> String {
    let base: String = format!("{run_name}-{iteration:05}")
        .chars()
        .take(MAX_BASE_LENGTH)
        .collect();
    format!("{base}-{}", random_suffix())
}

/// Build the TaskRun for one iteration of a Run
pub fn build_child(spec: &TaskLoopSpec, run: &Run, iteration: u32) -> Result<TaskRun, PlanError> {
    let params = iteration_params(run, spec, iteration)?;

    let (task_ref, task_spec) = match &spec.task_ref {
        Some(task_ref) if !task_ref.name.is_empty() => (
            Some(TaskRef {
                name: task_ref.name.clone(),
                kind: task_ref.kind.clone(),
                api_version: task_ref.api_version.clone(),
                bundle: task_ref.bundle.clone(),
            }),
            None,
        ),
        _ => (None, spec.task_spec.clone()),
    };

    let metadata = ObjectMeta {
        name: Some(child_name(&run.name_any(), iteration)),
        namespace: run.namespace(),
        owner_references: run.controller_owner_ref(&()).map(|r| vec![r]),
        labels: Some(child_labels(run, iteration)),
        annotations: Some(child_annotations(run)),
        ..ObjectMeta::default()
    };

    Ok(TaskRun {
        metadata,
        spec: TaskRunSpec {
            params,
            task_ref,
            task_spec,
            timeout: spec.timeout.clone(),
            service_account_name: run.spec.service_account_name.clone(),
            pod_template: run.spec.pod_template.clone(),
            workspaces: run.spec.workspaces.clone(),
            status: None,
        },
        status: None,
    })
}

/// Build and create the TaskRun for one iteration
pub async fn create_child(
    store: &dyn RunStore,
    spec: &TaskLoopSpec,
    run: &Run,
    iteration: u32,
) -> Result<TaskRun, FactoryError> {
    let task_run = build_child(spec, run, iteration)?;
    let name = task_run.name_any();
    let namespace = run.namespace().unwrap_or_default();

    info!(
        run = %run.name_any(),
        iteration = iteration,
        "Creating a new TaskRun object {}",
        name
    );

    store
        .create_task_run(&namespace, &task_run)
        .await
        .map_err(|source| FactoryError::Create { name, source })
}
