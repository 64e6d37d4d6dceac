//! End-to-end reconciliation of TaskLoop Runs against the in-memory store

use chrono::{Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use taskloop_controller::crds::{
    ConditionStatus, Param, Run, RunRef, RunSpec, TaskLoop, TaskLoopSpec, TaskRef, TaskRun,
    TaskRunStatus, RUN_SPEC_STATUS_CANCELLED, TASKLOOP_API_VERSION, TASKLOOP_KIND,
};
use taskloop_controller::tasks::memory::{InMemoryStore, Resource, Verb};
use taskloop_controller::tasks::taskloop::labels::{ITERATION_LABEL, RUN_LABEL, TASKLOOP_LABEL};
use taskloop_controller::tasks::taskloop::TaskLoopRunStatus;
use taskloop_controller::tasks::{MemoryRecorder, TaskLoopRunReconciler};

const NAMESPACE: &str = "foo";
const RUN_NAME: &str = "run-taskloop";

struct Harness {
    store: Arc<InMemoryStore>,
    recorder: Arc<MemoryRecorder>,
    reconciler: TaskLoopRunReconciler,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let reconciler = TaskLoopRunReconciler::new(store.clone(), recorder.clone());
        Self {
            store,
            recorder,
            reconciler,
        }
    }

    async fn with(task_loop: TaskLoop, run: Run) -> Self {
        let harness = Self::new();
        harness.store.insert_task_loop(task_loop).await;
        harness.store.insert_run(run).await;
        harness
    }

    async fn reconcile(&self) -> Result<Run, taskloop_controller::tasks::Error> {
        self.reconciler.reconcile_key(NAMESPACE, RUN_NAME).await
    }

    async fn run(&self) -> Run {
        self.store.run(NAMESPACE, RUN_NAME).await.unwrap()
    }

    /// Children ordered by iteration
    async fn children(&self) -> Vec<TaskRun> {
        let mut children: Vec<TaskRun> = self
            .store
            .task_runs(NAMESPACE)
            .await
            .into_iter()
            .filter(|tr| tr.labels().get(RUN_LABEL).map(String::as_str) == Some(RUN_NAME))
            .collect();
        children.sort_by_key(|tr| tr.labels()[ITERATION_LABEL].parse::<u32>().unwrap());
        children
    }

    /// Set the Succeeded condition of a child, as the TaskRun controller would
    async fn finish_child(&self, name: &str, status: ConditionStatus) {
        let mut tr = self.store.task_run(NAMESPACE, name).await.unwrap();
        let tr_status = tr.status.get_or_insert_with(TaskRunStatus::default);
        let reason = match status {
            ConditionStatus::True => "Succeeded",
            ConditionStatus::False => "Failed",
            ConditionStatus::Unknown => "Running",
        };
        tr_status.pod_name = Some(format!("{name}-pod"));
        tr_status.set_succeeded(status, reason, "");
        self.store.put_task_run(tr).await;
    }

    async fn cancel_run(&self) {
        let mut run = self.run().await;
        run.spec.status = Some(RUN_SPEC_STATUS_CANCELLED.to_string());
        self.store.put_run(run).await;
    }

    async fn events(&self) -> Vec<String> {
        self.recorder.events().await
    }
}

fn task_loop(spec: TaskLoopSpec) -> TaskLoop {
    let mut tl = TaskLoop::new("a-taskloop", spec);
    tl.metadata.namespace = Some(NAMESPACE.to_string());
    tl.metadata.labels = Some(BTreeMap::from([(
        "myTaskLoopLabel".to_string(),
        "myTaskLoopLabelValue".to_string(),
    )]));
    tl
}

fn loop_spec() -> TaskLoopSpec {
    TaskLoopSpec {
        task_ref: Some(TaskRef {
            name: "a-task".to_string(),
            ..TaskRef::default()
        }),
        iterate_param: "current-item".to_string(),
        ..TaskLoopSpec::default()
    }
}

fn loop_with_retries(retries: i32) -> TaskLoop {
    task_loop(TaskLoopSpec {
        retries,
        ..loop_spec()
    })
}

fn loop_with_concurrency(concurrency: i32) -> TaskLoop {
    task_loop(TaskLoopSpec {
        concurrency: Some(concurrency),
        ..loop_spec()
    })
}

fn run_with_items(items: &[&str]) -> Run {
    let mut run = Run::new(
        RUN_NAME,
        RunSpec {
            reference: Some(RunRef {
                api_version: TASKLOOP_API_VERSION.to_string(),
                kind: TASKLOOP_KIND.to_string(),
                name: "a-taskloop".to_string(),
            }),
            params: vec![
                Param::array("current-item", items.iter().copied()),
                Param::string("additional-parameter", "stuff"),
            ],
            ..RunSpec::default()
        },
    );
    run.metadata.namespace = Some(NAMESPACE.to_string());
    run.metadata.labels = Some(BTreeMap::from([(
        "myTestLabel".to_string(),
        "myTestLabelValue".to_string(),
    )]));
    run.metadata.annotations = Some(BTreeMap::from([(
        "myTestAnnotation".to_string(),
        "myTestAnnotationValue".to_string(),
    )]));
    run
}

fn two_items() -> Run {
    run_with_items(&["item1", "item2"])
}

fn condition(run: &Run) -> (ConditionStatus, String, String) {
    let c = run.succeeded_condition().unwrap();
    (c.status, c.reason().to_string(), c.message().to_string())
}

fn param_value(tr: &TaskRun, name: &str) -> serde_json::Value {
    let param = tr.spec.params.iter().find(|p| p.name == name).unwrap();
    serde_json::to_value(&param.value).unwrap()
}

#[tokio::test]
async fn first_pass_creates_first_iteration() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();

    let children = h.children().await;
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert!(child.name_any().starts_with("run-taskloop-00001-"));
    assert_eq!(child.labels()[ITERATION_LABEL], "1");
    assert_eq!(child.labels()["myTestLabel"], "myTestLabelValue");
    assert_eq!(child.annotations()["myTestAnnotation"], "myTestAnnotationValue");
    assert_eq!(param_value(child, "current-item"), json!("item1"));
    assert_eq!(param_value(child, "additional-parameter"), json!("stuff"));
    assert_eq!(child.spec.task_ref.as_ref().unwrap().name, "a-task");
    assert_eq!(child.owner_references()[0].name, RUN_NAME);

    let run = h.run().await;
    assert_eq!(
        condition(&run),
        (
            ConditionStatus::Unknown,
            "Running".to_string(),
            "Iterations completed: 0".to_string()
        )
    );
    assert_eq!(run.labels()[TASKLOOP_LABEL], "a-taskloop");
    assert_eq!(run.labels()["myTaskLoopLabel"], "myTaskLoopLabelValue");
    assert!(run.status.as_ref().unwrap().start_time.is_some());

    let status = TaskLoopRunStatus::decode(&run).unwrap();
    assert_eq!(status.task_loop_spec.unwrap().iterate_param, "current-item");
    assert_eq!(status.task_runs[&child.name_any()].iteration, 1);

    assert_eq!(
        h.events().await,
        vec![
            "Normal Started ".to_string(),
            "Normal Running Iterations completed: 0".to_string()
        ]
    );
}

#[tokio::test]
async fn repeated_pass_without_changes_is_a_no_op() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();
    let before = h.run().await;
    h.store.clear_actions().await;
    h.recorder.clear().await;

    h.reconcile().await.unwrap();

    assert_eq!(h.children().await.len(), 1);
    assert!(h.store.actions_for(Verb::Create, Resource::TaskRun).await.is_empty());
    assert!(h.store.actions_for(Verb::UpdateStatus, Resource::Run).await.is_empty());
    assert!(h.store.actions_for(Verb::Patch, Resource::Run).await.is_empty());
    assert_eq!(h.run().await.status, before.status);
    assert!(h.events().await.is_empty());
}

#[tokio::test]
async fn sequential_iterations_run_to_success() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();

    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::True).await;
    h.reconcile().await.unwrap();

    let children = h.children().await;
    assert_eq!(children.len(), 2);
    assert_eq!(param_value(&children[1], "current-item"), json!("item2"));
    assert_eq!(condition(&h.run().await).2, "Iterations completed: 1");

    h.finish_child(&children[1].name_any(), ConditionStatus::True)
        .await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(
        condition(&run),
        (
            ConditionStatus::True,
            "Succeeded".to_string(),
            "All TaskRuns completed successfully".to_string()
        )
    );
    assert!(run.status.as_ref().unwrap().completion_time.is_some());
    assert_eq!(h.children().await.len(), 2);

    let status = TaskLoopRunStatus::decode(&run).unwrap();
    assert_eq!(status.task_runs.len(), 2);
    assert!(status.task_runs.values().all(|entry| entry
        .status
        .as_ref()
        .and_then(TaskRunStatus::succeeded_condition)
        .is_some_and(|c| c.status == ConditionStatus::True)));

    assert_eq!(
        h.events().await.last().unwrap(),
        "Normal Succeeded All TaskRuns completed successfully"
    );
}

#[tokio::test]
async fn terminal_run_is_left_alone() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();
    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::False).await;
    h.reconcile().await.unwrap();
    assert!(h.run().await.is_done());

    h.store.clear_actions().await;
    h.reconcile().await.unwrap();
    let actions = h.store.actions().await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].verb, Verb::Get);
    assert_eq!(actions[0].resource, Resource::Run);
}

#[tokio::test]
async fn failure_without_retries_fails_the_run() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();

    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::False).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(
        condition(&run),
        (
            ConditionStatus::False,
            "Failed".to_string(),
            format!("TaskRun {first} has failed")
        )
    );
    assert_eq!(h.children().await.len(), 1);
    assert_eq!(
        h.events().await.last().unwrap(),
        &format!("Warning Failed TaskRun {first} has failed")
    );
}

#[tokio::test]
async fn failed_iteration_is_retried_in_place() {
    let h = Harness::with(loop_with_retries(1), two_items()).await;
    h.reconcile().await.unwrap();

    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::False).await;
    h.reconcile().await.unwrap();

    let children = h.children().await;
    assert_eq!(children.len(), 1);
    let retried = &children[0];
    assert_eq!(retried.name_any(), first);
    assert_eq!(retried.retries_attempted(), 1);
    assert!(!retried.is_done());
    let status = retried.status.as_ref().unwrap();
    assert!(status.pod_name.is_none());
    assert_eq!(
        status.retries_status[0].pod_name.as_deref(),
        Some(format!("{first}-pod").as_str())
    );
    assert_eq!(condition(&h.run().await).2, "Iterations completed: 0");

    // Budget exhausted
    h.finish_child(&first, ConditionStatus::False).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).0, ConditionStatus::False);
    assert_eq!(condition(&run).1, "Failed");
    assert_eq!(h.children().await.len(), 1);
    assert_eq!(h.children().await[0].retries_attempted(), 1);
}

#[tokio::test]
async fn retried_iteration_can_succeed_and_continue() {
    let h = Harness::with(loop_with_retries(2), two_items()).await;
    h.reconcile().await.unwrap();

    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::False).await;
    h.reconcile().await.unwrap();
    h.finish_child(&first, ConditionStatus::True).await;
    h.reconcile().await.unwrap();

    let children = h.children().await;
    assert_eq!(children.len(), 2);
    assert_eq!(children[1].labels()[ITERATION_LABEL], "2");

    let status = TaskLoopRunStatus::decode(&h.run().await).unwrap();
    assert_eq!(status.task_runs.len(), 2);
    assert_eq!(status.task_runs[&first].iteration, 1);
}

#[tokio::test]
async fn cancellation_stops_running_children() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();
    let first = h.children().await[0].name_any();

    h.cancel_run().await;
    h.reconcile().await.unwrap();

    let child = h.store.task_run(NAMESPACE, &first).await.unwrap();
    assert!(child.is_cancel_requested());
    assert_eq!(
        condition(&h.run().await),
        (
            ConditionStatus::Unknown,
            "Running".to_string(),
            "Cancelling TaskRuns".to_string()
        )
    );

    // A second pass does not patch the child again
    h.store.clear_actions().await;
    h.reconcile().await.unwrap();
    assert!(h.store.actions_for(Verb::Patch, Resource::TaskRun).await.is_empty());

    h.finish_child(&first, ConditionStatus::False).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(
        condition(&run),
        (
            ConditionStatus::False,
            "TaskLoopRunCancelled".to_string(),
            "Run foo/run-taskloop was cancelled".to_string()
        )
    );
    assert_eq!(h.children().await.len(), 1);
}

#[tokio::test]
async fn cancellation_between_iterations_starts_nothing_new() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();
    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::True).await;

    h.cancel_run().await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).1, "TaskLoopRunCancelled");
    assert_eq!(h.children().await.len(), 1);

    let child = h.store.task_run(NAMESPACE, &first).await.unwrap();
    assert!(child.is_successful());
    assert!(!child.is_cancel_requested());
}

#[tokio::test]
async fn failed_cancellation_is_reported_and_retried() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();
    let first = h.children().await[0].name_any();

    h.cancel_run().await;
    h.store
        .fail_next(Verb::Patch, Resource::TaskRun, "forbidden")
        .await;
    assert!(h.reconcile().await.is_err());

    let run = h.run().await;
    assert_eq!(condition(&run).0, ConditionStatus::Unknown);
    assert_eq!(condition(&run).1, "TaskLoopRunCouldntCancel");
    assert!(condition(&run).2.contains(&first));

    h.reconcile().await.unwrap();
    assert!(h
        .store
        .task_run(NAMESPACE, &first)
        .await
        .unwrap()
        .is_cancel_requested());
}

#[tokio::test]
async fn concurrency_limit_bounds_running_children() {
    let h = Harness::with(
        loop_with_concurrency(2),
        run_with_items(&["item1", "item2", "item3"]),
    )
    .await;
    h.reconcile().await.unwrap();

    let children = h.children().await;
    assert_eq!(children.len(), 2);
    assert_eq!(condition(&h.run().await).2, "Iterations completed: 0");

    h.finish_child(&children[0].name_any(), ConditionStatus::True)
        .await;
    h.reconcile().await.unwrap();

    let children = h.children().await;
    assert_eq!(children.len(), 3);
    assert_eq!(param_value(&children[2], "current-item"), json!("item3"));
    assert_eq!(condition(&h.run().await).2, "Iterations completed: 1");

    for child in &children[1..] {
        h.finish_child(&child.name_any(), ConditionStatus::True).await;
    }
    h.reconcile().await.unwrap();
    assert_eq!(condition(&h.run().await).0, ConditionStatus::True);
    assert_eq!(h.children().await.len(), 3);
}

#[tokio::test]
async fn non_positive_concurrency_starts_everything() {
    let h = Harness::with(
        loop_with_concurrency(0),
        run_with_items(&["item1", "item2", "item3"]),
    )
    .await;
    h.reconcile().await.unwrap();

    assert_eq!(h.children().await.len(), 3);
    assert_eq!(condition(&h.run().await).2, "Iterations completed: 0");
}

#[tokio::test]
async fn failure_inside_window_waits_for_running_children() {
    let h = Harness::with(
        loop_with_concurrency(2),
        run_with_items(&["item1", "item2", "item3"]),
    )
    .await;
    h.reconcile().await.unwrap();
    let children = h.children().await;
    let (first, second) = (children[0].name_any(), children[1].name_any());

    h.finish_child(&first, ConditionStatus::False).await;
    h.reconcile().await.unwrap();

    assert_eq!(h.children().await.len(), 2);
    let run = h.run().await;
    assert_eq!(condition(&run).0, ConditionStatus::Unknown);
    assert_eq!(condition(&run).2, "Iterations completed: 1");

    h.finish_child(&second, ConditionStatus::True).await;
    h.reconcile().await.unwrap();

    assert_eq!(h.children().await.len(), 2);
    assert_eq!(
        condition(&h.run().await),
        (
            ConditionStatus::False,
            "Failed".to_string(),
            format!("TaskRun {first} has failed")
        )
    );
}

#[tokio::test]
async fn lost_create_response_does_not_duplicate_the_iteration() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.store
        .lose_next_response(Verb::Create, Resource::TaskRun)
        .await;

    assert!(h.reconcile().await.is_err());
    assert_eq!(h.children().await.len(), 1);
    assert_eq!(condition(&h.run().await).1, "Started");

    h.reconcile().await.unwrap();
    let children = h.children().await;
    assert_eq!(children.len(), 1);

    let run = h.run().await;
    let status = TaskLoopRunStatus::decode(&run).unwrap();
    assert_eq!(status.task_runs[&children[0].name_any()].iteration, 1);
    assert_eq!(condition(&run).2, "Iterations completed: 0");
}

#[tokio::test]
async fn run_terminates_after_one_child_per_item() {
    let items = ["a", "b", "c", "d"];
    let h = Harness::with(loop_with_retries(0), run_with_items(&items)).await;

    for _ in 0..10 {
        h.reconcile().await.unwrap();
        if h.run().await.is_done() {
            break;
        }
        for child in h.children().await {
            if !child.is_done() {
                h.finish_child(&child.name_any(), ConditionStatus::True).await;
            }
        }
    }

    assert!(h.run().await.is_done());
    let children = h.children().await;
    assert_eq!(children.len(), items.len());
    for (i, child) in children.iter().enumerate() {
        assert_eq!(param_value(child, "current-item"), json!(items[i]));
    }
}

#[tokio::test]
async fn empty_iterate_array_succeeds_immediately() {
    let h = Harness::with(loop_with_retries(0), run_with_items(&[])).await;
    h.reconcile().await.unwrap();

    assert!(h.children().await.is_empty());
    assert_eq!(condition(&h.run().await).0, ConditionStatus::True);
}

#[tokio::test]
async fn missing_task_loop_reference_fails() {
    let mut run = two_items();
    run.spec.reference.as_mut().unwrap().name = String::new();
    let h = Harness::with(loop_with_retries(0), run).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).0, ConditionStatus::False);
    assert_eq!(condition(&run).1, "CouldntGetTaskLoop");
    assert_eq!(condition(&run).2, "Missing spec.ref.name for Run foo/run-taskloop");
    assert!(h.children().await.is_empty());
}

#[tokio::test]
async fn nonexistent_task_loop_fails() {
    let h = Harness::new();
    h.store.insert_run(two_items()).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).1, "CouldntGetTaskLoop");
    assert!(condition(&run).2.starts_with("Error retrieving TaskLoop for Run foo/run-taskloop"));
    assert_eq!(
        h.events().await,
        vec![
            "Normal Started ".to_string(),
            format!("Warning Failed {}", condition(&run).2)
        ]
    );
}

#[tokio::test]
async fn transient_task_loop_read_error_is_returned() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.store
        .fail_next(Verb::Get, Resource::TaskLoop, "timeout")
        .await;

    let err = h.reconcile().await.unwrap_err();
    assert!(err.to_string().contains("timeout"));
    assert!(!h.run().await.is_done());
    assert!(h.children().await.is_empty());

    h.reconcile().await.unwrap();
    assert_eq!(h.children().await.len(), 1);
}

#[tokio::test]
async fn missing_iterate_param_fails_validation() {
    let mut run = two_items();
    run.spec.params.retain(|p| p.name != "current-item");
    let h = Harness::with(loop_with_retries(0), run).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).0, ConditionStatus::False);
    assert_eq!(condition(&run).1, "TaskLoopValidationFailed");
    assert!(condition(&run).2.contains("current-item"));
    assert!(h.children().await.is_empty());
}

#[tokio::test]
async fn string_iterate_param_fails_validation() {
    let mut run = two_items();
    run.spec.params[0] = Param::string("current-item", "item1");
    let h = Harness::with(loop_with_retries(0), run).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).1, "TaskLoopValidationFailed");
    assert!(h.children().await.is_empty());
}

#[tokio::test]
async fn invalid_task_loop_spec_fails_validation() {
    let h = Harness::with(
        task_loop(TaskLoopSpec {
            iterate_param: "current-item".to_string(),
            ..TaskLoopSpec::default()
        }),
        two_items(),
    )
    .await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).1, "TaskLoopValidationFailed");
    assert!(condition(&run)
        .2
        .starts_with("TaskLoop foo/a-taskloop can't be Run; it has an invalid spec"));
}

#[tokio::test]
async fn runs_for_other_custom_tasks_are_ignored() {
    let mut run = two_items();
    run.spec.reference.as_mut().unwrap().kind = "PipelineLoop".to_string();
    let h = Harness::with(loop_with_retries(0), run).await;
    h.reconcile().await.unwrap();

    assert!(h.run().await.status.is_none());
    assert!(h.children().await.is_empty());
    assert!(h.events().await.is_empty());
}

#[tokio::test]
async fn captured_spec_outlives_task_loop_changes() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();

    let mut changed = task_loop(TaskLoopSpec {
        task_ref: Some(TaskRef {
            name: "another-task".to_string(),
            ..TaskRef::default()
        }),
        ..loop_spec()
    });
    changed.metadata.name = Some("a-taskloop".to_string());
    h.store.insert_task_loop(changed).await;

    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::True).await;
    h.reconcile().await.unwrap();

    let children = h.children().await;
    assert_eq!(children[1].spec.task_ref.as_ref().unwrap().name, "a-task");
}

#[tokio::test]
async fn deleted_task_loop_does_not_stop_a_started_run() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();
    h.store.delete_task_loop(NAMESPACE, "a-taskloop").await;

    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::True).await;
    h.reconcile().await.unwrap();

    assert_eq!(h.children().await.len(), 2);
    assert!(!h.run().await.is_done());
}

#[tokio::test]
async fn child_with_malformed_iteration_label_fails_the_run() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.reconcile().await.unwrap();

    let mut child = h.children().await.remove(0);
    child
        .labels_mut()
        .insert(ITERATION_LABEL.to_string(), "one".to_string());
    h.store.put_task_run(child).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).0, ConditionStatus::False);
    assert_eq!(condition(&run).1, "TaskLoopValidationFailed");
}

#[tokio::test]
async fn undecodable_status_payload_is_an_internal_error() {
    let mut run = two_items();
    run.initialize_conditions("Started");
    run.status_mut().extra_fields = Some(json!({"taskRuns": ["not", "a", "map"]}));
    let h = Harness::with(loop_with_retries(0), run).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(condition(&run).1, "TaskLoopInternalError");
    assert!(h.children().await.is_empty());
}

#[tokio::test]
async fn list_failure_is_transient() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.store
        .fail_next(Verb::List, Resource::TaskRun, "etcd unavailable")
        .await;

    let err = h.reconcile().await.unwrap_err();
    assert!(err.to_string().contains("listing TaskRuns for Run foo/run-taskloop"));
    assert!(!h.run().await.is_done());
    assert!(h.children().await.is_empty());
}

#[tokio::test]
async fn run_settings_are_propagated_to_children() {
    let mut run = two_items();
    run.spec.service_account_name = Some("builder".to_string());
    run.spec.pod_template = Some(json!({"nodeSelector": {"disk": "ssd"}}));
    run.spec.workspaces = vec![json!({"name": "source", "emptyDir": {}})];
    let h = Harness::with(
        task_loop(TaskLoopSpec {
            timeout: Some("5m".to_string()),
            ..loop_spec()
        }),
        run,
    )
    .await;
    h.reconcile().await.unwrap();

    let child = h.children().await.remove(0);
    assert_eq!(child.spec.service_account_name.as_deref(), Some("builder"));
    assert_eq!(child.spec.pod_template.unwrap()["nodeSelector"]["disk"], "ssd");
    assert_eq!(child.spec.workspaces[0]["name"], "source");
    assert_eq!(child.spec.timeout.as_deref(), Some("5m"));
}

#[tokio::test]
async fn failed_metadata_patch_still_writes_status() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.store
        .fail_next(Verb::Patch, Resource::Run, "conflict")
        .await;

    let err = h.reconcile().await.unwrap_err();
    assert!(err.to_string().contains("patching Run foo/run-taskloop"));

    let run = h.run().await;
    assert_eq!(condition(&run).2, "Iterations completed: 0");
    assert!(!run.labels().contains_key(TASKLOOP_LABEL));
    assert_eq!(h.children().await.len(), 1);

    h.reconcile().await.unwrap();
    assert_eq!(h.run().await.labels()[TASKLOOP_LABEL], "a-taskloop");
    assert_eq!(h.children().await.len(), 1);
}

#[tokio::test]
async fn failed_status_write_recovers_without_duplicates() {
    let h = Harness::with(loop_with_retries(0), two_items()).await;
    h.store
        .fail_next(Verb::UpdateStatus, Resource::Run, "nope")
        .await;

    let err = h.reconcile().await.unwrap_err();
    assert!(err.to_string().contains("updating status of Run foo/run-taskloop"));
    assert!(h.run().await.status.is_none());
    assert_eq!(h.children().await.len(), 1);

    h.reconcile().await.unwrap();
    let children = h.children().await;
    assert_eq!(children.len(), 1);

    let run = h.run().await;
    assert_eq!(condition(&run).2, "Iterations completed: 0");
    let status = TaskLoopRunStatus::decode(&run).unwrap();
    assert_eq!(status.task_runs[&children[0].name_any()].iteration, 1);
}

#[tokio::test]
async fn start_time_is_not_before_creation_under_clock_skew() {
    let created = Utc::now() + Duration::hours(1);
    let mut run = two_items();
    run.metadata.creation_timestamp = Some(Time(created));
    let h = Harness::with(loop_with_retries(0), run).await;
    h.reconcile().await.unwrap();

    let run = h.run().await;
    assert_eq!(run.status.as_ref().unwrap().start_time, Some(Time(created)));
}

#[tokio::test]
async fn failed_retry_update_is_retried_on_the_next_pass() {
    let h = Harness::with(loop_with_retries(1), two_items()).await;
    h.reconcile().await.unwrap();
    let first = h.children().await[0].name_any();
    h.finish_child(&first, ConditionStatus::False).await;

    h.store
        .fail_next(Verb::UpdateStatus, Resource::TaskRun, "throttled")
        .await;
    let err = h.reconcile().await.unwrap_err();
    assert!(err.to_string().contains(&format!("retrying TaskRun {first}")));

    let child = h.store.task_run(NAMESPACE, &first).await.unwrap();
    assert!(child.is_done());
    assert_eq!(child.retries_attempted(), 0);
    assert!(!h.run().await.is_done());

    h.reconcile().await.unwrap();
    let child = h.store.task_run(NAMESPACE, &first).await.unwrap();
    assert!(!child.is_done());
    assert_eq!(child.retries_attempted(), 1);
    assert_eq!(h.children().await.len(), 1);
    assert_eq!(condition(&h.run().await).0, ConditionStatus::Unknown);
}

#[tokio::test]
async fn duplicate_child_is_waited_for_and_cancelled() {
    let h = Harness::with(loop_with_retries(0), run_with_items(&["item1"])).await;
    h.reconcile().await.unwrap();

    let original = h.children().await.remove(0);
    let mut duplicate = original.clone();
    duplicate.metadata.name = Some("run-taskloop-00001-dupli".to_string());
    duplicate.metadata.uid = None;
    duplicate.metadata.resource_version = None;
    duplicate.metadata.creation_timestamp = original
        .creation_timestamp()
        .map(|created| Time(created.0 + Duration::minutes(1)));
    h.store.insert_task_run(duplicate).await;

    h.finish_child(&original.name_any(), ConditionStatus::True)
        .await;
    h.reconcile().await.unwrap();
    assert_eq!(condition(&h.run().await).0, ConditionStatus::Unknown);

    h.cancel_run().await;
    h.reconcile().await.unwrap();

    let duplicate = h
        .store
        .task_run(NAMESPACE, "run-taskloop-00001-dupli")
        .await
        .unwrap();
    assert!(duplicate.is_cancel_requested());
    assert_eq!(condition(&h.run().await).2, "Cancelling TaskRuns");
}
