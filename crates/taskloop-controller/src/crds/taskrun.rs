//! Tekton `TaskRun` resource (tekton.dev/v1beta1)

use super::common::{get_condition, set_condition, Condition, ConditionStatus, Param, TaskRef, CONDITION_SUCCEEDED};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Value of `spec.status` when cancellation has been requested
pub const TASKRUN_SPEC_STATUS_CANCELLED: &str = "TaskRunCancelled";

/// `TaskRun` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(group = "tekton.dev", version = "v1beta1", kind = "TaskRun")]
#[kube(namespaced)]
#[kube(status = "TaskRunStatus")]
#[kube(schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    /// Inline task template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<Value>,

    /// Go-style duration string (e.g. "1h0m0s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<Value>,

    /// Set to `TaskRunCancelled` to request cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Status of the `TaskRun`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    /// Snapshots of earlier attempts, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries_status: Vec<TaskRunStatus>,

    /// Fields written by the execution layer that this controller passes through
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TaskRunStatus {
    #[must_use]
    pub fn succeeded_condition(&self) -> Option<&Condition> {
        get_condition(&self.conditions, CONDITION_SUCCEEDED)
    }

    pub fn set_succeeded(&mut self, status: ConditionStatus, reason: &str, message: &str) {
        set_condition(
            &mut self.conditions,
            Condition::succeeded(status, reason, message),
        );
    }
}

impl TaskRun {
    #[must_use]
    pub fn succeeded_condition(&self) -> Option<&Condition> {
        self.status.as_ref().and_then(TaskRunStatus::succeeded_condition)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.succeeded_condition()
            .is_some_and(|c| c.status != ConditionStatus::Unknown)
    }

    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.succeeded_condition()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Cancellation has been requested on the spec
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.spec.status.as_deref() == Some(TASKRUN_SPEC_STATUS_CANCELLED)
    }

    /// Number of retries already attempted
    #[must_use]
    pub fn retries_attempted(&self) -> usize {
        self.status.as_ref().map_or(0, |s| s.retries_status.len())
    }
}
