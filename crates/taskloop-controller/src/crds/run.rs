//! Tekton `Run` resource (custom task invocation)
//!
//! The `Run` CRD is owned by Tekton Pipelines; this type mirrors the fields the
//! TaskLoop controller reads and writes, so schema generation is disabled.

use super::common::{get_condition, set_condition, Condition, ConditionStatus, Param, CONDITION_SUCCEEDED};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of `spec.status` when cancellation has been requested
pub const RUN_SPEC_STATUS_CANCELLED: &str = "RunCancelled";

/// Reference from a Run to the custom task that implements it
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

/// `Run` CRD (tekton.dev/v1alpha1)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "tekton.dev", version = "v1alpha1", kind = "Run")]
#[kube(namespaced)]
#[kube(status = "RunStatus")]
#[kube(schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// Reference to the custom task definition
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<RunRef>,

    /// Embedded custom task spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,

    /// Parameter bindings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,

    /// Set to `RunCancelled` to request cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Status of the `Run`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<Value>,

    /// Opaque payload owned by the custom task controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_fields: Option<Value>,
}

impl Run {
    /// Whether `spec.ref` points at the given custom task kind.
    /// Runs without a reference are claimed so they can be failed explicitly.
    #[must_use]
    pub fn references(&self, api_version: &str, kind: &str) -> bool {
        match &self.spec.reference {
            Some(r) => r.api_version == api_version && r.kind == kind,
            None => true,
        }
    }

    #[must_use]
    pub fn succeeded_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| get_condition(&s.conditions, CONDITION_SUCCEEDED))
    }

    #[must_use]
    pub fn has_started(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.start_time.is_some())
    }

    /// Terminal once the Succeeded condition is True or False
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.succeeded_condition()
            .is_some_and(|c| c.status != ConditionStatus::Unknown)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.spec.status.as_deref() == Some(RUN_SPEC_STATUS_CANCELLED)
    }

    pub fn status_mut(&mut self) -> &mut RunStatus {
        self.status.get_or_insert_with(RunStatus::default)
    }

    /// Set the start time and an Unknown Succeeded condition
    pub fn initialize_conditions(&mut self, reason: &str) {
        let status = self.status_mut();
        if status.start_time.is_none() {
            status.start_time = Some(Time(Utc::now()));
        }
        if get_condition(&status.conditions, CONDITION_SUCCEEDED).is_none() {
            set_condition(
                &mut status.conditions,
                Condition::succeeded(ConditionStatus::Unknown, reason, ""),
            );
        }
    }

    pub fn mark_running(&mut self, reason: &str, message: impl Into<String>) {
        set_condition(
            &mut self.status_mut().conditions,
            Condition::succeeded(ConditionStatus::Unknown, reason, message),
        );
    }

    pub fn mark_succeeded(&mut self, reason: &str, message: impl Into<String>) {
        let status = self.status_mut();
        set_condition(
            &mut status.conditions,
            Condition::succeeded(ConditionStatus::True, reason, message),
        );
        status.completion_time = Some(Time(Utc::now()));
    }

    pub fn mark_failed(&mut self, reason: &str, message: impl Into<String>) {
        let status = self.status_mut();
        if status.start_time.is_none() {
            status.start_time = Some(Time(Utc::now()));
        }
        set_condition(
            &mut status.conditions,
            Condition::succeeded(ConditionStatus::False, reason, message),
        );
        status.completion_time = Some(Time(Utc::now()));
    }
}
