//! `TaskLoop` Custom Resource Definition
//!
//! A TaskLoop runs a Task once per element of an array parameter. Runs reference
//! it through `spec.ref` and the controller records its progress in the Run's
//! `status.extraFields`.

use super::common::TaskRef;
use kube::CustomResource;
use lazy_static::lazy_static;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// API group of the TaskLoop CRD
pub const TASKLOOP_GROUP: &str = "custom.tekton.dev";

/// `apiVersion` a Run must reference to be handled by this controller
pub const TASKLOOP_API_VERSION: &str = "custom.tekton.dev/v1alpha1";

/// Kind a Run must reference to be handled by this controller
pub const TASKLOOP_KIND: &str = "TaskLoop";

const MAX_NAME_LENGTH: usize = 63;
const MAX_PREFIX_LENGTH: usize = 253;

lazy_static! {
    /// Go `time.ParseDuration` syntax, e.g. "90s", "1h30m", "1.5h"
    static ref DURATION_PATTERN: Regex =
        Regex::new(r"^([0-9]+(\.[0-9]+)?(ns|us|µs|ms|s|m|h))+$").unwrap();

    /// Name part of a Kubernetes qualified name
    static ref QUALIFIED_NAME_PATTERN: Regex =
        Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap();

    /// DNS-1123 subdomain used as a qualified name prefix
    static ref DNS_SUBDOMAIN_PATTERN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap();
}

/// `TaskLoop` CRD for iterating a Task over an array parameter
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(group = "custom.tekton.dev", version = "v1alpha1", kind = "TaskLoop")]
#[kube(namespaced)]
#[kube(printcolumn = r#"{"name":"Iterate","type":"string","jsonPath":".spec.iterateParam"}"#)]
#[kube(printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".spec.retries"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct TaskLoopSpec {
    /// Reference to a Task definition (mutually exclusive with `taskSpec`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    /// Inline Task definition (mutually exclusive with `taskRef`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<serde_json::Value>,

    /// Name of the Task parameter that is iterated upon
    #[serde(default)]
    pub iterate_param: String,

    /// Time after which each TaskRun times out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// How many times a failed iteration is retried
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: i32,

    /// Maximum number of iterations running at once.
    /// Absent means sequential; zero or negative means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<i32>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &i32) -> bool {
    *n == 0
}

/// Reasons for the Run `Succeeded` condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLoopRunReason {
    /// The Run has just started
    Started,
    /// Iterations are in progress
    Running,
    /// One of the TaskRuns failed and no retries remain
    Failed,
    /// All TaskRuns completed successfully
    Succeeded,
    /// The Run was cancelled
    Cancelled,
    /// The Run was cancelled but a running TaskRun could not be patched
    CouldntCancel,
    /// The referenced TaskLoop could not be retrieved
    CouldntGetTaskLoop,
    /// The TaskLoop or the Run failed runtime validation
    FailedValidation,
    /// Unexpected failure inside the reconciler
    InternalError,
}

impl TaskLoopRunReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::Succeeded => "Succeeded",
            Self::Cancelled => "TaskLoopRunCancelled",
            Self::CouldntCancel => "TaskLoopRunCouldntCancel",
            Self::CouldntGetTaskLoop => "CouldntGetTaskLoop",
            Self::FailedValidation => "TaskLoopValidationFailed",
            Self::InternalError => "TaskLoopInternalError",
        }
    }
}

impl fmt::Display for TaskLoopRunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TaskLoop validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("expected exactly one, got both: {0}")]
    MultipleOneOf(&'static str),

    #[error("expected exactly one, got neither: {0}")]
    MissingOneOf(&'static str),

    #[error("missing field(s): {0}")]
    MissingField(&'static str),

    #[error("invalid value: {reason}: {field}")]
    InvalidValue { field: &'static str, reason: String },
}

impl TaskLoopSpec {
    fn has_task_ref(&self) -> bool {
        self.task_ref.as_ref().is_some_and(|r| !r.name.is_empty())
    }

    /// Effective concurrency limit: `None` means unlimited
    #[must_use]
    pub fn concurrency_limit(&self) -> Option<usize> {
        match self.concurrency {
            None => Some(1),
            Some(n) if n <= 0 => None,
            Some(n) => usize::try_from(n).ok(),
        }
    }

    /// Retry budget per iteration
    #[must_use]
    pub fn retry_budget(&self) -> usize {
        usize::try_from(self.retries).unwrap_or(0)
    }

    /// Validate the spec before any TaskRun is created from it
    pub fn validate(&self) -> Result<(), ValidationError> {
        let one_of = "spec.taskRef, spec.taskSpec";
        match (self.has_task_ref(), self.task_spec.is_some()) {
            (true, true) => return Err(ValidationError::MultipleOneOf(one_of)),
            (false, false) => return Err(ValidationError::MissingOneOf(one_of)),
            _ => {}
        }

        if let Some(task_spec) = &self.task_spec {
            validate_inline_task(task_spec)?;
        }

        if let Some(task_ref) = self.task_ref.as_ref().filter(|r| !r.name.is_empty()) {
            validate_qualified_name(&task_ref.name).map_err(|reason| {
                ValidationError::InvalidValue {
                    field: "spec.taskRef.name",
                    reason,
                }
            })?;
        }

        if self.iterate_param.trim().is_empty() {
            return Err(ValidationError::MissingField("spec.iterateParam"));
        }

        if let Some(timeout) = &self.timeout {
            if !DURATION_PATTERN.is_match(timeout) {
                return Err(ValidationError::InvalidValue {
                    field: "spec.timeout",
                    reason: format!("{timeout:?} is not a valid duration"),
                });
            }
        }

        if self.retries < 0 {
            return Err(ValidationError::InvalidValue {
                field: "spec.retries",
                reason: format!("{} must be zero or greater", self.retries),
            });
        }

        Ok(())
    }
}

fn validate_inline_task(task_spec: &serde_json::Value) -> Result<(), ValidationError> {
    let steps = task_spec
        .as_object()
        .ok_or_else(|| ValidationError::InvalidValue {
            field: "spec.taskSpec",
            reason: "inline task must be an object".to_string(),
        })?
        .get("steps")
        .and_then(serde_json::Value::as_array);

    match steps {
        Some(steps) if !steps.is_empty() => Ok(()),
        _ => Err(ValidationError::MissingField("spec.taskSpec.steps")),
    }
}

/// Kubernetes qualified name: `[prefix/]name`
fn validate_qualified_name(value: &str) -> Result<(), String> {
    let (prefix, name) = match value.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, value),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            return Err("prefix part must be non-empty".to_string());
        }
        if prefix.len() > MAX_PREFIX_LENGTH || !DNS_SUBDOMAIN_PATTERN.is_match(prefix) {
            return Err("prefix part must be a lowercase RFC 1123 subdomain".to_string());
        }
    }

    if name.is_empty() {
        return Err("name part must be non-empty".to_string());
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!(
            "name part must be no more than {MAX_NAME_LENGTH} characters"
        ));
    }
    if !QUALIFIED_NAME_PATTERN.is_match(name) {
        return Err(
            "name part must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character"
                .to_string(),
        );
    }
    Ok(())
}
