//! Types shared by the Tekton `Run`, `TaskRun` and `TaskLoop` resources

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition type that carries the overall outcome of a Run or TaskRun
pub const CONDITION_SUCCEEDED: &str = "Succeeded";

/// Value of a Tekton parameter: either a single string or an array of strings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Array(Vec<String>),
}

impl ParamValue {
    /// Short type name used in error messages
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Array(_) => "array",
        }
    }
}

/// Named parameter binding
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
}

impl Param {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ParamValue::String(value.into()),
        }
    }

    pub fn array<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            value: ParamValue::Array(values.into_iter().map(Into::into).collect()),
        }
    }
}

/// Reference to a Task definition
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    /// Name of the referenced Task
    #[serde(default)]
    pub name: String,

    /// Kind of the referenced Task (Task or ClusterTask)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// API version of the referenced Task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// OCI bundle containing the Task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
}

/// Status of a condition (True, False, or Unknown)
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Knative-style condition as found on Tekton resources
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// Machine-readable reason for the condition's last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    /// Build a `Succeeded` condition
    pub fn succeeded(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type: CONDITION_SUCCEEDED.to_string(),
            status,
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }

    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Equality that ignores the transition timestamp
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Find a condition by type
#[must_use]
pub fn get_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Insert or replace a condition by type.
///
/// The transition time only moves when the status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status && existing.last_transition_time.is_some() {
                condition.last_transition_time = existing.last_transition_time.clone();
            } else if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(Time(Utc::now()));
            }
            *existing = condition;
        }
        None => {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(Time(Utc::now()));
            }
            conditions.push(condition);
        }
    }
}
