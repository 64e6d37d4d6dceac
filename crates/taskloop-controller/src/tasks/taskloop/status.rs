//! Controller-owned status payload stored in `run.status.extraFields`

use crate::crds::{Run, TaskLoopSpec, TaskRunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of one child TaskRun as recorded on the Run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLoopTaskRunStatus {
    pub iteration: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskRunStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLoopRunStatus {
    /// TaskLoop spec captured on the first pass that resolved it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_loop_spec: Option<TaskLoopSpec>,

    /// Child name to iteration and last observed status
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_runs: BTreeMap<String, TaskLoopTaskRunStatus>,
}

impl TaskLoopRunStatus {
    /// Decode from the Run; a Run without extra fields decodes to the default
    pub fn decode(run: &Run) -> Result<Self, serde_json::Error> {
        match run.status.as_ref().and_then(|s| s.extra_fields.as_ref()) {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone()),
            _ => Ok(Self::default()),
        }
    }

    pub fn encode(&self, run: &mut Run) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(self)?;
        run.status_mut().extra_fields = Some(value);
        Ok(())
    }

    /// Capture `fetched` if no spec has been captured yet and return the spec
    /// in effect for this Run
    pub fn snapshot_spec(&mut self, fetched: TaskLoopSpec) -> &TaskLoopSpec {
        self.task_loop_spec.get_or_insert(fetched)
    }

    /// Record a child. The iteration is fixed once recorded; only the status
    /// is refreshed.
    pub fn record(&mut self, name: &str, iteration: u32, status: Option<TaskRunStatus>) {
        self.task_runs
            .entry(name.to_string())
            .and_modify(|entry| entry.status = status.clone())
            .or_insert(TaskLoopTaskRunStatus { iteration, status });
    }
}
