//! Kubernetes events for Run condition transitions

use crate::crds::{Condition, ConditionStatus, Run};
use crate::tasks::store::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::PostParams;
use kube::{Api, Client, Resource, ResourceExt};
use std::fmt;
#[cfg(any(test, feature = "test-support"))]
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.event_type, self.reason, self.message)
    }
}

/// Event for a change of the Succeeded condition, if there was one.
///
/// The first Unknown condition is reported as `Started`; later Unknown
/// conditions as `Running`.
#[must_use]
pub fn condition_event(before: Option<&Condition>, after: Option<&Condition>) -> Option<RunEvent> {
    let after = after?;
    if before.is_some_and(|b| b.same_state(after)) {
        return None;
    }

    let (event_type, reason) = match after.status {
        ConditionStatus::Unknown if before.is_none() => (EventType::Normal, "Started"),
        ConditionStatus::Unknown => (EventType::Normal, "Running"),
        ConditionStatus::True => (EventType::Normal, "Succeeded"),
        ConditionStatus::False => (EventType::Warning, "Failed"),
    };

    Some(RunEvent {
        event_type,
        reason: reason.to_string(),
        message: after.message().to_string(),
    })
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, run: &Run, event: RunEvent) -> Result<(), StoreError>;
}

/// Writes `core/v1` Events referencing the Run
pub struct KubeEventRecorder {
    client: Client,
    component: String,
}

impl KubeEventRecorder {
    #[must_use]
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, run: &Run, event: RunEvent) -> Result<(), StoreError> {
        let namespace = run.namespace().unwrap_or_default();
        let now = Time(Utc::now());
        let object = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", run.name_any())),
                namespace: Some(namespace.clone()),
                ..ObjectMeta::default()
            },
            involved_object: run.object_ref(&()),
            type_: Some(event.event_type.to_string()),
            reason: Some(event.reason),
            message: Some(event.message),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            ..Event::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), &object).await?;
        Ok(())
    }
}

/// Keeps published events in memory, formatted as `"<type> <reason> <message>"`
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MemoryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<String> {
        self.events.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(&self, _run: &Run, event: RunEvent) -> Result<(), StoreError> {
        self.events.lock().await.push(event.to_string());
        Ok(())
    }
}
