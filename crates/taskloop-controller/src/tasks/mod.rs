use crate::crds::{Run, TaskRun, TASKLOOP_API_VERSION, TASKLOOP_KIND};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, Instrument};

pub mod config;
pub mod events;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod store;
pub mod taskloop;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use events::{EventRecorder, KubeEventRecorder};
#[cfg(any(test, feature = "test-support"))]
pub use events::MemoryRecorder;
#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryStore;
pub use store::{KubeStore, RunStore, StoreError};
pub use taskloop::TaskLoopRunReconciler;
pub use types::{Error, Result};

// Context is crate-internal only
use types::Context;

/// Main entry point for the TaskLoop controller
#[instrument(skip(client, config), fields(namespace = ?config.controller.namespace))]
pub async fn run_task_loop_controller(client: Client, config: Arc<ControllerConfig>) -> Result<()> {
    info!("Starting TaskLoop controller");

    let (runs, task_runs): (Api<Run>, Api<TaskRun>) = match &config.controller.namespace {
        Some(namespace) => (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client.clone(), namespace),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let reconciler = TaskLoopRunReconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeEventRecorder::new(
            client,
            config.controller.agent_name.clone(),
        )),
    );
    let context = Arc::new(Context { config, reconciler });

    debug!("Controller context created successfully");

    let watcher_config = Config::default().any_semantic();
    Controller::new(runs, watcher_config.clone())
        .owns(task_runs, watcher_config)
        .run(reconcile_run, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("taskloop_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(run_resource) => {
                        debug!(resource = ?run_resource, "Run reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "Run reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("TaskLoop controller shutting down");
    Ok(())
}

/// Reconcile one Run delivered by the controller runtime
#[instrument(skip(run, ctx), fields(run = %run.name_any(), namespace = ?run.namespace()))]
async fn reconcile_run(run: Arc<Run>, ctx: Arc<Context>) -> Result<Action> {
    if !run.references(TASKLOOP_API_VERSION, TASKLOOP_KIND) {
        return Ok(Action::await_change());
    }
    if run.namespace().is_none() {
        return Err(Error::MissingObjectKey);
    }

    let mut run = run.as_ref().clone();
    ctx.reconciler.reconcile_kind(&mut run).await?;

    // Children changing state re-enqueue the Run through the owner watch
    Ok(Action::await_change())
}

/// Requeue after a transient failure
fn error_policy(run: Arc<Run>, err: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.config.controller.error_requeue_seconds;
    error!(
        error = %err,
        run = %run.name_any(),
        requeue_seconds = delay,
        "Run reconciliation failed, requeueing"
    );
    Action::requeue(Duration::from_secs(delay))
}
