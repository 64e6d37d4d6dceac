//! TaskLoop custom task
//!
//! A Run referencing a TaskLoop runs the TaskLoop's Task once per element of
//! the iterate parameter:
//!
//! - **planner**: number of iterations and per-iteration params
//! - **factory**: child TaskRun construction and creation
//! - **progress**: current children indexed by iteration
//! - **retry**: in-place retries of failed iterations
//! - **cancel**: cancellation of in-flight children
//! - **reconciler**: the state machine tying these together

pub mod cancel;
pub mod factory;
pub mod labels;
pub mod planner;
pub mod progress;
pub mod reconciler;
pub mod retry;
pub mod status;

pub use reconciler::TaskLoopRunReconciler;
pub use status::{TaskLoopRunStatus, TaskLoopTaskRunStatus};
