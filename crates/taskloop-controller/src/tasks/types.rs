use crate::tasks::config::ControllerConfig;
use crate::tasks::store::StoreError;
use crate::tasks::taskloop::TaskLoopRunReconciler;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("{context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    pub fn transient(context: impl Into<String>, source: StoreError) -> Self {
        Self::Transient {
            context: context.into(),
            source,
        }
    }

    /// Collapse the errors gathered during one reconcile pass
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Context shared with the controller reconcile loop
pub(crate) struct Context {
    pub config: Arc<ControllerConfig>,
    pub reconciler: TaskLoopRunReconciler,
}
