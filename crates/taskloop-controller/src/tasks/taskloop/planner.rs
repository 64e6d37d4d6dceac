//! Iteration planning from the Run's iterate parameter

use crate::crds::{Param, ParamValue, Run, TaskLoopSpec};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("The iterate parameter {0:?} was not found")]
    IterateParamNotFound(String),

    #[error("The value of the iterate parameter {name:?} is a {found}, not an array")]
    IterateParamNotArray { name: String, found: &'static str },

    #[error("Iteration {iteration} is out of range for {total} values")]
    IterationOutOfRange { iteration: u32, total: usize },
}

fn iterate_values<'a>(run: &'a Run, spec: &TaskLoopSpec) -> Result<&'a [String], PlanError> {
    let param = run
        .spec
        .params
        .iter()
        .find(|p| p.name == spec.iterate_param)
        .ok_or_else(|| PlanError::IterateParamNotFound(spec.iterate_param.clone()))?;

    match &param.value {
        ParamValue::Array(values) => Ok(values),
        other => Err(PlanError::IterateParamNotArray {
            name: spec.iterate_param.clone(),
            found: other.type_name(),
        }),
    }
}

/// Number of iterations: the length of the iterate parameter array
pub fn compute_iterations(run: &Run, spec: &TaskLoopSpec) -> Result<usize, PlanError> {
    iterate_values(run, spec).map(<[String]>::len)
}

/// Value consumed by a 1-based iteration
pub fn iteration_value<'a>(
    run: &'a Run,
    spec: &TaskLoopSpec,
    iteration: u32,
) -> Result<&'a str, PlanError> {
    let values = iterate_values(run, spec)?;
    usize::try_from(iteration)
        .ok()
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| values.get(i))
        .map(String::as_str)
        .ok_or(PlanError::IterationOutOfRange {
            iteration,
            total: values.len(),
        })
}

/// Run params with the iterate parameter replaced by its scalar for `iteration`
pub fn iteration_params(
    run: &Run,
    spec: &TaskLoopSpec,
    iteration: u32,
) -> Result<Vec<Param>, PlanError> {
    let value = iteration_value(run, spec, iteration)?;
    Ok(run
        .spec
        .params
        .iter()
        .map(|p| {
            if p.name == spec.iterate_param {
                Param::string(p.name.clone(), value)
            } else {
                p.clone()
            }
        })
        .collect())
}
