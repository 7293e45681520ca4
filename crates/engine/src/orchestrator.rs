//! Pattern orchestrator: runs a pattern's steps in order against one request context.
//!
//! A run loads the pattern, completes and type-checks its inputs, seeds the state with them, and
//! then walks the steps strictly sequentially. For each step it checks for cancellation, evaluates
//! the `when` condition, resolves arguments, dispatches through the runtime, and binds the result.
//! The first failure stops the run; the trace collected so far is returned with the error.

use std::sync::Arc;

use indexmap::IndexMap;
use meridian_types::{ExecutionTrace, PatternDefinition, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    condition::eval_condition,
    context::RequestContext,
    error::EngineError,
    pattern::PatternStore,
    resolve::{ResolutionScope, resolve_args},
    runtime::Runtime,
    state::StateView,
    trace::{StepTimer, TraceRecorder},
};

/// Outputs and trace of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub outputs: IndexMap<String, Value>,
    pub trace: ExecutionTrace,
}

/// A failed run: the error plus the partial trace up to and including the failing step.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: EngineError,
    pub trace: ExecutionTrace,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<PatternStore>,
    runtime: Arc<Runtime>,
}

impl Orchestrator {
    pub fn new(store: Arc<PatternStore>, runtime: Arc<Runtime>) -> Self {
        Self { store, runtime }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Runs the latest version of `pattern_id`.
    pub async fn run(
        &self,
        pattern_id: &str,
        context: Arc<RequestContext>,
        inputs: IndexMap<String, Value>,
    ) -> Result<RunOutput, RunFailure> {
        self.run_with_cancellation(pattern_id, context, inputs, CancellationToken::new())
            .await
    }

    /// Runs `pattern_id`, checking `cancel` before every step.
    ///
    /// A call already in flight when the token fires is allowed to finish, but its result is not
    /// bound and no further step is dispatched.
    pub async fn run_with_cancellation(
        &self,
        pattern_id: &str,
        context: Arc<RequestContext>,
        inputs: IndexMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunOutput, RunFailure> {
        let pattern = match self.store.load(pattern_id).await {
            Ok(pattern) => pattern,
            Err(error) => {
                return Err(RunFailure {
                    error,
                    trace: TraceRecorder::new().finish(pattern_id, None, &context),
                });
            }
        };
        self.execute(pattern, context, inputs, cancel).await
    }

    /// Runs an already loaded pattern.
    pub async fn execute(
        &self,
        pattern: Arc<PatternDefinition>,
        context: Arc<RequestContext>,
        inputs: IndexMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunOutput, RunFailure> {
        let mut recorder = TraceRecorder::new();
        let fail = |recorder: TraceRecorder, error: EngineError| RunFailure {
            error,
            trace: recorder.finish(&pattern.id, Some(&pattern.version), &context),
        };

        let inputs = match prepare_inputs(&pattern, inputs) {
            Ok(inputs) => inputs,
            Err(error) => return Err(fail(recorder, error)),
        };

        info!(
            pattern = %pattern.id,
            version = %pattern.version,
            request_id = %context.request_id(),
            snapshot = %context.snapshot_id(),
            steps = pattern.steps.len(),
            "pattern run started"
        );

        let ctx_value = context.to_value();
        let mut state = StateView::new(inputs.clone());

        for (index, step) in pattern.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(pattern = %pattern.id, step = index, "pattern run cancelled");
                return Err(fail(recorder, EngineError::Cancelled { index }));
            }

            let scope = ResolutionScope::new(&inputs, &state, &ctx_value);
            if let Some(condition) = &step.when
                && !eval_condition(condition, &scope)
            {
                recorder.record_skip(index, step);
                continue;
            }

            let timer = StepTimer::start();
            let args = match resolve_args(&step.args, &scope) {
                Ok(args) => args,
                Err(error) => {
                    let route = self.runtime.route(&step.capability);
                    recorder.record_failure(index, step, route, timer, &error);
                    let handler = route.map(|(handler, _)| handler.to_string());
                    let error = error.at_step(&pattern.id, index, &step.capability, handler);
                    return Err(fail(recorder, error));
                }
            };

            debug!(pattern = %pattern.id, step = index, capability = %step.capability, "dispatching step");
            match self
                .runtime
                .dispatch(&step.capability, Arc::clone(&context), state.clone(), args)
                .await
            {
                Ok(dispatched) => {
                    recorder.record_success(index, step, &dispatched, timer);
                    if cancel.is_cancelled() {
                        info!(pattern = %pattern.id, step = index, "pattern run cancelled; discarding in-flight result");
                        return Err(fail(recorder, EngineError::Cancelled { index: index + 1 }));
                    }
                    state = state.with_binding(step.binding.clone(), dispatched.result.data);
                }
                Err(error) => {
                    let route = self.runtime.route(&step.capability);
                    recorder.record_failure(index, step, route, timer, &error);
                    let handler = route.map(|(handler, _)| handler.to_string());
                    let error = error.at_step(&pattern.id, index, &step.capability, handler);
                    return Err(fail(recorder, error));
                }
            }
        }

        let outputs = state.project(&pattern.outputs);
        let trace = recorder.finish(&pattern.id, Some(&pattern.version), &context);
        info!(
            pattern = %pattern.id,
            request_id = %context.request_id(),
            completed = trace.completed(),
            "pattern run finished"
        );
        Ok(RunOutput { outputs, trace })
    }
}

/// Applies defaults and checks required inputs and declared types.
///
/// Inputs the pattern does not declare are rejected so a misspelled name cannot silently fall
/// back to a default.
pub fn prepare_inputs(
    pattern: &PatternDefinition,
    mut supplied: IndexMap<String, Value>,
) -> Result<IndexMap<String, Value>, EngineError> {
    if let Some(unknown) = supplied.keys().find(|name| !pattern.inputs.contains_key(*name)) {
        return Err(EngineError::invalid_input(
            unknown.clone(),
            format!("pattern '{}' does not declare this input", pattern.id),
        ));
    }

    let mut prepared = IndexMap::with_capacity(pattern.inputs.len());
    for (name, declaration) in &pattern.inputs {
        let value = match supplied.shift_remove(name).filter(|value| !value.is_null()) {
            Some(value) => value,
            None => match &declaration.default {
                Some(default) => default.clone(),
                None if declaration.required => {
                    return Err(EngineError::invalid_input(name.clone(), "required input is missing"));
                }
                None => continue,
            },
        };
        if !declaration.r#type.accepts(&value) {
            return Err(EngineError::invalid_input(
                name.clone(),
                format!("expected {}, found {}", declaration.r#type, value.type_name()),
            ));
        }
        prepared.insert(name.clone(), value);
    }
    Ok(prepared)
}
