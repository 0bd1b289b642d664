//! Pipeline runner
//!
//! A pipeline is an ordered list of steps. Each step substitutes its params
//! against the accumulated context (strict mode), invokes the named tool,
//! and stores the result under its output key so later steps and the
//! response template can reference it. Order is therefore meaningful:
//! referencing a later step's output fails deterministically.

pub mod context;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StepConfig;
use crate::expr::{self, SubstituteMode};
use crate::tools::ToolRegistry;

pub use context::{ContextBuilder, WebhookRequest};

/// Result type for pipeline execution
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error type for pipeline execution
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// A step failed in strict mode
    #[error("Step {step} ('{tool}') failed: {message}")]
    StepFailed {
        step: usize,
        tool: String,
        message: String,
    },

    /// The whole pipeline exceeded its deadline
    #[error("Pipeline timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// How the runner reacts to a failing step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Abort on the first failing step
    Strict,
    /// Record the failure and continue; the failed step's output key is
    /// simply absent from the context
    BestEffort,
}

/// Record of one executed step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub tool: String,
    pub output: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of a full pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    /// Context after the last executed step (base context plus outputs)
    #[serde(skip)]
    pub context: Map<String, Value>,
    pub steps: Vec<StepResult>,
    /// False when any step failed (best-effort runs can still return Ok)
    pub success: bool,
    pub duration_ms: u64,
}

/// Run a pipeline to completion or deadline.
///
/// The context accumulates: step N sees the base context plus the outputs
/// of steps 1..N-1. The caller receives the final context for response
/// template rendering.
pub async fn run(
    steps: &[StepConfig],
    base_ctx: Map<String, Value>,
    registry: &Arc<ToolRegistry>,
    mode: PipelineMode,
    timeout: Duration,
) -> PipelineResult<PipelineOutcome> {
    let secs = timeout.as_secs();
    match tokio::time::timeout(timeout, run_steps(steps, base_ctx, registry, mode)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout { secs }),
    }
}

async fn run_steps(
    steps: &[StepConfig],
    mut ctx: Map<String, Value>,
    registry: &Arc<ToolRegistry>,
    mode: PipelineMode,
) -> PipelineResult<PipelineOutcome> {
    let started = Instant::now();
    let mut results = Vec::with_capacity(steps.len());
    let mut success = true;

    for (index, step) in steps.iter().enumerate() {
        let step_started = Instant::now();
        let step_number = index + 1;

        match run_step(step, &ctx, registry).await {
            Ok(value) => {
                let duration_ms = step_started.elapsed().as_millis() as u64;
                debug!(
                    step = step_number,
                    tool = %step.tool,
                    output = %step.output,
                    duration_ms,
                    "Step completed"
                );
                ctx.insert(step.output.clone(), value);
                results.push(StepResult {
                    tool: step.tool.clone(),
                    output: step.output.clone(),
                    success: true,
                    error: None,
                    duration_ms,
                });
            }
            Err(message) => {
                let duration_ms = step_started.elapsed().as_millis() as u64;
                warn!(
                    step = step_number,
                    tool = %step.tool,
                    error = %message,
                    "Step failed"
                );
                success = false;
                results.push(StepResult {
                    tool: step.tool.clone(),
                    output: step.output.clone(),
                    success: false,
                    error: Some(message.clone()),
                    duration_ms,
                });
                if mode == PipelineMode::Strict {
                    return Err(PipelineError::StepFailed {
                        step: step_number,
                        tool: step.tool.clone(),
                        message,
                    });
                }
            }
        }
    }

    Ok(PipelineOutcome {
        context: ctx,
        steps: results,
        success,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Substitute params and invoke one step's tool
async fn run_step(
    step: &StepConfig,
    ctx: &Map<String, Value>,
    registry: &Arc<ToolRegistry>,
) -> Result<Value, String> {
    let params = expr::substitute(&step.params, ctx, SubstituteMode::Strict)
        .map_err(|e| e.to_string())?;
    let tool = registry.get(&step.tool).map_err(|e| e.to_string())?;
    tool.invoke(params).await.map_err(|e| e.to_string())
}
