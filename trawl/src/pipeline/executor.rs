//! # Stage Pipeline
//!
//! Runs stages strictly in registration order. Every stage's
//! configuration is validated before any stage does work; after that the
//! pipeline is fail-fast: the first failed stage ends the run and later
//! stages never execute. A stage can also halt the pipeline successfully,
//! which stops the run without marking it failed.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::events::{EventPayload, StagePhase};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageResult};

/// Summary of one pipeline execution.
#[derive(Debug)]
pub struct ExecutionMetrics {
    /// Per-stage outcomes in execution order. Shorter than the stage
    /// list when the run failed or halted early.
    pub results: Vec<StageResult>,
    pub total_stages: usize,
    pub successful_stages: usize,
    pub failed_stages: usize,
    /// Sum of the per-stage processed counts.
    pub posts_processed: usize,
    pub total_duration: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// A stage requested a successful early stop.
    pub halted: bool,
}

impl ExecutionMetrics {
    pub fn success(&self) -> bool {
        self.failed_stages == 0
    }

    pub fn stage_time(&self, stage_name: &str) -> Option<Duration> {
        self.results
            .iter()
            .find(|result| result.stage_name == stage_name)
            .map(|result| result.execution_time)
    }
}

/// An ordered chain of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Add a stage to the end of the pipeline.
    ///
    /// Returns self for method chaining.
    pub fn add_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Collect configuration problems from every stage.
    ///
    /// Messages are prefixed with the stage name. Duplicate stage names
    /// are reported here too since results and events are keyed by name.
    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name().to_string()) {
                problems.push(format!("duplicate stage name: {}", stage.name()));
            }
            for message in stage.validate_config() {
                problems.push(format!("{}: {}", stage.name(), message));
            }
        }
        problems
    }

    /// Run all stages against the context.
    ///
    /// Returns `Err` only when validation rejects the pipeline up front;
    /// stage failures are reported through [`ExecutionMetrics`] so the
    /// caller can still see partial results.
    pub async fn execute(&self, ctx: &mut PipelineContext) -> Result<ExecutionMetrics> {
        let problems = self.validate();
        if !problems.is_empty() {
            return Err(Error::validation(format!(
                "pipeline configuration invalid: {}",
                problems.join("; ")
            )));
        }

        let started_at = Utc::now();
        let run_timer = Instant::now();
        let mut results: Vec<StageResult> = Vec::new();
        let mut halted = false;

        for stage in &self.stages {
            let name = stage.name().to_string();
            ctx.emit(EventPayload::StageChanged {
                stage_name: name.clone(),
                phase: StagePhase::Started,
                execution_time: None,
                posts_processed: ctx.posts.len(),
                error_message: None,
            });
            info!(stage = %name, posts = ctx.posts.len(), "stage started");

            let stage_timer = Instant::now();
            let mut result = match stage.pre_process(ctx).await {
                Ok(()) => stage.process(ctx).await,
                Err(error) => {
                    let mut failed = StageResult::new(&name);
                    failed.add_error(format!("pre-process failed: {error}"));
                    failed
                }
            };
            result.stage_name = name.clone();
            result.execution_time = stage_timer.elapsed();

            if let Err(error) = stage.post_process(ctx, &result).await {
                result.add_warning(format!("post-process failed: {error}"));
            }
            for warning in &result.warnings {
                warn!(stage = %name, "{warning}");
            }

            let phase = if result.success {
                StagePhase::Completed
            } else {
                StagePhase::Failed
            };
            ctx.emit(EventPayload::StageChanged {
                stage_name: name.clone(),
                phase,
                execution_time: Some(result.execution_time),
                posts_processed: result.processed_count,
                error_message: result.errors.first().cloned(),
            });

            let failed = !result.success;
            let halt = result.halt;
            if failed {
                warn!(
                    stage = %name,
                    errors = result.errors.len(),
                    "stage failed, aborting pipeline"
                );
            } else {
                info!(
                    stage = %name,
                    processed = result.processed_count,
                    elapsed = ?result.execution_time,
                    "stage completed"
                );
            }
            results.push(result);

            if failed {
                break;
            }
            if halt {
                info!(stage = %name, "stage halted the pipeline");
                halted = true;
                break;
            }
        }

        let successful_stages = results.iter().filter(|result| result.success).count();
        let failed_stages = results.len() - successful_stages;
        let posts_processed = results.iter().map(|result| result.processed_count).sum();
        Ok(ExecutionMetrics {
            total_stages: self.stages.len(),
            successful_stages,
            failed_stages,
            posts_processed,
            total_duration: run_timer.elapsed(),
            started_at,
            finished_at: Utc::now(),
            halted,
            results,
        })
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
