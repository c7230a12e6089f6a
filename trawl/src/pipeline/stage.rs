//! The stage contract and its per-run outcome report.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::pipeline::context::PipelineContext;

/// Outcome of one stage execution.
///
/// `success` starts true and flips on the first recorded error; warnings
/// never flip it. `halt` asks the pipeline to stop after this stage
/// without treating the run as failed.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage_name: String,
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Stage-specific figures for metrics and logs.
    pub data: HashMap<String, Value>,
    pub execution_time: Duration,
    /// Items this stage handled, whatever "item" means for the stage.
    pub processed_count: usize,
    pub halt: bool,
}

impl StageResult {
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            data: HashMap::new(),
            execution_time: Duration::ZERO,
            processed_count: 0,
            halt: false,
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.success = false;
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Stop the pipeline after this stage, successfully.
    pub fn halt_pipeline(&mut self) {
        self.halt = true;
    }
}

/// A unit of pipeline work.
///
/// `validate_config` runs for every stage before any stage does work, so
/// it must only inspect the stage's own configuration. The pre and post
/// hooks are optional; an error from `pre_process` fails the stage, an
/// error from `post_process` only adds a warning.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Configuration problems, one message each. Empty means valid.
    fn validate_config(&self) -> Vec<String> {
        Vec::new()
    }

    async fn pre_process(&self, _ctx: &mut PipelineContext) -> Result<()> {
        Ok(())
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult;

    async fn post_process(&self, _ctx: &mut PipelineContext, _result: &StageResult) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn errors_flip_success_and_warnings_do_not() {
        let mut result = StageResult::new("demo");
        assert!(result.success);

        result.add_warning("slow source");
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);

        result.add_error("source unreachable");
        assert!(!result.success);
        assert_eq!(result.errors, vec!["source unreachable".to_string()]);
    }

    #[test]
    fn data_round_trips() {
        let mut result = StageResult::new("demo");
        result.set_data("post_count", json!(42));
        assert_eq!(result.get_data("post_count"), Some(&json!(42)));
        assert_eq!(result.get_data("missing"), None);
    }

    #[test]
    fn halt_is_not_a_failure() {
        let mut result = StageResult::new("demo");
        result.halt_pipeline();
        assert!(result.halt);
        assert!(result.success);
    }
}
