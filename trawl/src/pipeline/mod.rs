//! The staged execution engine.

pub mod context;
pub mod executor;
pub mod stage;
pub mod stages;

pub use context::PipelineContext;
pub use executor::{ExecutionMetrics, Pipeline};
pub use stage::{Stage, StageResult};
