//! Built-in pipeline stages.

pub mod acquisition;
pub mod filter;
pub mod processing;

pub use acquisition::{AcquisitionStage, JsonLinesSource, PostSource};
pub use filter::FilterStage;
pub use processing::{FetchedFile, HttpFetcher, MediaFetcher, ProcessingStage};
