pub mod capture;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod segmentation;

pub use config::{PipelineConfig, Schedule};
pub use error::{BufferError, PipelineError, PipelineResult, Stage};
pub use pipeline::{run_pipeline, PipelineReport};
