mod onnx;
mod preprocess;
pub mod types;

pub use onnx::OnnxRemover;
pub use preprocess::Preprocessor;
pub use types::{BackgroundRemover, Matte};

use anyhow::Result;
use std::path::Path;

/// Create the default background remover (ONNX Runtime)
pub fn create_remover(models_dir: &Path, model_name: &str) -> Result<Box<dyn BackgroundRemover>> {
    let remover = OnnxRemover::open(models_dir, model_name)?;
    Ok(Box::new(remover))
}
