use anyhow::Result;
use image::{GrayImage, RgbImage};

/// Background matte: 0 = background, 255 = foreground
/// Dimensions match the input frame dimensions
pub type Matte = GrayImage;

/// Trait for background-removal backends
///
/// Each pipeline worker owns one remover, so implementations may keep
/// mutable per-session state without locking.
pub trait BackgroundRemover: Send {
    /// Remove the background from a batch of frames
    ///
    /// # Arguments
    /// * `frames` - Input RGB frames, in order
    /// * `model_name` - Identifier of the model to run
    ///
    /// # Returns
    /// * One matte per input frame, in the same order
    fn remove_many(&mut self, frames: Vec<RgbImage>, model_name: &str) -> Result<Vec<Matte>>;
}
