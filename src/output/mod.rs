mod ffmpeg_encode;

pub use ffmpeg_encode::{encoder_args, matte_output_path, FfmpegEncoder};

use anyhow::Result;
use image::GrayImage;

/// Trait for output destinations
pub trait MatteSink {
    /// Write a frame to the output
    fn write_frame(&mut self, frame: &GrayImage) -> Result<()>;

    /// Close the output and wait for it to be fully written
    fn finish(&mut self) -> Result<()>;

    /// Tear the output down after a failure, leaving nothing that looks complete
    fn abort(&mut self);

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}
