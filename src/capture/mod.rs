mod ffmpeg_decode;
pub mod probe;

pub use ffmpeg_decode::{scaled_width, FfmpegDecoder};
pub use probe::{probe_video, FrameRate, VideoInfo};

use anyhow::Result;
use image::RgbImage;

/// Trait for decoded frame sources
///
/// A source is finite and cannot be restarted; frames come out in decode order.
pub trait FrameSource: Send {
    /// Decode the next frame, or `None` once the stream is exhausted
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Get the resolution of decoded frames
    fn resolution(&self) -> (u32, u32);
}
