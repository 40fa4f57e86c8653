use super::probe::VideoInfo;
use super::FrameSource;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

/// Decodes a video file into RGB frames at a reduced working height
/// by reading raw `rgb24` frames from an ffmpeg child process.
pub struct FfmpegDecoder {
    child: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
    finished: bool,
}

impl FfmpegDecoder {
    pub fn spawn(ffmpeg: &str, input: &Path, info: &VideoInfo, height: u32) -> Result<Self> {
        let width = scaled_width(info.width, info.height, height)?;
        tracing::info!(
            "Decoding {} ({}x{} -> {}x{})",
            input.display(),
            info.width,
            info.height,
            width,
            height
        );

        let mut child = Command::new(ffmpeg)
            .args(["-v", "error", "-i"])
            .arg(input)
            .args(["-an", "-vf"])
            .arg(format!("scale={}:{}", width, height))
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {} decoder. Is ffmpeg installed?", ffmpeg))?;

        let stdout = child
            .stdout
            .take()
            .context("ffmpeg decoder has no stdout")?;

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            width,
            height,
            finished: false,
        })
    }

    /// Read until `buf` is full or the stream ends; returns the bytes read
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl FrameSource for FfmpegDecoder {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.finished {
            return Ok(None);
        }

        let frame_bytes = self.width as usize * self.height as usize * 3;
        let mut buf = vec![0u8; frame_bytes];
        let filled = self.fill(&mut buf).context("Failed to read from ffmpeg decoder")?;

        if filled == 0 {
            self.finished = true;
            let status = self.child.wait().context("Failed to wait on ffmpeg decoder")?;
            if !status.success() {
                bail!("ffmpeg decoder exited with {}", status);
            }
            return Ok(None);
        }
        if filled < frame_bytes {
            bail!("Truncated frame: got {} of {} bytes", filled, frame_bytes);
        }

        let frame = RgbImage::from_raw(self.width, self.height, buf)
            .context("Decoded frame does not match its geometry")?;
        Ok(Some(frame))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Width that keeps the aspect ratio at `height`, rounded to an even number
pub fn scaled_width(src_width: u32, src_height: u32, height: u32) -> Result<u32> {
    if src_width == 0 || src_height == 0 {
        bail!("Source has degenerate geometry {}x{}", src_width, src_height);
    }
    let exact = (src_width as u64 * height as u64 + src_height as u64 / 2) / src_height as u64;
    let even = (exact + 1) / 2 * 2;
    Ok(even.max(2) as u32)
}
