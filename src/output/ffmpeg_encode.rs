use super::MatteSink;
use anyhow::{bail, Context, Result};
use image::GrayImage;
use regex::Regex;
use std::ffi::OsString;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

/// Streams grayscale mattes into an ffmpeg child that encodes them to MPEG-4
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    output: PathBuf,
    width: u32,
    height: u32,
    done: bool,
}

impl FfmpegEncoder {
    pub fn spawn(ffmpeg: &str, output: &Path, width: u32, height: u32, fps: u64) -> Result<Self> {
        tracing::info!(
            "Encoding {}x{} @ {} fps to {}",
            width,
            height,
            fps,
            output.display()
        );

        let mut child = Command::new(ffmpeg)
            .args(encoder_args(width, height, fps, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {} encoder. Is ffmpeg installed?", ffmpeg))?;

        let stdin = child.stdin.take().context("ffmpeg encoder has no stdin")?;

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            output: output.to_path_buf(),
            width,
            height,
            done: false,
        })
    }
}

impl MatteSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &GrayImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            bail!(
                "Frame is {}x{} but the encoder was opened at {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }

        let stdin = self.stdin.as_mut().context("Encoder input is already closed")?;
        stdin
            .write_all(frame.as_raw())
            .context("Failed to write frame to ffmpeg encoder")?;

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().context("Failed to flush ffmpeg encoder input")?;
        }

        let status = self.child.wait().context("Failed to wait on ffmpeg encoder")?;
        self.done = true;
        if !status.success() {
            let _ = std::fs::remove_file(&self.output);
            bail!("ffmpeg encoder exited with {}", status);
        }

        tracing::info!("Wrote {}", self.output.display());
        Ok(())
    }

    fn abort(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();

        match std::fs::remove_file(&self.output) {
            Ok(()) => tracing::warn!("Removed partial output {}", self.output.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Could not remove partial output {}: {}",
                self.output.display(),
                e
            ),
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Arguments for encoding raw grayscale frames read from stdin
pub fn encoder_args(width: u32, height: u32, fps: u64, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-y".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-vcodec".to_string(),
        "rawvideo".to_string(),
        "-s".to_string(),
        format!("{}x{}", width, height),
        "-pix_fmt".to_string(),
        "gray".to_string(),
        "-r".to_string(),
        fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-an".to_string(),
        "-vcodec".to_string(),
        "mpeg4".to_string(),
        "-b:v".to_string(),
        "2000k".to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(output.as_os_str().to_os_string());
    args
}

/// `clip.MP4` -> `clip.matte.MP4`; other extensions get `.matte.mp4` appended
pub fn matte_output_path(input: &Path) -> Result<PathBuf> {
    let pattern = Regex::new(r"(?i)\.(mp4|mov|avi)$")?;

    if let Some(text) = input.to_str() {
        if pattern.is_match(text) {
            return Ok(PathBuf::from(pattern.replace(text, ".matte.$1").into_owned()));
        }
    }

    let mut fallback = input.as_os_str().to_os_string();
    fallback.push(".matte.mp4");
    Ok(PathBuf::from(fallback))
}
