use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

/// Frame rate as reported by ffprobe, e.g. `30000/1001`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u64,
    pub den: u64,
}

impl FrameRate {
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Whole frames per second, rounded up (`30000/1001` -> 30)
    pub fn ceil(&self) -> u64 {
        self.num.div_ceil(self.den)
    }
}

impl FromStr for FrameRate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (num, den) = match s.split_once('/') {
            Some((num, den)) => (num.trim(), den.trim()),
            None => (s, "1"),
        };

        let num: u64 = num
            .parse()
            .with_context(|| format!("Invalid frame rate numerator in '{}'", s))?;
        let den: u64 = den
            .parse()
            .with_context(|| format!("Invalid frame rate denominator in '{}'", s))?;

        if num == 0 || den == 0 {
            bail!("Frame rate '{}' is not a positive ratio", s);
        }

        Ok(Self { num, den })
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Stream metadata of the first video stream
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub total_frames: usize,
    pub frame_rate: FrameRate,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    nb_frames: Option<String>,
    r_frame_rate: Option<String>,
}

/// Run ffprobe on `path` and read the first video stream's metadata
pub fn probe_video(ffprobe: &str, path: &Path) -> Result<VideoInfo> {
    tracing::debug!("Probing {}", path.display());

    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,nb_frames,r_frame_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .with_context(|| format!("Failed to run {}. Is ffmpeg installed?", ffprobe))?;

    if !output.status.success() {
        bail!(
            "Cannot probe '{}': {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let json = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&json).with_context(|| format!("Cannot probe '{}'", path.display()))
}

pub fn parse_probe_output(json: &str) -> Result<VideoInfo> {
    let parsed: ProbeOutput = serde_json::from_str(json).context("Malformed ffprobe output")?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No video stream found"))?;

    let width = stream.width.ok_or_else(|| anyhow!("Video stream has no width"))?;
    let height = stream.height.ok_or_else(|| anyhow!("Video stream has no height"))?;
    let total_frames = stream
        .nb_frames
        .as_deref()
        .ok_or_else(|| anyhow!("Video stream does not report a frame count"))?
        .trim()
        .parse::<usize>()
        .context("Invalid frame count")?;
    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .ok_or_else(|| anyhow!("Video stream does not report a frame rate"))?
        .parse()?;

    Ok(VideoInfo {
        width,
        height,
        total_frames,
        frame_rate,
    })
}
