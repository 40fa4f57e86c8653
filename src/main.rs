use anyhow::{Context, Result};
use clap::Parser;
use matte_fx::capture::{self, FfmpegDecoder, FrameSource};
use matte_fx::config::{PipelineConfig, Schedule, DEFAULT_WORKING_HEIGHT};
use matte_fx::output::{self, FfmpegEncoder, MatteSink};
use matte_fx::segmentation;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input video file
    input: PathBuf,

    /// Number of parallel inference workers
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// Frames per inference call
    #[arg(short, long, default_value_t = 4)]
    batch_size: usize,

    /// Model name, resolved to <models-dir>/<model>.onnx
    #[arg(short, long, default_value = "u2net")]
    model: String,

    /// Directory holding ONNX models
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Stop after this many frames (-1 for the whole video)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    frame_limit: i64,

    /// Working frame height
    #[arg(long, default_value_t = DEFAULT_WORKING_HEIGHT)]
    height: u32,

    /// Seconds any stage may wait for a frame or result before failing
    #[arg(long, default_value_t = 120)]
    stall_timeout: u64,

    /// Maximum decoded frames held in memory (default: 2 x workers x batch size)
    #[arg(long)]
    buffer_frames: Option<usize>,

    /// Batch scheduling: queue or interleaved
    #[arg(long, default_value = "queue")]
    schedule: Schedule,

    /// ffmpeg binary
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// ffprobe binary
    #[arg(long, default_value = "ffprobe")]
    ffprobe: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = PipelineConfig {
        worker_count: args.workers,
        gpu_batchsize: args.batch_size,
        model_name: args.model.clone(),
        frame_limit: args.frame_limit,
        working_height: args.height,
        stall_timeout: Duration::from_secs(args.stall_timeout),
        frame_buffer_capacity: args.buffer_frames,
        schedule: args.schedule,
    };
    config.validate()?;

    let info = capture::probe_video(&args.ffprobe, &args.input)?;
    let frame_rate = info.frame_rate.ceil();
    tracing::info!(
        "Source rate {:.3} fps ({}), encoding at {} fps, total frames: {}",
        info.frame_rate.as_f64(),
        info.frame_rate,
        frame_rate,
        config.total_frames(info.total_frames)
    );

    let output_path = output::matte_output_path(&args.input)?;

    let decoder = FfmpegDecoder::spawn(&args.ffmpeg, &args.input, &info, config.working_height)
        .context("Failed to start frame decoder")?;
    let source: Box<dyn FrameSource> = Box::new(decoder);

    let models_dir = args.models_dir.clone();
    let model_name = args.model.clone();
    let make_remover = move |_worker: usize| segmentation::create_remover(&models_dir, &model_name);

    let ffmpeg = args.ffmpeg.clone();
    let open_sink = move |width: u32, height: u32| -> Result<Box<dyn MatteSink>> {
        let encoder = FfmpegEncoder::spawn(&ffmpeg, &output_path, width, height, frame_rate)?;
        Ok(Box::new(encoder))
    };

    let report = matte_fx::run_pipeline(&config, info.total_frames, source, make_remover, open_sink)
        .context("Matting pipeline failed")?;

    let secs = report.elapsed.as_secs_f64();
    tracing::info!(
        "Done: {} frames in {} batches, {:.1}s ({:.1} fps)",
        report.frames_written,
        report.batches,
        secs,
        report.frames_written as f64 / secs.max(f64::EPSILON)
    );

    Ok(())
}
