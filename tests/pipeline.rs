use anyhow::{bail, Result};
use crossbeam_channel::Receiver;
use image::{GrayImage, RgbImage};
use matte_fx::capture::FrameSource;
use matte_fx::output::MatteSink;
use matte_fx::segmentation::{BackgroundRemover, Matte};
use matte_fx::{run_pipeline, PipelineConfig, PipelineError, Schedule, Stage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WIDTH: u32 = 6;
const HEIGHT: u32 = 4;

/// Frames whose pixels all carry their own index
struct TaggedSource {
    next: usize,
    frames: usize,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    /// Once exhausted, block on this instead of ending the stream
    hang: Option<Receiver<()>>,
}

impl TaggedSource {
    fn new(frames: usize) -> Self {
        Self {
            next: 0,
            frames,
            fail_at: None,
            panic_at: None,
            hang: None,
        }
    }
}

impl FrameSource for TaggedSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if Some(self.next) == self.fail_at {
            bail!("corrupt packet");
        }
        if Some(self.next) == self.panic_at {
            panic!("demuxer state corrupted");
        }
        if self.next == self.frames {
            if let Some(hang) = &self.hang {
                let _ = hang.recv();
                bail!("source hung up");
            }
            return Ok(None);
        }
        let tag = u8::try_from(self.next)?;
        self.next += 1;
        Ok(Some(RgbImage::from_pixel(WIDTH, HEIGHT, image::Rgb([tag, 0, 255 - tag]))))
    }

    fn resolution(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

#[derive(Default)]
struct InferenceStats {
    calls: AtomicUsize,
    sizes: Mutex<Vec<usize>>,
}

/// Copies the red channel into the matte, so the tag survives
struct TagRemover {
    stats: Arc<InferenceStats>,
    delay: Duration,
    fail_on_frame: Option<u8>,
    panic_on_frame: Option<u8>,
}

impl BackgroundRemover for TagRemover {
    fn remove_many(&mut self, frames: Vec<RgbImage>, model_name: &str) -> Result<Vec<Matte>> {
        assert_eq!(model_name, "stub");
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats.sizes.lock().unwrap().push(frames.len());
        thread::sleep(self.delay);

        frames
            .iter()
            .map(|frame| {
                let tag = frame.get_pixel(0, 0)[0];
                if Some(tag) == self.fail_on_frame {
                    bail!("CUDA out of memory");
                }
                if Some(tag) == self.panic_on_frame {
                    panic!("ort session aborted");
                }
                Ok(GrayImage::from_pixel(frame.width(), frame.height(), image::Luma([tag])))
            })
            .collect()
    }
}

#[derive(Default)]
struct Encoded {
    bytes: Vec<u8>,
    opened: Option<(u32, u32)>,
    finished: bool,
    aborted: bool,
}

struct RecordingSink(Arc<Mutex<Encoded>>);

impl MatteSink for RecordingSink {
    fn write_frame(&mut self, frame: &GrayImage) -> Result<()> {
        self.0.lock().unwrap().bytes.extend_from_slice(frame.as_raw());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.0.lock().unwrap().finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.0.lock().unwrap().aborted = true;
    }

    fn resolution(&self) -> (u32, u32) {
        self.0.lock().unwrap().opened.unwrap_or_default()
    }
}

impl Encoded {
    /// Split the encoder byte stream back into per-frame tags
    fn tags(&self) -> Vec<u8> {
        let frame_bytes = (WIDTH * HEIGHT) as usize;
        assert_eq!(self.bytes.len() % frame_bytes, 0);
        self.bytes
            .chunks(frame_bytes)
            .map(|frame| {
                assert!(frame.iter().all(|&b| b == frame[0]));
                frame[0]
            })
            .collect()
    }
}

struct Harness {
    stats: Arc<InferenceStats>,
    encoded: Arc<Mutex<Encoded>>,
    slow_worker: Option<usize>,
    fail_on_frame: Option<u8>,
    panic_on_frame: Option<u8>,
}

impl Harness {
    fn new() -> Self {
        Self {
            stats: Arc::new(InferenceStats::default()),
            encoded: Arc::new(Mutex::new(Encoded::default())),
            slow_worker: None,
            fail_on_frame: None,
            panic_on_frame: None,
        }
    }

    fn run(
        &self,
        config: &PipelineConfig,
        probed_frames: usize,
        source: TaggedSource,
    ) -> Result<matte_fx::PipelineReport, PipelineError> {
        let stats = Arc::clone(&self.stats);
        let slow_worker = self.slow_worker;
        let fail_on_frame = self.fail_on_frame;
        let panic_on_frame = self.panic_on_frame;
        let make_remover = move |worker: usize| -> Result<Box<dyn BackgroundRemover>> {
            let delay = if Some(worker) == slow_worker {
                Duration::from_millis(40)
            } else {
                Duration::ZERO
            };
            Ok(Box::new(TagRemover {
                stats: Arc::clone(&stats),
                delay,
                fail_on_frame,
                panic_on_frame,
            }))
        };

        let encoded = Arc::clone(&self.encoded);
        let open_sink = move |width: u32, height: u32| -> Result<Box<dyn MatteSink>> {
            encoded.lock().unwrap().opened = Some((width, height));
            Ok(Box::new(RecordingSink(encoded)))
        };

        run_pipeline(config, probed_frames, Box::new(source), make_remover, open_sink)
    }
}

fn config(workers: usize, batch: usize, schedule: Schedule) -> PipelineConfig {
    PipelineConfig {
        worker_count: workers,
        gpu_batchsize: batch,
        model_name: "stub".to_string(),
        stall_timeout: Duration::from_secs(10),
        schedule,
        ..PipelineConfig::default()
    }
}

#[test]
fn ten_frames_two_workers_batches_of_three() {
    for schedule in [Schedule::Queue, Schedule::Interleaved] {
        let harness = Harness::new();
        let report = harness
            .run(&config(2, 3, schedule), 10, TaggedSource::new(10))
            .unwrap();

        assert_eq!(report.batches, 4);
        assert_eq!(report.frames_written, 10);
        assert_eq!(harness.stats.calls.load(Ordering::SeqCst), 4);

        let encoded = harness.encoded.lock().unwrap();
        assert_eq!(encoded.tags(), (0..10).collect::<Vec<u8>>());
        assert_eq!(encoded.opened, Some((WIDTH, HEIGHT)));
        assert!(encoded.finished);
        assert!(!encoded.aborted);
    }
}

#[test]
fn output_order_survives_out_of_order_completion() {
    for schedule in [Schedule::Queue, Schedule::Interleaved] {
        let mut harness = Harness::new();
        harness.slow_worker = Some(0);
        harness
            .run(&config(3, 2, schedule), 25, TaggedSource::new(25))
            .unwrap();

        let encoded = harness.encoded.lock().unwrap();
        assert_eq!(encoded.tags(), (0..25).collect::<Vec<u8>>());
    }
}

#[test]
fn one_inference_call_per_batch() {
    let harness = Harness::new();
    harness
        .run(&config(3, 4, Schedule::Queue), 23, TaggedSource::new(23))
        .unwrap();

    assert_eq!(harness.stats.calls.load(Ordering::SeqCst), 6);
    let mut sizes = harness.stats.sizes.lock().unwrap().clone();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![3, 4, 4, 4, 4, 4]);
}

#[test]
fn frame_limit_truncates_without_waiting_for_the_source() {
    let (_keep_open, hang) = crossbeam_channel::bounded::<()>(0);
    let source = TaggedSource {
        hang: Some(hang),
        ..TaggedSource::new(8)
    };

    let mut cfg = config(2, 3, Schedule::Interleaved);
    cfg.frame_limit = 5;

    let harness = Harness::new();
    let started = Instant::now();
    let report = harness.run(&cfg, 40, source).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(report.total_frames, 5);
    assert_eq!(report.frames_written, 5);
    assert_eq!(harness.stats.calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.encoded.lock().unwrap().tags(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn tight_frame_buffer_still_completes() {
    let mut cfg = config(2, 3, Schedule::Queue);
    cfg.frame_buffer_capacity = Some(3);

    let harness = Harness::new();
    let report = harness.run(&cfg, 30, TaggedSource::new(30)).unwrap();
    assert_eq!(report.frames_written, 30);
    assert_eq!(harness.encoded.lock().unwrap().tags(), (0..30).collect::<Vec<u8>>());
}

#[test]
fn zero_frame_budget_never_opens_the_encoder() {
    let mut cfg = config(2, 3, Schedule::Queue);
    cfg.frame_limit = 0;

    let harness = Harness::new();
    let report = harness.run(&cfg, 10, TaggedSource::new(10)).unwrap();
    assert_eq!(report.frames_written, 0);
    assert_eq!(report.batches, 0);
    assert!(harness.encoded.lock().unwrap().opened.is_none());
}

#[test]
fn inference_failure_names_batch_position() {
    let mut harness = Harness::new();
    harness.fail_on_frame = Some(7);

    let err = harness
        .run(&config(2, 3, Schedule::Queue), 12, TaggedSource::new(12))
        .unwrap_err();
    match err {
        PipelineError::Inference { position, reason } => {
            assert_eq!(position, 3);
            assert!(reason.contains("CUDA out of memory"));
        }
        other => panic!("unexpected {}", other),
    }
    assert!(!harness.encoded.lock().unwrap().finished);
}

#[test]
fn inference_panic_is_reported_without_waiting_for_a_stall() {
    let mut harness = Harness::new();
    harness.panic_on_frame = Some(4);

    let mut cfg = config(2, 3, Schedule::Queue);
    cfg.stall_timeout = Duration::from_secs(30);

    let started = Instant::now();
    let err = harness.run(&cfg, 12, TaggedSource::new(12)).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    match err {
        PipelineError::Inference { position, reason } => {
            assert_eq!(position, 2);
            assert!(reason.contains("ort session aborted"), "{}", reason);
        }
        other => panic!("unexpected {}", other),
    }

    let encoded = harness.encoded.lock().unwrap();
    assert!(!encoded.finished);
}

#[test]
fn frame_source_panic_names_the_stage() {
    let source = TaggedSource {
        panic_at: Some(5),
        ..TaggedSource::new(10)
    };
    let mut cfg = config(2, 3, Schedule::Interleaved);
    cfg.stall_timeout = Duration::from_secs(30);

    let harness = Harness::new();
    let started = Instant::now();
    let err = harness.run(&cfg, 10, source).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    match err {
        PipelineError::Panicked { stage, reason } => {
            assert_eq!(stage, Stage::FrameSource);
            assert!(reason.contains("demuxer state corrupted"), "{}", reason);
        }
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn decode_failure_names_frame() {
    let source = TaggedSource {
        fail_at: Some(4),
        ..TaggedSource::new(10)
    };

    let harness = Harness::new();
    let err = harness.run(&config(2, 3, Schedule::Queue), 10, source).unwrap_err();
    assert!(matches!(err, PipelineError::Decode { frame_index: 4, .. }), "{}", err);
    assert!(!harness.encoded.lock().unwrap().finished);
}

#[test]
fn short_stream_is_a_decode_failure() {
    let harness = Harness::new();
    let err = harness
        .run(&config(2, 3, Schedule::Interleaved), 10, TaggedSource::new(6))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Decode { frame_index: 6, .. }), "{}", err);
}

#[test]
fn missing_frames_stall_instead_of_hanging() {
    let (_keep_open, hang) = crossbeam_channel::bounded::<()>(0);
    let source = TaggedSource {
        hang: Some(hang),
        ..TaggedSource::new(4)
    };

    let mut cfg = config(2, 3, Schedule::Queue);
    cfg.stall_timeout = Duration::from_millis(150);

    let harness = Harness::new();
    let started = Instant::now();
    let err = harness.run(&cfg, 6, source).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, PipelineError::Stall { .. }), "{}", err);

    let encoded = harness.encoded.lock().unwrap();
    assert!(encoded.aborted);
    assert!(!encoded.finished);
}

#[test]
fn model_load_failure_is_reported_before_work_starts() {
    let err = run_pipeline(
        &config(2, 3, Schedule::Queue),
        10,
        Box::new(TaggedSource::new(10)),
        |worker: usize| -> Result<Box<dyn BackgroundRemover>> { bail!("no model for worker {}", worker) },
        |_: u32, _: u32| -> Result<Box<dyn MatteSink>> { bail!("encoder should not open") },
    )
    .unwrap_err();

    assert!(matches!(err, PipelineError::Setup(_)), "{}", err);
    assert!(err.to_string().contains("no model for worker 0"));
}

#[test]
fn invalid_config_is_rejected() {
    let harness = Harness::new();
    let err = harness
        .run(&config(0, 3, Schedule::Queue), 10, TaggedSource::new(10))
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
    assert_eq!(harness.stats.calls.load(Ordering::SeqCst), 0);
}
