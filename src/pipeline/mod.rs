//! Parallel matting pipeline
//!
//! Three kinds of concurrent units share two keyed buffers:
//!
//! - the frame source publishes decoded frames under their frame index,
//! - N workers take whole batches of frames, run one inference call per
//!   batch and publish the mattes under the batch position,
//! - the sequencer (on the calling thread) takes positions 1, 2, 3, ... in
//!   order and streams every matte to the sink.
//!
//! Workers finish out of order; the position keys restore the order. Every
//! buffer wait is bounded, and the first failure closes both buffers so no
//! unit is left waiting on a key that will never arrive.

pub mod buffer;
pub mod partition;
mod sequencer;
mod source;
mod worker;

pub use buffer::KeyedBuffer;
pub use partition::{batch_count, batches_for_worker, plan_batches, worker_for, Batch};
pub use sequencer::{Completion, Sequencer};
pub use source::run_frame_source;
pub use worker::run_worker;

use crate::capture::FrameSource;
use crate::config::{PipelineConfig, Schedule};
use crate::error::{panic_message, PipelineError, PipelineResult, Stage};
use crate::output::MatteSink;
use crate::segmentation::{BackgroundRemover, Matte};
use image::RgbImage;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Buffers and failure slot shared by every pipeline unit
pub struct Shared {
    pub frames: KeyedBuffer<RgbImage>,
    pub results: KeyedBuffer<Vec<Matte>>,
    failure: Mutex<Option<PipelineError>>,
}

impl Shared {
    pub fn new(frame_capacity: usize) -> Self {
        Self {
            frames: KeyedBuffer::bounded(frame_capacity),
            results: KeyedBuffer::new(),
            failure: Mutex::new(None),
        }
    }

    /// Record the first real failure and wake every unit
    pub fn fail(&self, err: PipelineError) {
        if !err.is_closed() {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                tracing::error!("{}", err);
                *failure = Some(err);
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&self) {
        self.frames.close();
        self.results.close();
    }

    pub fn take_failure(&self) -> Option<PipelineError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub total_frames: usize,
    pub frames_written: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

/// Spawn a named unit; if that fails, stop the units already running
///
/// A panic inside `body` is recorded as that stage's failure so the other
/// units are woken instead of waiting out their stall timeout.
fn spawn_unit<F>(shared: &Arc<Shared>, stage: Stage, name: String, body: F) -> PipelineResult<JoinHandle<()>>
where
    F: FnOnce(&Shared) + Send + 'static,
{
    let unit_shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let shared = unit_shared;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(&*shared))) {
                shared.fail(PipelineError::Panicked {
                    stage,
                    reason: panic_message(payload.as_ref()),
                });
            }
        })
        .map_err(|e| {
            shared.shutdown();
            PipelineError::Setup(format!("failed to spawn {}: {}", name, e))
        })
}

/// Run the whole pipeline over `probed_frames` frames (before the frame limit)
///
/// Returns as soon as the frame budget has been written; the frame source
/// and workers are then shut down without being joined. If every batch is
/// consumed without meeting the budget, all units are joined before the
/// sink is finished.
pub fn run_pipeline<R, S>(
    config: &PipelineConfig,
    probed_frames: usize,
    mut source: Box<dyn FrameSource>,
    mut make_remover: R,
    open_sink: S,
) -> PipelineResult<PipelineReport>
where
    R: FnMut(usize) -> anyhow::Result<Box<dyn BackgroundRemover>>,
    S: FnOnce(u32, u32) -> anyhow::Result<Box<dyn MatteSink>>,
{
    config.validate()?;
    let started = Instant::now();

    let total_frames = config.total_frames(probed_frames);
    let batches = batch_count(total_frames, config.gpu_batchsize);
    tracing::info!(
        "Pipeline: {} frames in {} batches of {} across {} workers ({:?} schedule)",
        total_frames,
        batches,
        config.gpu_batchsize,
        config.worker_count,
        config.schedule
    );

    // Load every model before any thread starts so failures surface up front
    let removers = (0..config.worker_count)
        .map(|index| {
            make_remover(index).map_err(|e| {
                PipelineError::Setup(format!("worker {} could not load a model: {:#}", index, e))
            })
        })
        .collect::<PipelineResult<Vec<_>>>()?;

    let shared = Arc::new(Shared::new(config.buffer_capacity()));
    let mut handles = Vec::with_capacity(config.worker_count + 2);

    let source_handle = spawn_unit(&shared, Stage::FrameSource, "frame-source".to_string(), move |shared| {
        if let Err(e) = run_frame_source(source.as_mut(), shared, total_frames) {
            shared.fail(e);
        }
    })?;

    let queue = match config.schedule {
        Schedule::Queue => {
            let (tx, rx) = crossbeam_channel::bounded::<Batch>(config.worker_count);
            let batch_size = config.gpu_batchsize;
            handles.push(spawn_unit(&shared, Stage::Dispatcher, "batch-dispatch".to_string(), move |_| {
                for batch in plan_batches(total_frames, batch_size) {
                    // Every worker has gone away
                    if tx.send(batch).is_err() {
                        break;
                    }
                }
            })?);
            Some(rx)
        }
        Schedule::Interleaved => None,
    };

    for (index, mut remover) in removers.into_iter().enumerate() {
        let batches: Box<dyn Iterator<Item = Batch> + Send> = match &queue {
            Some(rx) => Box::new(rx.clone().into_iter()),
            None => Box::new(batches_for_worker(
                index,
                config.worker_count,
                total_frames,
                config.gpu_batchsize,
            )),
        };
        let model_name = config.model_name.clone();
        let timeout = config.stall_timeout;

        handles.push(spawn_unit(&shared, Stage::Worker(index), format!("worker-{}", index), move |shared| {
            if let Err(e) = run_worker(index, batches, remover.as_mut(), &model_name, shared, timeout) {
                shared.fail(e);
            }
        })?);
    }
    drop(queue);

    let mut sequencer = Sequencer::new(&shared, total_frames, config.stall_timeout, open_sink);
    let outcome = sequencer.run(batches);

    let report = |frames_written| PipelineReport {
        total_frames,
        frames_written,
        batches,
        elapsed: started.elapsed(),
    };

    match outcome {
        Ok(Completion::BudgetMet) => {
            shared.shutdown();
            tracing::debug!("Abandoning frame source and {} worker threads", config.worker_count);
            Ok(report(sequencer.frames_written()))
        }
        Ok(Completion::Exhausted) => {
            // Workers end once their batches run out; the source may still be
            // decoding past the budget, so it is stopped before being joined.
            for handle in handles {
                let _ = handle.join();
            }
            shared.frames.close();
            let _ = source_handle.join();

            if let Some(err) = shared.take_failure() {
                sequencer.abort();
                return Err(err);
            }
            if let Err(err) = sequencer.finish() {
                sequencer.abort();
                return Err(err);
            }
            Ok(report(sequencer.frames_written()))
        }
        Err(err) => {
            shared.fail(err.clone());
            sequencer.abort();
            Err(shared.take_failure().unwrap_or(err))
        }
    }
}
