use super::partition::Batch;
use super::Shared;
use crate::error::{panic_message, PipelineError, PipelineResult, Stage};
use crate::segmentation::BackgroundRemover;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Process batches until the assignment runs dry
///
/// Each batch waits for its last frame, takes all of its frames out of the
/// frame buffer, runs one inference call, and publishes the mattes under the
/// batch position.
pub fn run_worker<I>(
    index: usize,
    batches: I,
    remover: &mut dyn BackgroundRemover,
    model_name: &str,
    shared: &Shared,
    timeout: Duration,
) -> PipelineResult<usize>
where
    I: IntoIterator<Item = Batch>,
{
    tracing::info!("Worker {} online", index);

    let mut processed = 0;
    for batch in batches {
        process_batch(index, &batch, remover, model_name, shared, timeout)?;
        processed += 1;
    }

    tracing::debug!("Worker {} finished after {} batches", index, processed);
    Ok(processed)
}

fn process_batch(
    index: usize,
    batch: &Batch,
    remover: &mut dyn BackgroundRemover,
    model_name: &str,
    shared: &Shared,
    timeout: Duration,
) -> PipelineResult<()> {
    let stage = Stage::Worker(index);
    let position = batch.position();
    let _span = tracing::debug_span!("batch", worker = index, position).entered();

    // Frames arrive in order, so the last one being present means all are
    shared
        .frames
        .wait_for(batch.last_frame(), timeout)
        .map_err(|e| PipelineError::from_buffer(stage, e))?;

    let frames = batch
        .frames
        .clone()
        .map(|frame| shared.frames.take(frame))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PipelineError::from_buffer(stage, e))?;

    let started = Instant::now();
    // A backend panic fails the batch like any other inference error
    let mattes = match panic::catch_unwind(AssertUnwindSafe(|| remover.remove_many(frames, model_name))) {
        Ok(result) => result.map_err(|e| PipelineError::Inference {
            position,
            reason: format!("{:#}", e),
        })?,
        Err(payload) => {
            return Err(PipelineError::Inference {
                position,
                reason: format!("inference panicked: {}", panic_message(payload.as_ref())),
            })
        }
    };

    if mattes.len() != batch.len() {
        return Err(PipelineError::Inference {
            position,
            reason: format!("expected {} mattes, got {}", batch.len(), mattes.len()),
        });
    }

    tracing::debug!(
        "Batch {} (frames {}..{}) inferred in {:.1}ms",
        position,
        batch.frames.start,
        batch.frames.end,
        started.elapsed().as_secs_f64() * 1000.0
    );

    shared
        .results
        .publish(position, mattes)
        .map_err(|e| PipelineError::from_buffer(stage, e))
}
