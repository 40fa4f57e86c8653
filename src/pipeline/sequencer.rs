use super::Shared;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::output::MatteSink;
use image::GrayImage;
use std::time::{Duration, Instant};

/// How the sequencer loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `total_frames` frames were written and the sink was finished
    BudgetMet,
    /// Every batch position was consumed without meeting the budget
    Exhausted,
}

/// Consumes batch results in strict position order and streams them to a sink
///
/// The sink is opened lazily from the first matte, once the frame geometry
/// is known.
pub struct Sequencer<'a, F>
where
    F: FnOnce(u32, u32) -> anyhow::Result<Box<dyn MatteSink>>,
{
    shared: &'a Shared,
    total_frames: usize,
    timeout: Duration,
    open_sink: Option<F>,
    sink: Option<Box<dyn MatteSink>>,
    frames_written: usize,
    started: Instant,
}

impl<'a, F> Sequencer<'a, F>
where
    F: FnOnce(u32, u32) -> anyhow::Result<Box<dyn MatteSink>>,
{
    pub fn new(shared: &'a Shared, total_frames: usize, timeout: Duration, open_sink: F) -> Self {
        Self {
            shared,
            total_frames,
            timeout,
            open_sink: Some(open_sink),
            sink: None,
            frames_written: 0,
            started: Instant::now(),
        }
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn run(&mut self, batch_count: usize) -> PipelineResult<Completion> {
        for position in 1..=batch_count {
            let mattes = self
                .shared
                .results
                .wait_take(position, self.timeout)
                .map_err(|e| PipelineError::from_buffer(Stage::Sequencer, e))?;

            for matte in &mattes {
                self.write(matte)?;

                if self.frames_written >= self.total_frames {
                    self.finish()?;
                    tracing::info!("Finished all frames ({})", self.total_frames);
                    return Ok(Completion::BudgetMet);
                }
            }
        }

        Ok(Completion::Exhausted)
    }

    fn write(&mut self, matte: &GrayImage) -> PipelineResult<()> {
        let frame_index = self.frames_written;
        let encoder_error = |e: anyhow::Error| PipelineError::Encoder {
            frame_index,
            reason: format!("{:#}", e),
        };

        if self.sink.is_none() {
            if let Some(open_sink) = self.open_sink.take() {
                let (width, height) = matte.dimensions();
                self.sink = Some(open_sink(width, height).map_err(encoder_error)?);
            }
        }
        let sink = self.sink.as_mut().ok_or_else(|| PipelineError::Encoder {
            frame_index,
            reason: "sink could not be reopened".to_string(),
        })?;

        let _span = tracing::debug_span!("encode", frame = frame_index).entered();
        sink.write_frame(matte).map_err(encoder_error)?;
        self.frames_written += 1;

        if self.frames_written % 30 == 0 {
            let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
            let avg_ms = elapsed_ms / self.frames_written as f64;
            tracing::info!(
                "Frame {}/{}: avg={:.1}ms, fps={:.1}",
                self.frames_written,
                self.total_frames,
                avg_ms,
                1000.0 / avg_ms
            );
        }

        Ok(())
    }

    /// Close the sink, if one was opened
    pub fn finish(&mut self) -> PipelineResult<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.finish().map_err(|e| PipelineError::Encoder {
                frame_index: self.frames_written,
                reason: format!("{:#}", e),
            }),
            None => Ok(()),
        }
    }

    pub fn abort(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            sink.abort();
        }
    }
}
