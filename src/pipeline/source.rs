use super::Shared;
use crate::capture::FrameSource;
use crate::error::{PipelineError, PipelineResult, Stage};

/// Decode frames and publish each one under its decode index
///
/// The source is not limited to `total_frames`; consumers simply never ask
/// for later indices, and the orchestrator closes the buffer once the budget
/// is met. Running out of frames before `total_frames` is a decode failure,
/// while a decode error after the budget is only logged.
pub fn run_frame_source(
    source: &mut dyn FrameSource,
    shared: &Shared,
    total_frames: usize,
) -> PipelineResult<usize> {
    let (width, height) = source.resolution();
    tracing::info!("Frame source online ({}x{})", width, height);

    let mut index = 0;
    loop {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if index >= total_frames => {
                tracing::warn!("Decode error past the last needed frame ({}): {:#}", index, e);
                break;
            }
            Err(e) => {
                return Err(PipelineError::Decode {
                    frame_index: index,
                    reason: format!("{:#}", e),
                })
            }
        };

        shared
            .frames
            .publish(index, frame)
            .map_err(|e| PipelineError::from_buffer(Stage::FrameSource, e))?;
        index += 1;
    }

    if index < total_frames {
        return Err(PipelineError::Decode {
            frame_index: index,
            reason: format!("stream ended after {} of {} frames", index, total_frames),
        });
    }

    tracing::debug!("Frame source finished after {} frames", index);
    Ok(index)
}
