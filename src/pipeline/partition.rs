use std::ops::Range;

/// A contiguous run of frame indices handled by one inference call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 0-based rank in global processing order
    pub index: usize,
    pub frames: Range<usize>,
}

impl Batch {
    /// 1-based key under which the batch's result is published
    pub fn position(&self) -> usize {
        self.index + 1
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn last_frame(&self) -> usize {
        self.frames.end - 1
    }
}

pub fn batch_count(total_frames: usize, batch_size: usize) -> usize {
    total_frames.div_ceil(batch_size)
}

pub fn batch_at(index: usize, total_frames: usize, batch_size: usize) -> Batch {
    let start = index * batch_size;
    Batch {
        index,
        frames: start..(start + batch_size).min(total_frames),
    }
}

/// Chunk `0..total_frames` into batches of at most `batch_size` frames
pub fn plan_batches(total_frames: usize, batch_size: usize) -> impl Iterator<Item = Batch> {
    (0..batch_count(total_frames, batch_size)).map(move |index| batch_at(index, total_frames, batch_size))
}

/// Worker that owns a batch under interleaved scheduling
pub fn worker_for(batch_index: usize, worker_count: usize) -> usize {
    batch_index % worker_count
}

/// Batches owned by `worker` under interleaved scheduling, ascending.
///
/// Batch `i * worker_count + worker` lands at position
/// `i * worker_count + 1 + worker`, the same key the sequencer asks for.
pub fn batches_for_worker(
    worker: usize,
    worker_count: usize,
    total_frames: usize,
    batch_size: usize,
) -> impl Iterator<Item = Batch> {
    (worker..batch_count(total_frames, batch_size))
        .step_by(worker_count)
        .map(move |index| batch_at(index, total_frames, batch_size))
}
