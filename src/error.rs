use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Failures of a keyed buffer operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("key {0} has not been produced yet")]
    NotYetProduced(usize),

    #[error("key {0} was already consumed")]
    Evicted(usize),

    #[error("key {0} was published twice")]
    Duplicate(usize),

    #[error("timed out after {waited:?} waiting for key {key}")]
    TimedOut { key: usize, waited: Duration },

    #[error("buffer closed")]
    Closed,
}

/// Pipeline stage, used to say where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FrameSource,
    Dispatcher,
    Worker(usize),
    Sequencer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::FrameSource => write!(f, "frame source"),
            Stage::Dispatcher => write!(f, "batch dispatcher"),
            Stage::Worker(index) => write!(f, "worker {}", index),
            Stage::Sequencer => write!(f, "sequencer"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pipeline setup failed: {0}")]
    Setup(String),

    #[error("decode failed at frame {frame_index}: {reason}")]
    Decode { frame_index: usize, reason: String },

    #[error("inference failed for batch position {position}: {reason}")]
    Inference { position: usize, reason: String },

    #[error("{stage} stalled after {waited:?} waiting for key {key}")]
    Stall {
        stage: Stage,
        key: usize,
        waited: Duration,
    },

    #[error("encoder failed at frame {frame_index}: {reason}")]
    Encoder { frame_index: usize, reason: String },

    #[error("{stage} panicked: {reason}")]
    Panicked { stage: Stage, reason: String },

    #[error("{stage}: {source}")]
    Buffer {
        stage: Stage,
        #[source]
        source: BufferError,
    },
}

impl PipelineError {
    /// Attribute a buffer failure to the stage that hit it.
    ///
    /// Timeouts become [`PipelineError::Stall`]; everything else is kept as a
    /// protocol error.
    pub fn from_buffer(stage: Stage, err: BufferError) -> Self {
        match err {
            BufferError::TimedOut { key, waited } => PipelineError::Stall { stage, key, waited },
            source => PipelineError::Buffer { stage, source },
        }
    }

    /// True for the secondary error a unit sees after another unit failed.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            PipelineError::Buffer {
                source: BufferError::Closed,
                ..
            }
        )
    }
}

/// Text of a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
