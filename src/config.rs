use crate::error::{PipelineError, PipelineResult};
use std::str::FromStr;
use std::time::Duration;

/// Default working frame height for decoding and matting
pub const DEFAULT_WORKING_HEIGHT: u32 = 320;

/// How batches are handed to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Workers pull the next batch from a shared bounded queue
    #[default]
    Queue,
    /// Worker `w` owns every batch whose index is `w` modulo the worker count
    Interleaved,
}

impl FromStr for Schedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" => Ok(Schedule::Queue),
            "interleaved" => Ok(Schedule::Interleaved),
            other => Err(format!("unknown schedule '{}' (expected queue or interleaved)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub gpu_batchsize: usize,
    pub model_name: String,
    /// `-1` means unlimited
    pub frame_limit: i64,
    pub working_height: u32,
    pub stall_timeout: Duration,
    /// Max decoded frames held at once; `None` picks twice the in-flight batches
    pub frame_buffer_capacity: Option<usize>,
    pub schedule: Schedule,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            gpu_batchsize: 4,
            model_name: "u2net".to_string(),
            frame_limit: -1,
            working_height: DEFAULT_WORKING_HEIGHT,
            stall_timeout: Duration::from_secs(120),
            frame_buffer_capacity: None,
            schedule: Schedule::Queue,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.worker_count == 0 {
            return Err(PipelineError::InvalidConfig("worker count must be positive".into()));
        }
        if self.gpu_batchsize == 0 {
            return Err(PipelineError::InvalidConfig("batch size must be positive".into()));
        }
        if self.frame_limit < -1 {
            return Err(PipelineError::InvalidConfig(format!(
                "frame limit must be -1 or non-negative, got {}",
                self.frame_limit
            )));
        }
        if self.working_height == 0 || self.working_height % 2 != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "working height must be a positive even number, got {}",
                self.working_height
            )));
        }
        if self.stall_timeout.is_zero() {
            return Err(PipelineError::InvalidConfig("stall timeout must be positive".into()));
        }
        if let Some(capacity) = self.frame_buffer_capacity {
            if capacity < self.gpu_batchsize {
                return Err(PipelineError::InvalidConfig(format!(
                    "frame buffer capacity {} is smaller than one batch ({})",
                    capacity, self.gpu_batchsize
                )));
            }
        }
        Ok(())
    }

    /// Apply the frame limit to the probed frame count
    pub fn total_frames(&self, probed: usize) -> usize {
        match usize::try_from(self.frame_limit) {
            Ok(limit) => probed.min(limit),
            Err(_) => probed,
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.frame_buffer_capacity
            .unwrap_or_else(|| self.worker_count.saturating_mul(self.gpu_batchsize).saturating_mul(2))
            .max(self.gpu_batchsize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_caps_total() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.total_frames(100), 100);

        config.frame_limit = 7;
        assert_eq!(config.total_frames(100), 7);
        assert_eq!(config.total_frames(5), 5);

        config.frame_limit = 0;
        assert_eq!(config.total_frames(5), 0);
    }

    #[test]
    fn rejects_bad_values() {
        let base = PipelineConfig::default();
        assert!(base.validate().is_ok());

        let bad = [
            PipelineConfig { worker_count: 0, ..base.clone() },
            PipelineConfig { gpu_batchsize: 0, ..base.clone() },
            PipelineConfig { frame_limit: -2, ..base.clone() },
            PipelineConfig { working_height: 0, ..base.clone() },
            PipelineConfig { working_height: 241, ..base.clone() },
            PipelineConfig { stall_timeout: Duration::ZERO, ..base.clone() },
            PipelineConfig { frame_buffer_capacity: Some(3), ..base.clone() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))), "{:?}", config);
        }
    }

    #[test]
    fn buffer_capacity_defaults_to_two_rounds() {
        let config = PipelineConfig {
            worker_count: 3,
            gpu_batchsize: 5,
            ..PipelineConfig::default()
        };
        assert_eq!(config.buffer_capacity(), 30);

        let config = PipelineConfig {
            frame_buffer_capacity: Some(5),
            gpu_batchsize: 5,
            ..PipelineConfig::default()
        };
        assert_eq!(config.buffer_capacity(), 5);
    }

    #[test]
    fn huge_batches_saturate_the_buffer_capacity() {
        let config = PipelineConfig {
            worker_count: 4,
            gpu_batchsize: usize::MAX / 4,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity(), usize::MAX);
    }

    #[test]
    fn parses_schedule() {
        assert_eq!("queue".parse::<Schedule>().unwrap(), Schedule::Queue);
        assert_eq!("Interleaved".parse::<Schedule>().unwrap(), Schedule::Interleaved);
        assert!("round-robin".parse::<Schedule>().is_err());
    }
}
