use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FLUSH_EVERY: usize = 5;
pub const DEFAULT_CHECKPOINT: &str = "data/checkpoint.jsonl";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workerCount must be >= 1")]
    ZeroWorkers,
    #[error("checkpointFlushEvery must be >= 1")]
    ZeroFlush,
    #[error("perRecordTimeout must be non-zero")]
    ZeroTimeout,
}

/// Recognized pipeline options. `worker_count = 1` degrades to sequential
/// processing through the same code path.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub per_record_timeout: Duration,
    pub checkpoint_flush_every: usize,
    pub resume: bool,
    pub checkpoint_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            worker_count: DEFAULT_WORKERS,
            per_record_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            checkpoint_flush_every: DEFAULT_FLUSH_EVERY,
            resume: true,
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.checkpoint_flush_every == 0 {
            return Err(ConfigError::ZeroFlush);
        }
        if self.per_record_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = PipelineConfig { worker_count: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroWorkers)));
    }
}
