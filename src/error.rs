//! Error types for each failure domain named in the component design.
//!
//! Configuration errors are fatal at startup; everything else is handled
//! locally by the subsystem that raised it (see the error handling design).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
    #[error("at most 4 FM_FREQUENCIES may be configured, got {0}")]
    TooManyFrequencies(usize),
    #[error("FM_FREQUENCIES span {span_hz} Hz exceeds the 2 MHz limit")]
    FrequencySpanTooWide { span_hz: u64 },
    #[error("FM_FREQUENCIES must not be empty")]
    NoFrequencies,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn {binary}: {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} exited with status {status}")]
    NonZeroExit { binary: String, status: i32 },
    #[error("device resolution failed: {0}")]
    DeviceResolution(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("event {0} not found")]
    NotFound(i64),
}

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transcription backend unavailable")]
    BackendUnavailable,
    #[error("remote transcription request failed: {0}")]
    Remote(String),
    #[error("local transcription failed: {0}")]
    Local(String),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),
    #[error("ffmpeg timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker publish failed: {0}")]
    PublishFailed(String),
}

#[derive(Debug, Error)]
pub enum RdsGuardError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transcription(#[from] TranscriptionError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
