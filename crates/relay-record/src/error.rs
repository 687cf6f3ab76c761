use thiserror::Error;

/// Errors raised by the recorder.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record path template: {0}")]
    InvalidTemplate(String),

    #[error("stream error: {0}")]
    Stream(#[from] relay_core::StreamError),
}
