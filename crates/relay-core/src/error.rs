use relay_rtp::RtpError;
use thiserror::Error;

/// Error returned by a reader callback. Terminates that reader only.
pub type ReaderError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while processing units through a format processor.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Rtp(#[from] RtpError),

    #[error("payload size ({size}) is greater than maximum allowed ({max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("{codec} units cannot be repacketized")]
    CodecUnsupported { codec: &'static str },

    #[error("unit payload does not match the track codec")]
    PayloadMismatch,
}

/// Errors raised by the fan-out stream.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("media {0} does not exist")]
    UnknownMedia(usize),

    #[error("media {media} has no format with payload type {payload_type}")]
    UnknownFormat { media: usize, payload_type: u8 },

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}
