//! Error kinds surfaced to protocol adapters.
//!
//! Adapters map these to wire status codes (RTSP 401 for authentication,
//! 404 for an unconfigured path, 503 for an on-demand timeout). The
//! authentication variant deliberately carries no detail; the reason is
//! logged server-side only.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("authentication error")]
    Auth,

    #[error("invalid path name ({0})")]
    InvalidPathName(String),

    #[error("path '{0}' is not configured")]
    NotConfigured(String),

    #[error("no one is publishing to path '{0}'")]
    NoOnePublishing(String),

    #[error("source of path '{0}' has timed out")]
    Timeout(String),

    #[error("can't publish to path '{0}' since 'source' is not 'publisher'")]
    SourceNotPublisher(String),

    #[error("someone is already publishing to path '{0}'")]
    PublisherExists(String),

    #[error("publisher is not assigned to this path anymore")]
    PublisherDetached,

    #[error("codec {0} is not supported by this endpoint")]
    CodecUnsupported(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("terminated")]
    Terminated,
}
