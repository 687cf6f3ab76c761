//! RTP packet model and per-codec payloaders/depayloaders.
//!
//! This crate provides the wire-level building blocks of the relay: a
//! zero-copy [`Packet`] representation plus encoders and decoders for the
//! RTP payload formats the relay has to repacketize itself (H.264
//! STAP-A/FU-A, H.265 AP/FU, and a generic fragmentation scheme for
//! continuous-payload codecs).
//!
//! Decoders reassemble access units across packets; errors that merely mean
//! "feed me more packets" are reported as [`RtpError::MorePacketsNeeded`] /
//! [`RtpError::NonStartingPacketAndNoPrevious`] and are recoverable.

pub mod av1;
pub mod error;
pub mod fragment;
pub mod h264;
pub mod h265;
pub mod packet;
pub mod simple;
pub mod vp9;

pub use error::RtpError;
pub use packet::Packet;

/// Result type for RTP operations.
pub type Result<T> = std::result::Result<T, RtpError>;
