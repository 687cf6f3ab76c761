//! On-disk recording.
//!
//! The recorder is just another reader of a stream: an [`Agent`]
//! subscribes to every track, segments incoming units into files named by
//! a strftime-like template, and fires hooks when segments open and
//! close. A [`Cleaner`] periodically deletes segments older than a
//! configured age by re-parsing their timestamps from the file names.
//!
//! Byte-level fMP4/MPEG-TS muxing is delegated to a [`SampleMuxer`]; the
//! crate drives naming, rotation, parts and hooks.

pub mod agent;
pub mod cleaner;
pub mod error;
pub mod muxer;
pub mod path_template;

pub use agent::{Agent, NowFn, RecordFormat, SegmentHook};
pub use cleaner::{Cleaner, CleanerEntry};
pub use error::RecordError;
pub use muxer::{LengthDelimitedMuxer, SampleMuxer};
