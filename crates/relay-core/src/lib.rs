//! Core of the relay: the codec-tagged unit model, per-track format
//! descriptors, the per-codec format processors, and the fan-out machinery
//! (Stream + AsyncWriter) that carries media from one publisher to many
//! readers without head-of-line blocking.
//!
//! Nothing in this crate touches a socket or a disk; protocol adapters and
//! the recorder are layered on top through the [`stream::Stream`] reader
//! interface.

pub mod async_writer;
pub mod dts;
pub mod error;
pub mod format;
pub mod processor;
pub mod session;
pub mod stream;
pub mod unit;

pub use async_writer::{AsyncWriter, AsyncWriterError, WriterId};
pub use error::{ProcessorError, ReaderError, StreamError};
pub use format::Format;
pub use processor::{FormatProcessor, ParentLogger, TracingLogger};
pub use session::{Media, MediaKind, SessionDescription};
pub use stream::Stream;
pub use unit::{Payload, Unit};
