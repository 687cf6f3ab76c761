//! Sample serialization contract.
//!
//! The relay does not implement fMP4 boxes or MPEG-TS packetization; a
//! [`SampleMuxer`] turns (track, dts, random-access flag, payload) tuples
//! into segment bytes. The default implementation writes a plain
//! length-delimited record per sample, which is enough for tests and for
//! external muxers consuming the segment as a byte stream.

use std::io::Write;

/// Serializes samples into an open segment file.
pub trait SampleMuxer: Send {
    /// Called once when a segment file is opened.
    fn write_header(&mut self, w: &mut dyn Write, track_count: usize) -> std::io::Result<u64>;

    /// Write one sample; returns the number of bytes written.
    fn write_sample(
        &mut self,
        w: &mut dyn Write,
        track: u32,
        dts: i64,
        random_access: bool,
        payload: &[u8],
    ) -> std::io::Result<u64>;

    /// Called before the segment file is closed.
    fn write_trailer(&mut self, w: &mut dyn Write) -> std::io::Result<u64>;
}

/// Default muxer: one length-delimited record per sample.
#[derive(Debug, Default)]
pub struct LengthDelimitedMuxer {}

impl SampleMuxer for LengthDelimitedMuxer {
    fn write_header(&mut self, w: &mut dyn Write, track_count: usize) -> std::io::Result<u64> {
        let header = [b'S', b'E', b'G', track_count as u8];
        w.write_all(&header)?;
        Ok(header.len() as u64)
    }

    fn write_sample(
        &mut self,
        w: &mut dyn Write,
        track: u32,
        dts: i64,
        random_access: bool,
        payload: &[u8],
    ) -> std::io::Result<u64> {
        w.write_all(&track.to_be_bytes())?;
        w.write_all(&dts.to_be_bytes())?;
        w.write_all(&[random_access as u8])?;
        w.write_all(&(payload.len() as u32).to_be_bytes())?;
        w.write_all(payload)?;
        Ok(4 + 8 + 1 + 4 + payload.len() as u64)
    }

    fn write_trailer(&mut self, _w: &mut dyn Write) -> std::io::Result<u64> {
        Ok(0)
    }
}
