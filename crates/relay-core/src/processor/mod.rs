//! Per-codec format processors.
//!
//! A processor sits between a publisher and the fan-out stream, one
//! instance per track. It decodes incoming RTP just enough to extract
//! codec parameters, remuxes access units to a canonical shape (parameter
//! sets stripped and re-injected ahead of key frames), and re-packetizes
//! RTP when packets exceed the maximum UDP payload size or when the
//! publisher provides decoded payload only.
//!
//! Dispatch is a plain match over the closed [`Format`] variant; each
//! constructor binds the remux/encode/decode logic for its codec.

mod ac3;
mod av1;
mod h264;
mod h265;
mod lpcm;
mod mpeg1_audio;
mod mpeg1_video;
mod mpeg4_audio;
mod mpeg4_video;
mod opus;
mod passthrough;
mod vp9;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_rtp::Packet;
use tracing::warn;

use crate::error::ProcessorError;
use crate::format::Format;
use crate::unit::Unit;

/// Sink for processor-level log events. The production implementation
/// forwards to `tracing`; tests install a capturing sink.
pub trait ParentLogger: Send + Sync {
    fn warn(&self, message: &str);
}

/// [`ParentLogger`] that forwards to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl ParentLogger for TracingLogger {
    fn warn(&self, message: &str) {
        warn!("{message}");
    }
}

/// Protocol-level remuxer for one track.
pub trait FormatProcessor: Send {
    /// Publisher path: remux the decoded payload, update track parameters
    /// observed inline, and regenerate RTP packets.
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError>;

    /// RTSP publisher path: route an incoming RTP packet, decoding it into
    /// payload form when any non-RTSP reader is attached (or a decoder has
    /// already been created).
    fn process_rtp_packet(
        &mut self,
        pkt: Packet,
        ntp: DateTime<Utc>,
        pts: i64,
        has_non_rtsp_readers: bool,
    ) -> Result<Unit, ProcessorError>;
}

/// Build the processor for a track.
pub fn new_format_processor(
    udp_max_payload_size: usize,
    format: &Format,
    generate_rtp_packets: bool,
    parent: Arc<dyn ParentLogger>,
) -> Box<dyn FormatProcessor> {
    match format {
        Format::H264(f) => Box::new(h264::H264Processor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
            parent,
        )),
        Format::H265(f) => Box::new(h265::H265Processor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
            parent,
        )),
        Format::Av1(f) => Box::new(av1::Av1Processor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
        )),
        Format::Vp9(f) => Box::new(vp9::Vp9Processor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
        )),
        Format::Mpeg4Video(f) => Box::new(mpeg4_video::Mpeg4VideoProcessor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
        )),
        Format::Mpeg1Video(_) => Box::new(mpeg1_video::Mpeg1VideoProcessor::new(
            udp_max_payload_size,
            generate_rtp_packets,
        )),
        Format::Mjpeg(_) => Box::new(passthrough::PassthroughProcessor::new(
            udp_max_payload_size,
            "M-JPEG",
        )),
        Format::Mpeg4Audio(f) => Box::new(mpeg4_audio::Mpeg4AudioProcessor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
        )),
        Format::Mpeg1Audio(_) => Box::new(mpeg1_audio::Mpeg1AudioProcessor::new(
            udp_max_payload_size,
            generate_rtp_packets,
        )),
        Format::Opus(f) => Box::new(opus::OpusProcessor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
        )),
        Format::Ac3(f) => Box::new(ac3::Ac3Processor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
        )),
        Format::Lpcm(f) => Box::new(lpcm::LpcmProcessor::new(
            udp_max_payload_size,
            f.clone(),
            generate_rtp_packets,
        )),
    }
}

/// Compute `v * m / d` without overflowing 64-bit intermediates, by
/// splitting `v` into whole and fractional parts of `d`. At 90 kHz a plain
/// `v * m` overflows after roughly 29 hours of PTS.
pub fn multiply_and_divide(v: i64, m: i64, d: i64) -> i64 {
    let secs = v / d;
    let dec = v % d;
    secs * m + dec * m / d
}

/// RTP timestamp, 32-bit modular, derived from a PTS in nanoseconds.
pub(crate) fn rtp_time(pts: i64, clock_rate: u32) -> u32 {
    multiply_and_divide(pts, clock_rate as i64, 1_000_000_000) as u32
}

/// Stamp regenerated packets: reuse the original RTP timestamp when the
/// unit entered as RTP, otherwise offset the encoder's base timestamp by
/// the PTS.
pub(crate) fn set_timestamp(
    new_packets: &mut [Packet],
    old_packets: &[Packet],
    clock_rate: u32,
    pts: i64,
) {
    if let Some(old) = old_packets.first() {
        for pkt in new_packets {
            pkt.timestamp = old.timestamp;
        }
    } else {
        let ts = rtp_time(pts, clock_rate);
        for pkt in new_packets {
            pkt.timestamp = pkt.timestamp.wrapping_add(ts);
        }
    }
}

const MAX_KEY_FRAME_INTERVAL_SECS: i64 = 10;

/// Warns once per dry spell when a video track stops delivering key
/// frames. Driven by unit NTP timestamps rather than the wall clock so the
/// behavior is reproducible.
pub(crate) struct KeyFrameWatch {
    codec: &'static str,
    parent: Arc<dyn ParentLogger>,
    baseline: Option<DateTime<Utc>>,
    warned: bool,
}

impl KeyFrameWatch {
    pub(crate) fn new(codec: &'static str, parent: Arc<dyn ParentLogger>) -> Self {
        Self {
            codec,
            parent,
            baseline: None,
            warned: false,
        }
    }

    pub(crate) fn observe(&mut self, ntp: DateTime<Utc>, is_key_frame: bool) {
        if is_key_frame {
            self.baseline = Some(ntp);
            self.warned = false;
            return;
        }

        match self.baseline {
            None => self.baseline = Some(ntp),
            Some(base) => {
                if !self.warned
                    && (ntp - base).num_seconds() >= MAX_KEY_FRAME_INTERVAL_SECS
                {
                    self.parent.warn(&format!(
                        "no {} key frames received in {}s, stream can't be decoded",
                        self.codec, MAX_KEY_FRAME_INTERVAL_SECS
                    ));
                    self.warned = true;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::ParentLogger;

    /// Logger that records warnings for assertions.
    #[derive(Default)]
    pub(crate) struct CaptureLogger {
        pub(crate) warnings: Mutex<Vec<String>>,
    }

    impl ParentLogger for CaptureLogger {
        fn warn(&self, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }
    }
}
