//! The unit model: one decode frame or access unit, tagged by codec.
//!
//! A unit may carry RTP packets, a decoded payload, or both. A missing
//! payload means "route the RTP packets as-is, opaque to the relay".

use bytes::Bytes;
use chrono::{DateTime, Utc};
use relay_rtp::Packet;

/// One media unit flowing through a stream.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Wall-clock timestamp of the unit.
    pub ntp: DateTime<Utc>,
    /// Presentation timestamp, nanoseconds from an arbitrary epoch.
    pub pts: i64,
    /// RTP packets carrying the unit, possibly empty.
    pub rtp_packets: Vec<Packet>,
    /// Decoded payload, [`Payload::None`] when the unit is opaque.
    pub payload: Payload,
}

impl Unit {
    /// A unit carrying a single RTP packet and no decoded payload.
    pub fn from_rtp(pkt: Packet, ntp: DateTime<Utc>, pts: i64) -> Self {
        Self {
            ntp,
            pts,
            rtp_packets: vec![pkt],
            payload: Payload::None,
        }
    }

    /// Total wire size of the RTP packets of this unit.
    pub fn wire_size(&self) -> u64 {
        self.rtp_packets.iter().map(|p| p.marshal_size() as u64).sum()
    }
}

/// Codec-specific decoded payload of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No decoded payload; RTP packets are routed opaquely.
    None,
    /// H.264 access unit, one NAL unit per entry.
    H264 { au: Vec<Bytes> },
    /// H.265 access unit, one NAL unit per entry.
    H265 { au: Vec<Bytes> },
    /// AV1 temporal unit, one OBU per entry.
    Av1 { tu: Vec<Bytes> },
    /// VP9 frame.
    Vp9 { frame: Bytes },
    /// MPEG-4 Video frame.
    Mpeg4Video { frame: Bytes },
    /// MPEG-1/2 Video frame.
    Mpeg1Video { frame: Bytes },
    /// Motion-JPEG frame.
    Mjpeg { frame: Bytes },
    /// MPEG-4 Audio access units.
    Mpeg4Audio { aus: Vec<Bytes> },
    /// MPEG-1 Audio frames.
    Mpeg1Audio { frames: Vec<Bytes> },
    /// Opus packets.
    Opus { packets: Vec<Bytes> },
    /// AC-3 frames.
    Ac3 { frames: Vec<Bytes> },
    /// Uncompressed audio samples.
    Lpcm { samples: Bytes },
}

impl Payload {
    /// Whether the payload carries no data at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::None => true,
            Payload::H264 { au } => au.is_empty(),
            Payload::H265 { au } => au.is_empty(),
            Payload::Av1 { tu } => tu.is_empty(),
            Payload::Vp9 { frame }
            | Payload::Mpeg4Video { frame }
            | Payload::Mpeg1Video { frame }
            | Payload::Mjpeg { frame } => frame.is_empty(),
            Payload::Mpeg4Audio { aus } => aus.is_empty(),
            Payload::Mpeg1Audio { frames } | Payload::Ac3 { frames } => frames.is_empty(),
            Payload::Opus { packets } => packets.is_empty(),
            Payload::Lpcm { samples } => samples.is_empty(),
        }
    }
}
