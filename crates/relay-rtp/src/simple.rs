//! Compact payload formats for codecs whose RTP mapping is a fixed header
//! (or none) in front of each elementary frame: Opus, MPEG-1 Audio,
//! AC-3 and MPEG-4 Audio generic mode.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::{Packet, RtpError};

fn seed(ssrc: Option<u32>, seq: Option<u16>) -> (u32, u16, u32) {
    let mut rng = rand::thread_rng();
    (
        ssrc.unwrap_or_else(|| rng.gen()),
        seq.unwrap_or_else(|| rng.gen()),
        rng.gen(),
    )
}

/// Payloader for codecs carrying one frame per packet behind a fixed
/// header: Opus (no header), MPEG-1 Audio (4-byte offset header), AC-3
/// (2-byte frame-count header).
pub struct FrameEncoder {
    payload_max_size: usize,
    payload_type: u8,
    header: HeaderKind,
    ssrc: u32,
    sequence_number: u16,
    initial_timestamp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// No payload header (Opus, RFC 7587).
    None,
    /// 4-byte MBZ/offset header (MPEG-1 Audio, RFC 2250).
    Mpeg1Audio,
    /// 2-byte frame-type/count header (AC-3, RFC 4184).
    Ac3,
}

impl HeaderKind {
    fn len(self) -> usize {
        match self {
            HeaderKind::None => 0,
            HeaderKind::Mpeg1Audio => 4,
            HeaderKind::Ac3 => 2,
        }
    }
}

impl FrameEncoder {
    pub fn new(
        payload_max_size: usize,
        payload_type: u8,
        header: HeaderKind,
        ssrc: Option<u32>,
        initial_sequence_number: Option<u16>,
    ) -> Self {
        let (ssrc, sequence_number, initial_timestamp) = seed(ssrc, initial_sequence_number);
        Self {
            payload_max_size,
            payload_type,
            header,
            ssrc,
            sequence_number,
            initial_timestamp,
        }
    }

    pub fn initial_timestamp(&self) -> u32 {
        self.initial_timestamp
    }

    /// Packetize a group of frames, one frame per packet.
    pub fn encode(&mut self, frames: &[Bytes]) -> Result<Vec<Packet>, RtpError> {
        let mut pkts = Vec::with_capacity(frames.len());
        let last = frames.len().saturating_sub(1);

        for (i, frame) in frames.iter().enumerate() {
            let size = self.header.len() + frame.len();
            if size > self.payload_max_size {
                return Err(RtpError::PayloadTooLarge {
                    size,
                    max: self.payload_max_size,
                });
            }

            let mut buf = BytesMut::with_capacity(size);
            match self.header {
                HeaderKind::None => {}
                HeaderKind::Mpeg1Audio => buf.put_u32(0),
                HeaderKind::Ac3 => {
                    buf.put_u8(0);
                    buf.put_u8(1);
                }
            }
            buf.put_slice(frame);

            pkts.push(Packet {
                marker: i == last,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp: self.initial_timestamp,
                ssrc: self.ssrc,
                payload: buf.freeze(),
                ..Default::default()
            });
            self.sequence_number = self.sequence_number.wrapping_add(1);
        }

        Ok(pkts)
    }
}

/// Depayloader counterpart of [`FrameEncoder`].
pub struct FrameDecoder {
    header: HeaderKind,
}

impl FrameDecoder {
    pub fn new(header: HeaderKind) -> Self {
        Self { header }
    }

    pub fn decode(&mut self, pkt: &Packet) -> Result<Vec<Bytes>, RtpError> {
        let hdr = self.header.len();
        if pkt.payload.len() <= hdr {
            return Err(RtpError::BufferTooShort(pkt.payload.len()));
        }
        Ok(vec![pkt.payload.slice(hdr..)])
    }
}

/// MPEG-4 Audio generic mode (RFC 3640): a 16-bit AU-headers-length field
/// followed by one 16-bit header (13-bit size, 3-bit index delta) per AU.
pub struct Mpeg4AudioEncoder {
    payload_max_size: usize,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    initial_timestamp: u32,
}

impl Mpeg4AudioEncoder {
    pub fn new(
        payload_max_size: usize,
        payload_type: u8,
        ssrc: Option<u32>,
        initial_sequence_number: Option<u16>,
    ) -> Self {
        let (ssrc, sequence_number, initial_timestamp) = seed(ssrc, initial_sequence_number);
        Self {
            payload_max_size,
            payload_type,
            ssrc,
            sequence_number,
            initial_timestamp,
        }
    }

    pub fn initial_timestamp(&self) -> u32 {
        self.initial_timestamp
    }

    /// Packetize a group of access units into a single packet.
    pub fn encode(&mut self, aus: &[Bytes]) -> Result<Vec<Packet>, RtpError> {
        if aus.is_empty() {
            return Ok(Vec::new());
        }

        let headers_size = 2 + 2 * aus.len();
        let size = headers_size + aus.iter().map(|au| au.len()).sum::<usize>();
        if size > self.payload_max_size {
            return Err(RtpError::PayloadTooLarge {
                size,
                max: self.payload_max_size,
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16((16 * aus.len()) as u16);
        for au in aus {
            buf.put_u16((au.len() << 3) as u16);
        }
        for au in aus {
            buf.put_slice(au);
        }

        let pkt = Packet {
            marker: true,
            payload_type: self.payload_type,
            sequence_number: self.sequence_number,
            timestamp: self.initial_timestamp,
            ssrc: self.ssrc,
            payload: buf.freeze(),
            ..Default::default()
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        Ok(vec![pkt])
    }
}

/// Depayloader counterpart of [`Mpeg4AudioEncoder`].
#[derive(Default)]
pub struct Mpeg4AudioDecoder {}

impl Mpeg4AudioDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, pkt: &Packet) -> Result<Vec<Bytes>, RtpError> {
        if pkt.payload.len() < 2 {
            return Err(RtpError::BufferTooShort(pkt.payload.len()));
        }

        let headers_bits = u16::from_be_bytes([pkt.payload[0], pkt.payload[1]]) as usize;
        if headers_bits == 0 || headers_bits % 16 != 0 {
            return Err(RtpError::InvalidAggregation("invalid AU-headers length"));
        }
        let count = headers_bits / 16;
        let headers_end = 2 + 2 * count;
        if pkt.payload.len() < headers_end {
            return Err(RtpError::BufferTooShort(pkt.payload.len()));
        }

        let mut sizes = Vec::with_capacity(count);
        for i in 0..count {
            let h = u16::from_be_bytes([pkt.payload[2 + 2 * i], pkt.payload[3 + 2 * i]]);
            sizes.push((h >> 3) as usize);
        }

        let mut aus = Vec::with_capacity(count);
        let mut pos = headers_end;
        for size in sizes {
            if pkt.payload.len() < pos + size {
                return Err(RtpError::BufferTooShort(pkt.payload.len()));
            }
            aus.push(pkt.payload.slice(pos..pos + size));
            pos += size;
        }

        Ok(aus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_frames_round_trip() {
        let mut enc = FrameEncoder::new(1460, 111, HeaderKind::None, Some(1), Some(0));
        let frames = vec![Bytes::from_static(&[1, 2, 3]), Bytes::from_static(&[4, 5])];
        let pkts = enc.encode(&frames).unwrap();

        assert_eq!(pkts.len(), 2);
        assert!(!pkts[0].marker);
        assert!(pkts[1].marker);

        let mut dec = FrameDecoder::new(HeaderKind::None);
        assert_eq!(dec.decode(&pkts[0]).unwrap(), vec![frames[0].clone()]);
        assert_eq!(dec.decode(&pkts[1]).unwrap(), vec![frames[1].clone()]);
    }

    #[test]
    fn mpeg1_audio_header_is_stripped() {
        let mut enc = FrameEncoder::new(1460, 14, HeaderKind::Mpeg1Audio, Some(1), Some(0));
        let frames = vec![Bytes::from_static(&[0xFF, 0xFB, 1, 2])];
        let pkts = enc.encode(&frames).unwrap();

        assert_eq!(&pkts[0].payload[..4], &[0, 0, 0, 0]);

        let mut dec = FrameDecoder::new(HeaderKind::Mpeg1Audio);
        assert_eq!(dec.decode(&pkts[0]).unwrap(), frames);
    }

    #[test]
    fn mpeg4_audio_aus_round_trip() {
        let mut enc = Mpeg4AudioEncoder::new(1460, 96, Some(1), Some(0));
        let aus = vec![
            Bytes::from_static(&[0x21, 0x10, 0x04]),
            Bytes::from_static(&[0x21, 0x10]),
        ];
        let pkts = enc.encode(&aus).unwrap();

        assert_eq!(pkts.len(), 1);
        assert!(pkts[0].marker);

        let mut dec = Mpeg4AudioDecoder::new();
        assert_eq!(dec.decode(&pkts[0]).unwrap(), aus);
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut enc = FrameEncoder::new(10, 111, HeaderKind::None, None, None);
        let frames = vec![Bytes::from(vec![0; 20])];
        assert!(matches!(
            enc.encode(&frames).unwrap_err(),
            RtpError::PayloadTooLarge { .. }
        ));
    }
}
