//! VP9 RTP payload format (draft-ietf-payload-vp9).
//!
//! The encoder emits a minimal flexible-mode descriptor (begin/end flags
//! only); the decoder skips the optional descriptor fields it does not
//! need and reassembles frames on the marker bit.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::{Packet, RtpError};

const MAX_FRAME_SIZE: usize = 3 * 1024 * 1024;

const FLAG_PICTURE_ID: u8 = 0x80;
const FLAG_INTER_PREDICTED: u8 = 0x40;
const FLAG_LAYER_INDICES: u8 = 0x20;
const FLAG_FLEXIBLE: u8 = 0x10;
const FLAG_BEGIN: u8 = 0x08;
const FLAG_END: u8 = 0x04;
const FLAG_SCALABILITY: u8 = 0x02;

/// RTP/VP9 payloader.
pub struct Vp9Encoder {
    payload_max_size: usize,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    initial_timestamp: u32,
}

impl Vp9Encoder {
    pub fn new(
        payload_max_size: usize,
        payload_type: u8,
        ssrc: Option<u32>,
        initial_sequence_number: Option<u16>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            payload_max_size,
            payload_type,
            ssrc: ssrc.unwrap_or_else(|| rng.gen()),
            sequence_number: initial_sequence_number.unwrap_or_else(|| rng.gen()),
            initial_timestamp: rng.gen(),
        }
    }

    pub fn initial_timestamp(&self) -> u32 {
        self.initial_timestamp
    }

    pub fn encode(&mut self, frame: &Bytes) -> Result<Vec<Packet>, RtpError> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = self.payload_max_size - 1;
        let count = frame.len().div_ceil(chunk_size);
        let mut pkts = Vec::with_capacity(count);

        for (i, chunk) in frame.chunks(chunk_size).enumerate() {
            let mut descriptor = 0;
            if i == 0 {
                descriptor |= FLAG_BEGIN;
            }
            if i == count - 1 {
                descriptor |= FLAG_END;
            }

            let mut buf = BytesMut::with_capacity(1 + chunk.len());
            buf.put_u8(descriptor);
            buf.put_slice(chunk);

            let pkt = Packet {
                marker: i == count - 1,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp: self.initial_timestamp,
                ssrc: self.ssrc,
                payload: buf.freeze(),
                ..Default::default()
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);
            pkts.push(pkt);
        }

        Ok(pkts)
    }
}

/// RTP/VP9 depayloader.
#[derive(Default)]
pub struct Vp9Decoder {
    buffer: Option<BytesMut>,
}

impl Vp9Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, pkt: &Packet) -> Result<Bytes, RtpError> {
        if pkt.payload.is_empty() {
            return Err(RtpError::BufferTooShort(0));
        }

        let flags = pkt.payload[0];
        if flags & FLAG_SCALABILITY != 0 {
            return Err(RtpError::InvalidFragment("scalability structure is not supported"));
        }

        let mut pos = 1;
        if flags & FLAG_PICTURE_ID != 0 {
            if pkt.payload.len() < pos + 1 {
                return Err(RtpError::BufferTooShort(pkt.payload.len()));
            }
            pos += if pkt.payload[pos] & 0x80 != 0 { 2 } else { 1 };
        }
        if flags & FLAG_LAYER_INDICES != 0 {
            pos += 1;
            if flags & FLAG_FLEXIBLE == 0 {
                pos += 1;
            }
        }
        if flags & FLAG_FLEXIBLE != 0 && flags & FLAG_INTER_PREDICTED != 0 {
            // up to three reference indices, each with a continuation bit
            for _ in 0..3 {
                if pkt.payload.len() < pos + 1 {
                    return Err(RtpError::BufferTooShort(pkt.payload.len()));
                }
                let more = pkt.payload[pos] & 0x01 != 0;
                pos += 1;
                if !more {
                    break;
                }
            }
        }
        if pkt.payload.len() <= pos {
            return Err(RtpError::BufferTooShort(pkt.payload.len()));
        }

        if flags & FLAG_BEGIN != 0 {
            self.buffer = Some(BytesMut::new());
        }
        let buffer = self
            .buffer
            .as_mut()
            .ok_or(RtpError::NonStartingPacketAndNoPrevious)?;
        buffer.put_slice(&pkt.payload[pos..]);

        if buffer.len() > MAX_FRAME_SIZE {
            self.buffer = None;
            return Err(RtpError::AccessUnitTooBig {
                size: MAX_FRAME_SIZE + 1,
                max: MAX_FRAME_SIZE,
            });
        }

        if !pkt.marker {
            return Err(RtpError::MorePacketsNeeded);
        }

        match self.buffer.take() {
            Some(buffer) => Ok(buffer.freeze()),
            None => Err(RtpError::MorePacketsNeeded),
        }
    }
}
