//! AV1 RTP payload format (AOM AV1 RTP mapping, v1.0).
//!
//! One OBU element per packet (W = 1); oversize OBUs are split across
//! packets with the Z/Y continuation flags. The decoder additionally
//! accepts W = 0 packets with LEB128 length prefixes.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::{Packet, RtpError};

const MAX_TU_SIZE: usize = 3 * 1024 * 1024;

const FLAG_Z: u8 = 0x80;
const FLAG_Y: u8 = 0x40;
const W_SHIFT: u8 = 4;
const W_MASK: u8 = 0x30;

/// RTP/AV1 payloader.
pub struct Av1Encoder {
    payload_max_size: usize,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    initial_timestamp: u32,
}

impl Av1Encoder {
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

    /// Packetize one temporal unit (a list of OBUs).
    pub fn encode(&mut self, tu: &[Bytes]) -> Result<Vec<Packet>, RtpError> {
        let mut payloads: Vec<Bytes> = Vec::new();
        let chunk_size = self.payload_max_size - 1;

        for obu in tu {
            if obu.is_empty() {
                continue;
            }
            let count = obu.len().div_ceil(chunk_size);
            for (i, chunk) in obu.chunks(chunk_size).enumerate() {
                let mut header = 1 << W_SHIFT;
                if i > 0 {
                    header |= FLAG_Z;
                }
                if i < count - 1 {
                    header |= FLAG_Y;
                }

                let mut buf = BytesMut::with_capacity(1 + chunk.len());
                buf.put_u8(header);
                buf.put_slice(chunk);
                payloads.push(buf.freeze());
            }
        }

        let last = payloads.len().saturating_sub(1);
        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let pkt = Packet {
                    marker: i == last,
                    payload_type: self.payload_type,
                    sequence_number: self.sequence_number,
                    timestamp: self.initial_timestamp,
                    ssrc: self.ssrc,
                    payload,
                    ..Default::default()
                };
                self.sequence_number = self.sequence_number.wrapping_add(1);
                pkt
            })
            .collect())
    }
}

fn read_leb128(buf: &Bytes, pos: &mut usize) -> Result<usize, RtpError> {
    let mut value = 0usize;
    for i in 0..8 {
        if *pos >= buf.len() {
            return Err(RtpError::BufferTooShort(buf.len()));
        }
        let b = buf[*pos];
        *pos += 1;
        value |= ((b & 0x7F) as usize) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(RtpError::InvalidAggregation("LEB128 length is too long"))
}

/// RTP/AV1 depayloader.
#[derive(Default)]
pub struct Av1Decoder {
    obus: Vec<Bytes>,
    tu_size: usize,
    fragment: Option<BytesMut>,
}

impl Av1Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the OBUs of one temporal unit when a packet with the marker
    /// bit completes it.
    pub fn decode(&mut self, pkt: &Packet) -> Result<Vec<Bytes>, RtpError> {
        if pkt.payload.len() < 2 {
            return Err(RtpError::BufferTooShort(pkt.payload.len()));
        }

        let header = pkt.payload[0];
        let z = header & FLAG_Z != 0;
        let y = header & FLAG_Y != 0;
        let w = (header & W_MASK) >> W_SHIFT;

        let mut pos = 1;
        let mut elements: Vec<Bytes> = Vec::new();

        if w == 0 {
            while pos < pkt.payload.len() {
                let size = read_leb128(&pkt.payload, &mut pos)?;
                if size == 0 || pos + size > pkt.payload.len() {
                    return Err(RtpError::InvalidAggregation("invalid OBU element size"));
                }
                elements.push(pkt.payload.slice(pos..pos + size));
                pos += size;
            }
        } else {
            // the last element extends to the end of the payload
            for _ in 0..w - 1 {
                let size = read_leb128(&pkt.payload, &mut pos)?;
                if size == 0 || pos + size > pkt.payload.len() {
                    return Err(RtpError::InvalidAggregation("invalid OBU element size"));
                }
                elements.push(pkt.payload.slice(pos..pos + size));
                pos += size;
            }
            if pos >= pkt.payload.len() {
                return Err(RtpError::BufferTooShort(pkt.payload.len()));
            }
            elements.push(pkt.payload.slice(pos..));
        }

        for (i, element) in elements.iter().enumerate() {
            let first = i == 0;
            let last = i == elements.len() - 1;

            if first && z {
                let frag = self
                    .fragment
                    .as_mut()
                    .ok_or(RtpError::NonStartingPacketAndNoPrevious)?;
                frag.put_slice(element);
                if !(last && y) {
                    if let Some(frag) = self.fragment.take() {
                        self.push_obu(frag.freeze())?;
                    }
                }
            } else if last && y {
                self.fragment = Some(BytesMut::from(&element[..]));
            } else {
                self.push_obu(element.clone())?;
            }
        }

        if !pkt.marker || self.fragment.is_some() {
            return Err(RtpError::MorePacketsNeeded);
        }
        if self.obus.is_empty() {
            return Err(RtpError::MorePacketsNeeded);
        }

        self.tu_size = 0;
        Ok(std::mem::take(&mut self.obus))
    }

    fn push_obu(&mut self, obu: Bytes) -> Result<(), RtpError> {
        self.tu_size += obu.len();
        if self.tu_size > MAX_TU_SIZE {
            self.obus.clear();
            self.tu_size = 0;
            self.fragment = None;
            return Err(RtpError::AccessUnitTooBig {
                size: self.tu_size,
                max: MAX_TU_SIZE,
            });
        }
        self.obus.push(obu);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_unit_round_trip() {
        let mut enc = Av1Encoder::new(100, 97, Some(1), Some(0));
        let tu = vec![
            Bytes::from_static(&[0x0A, 1, 2, 3]),
            Bytes::from((0..250).map(|i| i as u8).collect::<Vec<u8>>()),
        ];
        let pkts = enc.encode(&tu).unwrap();
        assert!(pkts.len() > 2);

        let mut dec = Av1Decoder::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(dec.decode(pkt).unwrap_err(), RtpError::MorePacketsNeeded);
        }
        assert_eq!(dec.decode(&pkts[pkts.len() - 1]).unwrap(), tu);
    }

    #[test]
    fn continuation_without_start_is_flagged() {
        let mut dec = Av1Decoder::new();
        let pkt = Packet {
            marker: true,
            payload: Bytes::from_static(&[(1 << W_SHIFT) | FLAG_Z, 1, 2]),
            ..Default::default()
        };
        assert_eq!(
            dec.decode(&pkt).unwrap_err(),
            RtpError::NonStartingPacketAndNoPrevious
        );
    }
}
