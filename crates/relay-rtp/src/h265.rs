//! H.265 RTP payload format (RFC 7798).
//!
//! Same shape as the H.264 payloader, with 2-byte NAL headers, aggregation
//! packets (type 48) and fragmentation units (type 49).

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::{Packet, RtpError};

const MAX_AU_SIZE: usize = 3 * 1024 * 1024;
const MAX_NALUS_PER_AU: usize = 25;

pub const TYPE_AGGREGATION: u8 = 48;
pub const TYPE_FRAGMENTATION: u8 = 49;

/// H.265 NAL unit types the relay inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NaluType {
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
}

/// Extract the NAL unit type from the first NAL header byte.
pub fn nalu_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// Whether a NAL type starts a random-access (key) picture.
pub fn is_key_nalu(typ: u8) -> bool {
    typ == NaluType::IdrWRadl as u8 || typ == NaluType::IdrNLp as u8 || typ == NaluType::CraNut as u8
}

/// RTP/H.265 payloader.
pub struct H265Encoder {
    payload_max_size: usize,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    initial_timestamp: u32,
}

impl H265Encoder {
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

    /// Packetize one access unit. The marker bit is set on the last packet.
    pub fn encode(&mut self, au: &[Bytes]) -> Result<Vec<Packet>, RtpError> {
        let mut payloads: Vec<Bytes> = Vec::new();
        let mut batch: Vec<Bytes> = Vec::new();
        let mut batch_size = 2;

        for nalu in au {
            if nalu.len() < 2 {
                return Err(RtpError::BufferTooShort(nalu.len()));
            }

            if nalu.len() > self.payload_max_size {
                flush_batch(&mut batch, &mut batch_size, &mut payloads);
                self.fragment(nalu, &mut payloads);
                continue;
            }

            if !batch.is_empty() && batch_size + 2 + nalu.len() > self.payload_max_size {
                flush_batch(&mut batch, &mut batch_size, &mut payloads);
            }
            batch_size += 2 + nalu.len();
            batch.push(nalu.clone());
        }

        flush_batch(&mut batch, &mut batch_size, &mut payloads);

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

    fn fragment(&self, nalu: &Bytes, out: &mut Vec<Bytes>) {
        let b0 = (nalu[0] & 0x81) | (TYPE_FRAGMENTATION << 1);
        let b1 = nalu[1];
        let typ = nalu_type(nalu[0]);
        let data = &nalu[2..];
        let chunk_size = self.payload_max_size - 3;
        let count = data.len().div_ceil(chunk_size);

        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let mut buf = BytesMut::with_capacity(3 + chunk.len());
            buf.put_u8(b0);
            buf.put_u8(b1);
            let mut fu_header = typ;
            if i == 0 {
                fu_header |= 0x80;
            }
            if i == count - 1 {
                fu_header |= 0x40;
            }
            buf.put_u8(fu_header);
            buf.put_slice(chunk);
            out.push(buf.freeze());
        }
    }
}

fn flush_batch(batch: &mut Vec<Bytes>, batch_size: &mut usize, out: &mut Vec<Bytes>) {
    match batch.len() {
        0 => {}
        1 => out.push(batch.pop().unwrap()),
        _ => {
            let mut buf = BytesMut::with_capacity(*batch_size);
            buf.put_u8((batch[0][0] & 0x81) | (TYPE_AGGREGATION << 1));
            buf.put_u8(batch[0][1]);
            for nalu in batch.drain(..) {
                buf.put_u16(nalu.len() as u16);
                buf.put_slice(&nalu);
            }
            out.push(buf.freeze());
        }
    }
    *batch_size = 2;
}

/// RTP/H.265 depayloader.
#[derive(Default)]
pub struct H265Decoder {
    nalus: Vec<Bytes>,
    au_size: usize,
    fragment: Option<BytesMut>,
}

impl H265Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, pkt: &Packet) -> Result<Vec<Bytes>, RtpError> {
        if pkt.payload.len() < 2 {
            return Err(RtpError::BufferTooShort(pkt.payload.len()));
        }

        match nalu_type(pkt.payload[0]) {
            TYPE_AGGREGATION => {
                let mut payload = pkt.payload.slice(2..);
                if payload.is_empty() {
                    return Err(RtpError::InvalidAggregation("aggregation packet carries no NAL units"));
                }
                while !payload.is_empty() {
                    if payload.len() < 2 {
                        return Err(RtpError::InvalidAggregation("truncated NALU size"));
                    }
                    let size = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                    payload = payload.slice(2..);
                    if size == 0 || size > payload.len() {
                        return Err(RtpError::InvalidAggregation("invalid NALU size"));
                    }
                    self.push_nalu(payload.slice(..size))?;
                    payload = payload.slice(size..);
                }
            }

            TYPE_FRAGMENTATION => {
                if pkt.payload.len() < 3 {
                    return Err(RtpError::InvalidFragment("payload too short"));
                }
                let start = (pkt.payload[2] & 0x80) != 0;
                let end = (pkt.payload[2] & 0x40) != 0;
                let typ = pkt.payload[2] & 0x3F;

                if start {
                    let mut frag = BytesMut::with_capacity(pkt.payload.len() - 1);
                    frag.put_u8((pkt.payload[0] & 0x81) | (typ << 1));
                    frag.put_u8(pkt.payload[1]);
                    frag.put_slice(&pkt.payload[3..]);
                    self.fragment = Some(frag);
                } else {
                    let frag = self
                        .fragment
                        .as_mut()
                        .ok_or(RtpError::NonStartingPacketAndNoPrevious)?;
                    frag.put_slice(&pkt.payload[3..]);
                }

                if end {
                    let frag = self
                        .fragment
                        .take()
                        .ok_or(RtpError::NonStartingPacketAndNoPrevious)?;
                    self.push_nalu(frag.freeze())?;
                }
            }

            _ => {
                if self.fragment.is_some() {
                    self.fragment = None;
                    return Err(RtpError::InvalidFragment("fragment interrupted by a plain NAL unit"));
                }
                self.push_nalu(pkt.payload.clone())?;
            }
        }

        if !pkt.marker || self.fragment.is_some() {
            return Err(RtpError::MorePacketsNeeded);
        }
        if self.nalus.is_empty() {
            return Err(RtpError::MorePacketsNeeded);
        }

        self.au_size = 0;
        Ok(std::mem::take(&mut self.nalus))
    }

    fn push_nalu(&mut self, nalu: Bytes) -> Result<(), RtpError> {
        self.au_size += nalu.len();
        if self.au_size > MAX_AU_SIZE {
            self.reset();
            return Err(RtpError::AccessUnitTooBig {
                size: self.au_size,
                max: MAX_AU_SIZE,
            });
        }
        if self.nalus.len() >= MAX_NALUS_PER_AU {
            self.reset();
            return Err(RtpError::TooManyNalus {
                count: MAX_NALUS_PER_AU + 1,
                max: MAX_NALUS_PER_AU,
            });
        }
        self.nalus.push(nalu);
        Ok(())
    }

    fn reset(&mut self) {
        self.nalus.clear();
        self.au_size = 0;
        self.fragment = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(max: usize) -> H265Encoder {
        H265Encoder::new(max, 96, Some(563423), Some(124))
    }

    #[test]
    fn single_nalu_round_trip() {
        let mut enc = encoder(1460);
        let au = vec![Bytes::from_static(&[(NaluType::CraNut as u8) << 1, 0x00])];
        let pkts = enc.encode(&au).unwrap();

        assert_eq!(pkts.len(), 1);
        assert!(pkts[0].marker);

        let mut dec = H265Decoder::new();
        assert_eq!(dec.decode(&pkts[0]).unwrap(), au);
    }

    #[test]
    fn oversize_nalu_splits_into_two_fragments() {
        // 1472-byte datagram limit leaves 1460 bytes of payload.
        let mut enc = encoder(1460);
        let nalu = Bytes::from([0x01u8, 0x02, 0x03, 0x04].repeat(500));
        let pkts = enc.encode(&[nalu]).unwrap();

        assert_eq!(pkts.len(), 2);

        let mut first = vec![0x63, 0x02, 0x80, 0x03, 0x04];
        first.extend([0x01, 0x02, 0x03, 0x04].repeat(363));
        first.extend([0x01, 0x02, 0x03]);
        assert_eq!(&pkts[0].payload[..], &first[..]);
        assert!(!pkts[0].marker);
        assert_eq!(pkts[0].sequence_number, 124);

        let mut second = vec![0x63, 0x02, 0x40, 0x04];
        second.extend([0x01, 0x02, 0x03, 0x04].repeat(135));
        assert_eq!(&pkts[1].payload[..], &second[..]);
        assert!(pkts[1].marker);
        assert_eq!(pkts[1].sequence_number, 125);
    }

    #[test]
    fn fragments_reassemble() {
        let mut enc = encoder(200);
        let au = vec![Bytes::from(
            [(NaluType::IdrWRadl as u8) << 1, 0x01]
                .into_iter()
                .chain((0..600).map(|i| i as u8))
                .collect::<Vec<u8>>(),
        )];
        let pkts = enc.encode(&au).unwrap();
        assert!(pkts.len() > 1);

        let mut dec = H265Decoder::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(dec.decode(pkt).unwrap_err(), RtpError::MorePacketsNeeded);
        }
        assert_eq!(dec.decode(&pkts[pkts.len() - 1]).unwrap(), au);
    }

    #[test]
    fn aggregation_round_trip() {
        let mut enc = encoder(1460);
        let au = vec![
            Bytes::from_static(&[(NaluType::VpsNut as u8) << 1, 1, 2, 3]),
            Bytes::from_static(&[(NaluType::SpsNut as u8) << 1, 4, 5, 6]),
            Bytes::from_static(&[(NaluType::PpsNut as u8) << 1, 7, 8, 9]),
        ];
        let pkts = enc.encode(&au).unwrap();

        assert_eq!(pkts.len(), 1);
        assert_eq!(nalu_type(pkts[0].payload[0]), TYPE_AGGREGATION);

        let mut dec = H265Decoder::new();
        assert_eq!(dec.decode(&pkts[0]).unwrap(), au);
    }

    #[test]
    fn key_nalu_detection() {
        assert!(is_key_nalu(NaluType::IdrWRadl as u8));
        assert!(is_key_nalu(NaluType::IdrNLp as u8));
        assert!(is_key_nalu(NaluType::CraNut as u8));
        assert!(!is_key_nalu(NaluType::SpsNut as u8));
        assert!(!is_key_nalu(0));
    }
}
