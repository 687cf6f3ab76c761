//! H.264 RTP payload format (RFC 6184).
//!
//! The encoder aggregates small NAL units into STAP-A packets and fragments
//! oversize ones into FU-A runs; the decoder reassembles access units,
//! treating the marker bit as the access-unit boundary.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::{Packet, RtpError};

/// Maximum size of a reassembled access unit.
const MAX_AU_SIZE: usize = 3 * 1024 * 1024;
/// Maximum number of NAL units in a reassembled access unit.
const MAX_NALUS_PER_AU: usize = 25;

pub const TYPE_STAP_A: u8 = 24;
pub const TYPE_FU_A: u8 = 28;

/// H.264 NAL unit types the relay inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NaluType {
    NonIdr = 1,
    Idr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AccessUnitDelimiter = 9,
}

/// Extract the NAL unit type from a NAL header byte.
pub fn nalu_type(header: u8) -> u8 {
    header & 0x1F
}

/// RTP/H.264 payloader.
pub struct H264Encoder {
    payload_max_size: usize,
    payload_type: u8,
    packetization_mode: u8,
    ssrc: u32,
    sequence_number: u16,
    initial_timestamp: u32,
}

impl H264Encoder {
    /// Create an encoder. `ssrc` and `initial_sequence_number` are randomized
    /// when not provided; a processor that takes over an existing RTP stream
    /// seeds them from the last routed packet.
    pub fn new(
        payload_max_size: usize,
        payload_type: u8,
        packetization_mode: u8,
        ssrc: Option<u32>,
        initial_sequence_number: Option<u16>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            payload_max_size,
            payload_type,
            packetization_mode,
            ssrc: ssrc.unwrap_or_else(|| rng.gen()),
            sequence_number: initial_sequence_number.unwrap_or_else(|| rng.gen()),
            initial_timestamp: rng.gen(),
        }
    }

    /// Timestamp carried by generated packets before the caller applies a
    /// PTS-derived offset.
    pub fn initial_timestamp(&self) -> u32 {
        self.initial_timestamp
    }

    /// Packetize one access unit. The marker bit is set on the last packet.
    pub fn encode(&mut self, au: &[Bytes]) -> Result<Vec<Packet>, RtpError> {
        let mut payloads: Vec<Bytes> = Vec::new();
        let mut batch: Vec<Bytes> = Vec::new();
        let mut batch_stap_size = 1;

        for nalu in au {
            if nalu.len() > self.payload_max_size {
                if self.packetization_mode == 0 {
                    return Err(RtpError::FragmentationForbidden {
                        size: nalu.len(),
                        max: self.payload_max_size,
                    });
                }
                self.flush_batch(&mut batch, &mut batch_stap_size, &mut payloads);
                self.fragment(nalu, &mut payloads);
                continue;
            }

            if self.packetization_mode == 0 {
                payloads.push(nalu.clone());
                continue;
            }

            if !batch.is_empty() && batch_stap_size + 2 + nalu.len() > self.payload_max_size {
                self.flush_batch(&mut batch, &mut batch_stap_size, &mut payloads);
            }
            batch_stap_size += 2 + nalu.len();
            batch.push(nalu.clone());
        }

        self.flush_batch(&mut batch, &mut batch_stap_size, &mut payloads);

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

    fn flush_batch(&self, batch: &mut Vec<Bytes>, stap_size: &mut usize, out: &mut Vec<Bytes>) {
        match batch.len() {
            0 => {}
            1 => out.push(batch.pop().unwrap()),
            _ => {
                let mut buf = BytesMut::with_capacity(*stap_size);
                let nri = batch.iter().map(|n| n[0] & 0x60).max().unwrap();
                buf.put_u8(nri | TYPE_STAP_A);
                for nalu in batch.drain(..) {
                    buf.put_u16(nalu.len() as u16);
                    buf.put_slice(&nalu);
                }
                out.push(buf.freeze());
            }
        }
        *stap_size = 1;
    }

    fn fragment(&self, nalu: &Bytes, out: &mut Vec<Bytes>) {
        let indicator = (nalu[0] & 0xE0) | TYPE_FU_A;
        let typ = nalu_type(nalu[0]);
        let data = &nalu[1..];
        let chunk_size = self.payload_max_size - 2;
        let count = data.len().div_ceil(chunk_size);

        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let mut buf = BytesMut::with_capacity(2 + chunk.len());
            buf.put_u8(indicator);
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

/// RTP/H.264 depayloader. Returns the NAL units of one access unit when a
/// packet with the marker bit completes it.
#[derive(Default)]
pub struct H264Decoder {
    nalus: Vec<Bytes>,
    au_size: usize,
    fragment: Option<BytesMut>,
}

impl H264Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, pkt: &Packet) -> Result<Vec<Bytes>, RtpError> {
        if pkt.payload.is_empty() {
            return Err(RtpError::BufferTooShort(0));
        }

        match nalu_type(pkt.payload[0]) {
            1..=23 => {
                if self.fragment.is_some() {
                    self.fragment = None;
                    return Err(RtpError::InvalidFragment("fragment interrupted by a plain NAL unit"));
                }
                self.push_nalu(pkt.payload.clone())?;
            }

            TYPE_STAP_A => {
                let mut payload = pkt.payload.slice(1..);
                if payload.is_empty() {
                    return Err(RtpError::InvalidAggregation("STAP-A carries no NAL units"));
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

            TYPE_FU_A => {
                if pkt.payload.len() < 2 {
                    return Err(RtpError::InvalidFragment("payload too short"));
                }
                let start = (pkt.payload[1] & 0x80) != 0;
                let end = (pkt.payload[1] & 0x40) != 0;
                let typ = pkt.payload[1] & 0x1F;

                if start {
                    let mut frag = BytesMut::with_capacity(pkt.payload.len() - 1);
                    frag.put_u8((pkt.payload[0] & 0xE0) | typ);
                    frag.put_slice(&pkt.payload[2..]);
                    self.fragment = Some(frag);
                } else {
                    let frag = self
                        .fragment
                        .as_mut()
                        .ok_or(RtpError::NonStartingPacketAndNoPrevious)?;
                    frag.put_slice(&pkt.payload[2..]);
                }

                if end {
                    let frag = self
                        .fragment
                        .take()
                        .ok_or(RtpError::NonStartingPacketAndNoPrevious)?;
                    self.push_nalu(frag.freeze())?;
                }
            }

            other => return Err(RtpError::UnsupportedNalu(other)),
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

    fn encoder(max: usize) -> H264Encoder {
        H264Encoder::new(max, 96, 1, Some(0x1234), Some(100))
    }

    #[test]
    fn single_nalu_round_trip() {
        let mut enc = encoder(1460);
        let au = vec![Bytes::from_static(&[0x65, 1, 2, 3])];
        let pkts = enc.encode(&au).unwrap();

        assert_eq!(pkts.len(), 1);
        assert!(pkts[0].marker);
        assert_eq!(pkts[0].sequence_number, 100);
        assert_eq!(pkts[0].payload, au[0]);

        let mut dec = H264Decoder::new();
        assert_eq!(dec.decode(&pkts[0]).unwrap(), au);
    }

    #[test]
    fn small_nalus_are_aggregated() {
        let mut enc = encoder(1460);
        let au = vec![
            Bytes::from_static(&[0x67, 1, 2]),
            Bytes::from_static(&[0x68, 3]),
            Bytes::from_static(&[0x65, 4, 5, 6]),
        ];
        let pkts = enc.encode(&au).unwrap();

        assert_eq!(pkts.len(), 1);
        assert_eq!(nalu_type(pkts[0].payload[0]), TYPE_STAP_A);

        let mut dec = H264Decoder::new();
        assert_eq!(dec.decode(&pkts[0]).unwrap(), au);
    }

    #[test]
    fn oversize_nalu_is_fragmented() {
        let mut enc = encoder(200);
        let au = vec![Bytes::from(
            std::iter::once(0x65)
                .chain((0..500).map(|i| i as u8))
                .collect::<Vec<u8>>(),
        )];
        let pkts = enc.encode(&au).unwrap();

        assert_eq!(pkts.len(), 3);
        assert!(!pkts[0].marker);
        assert!(!pkts[1].marker);
        assert!(pkts[2].marker);
        for pkt in &pkts {
            assert!(pkt.payload.len() <= 200);
            assert_eq!(nalu_type(pkt.payload[0]), TYPE_FU_A);
        }
        assert_eq!(pkts[0].payload[1] & 0x80, 0x80);
        assert_eq!(pkts[2].payload[1] & 0x40, 0x40);
        assert_eq!(
            pkts.iter()
                .map(|p| p.sequence_number)
                .collect::<Vec<_>>(),
            vec![100, 101, 102]
        );

        let mut dec = H264Decoder::new();
        assert_eq!(dec.decode(&pkts[0]).unwrap_err(), RtpError::MorePacketsNeeded);
        assert_eq!(dec.decode(&pkts[1]).unwrap_err(), RtpError::MorePacketsNeeded);
        assert_eq!(dec.decode(&pkts[2]).unwrap(), au);
    }

    #[test]
    fn mode_zero_forbids_fragmentation() {
        let mut enc = H264Encoder::new(100, 96, 0, None, None);
        let au = vec![Bytes::from(vec![0x65; 200])];
        assert!(matches!(
            enc.encode(&au).unwrap_err(),
            RtpError::FragmentationForbidden { .. }
        ));
    }

    #[test]
    fn non_starting_fragment_without_previous() {
        let mut dec = H264Decoder::new();
        let pkt = Packet {
            marker: true,
            payload: Bytes::from_static(&[TYPE_FU_A, 0x45, 1, 2]),
            ..Default::default()
        };
        assert_eq!(
            dec.decode(&pkt).unwrap_err(),
            RtpError::NonStartingPacketAndNoPrevious
        );
    }
}
