//! Generic fragmentation payload format.
//!
//! Used by codecs whose RTP mapping is "split the elementary-stream frame
//! at packet boundaries, marker on the last fragment" (MPEG-4 Video and
//! friends).

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::{Packet, RtpError};

const MAX_FRAME_SIZE: usize = 3 * 1024 * 1024;

/// Payloader that slices a frame into fixed-size fragments.
pub struct FragmentEncoder {
    payload_max_size: usize,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    initial_timestamp: u32,
}

impl FragmentEncoder {
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

        let count = frame.len().div_ceil(self.payload_max_size);
        let mut pkts = Vec::with_capacity(count);

        for (i, chunk) in frame.chunks(self.payload_max_size).enumerate() {
            let pkt = Packet {
                marker: i == count - 1,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp: self.initial_timestamp,
                ssrc: self.ssrc,
                payload: frame.slice(i * self.payload_max_size..i * self.payload_max_size + chunk.len()),
                ..Default::default()
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);
            pkts.push(pkt);
        }

        Ok(pkts)
    }
}

/// Depayloader that concatenates fragments until the marker bit.
#[derive(Default)]
pub struct FragmentDecoder {
    buffer: Option<BytesMut>,
}

impl FragmentDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, pkt: &Packet) -> Result<Bytes, RtpError> {
        let buffer = self.buffer.get_or_insert_with(BytesMut::new);
        buffer.put_slice(&pkt.payload);

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut enc = FragmentEncoder::new(100, 32, Some(1), Some(0));
        let frame = Bytes::from((0..250).map(|i| i as u8).collect::<Vec<u8>>());
        let pkts = enc.encode(&frame).unwrap();

        assert_eq!(pkts.len(), 3);
        assert_eq!(pkts[0].payload.len(), 100);
        assert_eq!(pkts[2].payload.len(), 50);
        assert!(pkts[2].marker);

        let mut dec = FragmentDecoder::new();
        assert_eq!(dec.decode(&pkts[0]).unwrap_err(), RtpError::MorePacketsNeeded);
        assert_eq!(dec.decode(&pkts[1]).unwrap_err(), RtpError::MorePacketsNeeded);
        assert_eq!(dec.decode(&pkts[2]).unwrap(), frame);
    }

    #[test]
    fn empty_frame_produces_no_packets() {
        let mut enc = FragmentEncoder::new(100, 32, None, None);
        assert!(enc.encode(&Bytes::new()).unwrap().is_empty());
    }
}
