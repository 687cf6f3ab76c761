//! MPEG-1/2 Video format processor. Frames pass through without remuxing.

use chrono::{DateTime, Utc};
use relay_rtp::fragment::{FragmentDecoder, FragmentEncoder};
use relay_rtp::{Packet, RtpError};

use super::{set_timestamp, FormatProcessor};
use crate::error::ProcessorError;
use crate::unit::{Payload, Unit};

const CLOCK_RATE: u32 = 90_000;
const PAYLOAD_TYPE: u8 = 32;

pub(super) struct Mpeg1VideoProcessor {
    udp_max_payload_size: usize,
    encoder: Option<FragmentEncoder>,
    decoder: Option<FragmentDecoder>,
}

impl Mpeg1VideoProcessor {
    pub(super) fn new(udp_max_payload_size: usize, generate_rtp_packets: bool) -> Self {
        let mut p = Self {
            udp_max_payload_size,
            encoder: None,
            decoder: None,
        };
        if generate_rtp_packets {
            p.create_encoder();
        }
        p
    }

    fn create_encoder(&mut self) {
        self.encoder = Some(FragmentEncoder::new(
            self.udp_max_payload_size - 12,
            PAYLOAD_TYPE,
            None,
            None,
        ));
    }
}

impl FormatProcessor for Mpeg1VideoProcessor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let frame = match &unit.payload {
            Payload::Mpeg1Video { frame } => frame.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        if frame.is_empty() {
            unit.rtp_packets = Vec::new();
            return Ok(());
        }

        if self.encoder.is_none() {
            self.create_encoder();
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut pkts = encoder.encode(&frame)?;
        set_timestamp(&mut pkts, &unit.rtp_packets, CLOCK_RATE, unit.pts);
        unit.rtp_packets = pkts;
        Ok(())
    }

    fn process_rtp_packet(
        &mut self,
        mut pkt: Packet,
        ntp: DateTime<Utc>,
        pts: i64,
        has_non_rtsp_readers: bool,
    ) -> Result<Unit, ProcessorError> {
        pkt.strip_padding();
        if pkt.marshal_size() > self.udp_max_payload_size {
            return Err(ProcessorError::PayloadTooLarge {
                size: pkt.marshal_size(),
                max: self.udp_max_payload_size,
            });
        }

        let mut unit = Unit::from_rtp(pkt.clone(), ntp, pts);

        if has_non_rtsp_readers || self.decoder.is_some() {
            let decoder = self.decoder.get_or_insert_with(FragmentDecoder::new);

            match decoder.decode(&pkt) {
                Ok(frame) => unit.payload = Payload::Mpeg1Video { frame },
                Err(RtpError::MorePacketsNeeded) => return Ok(unit),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(unit)
    }
}
