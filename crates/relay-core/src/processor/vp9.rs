//! VP9 format processor. Frames pass through without remuxing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_rtp::vp9::{Vp9Decoder, Vp9Encoder};
use relay_rtp::{Packet, RtpError};

use super::{set_timestamp, FormatProcessor};
use crate::error::ProcessorError;
use crate::format::Vp9Format;
use crate::unit::{Payload, Unit};

const CLOCK_RATE: u32 = 90_000;

pub(super) struct Vp9Processor {
    udp_max_payload_size: usize,
    format: Arc<Vp9Format>,
    encoder: Option<Vp9Encoder>,
    decoder: Option<Vp9Decoder>,
}

impl Vp9Processor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<Vp9Format>,
        generate_rtp_packets: bool,
    ) -> Self {
        let mut p = Self {
            udp_max_payload_size,
            format,
            encoder: None,
            decoder: None,
        };
        if generate_rtp_packets {
            p.create_encoder();
        }
        p
    }

    fn create_encoder(&mut self) {
        self.encoder = Some(Vp9Encoder::new(
            self.udp_max_payload_size - 12,
            self.format.payload_type,
            None,
            None,
        ));
    }
}

impl FormatProcessor for Vp9Processor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let frame = match &unit.payload {
            Payload::Vp9 { frame } => frame.clone(),
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
            let decoder = self.decoder.get_or_insert_with(Vp9Decoder::new);

            match decoder.decode(&pkt) {
                Ok(frame) => unit.payload = Payload::Vp9 { frame },
                Err(RtpError::MorePacketsNeeded)
                | Err(RtpError::NonStartingPacketAndNoPrevious) => return Ok(unit),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(unit)
    }
}
