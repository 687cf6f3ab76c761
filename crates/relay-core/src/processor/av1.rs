//! AV1 format processor. Temporal units pass through without remuxing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_rtp::av1::{Av1Decoder, Av1Encoder};
use relay_rtp::{Packet, RtpError};

use super::{set_timestamp, FormatProcessor};
use crate::error::ProcessorError;
use crate::format::Av1Format;
use crate::unit::{Payload, Unit};

const CLOCK_RATE: u32 = 90_000;

pub(super) struct Av1Processor {
    udp_max_payload_size: usize,
    format: Arc<Av1Format>,
    encoder: Option<Av1Encoder>,
    decoder: Option<Av1Decoder>,
}

impl Av1Processor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<Av1Format>,
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
        self.encoder = Some(Av1Encoder::new(
            self.udp_max_payload_size - 12,
            self.format.payload_type,
            None,
            None,
        ));
    }
}

impl FormatProcessor for Av1Processor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let tu = match &unit.payload {
            Payload::Av1 { tu } => tu.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        if tu.is_empty() {
            unit.rtp_packets = Vec::new();
            return Ok(());
        }

        if self.encoder.is_none() {
            self.create_encoder();
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut pkts = encoder.encode(&tu)?;
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
            let decoder = self.decoder.get_or_insert_with(Av1Decoder::new);

            match decoder.decode(&pkt) {
                Ok(tu) => unit.payload = Payload::Av1 { tu },
                Err(RtpError::MorePacketsNeeded)
                | Err(RtpError::NonStartingPacketAndNoPrevious) => return Ok(unit),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(unit)
    }
}
