//! AC-3 format processor. Frames pass through without remuxing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_rtp::simple::{FrameDecoder, FrameEncoder, HeaderKind};
use relay_rtp::Packet;

use super::{set_timestamp, FormatProcessor};
use crate::error::ProcessorError;
use crate::format::Ac3Format;
use crate::unit::{Payload, Unit};

pub(super) struct Ac3Processor {
    udp_max_payload_size: usize,
    format: Arc<Ac3Format>,
    encoder: Option<FrameEncoder>,
    decoder: Option<FrameDecoder>,
}

impl Ac3Processor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<Ac3Format>,
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
        self.encoder = Some(FrameEncoder::new(
            self.udp_max_payload_size - 12,
            self.format.payload_type,
            HeaderKind::Ac3,
            None,
            None,
        ));
    }
}

impl FormatProcessor for Ac3Processor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let frames = match &unit.payload {
            Payload::Ac3 { frames } => frames.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        if frames.is_empty() {
            unit.rtp_packets = Vec::new();
            return Ok(());
        }

        if self.encoder.is_none() {
            self.create_encoder();
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut pkts = encoder.encode(&frames)?;
        set_timestamp(&mut pkts, &unit.rtp_packets, self.format.sample_rate, unit.pts);
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
            let decoder = self
                .decoder
                .get_or_insert_with(|| FrameDecoder::new(HeaderKind::Ac3));
            let frames = decoder.decode(&pkt)?;
            unit.payload = Payload::Ac3 { frames };
        }

        Ok(unit)
    }
}
