//! LPCM format processor. Samples pass through without remuxing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_rtp::fragment::{FragmentDecoder, FragmentEncoder};
use relay_rtp::{Packet, RtpError};

use super::{set_timestamp, FormatProcessor};
use crate::error::ProcessorError;
use crate::format::LpcmFormat;
use crate::unit::{Payload, Unit};

pub(super) struct LpcmProcessor {
    udp_max_payload_size: usize,
    format: Arc<LpcmFormat>,
    encoder: Option<FragmentEncoder>,
    decoder: Option<FragmentDecoder>,
}

impl LpcmProcessor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<LpcmFormat>,
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
        // keep sample alignment when splitting
        let sample_size = (self.format.bit_depth as usize / 8) * self.format.channels as usize;
        let mut payload_max_size = self.udp_max_payload_size - 12;
        if sample_size > 0 {
            payload_max_size -= payload_max_size % sample_size;
        }
        self.encoder = Some(FragmentEncoder::new(
            payload_max_size,
            self.format.payload_type,
            None,
            None,
        ));
    }
}

impl FormatProcessor for LpcmProcessor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let samples = match &unit.payload {
            Payload::Lpcm { samples } => samples.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        if samples.is_empty() {
            unit.rtp_packets = Vec::new();
            return Ok(());
        }

        if self.encoder.is_none() {
            self.create_encoder();
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut pkts = encoder.encode(&samples)?;
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
            let decoder = self.decoder.get_or_insert_with(FragmentDecoder::new);

            match decoder.decode(&pkt) {
                Ok(samples) => unit.payload = Payload::Lpcm { samples },
                Err(RtpError::MorePacketsNeeded) => return Ok(unit),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(unit)
    }
}
