//! MPEG-4 Audio format processor. Access units pass through without
//! remuxing; the Generic and LATM RTP mappings are supported, single
//! program and single layer only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_rtp::simple::{
    FrameDecoder, FrameEncoder, HeaderKind, Mpeg4AudioDecoder, Mpeg4AudioEncoder,
};
use relay_rtp::Packet;

use super::{set_timestamp, FormatProcessor};
use crate::error::ProcessorError;
use crate::format::Mpeg4AudioFormat;
use crate::unit::{Payload, Unit};

enum Encoder {
    Generic(Mpeg4AudioEncoder),
    Latm(FrameEncoder),
}

enum Decoder {
    Generic(Mpeg4AudioDecoder),
    Latm(FrameDecoder),
}

pub(super) struct Mpeg4AudioProcessor {
    udp_max_payload_size: usize,
    format: Arc<Mpeg4AudioFormat>,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
}

impl Mpeg4AudioProcessor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<Mpeg4AudioFormat>,
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
        let payload_max_size = self.udp_max_payload_size - 12;
        self.encoder = Some(if self.format.latm {
            Encoder::Latm(FrameEncoder::new(
                payload_max_size,
                self.format.payload_type,
                HeaderKind::None,
                None,
                None,
            ))
        } else {
            Encoder::Generic(Mpeg4AudioEncoder::new(
                payload_max_size,
                self.format.payload_type,
                None,
                None,
            ))
        });
    }

    fn create_decoder(&self) -> Decoder {
        if self.format.latm {
            Decoder::Latm(FrameDecoder::new(HeaderKind::None))
        } else {
            Decoder::Generic(Mpeg4AudioDecoder::new())
        }
    }
}

impl FormatProcessor for Mpeg4AudioProcessor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let aus = match &unit.payload {
            Payload::Mpeg4Audio { aus } => aus.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        if aus.is_empty() {
            unit.rtp_packets = Vec::new();
            return Ok(());
        }

        if self.encoder.is_none() {
            self.create_encoder();
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut pkts = match encoder {
            Encoder::Generic(enc) => enc.encode(&aus)?,
            Encoder::Latm(enc) => enc.encode(&aus)?,
        };
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
            if self.decoder.is_none() {
                self.decoder = Some(self.create_decoder());
            }
            let aus = match self.decoder.as_mut() {
                Some(Decoder::Generic(dec)) => dec.decode(&pkt)?,
                Some(Decoder::Latm(dec)) => dec.decode(&pkt)?,
                None => Vec::new(),
            };
            unit.payload = Payload::Mpeg4Audio { aus };
        }

        Ok(unit)
    }
}
