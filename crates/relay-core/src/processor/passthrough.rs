//! Opaque processor for codecs the relay routes but never repacketizes.

use chrono::{DateTime, Utc};
use relay_rtp::Packet;

use super::FormatProcessor;
use crate::error::ProcessorError;
use crate::unit::Unit;

pub(super) struct PassthroughProcessor {
    udp_max_payload_size: usize,
    codec: &'static str,
}

impl PassthroughProcessor {
    pub(super) fn new(udp_max_payload_size: usize, codec: &'static str) -> Self {
        Self {
            udp_max_payload_size,
            codec,
        }
    }
}

impl FormatProcessor for PassthroughProcessor {
    fn process_unit(&mut self, _unit: &mut Unit) -> Result<(), ProcessorError> {
        Err(ProcessorError::CodecUnsupported { codec: self.codec })
    }

    fn process_rtp_packet(
        &mut self,
        mut pkt: Packet,
        ntp: DateTime<Utc>,
        pts: i64,
        _has_non_rtsp_readers: bool,
    ) -> Result<Unit, ProcessorError> {
        pkt.strip_padding();
        if pkt.marshal_size() > self.udp_max_payload_size {
            return Err(ProcessorError::PayloadTooLarge {
                size: pkt.marshal_size(),
                max: self.udp_max_payload_size,
            });
        }

        Ok(Unit::from_rtp(pkt, ntp, pts))
    }
}
