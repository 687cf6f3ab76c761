//! H.264 format processor.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use relay_rtp::h264::{nalu_type, H264Decoder, H264Encoder, NaluType, TYPE_STAP_A};
use relay_rtp::{Packet, RtpError};

use super::{set_timestamp, FormatProcessor, KeyFrameWatch, ParentLogger};
use crate::error::ProcessorError;
use crate::format::H264Format;
use crate::unit::{Payload, Unit};

const CLOCK_RATE: u32 = 90_000;

/// Extract SPS and PPS without decoding RTP packets.
fn rtp_extract_sps_pps(pkt: &Packet) -> (Option<Bytes>, Option<Bytes>) {
    if pkt.payload.is_empty() {
        return (None, None);
    }

    match nalu_type(pkt.payload[0]) {
        t if t == NaluType::Sps as u8 => (Some(pkt.payload.clone()), None),

        t if t == NaluType::Pps as u8 => (None, Some(pkt.payload.clone())),

        TYPE_STAP_A => {
            let mut payload = pkt.payload.slice(1..);
            let mut sps = None;
            let mut pps = None;

            while !payload.is_empty() {
                if payload.len() < 2 {
                    break;
                }

                let size = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                payload = payload.slice(2..);

                if size == 0 {
                    break;
                }
                if size > payload.len() {
                    return (None, None);
                }

                let nalu = payload.slice(..size);
                payload = payload.slice(size..);

                match nalu_type(nalu[0]) {
                    t if t == NaluType::Sps as u8 => sps = Some(nalu),
                    t if t == NaluType::Pps as u8 => pps = Some(nalu),
                    _ => {}
                }
            }

            (sps, pps)
        }

        _ => (None, None),
    }
}

fn au_contains_key_frame(au: &[Bytes]) -> bool {
    au.iter()
        .any(|n| !n.is_empty() && nalu_type(n[0]) == NaluType::Idr as u8)
}

pub(super) struct H264Processor {
    udp_max_payload_size: usize,
    format: Arc<H264Format>,
    encoder: Option<H264Encoder>,
    decoder: Option<H264Decoder>,
    key_frame_watch: KeyFrameWatch,
}

impl H264Processor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<H264Format>,
        generate_rtp_packets: bool,
        parent: Arc<dyn ParentLogger>,
    ) -> Self {
        let mut p = Self {
            udp_max_payload_size,
            format,
            encoder: None,
            decoder: None,
            key_frame_watch: KeyFrameWatch::new("H264", parent),
        };
        if generate_rtp_packets {
            p.create_encoder(None, None);
        }
        p
    }

    fn create_encoder(&mut self, ssrc: Option<u32>, initial_sequence_number: Option<u16>) {
        self.encoder = Some(H264Encoder::new(
            self.udp_max_payload_size - 12,
            self.format.payload_type,
            self.format.packetization_mode,
            ssrc,
            initial_sequence_number,
        ));
    }

    fn update_track_parameters_from_rtp_packet(&self, pkt: &Packet) {
        let (sps, pps) = rtp_extract_sps_pps(pkt);
        let params = self.format.params();
        let mut update = false;

        if sps.is_some() && sps != params.sps {
            update = true;
        }
        if pps.is_some() && pps != params.pps {
            update = true;
        }

        if update {
            self.format
                .set_params(sps.or(params.sps), pps.or(params.pps));
        }
    }

    fn update_track_parameters_from_au(&self, au: &[Bytes]) {
        let params = self.format.params();
        let mut sps = params.sps;
        let mut pps = params.pps;
        let mut update = false;

        for nalu in au {
            if nalu.is_empty() {
                continue;
            }
            match nalu_type(nalu[0]) {
                t if t == NaluType::Sps as u8 => {
                    if sps.as_ref() != Some(nalu) {
                        sps = Some(nalu.clone());
                        update = true;
                    }
                }
                t if t == NaluType::Pps as u8 => {
                    if pps.as_ref() != Some(nalu) {
                        pps = Some(nalu.clone());
                        update = true;
                    }
                }
                _ => {}
            }
        }

        if update {
            self.format.set_params(sps, pps);
        }
    }

    /// Strip parameter sets and delimiters; prepend SPS and PPS ahead of
    /// key frames when both are known.
    fn remux_access_unit(&self, au: &[Bytes]) -> Vec<Bytes> {
        let params = self.format.params();
        let mut is_key_frame = false;
        let mut filtered: Vec<Bytes> = Vec::with_capacity(au.len());

        for nalu in au {
            if nalu.is_empty() {
                continue;
            }
            match nalu_type(nalu[0]) {
                t if t == NaluType::Sps as u8 || t == NaluType::Pps as u8 => continue,
                t if t == NaluType::AccessUnitDelimiter as u8 => continue,
                t if t == NaluType::Idr as u8 => is_key_frame = true,
                _ => {}
            }
            filtered.push(nalu.clone());
        }

        if filtered.is_empty() {
            return filtered;
        }

        if is_key_frame {
            if let (Some(sps), Some(pps)) = (params.sps, params.pps) {
                let mut with_params = Vec::with_capacity(filtered.len() + 2);
                with_params.push(sps);
                with_params.push(pps);
                with_params.extend(filtered);
                return with_params;
            }
        }

        filtered
    }

    fn encode_access_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let au = match &unit.payload {
            Payload::H264 { au } => au.clone(),
            _ => Vec::new(),
        };

        if au.is_empty() {
            unit.rtp_packets = Vec::new();
            return Ok(());
        }

        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut pkts = encoder.encode(&au)?;
        set_timestamp(&mut pkts, &unit.rtp_packets, CLOCK_RATE, unit.pts);
        unit.rtp_packets = pkts;
        Ok(())
    }
}

impl FormatProcessor for H264Processor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let au = match &unit.payload {
            Payload::H264 { au } => au.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        self.update_track_parameters_from_au(&au);
        self.key_frame_watch
            .observe(unit.ntp, au_contains_key_frame(&au));
        unit.payload = Payload::H264 {
            au: self.remux_access_unit(&au),
        };

        if self.encoder.is_none() {
            self.create_encoder(None, None);
        }
        self.encode_access_unit(unit)
    }

    fn process_rtp_packet(
        &mut self,
        mut pkt: Packet,
        ntp: DateTime<Utc>,
        pts: i64,
        has_non_rtsp_readers: bool,
    ) -> Result<Unit, ProcessorError> {
        self.update_track_parameters_from_rtp_packet(&pkt);

        if self.encoder.is_none() {
            pkt.strip_padding();

            // RTP packets exceed the maximum size: start re-encoding them.
            if pkt.marshal_size() > self.udp_max_payload_size {
                self.create_encoder(Some(pkt.ssrc), Some(pkt.sequence_number));
            }
        }

        let mut unit = Unit::from_rtp(pkt.clone(), ntp, pts);

        if has_non_rtsp_readers || self.decoder.is_some() || self.encoder.is_some() {
            let decoder = self.decoder.get_or_insert_with(H264Decoder::new);

            match decoder.decode(&pkt) {
                Ok(au) => {
                    self.key_frame_watch.observe(ntp, au_contains_key_frame(&au));
                    unit.payload = Payload::H264 {
                        au: self.remux_access_unit(&au),
                    };
                }
                Err(RtpError::MorePacketsNeeded)
                | Err(RtpError::NonStartingPacketAndNoPrevious) => {
                    if self.encoder.is_some() {
                        unit.rtp_packets.clear();
                    }
                    return Ok(unit);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Route the packet as-is.
        if self.encoder.is_none() {
            return Ok(unit);
        }

        self.encode_access_unit(&mut unit)?;
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::CaptureLogger;

    fn rtp(payload: Vec<u8>, sequence_number: u16) -> Packet {
        Packet {
            marker: true,
            payload_type: 96,
            sequence_number,
            timestamp: 45343,
            ssrc: 563423,
            payload: Bytes::from(payload),
            ..Default::default()
        }
    }

    fn processor(format: &Arc<H264Format>, generate_rtp_packets: bool) -> H264Processor {
        H264Processor::new(
            1472,
            format.clone(),
            generate_rtp_packets,
            Arc::new(CaptureLogger::default()),
        )
    }

    #[test]
    fn dynamic_parameters_are_learned_and_injected() {
        let format = Arc::new(H264Format::new(96, 1, None, None));
        let mut p = processor(&format, false);

        let unit = p
            .process_rtp_packet(rtp(vec![0x05, 0x00], 1), Utc::now(), 0, true)
            .unwrap();
        // No parameters are available yet.
        assert_eq!(
            unit.payload,
            Payload::H264 {
                au: vec![Bytes::from_static(&[0x05, 0x00])]
            }
        );

        p.process_rtp_packet(rtp(vec![0x67, 1, 2, 3], 2), Utc::now(), 0, false)
            .unwrap();
        p.process_rtp_packet(rtp(vec![0x68, 4, 5, 6], 3), Utc::now(), 0, false)
            .unwrap();

        let params = format.params();
        assert_eq!(params.sps, Some(Bytes::from_static(&[0x67, 1, 2, 3])));
        assert_eq!(params.pps, Some(Bytes::from_static(&[0x68, 4, 5, 6])));

        let unit = p
            .process_rtp_packet(rtp(vec![0x05, 0x00], 4), Utc::now(), 0, true)
            .unwrap();
        assert_eq!(
            unit.payload,
            Payload::H264 {
                au: vec![
                    Bytes::from_static(&[0x67, 1, 2, 3]),
                    Bytes::from_static(&[0x68, 4, 5, 6]),
                    Bytes::from_static(&[0x05, 0x00]),
                ]
            }
        );
    }

    #[test]
    fn parameters_only_au_produces_no_packets() {
        let format = Arc::new(H264Format::new(96, 1, None, None));
        let mut p = processor(&format, true);

        let mut unit = Unit {
            ntp: Utc::now(),
            pts: 0,
            rtp_packets: Vec::new(),
            payload: Payload::H264 {
                au: vec![
                    Bytes::from_static(&[0x67, 1, 2, 3]),
                    Bytes::from_static(&[0x68, 4, 5, 6]),
                ],
            },
        };

        p.process_unit(&mut unit).unwrap();
        assert!(unit.rtp_packets.is_empty());
    }

    #[test]
    fn oversize_packet_triggers_reencoding() {
        let format = Arc::new(H264Format::new(
            96,
            1,
            Some(Bytes::from_static(&[0x67, 10])),
            Some(Bytes::from_static(&[0x68, 11])),
        ));
        let mut p = processor(&format, false);

        // A small non-key packet is routed untouched.
        let unit = p
            .process_rtp_packet(rtp(vec![0x01, 0x02, 0x03, 0x04], 123), Utc::now(), 0, false)
            .unwrap();
        assert_eq!(unit.rtp_packets.len(), 1);
        assert_eq!(unit.rtp_packets[0].sequence_number, 123);
        assert_eq!(unit.rtp_packets[0].payload.len(), 4);

        // An oversize packet switches the processor to re-encoding.
        let mut big = vec![0x01];
        big.extend(std::iter::repeat(0x02).take(2000));
        let unit = p
            .process_rtp_packet(rtp(big, 124), Utc::now(), 0, false)
            .unwrap();

        assert_eq!(unit.rtp_packets.len(), 2);
        for pkt in &unit.rtp_packets {
            assert!(pkt.marshal_size() <= 1472);
            assert_eq!(pkt.ssrc, 563423);
            assert_eq!(pkt.timestamp, 45343);
        }
        assert_eq!(unit.rtp_packets[0].sequence_number, 124);
        assert_eq!(unit.rtp_packets[1].sequence_number, 125);
        assert!(!unit.rtp_packets[0].marker);
        assert!(unit.rtp_packets[1].marker);
    }

    #[test]
    fn stap_a_parameters_are_extracted() {
        let format = Arc::new(H264Format::new(96, 1, None, None));
        let p = processor(&format, false);

        let mut payload = vec![TYPE_STAP_A];
        payload.extend([0, 4, 0x67, 1, 2, 3]);
        payload.extend([0, 2, 0x68, 4]);
        p.update_track_parameters_from_rtp_packet(&rtp(payload, 1));

        let params = format.params();
        assert_eq!(params.sps, Some(Bytes::from_static(&[0x67, 1, 2, 3])));
        assert_eq!(params.pps, Some(Bytes::from_static(&[0x68, 4])));
    }

    #[test]
    fn truncated_stap_a_is_ignored() {
        let format = Arc::new(H264Format::new(96, 1, None, None));
        let p = processor(&format, false);

        // Size field claims more bytes than are present.
        let payload = vec![TYPE_STAP_A, 0, 10, 0x67, 1];
        p.update_track_parameters_from_rtp_packet(&rtp(payload, 1));

        assert!(format.params().sps.is_none());
    }

    #[test]
    fn key_frame_warning_fires_once() {
        let format = Arc::new(H264Format::new(96, 1, None, None));
        let logger = Arc::new(CaptureLogger::default());
        let mut p = H264Processor::new(1472, format, true, logger.clone());

        let ntp0 = "2009-11-10T23:00:00Z".parse::<DateTime<Utc>>().unwrap();
        for i in 0..3 {
            let mut unit = Unit {
                ntp: ntp0 + chrono::Duration::seconds(30 * i),
                pts: 0,
                rtp_packets: Vec::new(),
                payload: Payload::H264 {
                    au: vec![Bytes::from_static(&[0x01])],
                },
            };
            p.process_unit(&mut unit).unwrap();
        }

        let warnings = logger.warnings.lock().unwrap();
        assert_eq!(
            warnings.as_slice(),
            ["no H264 key frames received in 10s, stream can't be decoded"]
        );
    }
}
