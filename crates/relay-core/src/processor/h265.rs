//! H.265 format processor.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use relay_rtp::h265::{is_key_nalu, nalu_type, H265Decoder, H265Encoder, NaluType, TYPE_AGGREGATION};
use relay_rtp::{Packet, RtpError};

use super::{set_timestamp, FormatProcessor, KeyFrameWatch, ParentLogger};
use crate::error::ProcessorError;
use crate::format::H265Format;
use crate::unit::{Payload, Unit};

const CLOCK_RATE: u32 = 90_000;

/// Extract VPS, SPS and PPS without decoding RTP packets. The NAL type is
/// recomputed from each aggregated NAL's own header.
fn rtp_extract_params(pkt: &Packet) -> (Option<Bytes>, Option<Bytes>, Option<Bytes>) {
    if pkt.payload.len() < 2 {
        return (None, None, None);
    }

    match nalu_type(pkt.payload[0]) {
        t if t == NaluType::VpsNut as u8 => (Some(pkt.payload.clone()), None, None),

        t if t == NaluType::SpsNut as u8 => (None, Some(pkt.payload.clone()), None),

        t if t == NaluType::PpsNut as u8 => (None, None, Some(pkt.payload.clone())),

        TYPE_AGGREGATION => {
            let mut payload = pkt.payload.slice(2..);
            let mut vps = None;
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
                    return (None, None, None);
                }

                let nalu = payload.slice(..size);
                payload = payload.slice(size..);

                match nalu_type(nalu[0]) {
                    t if t == NaluType::VpsNut as u8 => vps = Some(nalu),
                    t if t == NaluType::SpsNut as u8 => sps = Some(nalu),
                    t if t == NaluType::PpsNut as u8 => pps = Some(nalu),
                    _ => {}
                }
            }

            (vps, sps, pps)
        }

        _ => (None, None, None),
    }
}

fn au_contains_key_frame(au: &[Bytes]) -> bool {
    au.iter()
        .any(|n| !n.is_empty() && is_key_nalu(nalu_type(n[0])))
}

pub(super) struct H265Processor {
    udp_max_payload_size: usize,
    format: Arc<H265Format>,
    encoder: Option<H265Encoder>,
    decoder: Option<H265Decoder>,
    key_frame_watch: KeyFrameWatch,
}

impl H265Processor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<H265Format>,
        generate_rtp_packets: bool,
        parent: Arc<dyn ParentLogger>,
    ) -> Self {
        let mut p = Self {
            udp_max_payload_size,
            format,
            encoder: None,
            decoder: None,
            key_frame_watch: KeyFrameWatch::new("H265", parent),
        };
        if generate_rtp_packets {
            p.create_encoder(None, None);
        }
        p
    }

    fn create_encoder(&mut self, ssrc: Option<u32>, initial_sequence_number: Option<u16>) {
        self.encoder = Some(H265Encoder::new(
            self.udp_max_payload_size - 12,
            self.format.payload_type,
            ssrc,
            initial_sequence_number,
        ));
    }

    fn update_track_parameters_from_rtp_packet(&self, pkt: &Packet) {
        let (vps, sps, pps) = rtp_extract_params(pkt);
        let params = self.format.params();
        let mut update = false;

        if vps.is_some() && vps != params.vps {
            update = true;
        }
        if sps.is_some() && sps != params.sps {
            update = true;
        }
        if pps.is_some() && pps != params.pps {
            update = true;
        }

        if update {
            self.format.set_params(
                vps.or(params.vps),
                sps.or(params.sps),
                pps.or(params.pps),
            );
        }
    }

    // Each NAL is compared against the stored parameter set, not the
    // running local value: duplicates of the stored parameters within one
    // access unit are ignored.
    fn update_track_parameters_from_au(&self, au: &[Bytes]) {
        let stored = self.format.params();
        let mut vps = stored.vps.clone();
        let mut sps = stored.sps.clone();
        let mut pps = stored.pps.clone();
        let mut update = false;

        for nalu in au {
            if nalu.is_empty() {
                continue;
            }
            match nalu_type(nalu[0]) {
                t if t == NaluType::VpsNut as u8 => {
                    if stored.vps.as_ref() != Some(nalu) {
                        vps = Some(nalu.clone());
                        update = true;
                    }
                }
                t if t == NaluType::SpsNut as u8 => {
                    if stored.sps.as_ref() != Some(nalu) {
                        sps = Some(nalu.clone());
                        update = true;
                    }
                }
                t if t == NaluType::PpsNut as u8 => {
                    if stored.pps.as_ref() != Some(nalu) {
                        pps = Some(nalu.clone());
                        update = true;
                    }
                }
                _ => {}
            }
        }

        if update {
            self.format.set_params(vps, sps, pps);
        }
    }

    /// Strip parameter sets and delimiters; prepend VPS, SPS and PPS ahead
    /// of key frames when all three are known.
    fn remux_access_unit(&self, au: &[Bytes]) -> Vec<Bytes> {
        let params = self.format.params();
        let mut is_key_frame = false;
        let mut filtered: Vec<Bytes> = Vec::with_capacity(au.len());

        for nalu in au {
            if nalu.is_empty() {
                continue;
            }
            let typ = nalu_type(nalu[0]);
            match typ {
                t if t == NaluType::VpsNut as u8
                    || t == NaluType::SpsNut as u8
                    || t == NaluType::PpsNut as u8 =>
                {
                    continue
                }
                t if t == NaluType::AudNut as u8 => continue,
                t if is_key_nalu(t) => is_key_frame = true,
                _ => {}
            }
            filtered.push(nalu.clone());
        }

        if filtered.is_empty() {
            return filtered;
        }

        if is_key_frame {
            if let (Some(vps), Some(sps), Some(pps)) = (params.vps, params.sps, params.pps) {
                let mut with_params = Vec::with_capacity(filtered.len() + 3);
                with_params.push(vps);
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
            Payload::H265 { au } => au.clone(),
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

impl FormatProcessor for H265Processor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let au = match &unit.payload {
            Payload::H265 { au } => au.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        self.update_track_parameters_from_au(&au);
        self.key_frame_watch
            .observe(unit.ntp, au_contains_key_frame(&au));
        unit.payload = Payload::H265 {
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
            let decoder = self.decoder.get_or_insert_with(H265Decoder::new);

            match decoder.decode(&pkt) {
                Ok(au) => {
                    self.key_frame_watch.observe(ntp, au_contains_key_frame(&au));
                    unit.payload = Payload::H265 {
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

    fn rtp(payload: Vec<u8>, sequence_number: u16, padding: bool) -> Packet {
        Packet {
            marker: true,
            payload_type: 96,
            sequence_number,
            timestamp: 45343,
            ssrc: 563423,
            padding,
            padding_size: if padding { 4 } else { 0 },
            payload: Bytes::from(payload),
            ..Default::default()
        }
    }

    fn processor(format: &Arc<H265Format>, generate_rtp_packets: bool) -> H265Processor {
        H265Processor::new(
            1472,
            format.clone(),
            generate_rtp_packets,
            Arc::new(CaptureLogger::default()),
        )
    }

    #[test]
    fn dynamic_parameters_are_learned_and_injected() {
        let format = Arc::new(H265Format::new(96, None, None, None));
        let mut p = processor(&format, false);

        let cra = vec![(NaluType::CraNut as u8) << 1, 0x00];
        let unit = p
            .process_rtp_packet(rtp(cra.clone(), 1, false), Utc::now(), 0, true)
            .unwrap();
        // No parameters are available yet.
        assert_eq!(
            unit.payload,
            Payload::H265 {
                au: vec![Bytes::from(cra.clone())]
            }
        );

        p.process_rtp_packet(
            rtp(vec![(NaluType::VpsNut as u8) << 1, 1, 2, 3], 2, false),
            Utc::now(),
            0,
            false,
        )
        .unwrap();
        p.process_rtp_packet(
            rtp(vec![(NaluType::SpsNut as u8) << 1, 4, 5, 6], 3, false),
            Utc::now(),
            0,
            false,
        )
        .unwrap();
        p.process_rtp_packet(
            rtp(vec![(NaluType::PpsNut as u8) << 1, 7, 8, 9], 4, false),
            Utc::now(),
            0,
            false,
        )
        .unwrap();

        let params = format.params();
        assert_eq!(
            params.vps,
            Some(Bytes::from(vec![(NaluType::VpsNut as u8) << 1, 1, 2, 3]))
        );
        assert_eq!(
            params.sps,
            Some(Bytes::from(vec![(NaluType::SpsNut as u8) << 1, 4, 5, 6]))
        );
        assert_eq!(
            params.pps,
            Some(Bytes::from(vec![(NaluType::PpsNut as u8) << 1, 7, 8, 9]))
        );

        let unit = p
            .process_rtp_packet(rtp(cra.clone(), 5, false), Utc::now(), 0, true)
            .unwrap();
        assert_eq!(
            unit.payload,
            Payload::H265 {
                au: vec![
                    Bytes::from(vec![(NaluType::VpsNut as u8) << 1, 1, 2, 3]),
                    Bytes::from(vec![(NaluType::SpsNut as u8) << 1, 4, 5, 6]),
                    Bytes::from(vec![(NaluType::PpsNut as u8) << 1, 7, 8, 9]),
                    Bytes::from(cra),
                ]
            }
        );
    }

    #[test]
    fn oversize_packets_are_repacketized() {
        let format = Arc::new(H265Format::new(
            96,
            Some(Bytes::from(vec![(NaluType::VpsNut as u8) << 1, 10, 11, 12])),
            Some(Bytes::from(vec![(NaluType::SpsNut as u8) << 1, 13, 14, 15])),
            Some(Bytes::from(vec![(NaluType::PpsNut as u8) << 1, 16, 17, 18])),
        ));
        let mut p = processor(&format, false);

        let mut out = Vec::new();
        for pkt in [
            rtp(vec![0x01, 0x02, 0x03, 0x04], 123, true),
            rtp([0x01, 0x02, 0x03, 0x04].repeat(500), 124, true),
        ] {
            let unit = p.process_rtp_packet(pkt, Utc::now(), 0, false).unwrap();
            out.extend(unit.rtp_packets);
        }

        assert_eq!(out.len(), 3);

        // The small packet passes through, padding stripped.
        assert_eq!(out[0].sequence_number, 123);
        assert_eq!(out[0].payload, Bytes::from_static(&[0x01, 0x02, 0x03, 0x04]));
        assert!(!out[0].padding);
        assert_eq!(out[0].padding_size, 0);

        // The oversize payload is split into two fragmentation units.
        let mut first = vec![0x63, 0x02, 0x80, 0x03, 0x04];
        first.extend([0x01, 0x02, 0x03, 0x04].repeat(363));
        first.extend([0x01, 0x02, 0x03]);
        assert_eq!(&out[1].payload[..], &first[..]);
        assert!(!out[1].marker);
        assert_eq!(out[1].sequence_number, 124);
        assert_eq!(out[1].timestamp, 45343);
        assert_eq!(out[1].ssrc, 563423);

        let mut second = vec![0x63, 0x02, 0x40, 0x04];
        second.extend([0x01, 0x02, 0x03, 0x04].repeat(135));
        assert_eq!(&out[2].payload[..], &second[..]);
        assert!(out[2].marker);
        assert_eq!(out[2].sequence_number, 125);
        assert_eq!(out[2].timestamp, 45343);

        for pkt in &out {
            assert!(pkt.marshal_size() <= 1472);
        }
    }

    #[test]
    fn parameters_only_au_produces_no_packets() {
        let format = Arc::new(H265Format::new(96, None, None, None));
        let mut p = processor(&format, true);

        let mut unit = Unit {
            ntp: Utc::now(),
            pts: 0,
            rtp_packets: Vec::new(),
            payload: Payload::H265 {
                au: vec![
                    Bytes::from(vec![(NaluType::VpsNut as u8) << 1, 10, 11, 12]),
                    Bytes::from(vec![(NaluType::SpsNut as u8) << 1, 13, 14, 15]),
                    Bytes::from(vec![(NaluType::PpsNut as u8) << 1, 16, 17, 18]),
                ],
            },
        };

        p.process_unit(&mut unit).unwrap();
        assert!(unit.rtp_packets.is_empty());
    }

    #[test]
    fn key_frame_warning_fires_once() {
        let format = Arc::new(H265Format::new(96, None, None, None));
        let logger = Arc::new(CaptureLogger::default());
        let mut p = H265Processor::new(1472, format, true, logger.clone());

        let ntp0 = "2009-11-10T23:00:00Z".parse::<DateTime<Utc>>().unwrap();
        for i in 0..2 {
            let mut unit = Unit {
                ntp: ntp0 + chrono::Duration::seconds(30 * i),
                pts: 0,
                rtp_packets: Vec::new(),
                payload: Payload::H265 {
                    au: vec![Bytes::from_static(&[0x01, 0x00])],
                },
            };
            p.process_unit(&mut unit).unwrap();
        }

        let warnings = logger.warnings.lock().unwrap();
        assert_eq!(
            warnings.as_slice(),
            ["no H265 key frames received in 10s, stream can't be decoded"]
        );
    }

    #[test]
    fn aggregation_nal_types_are_read_per_nal() {
        let format = Arc::new(H265Format::new(96, None, None, None));
        let p = processor(&format, false);

        // An aggregation packet mixing a slice and parameter sets: each
        // aggregated NAL must be classified by its own header.
        let vps = vec![(NaluType::VpsNut as u8) << 1, 1, 2];
        let sps = vec![(NaluType::SpsNut as u8) << 1, 3, 4];
        let slice = vec![0x02, 0x00, 0xAA];

        let mut payload = vec![TYPE_AGGREGATION << 1, 0x01];
        for nalu in [&slice, &vps, &sps] {
            payload.extend((nalu.len() as u16).to_be_bytes());
            payload.extend(nalu);
        }
        p.update_track_parameters_from_rtp_packet(&rtp(payload, 1, false));

        let params = format.params();
        assert_eq!(params.vps, Some(Bytes::from(vps)));
        assert_eq!(params.sps, Some(Bytes::from(sps)));
        assert!(params.pps.is_none());
    }

    #[test]
    fn duplicate_of_stored_parameter_does_not_update() {
        let vps_stored = Bytes::from(vec![(NaluType::VpsNut as u8) << 1, 1, 2]);
        let format = Arc::new(H265Format::new(96, Some(vps_stored.clone()), None, None));
        let p = processor(&format, false);

        // A new VPS followed by a copy of the stored one: the differing
        // copy wins because each NAL is compared against the stored set.
        let vps_new = Bytes::from(vec![(NaluType::VpsNut as u8) << 1, 9, 9]);
        p.update_track_parameters_from_au(&[vps_new.clone(), vps_stored]);

        assert_eq!(format.params().vps, Some(vps_new));
    }
}
