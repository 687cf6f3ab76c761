//! MPEG-4 Video format processor.
//!
//! The codec configuration travels inline: everything between the Visual
//! Object Sequence start code and the first Group-of-VOP start code is the
//! configuration, which is stored on the track and re-injected ahead of
//! GOVs so every reader can start decoding.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use relay_rtp::fragment::{FragmentDecoder, FragmentEncoder};
use relay_rtp::{Packet, RtpError};

use super::{set_timestamp, FormatProcessor};
use crate::error::ProcessorError;
use crate::format::Mpeg4VideoFormat;
use crate::unit::{Payload, Unit};

const CLOCK_RATE: u32 = 90_000;

const VISUAL_OBJECT_SEQUENCE_START: [u8; 4] = [0x00, 0x00, 0x01, 0xB0];
const GROUP_OF_VOP_START: [u8; 4] = [0x00, 0x00, 0x01, 0xB3];

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(super) struct Mpeg4VideoProcessor {
    udp_max_payload_size: usize,
    format: Arc<Mpeg4VideoFormat>,
    encoder: Option<FragmentEncoder>,
    decoder: Option<FragmentDecoder>,
}

impl Mpeg4VideoProcessor {
    pub(super) fn new(
        udp_max_payload_size: usize,
        format: Arc<Mpeg4VideoFormat>,
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
        self.encoder = Some(FragmentEncoder::new(
            self.udp_max_payload_size - 12,
            self.format.payload_type,
            None,
            None,
        ));
    }

    fn update_track_parameters(&self, frame: &Bytes) {
        if frame.starts_with(&VISUAL_OBJECT_SEQUENCE_START) {
            let Some(end) = find(&frame[4..], &GROUP_OF_VOP_START) else {
                return;
            };
            let config = frame.slice(..end + 4);

            if self.format.config().as_ref() != Some(&config) {
                self.format.set_config(config);
            }
        }
    }

    fn remux_frame(&self, mut frame: Bytes) -> Bytes {
        if frame.starts_with(&VISUAL_OBJECT_SEQUENCE_START) {
            if let Some(end) = find(&frame[4..], &GROUP_OF_VOP_START) {
                frame = frame.slice(end + 4..);
            }
        }

        if find(&frame, &GROUP_OF_VOP_START).is_some() {
            if let Some(config) = self.format.config() {
                let mut buf = BytesMut::with_capacity(config.len() + frame.len());
                buf.put_slice(&config);
                buf.put_slice(&frame);
                frame = buf.freeze();
            }
        }

        frame
    }
}

impl FormatProcessor for Mpeg4VideoProcessor {
    fn process_unit(&mut self, unit: &mut Unit) -> Result<(), ProcessorError> {
        let frame = match &unit.payload {
            Payload::Mpeg4Video { frame } => frame.clone(),
            _ => return Err(ProcessorError::PayloadMismatch),
        };

        self.update_track_parameters(&frame);
        let frame = self.remux_frame(frame);
        unit.payload = Payload::Mpeg4Video { frame: frame.clone() };

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
        self.update_track_parameters(&pkt.payload);

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
                Ok(frame) => {
                    unit.payload = Payload::Mpeg4Video {
                        frame: self.remux_frame(frame),
                    };
                }
                Err(RtpError::MorePacketsNeeded) => return Ok(unit),
                Err(e) => return Err(e.into()),
            }
        }

        // Route the packet as-is.
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_split_from_the_frame_and_stored() {
        let format = Arc::new(Mpeg4VideoFormat::new(96, None));
        let mut p = Mpeg4VideoProcessor::new(1472, format.clone(), true);

        let mut frame = VISUAL_OBJECT_SEQUENCE_START.to_vec();
        frame.extend([0x01, 0x02]);
        frame.extend(GROUP_OF_VOP_START);
        frame.extend([0xAA, 0xBB]);

        let mut unit = Unit {
            ntp: Utc::now(),
            pts: 0,
            rtp_packets: Vec::new(),
            payload: Payload::Mpeg4Video {
                frame: Bytes::from(frame.clone()),
            },
        };
        p.process_unit(&mut unit).unwrap();

        // The stored configuration is everything before the GOV start code.
        assert_eq!(format.config(), Some(Bytes::from(frame[..6].to_vec())));

        // The payload keeps the configuration ahead of the GOV.
        assert_eq!(
            unit.payload,
            Payload::Mpeg4Video {
                frame: Bytes::from(frame)
            }
        );
        assert!(!unit.rtp_packets.is_empty());
    }

    #[test]
    fn config_is_prepended_to_gov_frames() {
        let config = Bytes::from(
            VISUAL_OBJECT_SEQUENCE_START
                .iter()
                .copied()
                .chain([0x01, 0x02])
                .collect::<Vec<u8>>(),
        );
        let format = Arc::new(Mpeg4VideoFormat::new(96, Some(config.clone())));
        let p = Mpeg4VideoProcessor::new(1472, format, false);

        let mut frame = GROUP_OF_VOP_START.to_vec();
        frame.extend([0xAA]);
        let out = p.remux_frame(Bytes::from(frame.clone()));

        let mut expected = config.to_vec();
        expected.extend(frame);
        assert_eq!(out, Bytes::from(expected));
    }

    #[test]
    fn frames_without_gov_pass_through() {
        let format = Arc::new(Mpeg4VideoFormat::new(96, None));
        let p = Mpeg4VideoProcessor::new(1472, format, false);

        let frame = Bytes::from_static(&[0x00, 0x00, 0x01, 0xB6, 0x10]);
        assert_eq!(p.remux_frame(frame.clone()), frame);
    }

    #[test]
    fn oversize_packet_is_rejected() {
        let format = Arc::new(Mpeg4VideoFormat::new(96, None));
        let mut p = Mpeg4VideoProcessor::new(1472, format, false);

        let pkt = Packet {
            marker: true,
            payload: Bytes::from(vec![0; 2000]),
            ..Default::default()
        };
        assert!(matches!(
            p.process_rtp_packet(pkt, Utc::now(), 0, false).unwrap_err(),
            ProcessorError::PayloadTooLarge { .. }
        ));
    }
}
