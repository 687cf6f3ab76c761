//! Per-track format descriptors.
//!
//! A format describes one track of a session: codec, clock rate, payload
//! type, and the codec parameters observed inline in the stream. Parameter
//! sets are mutable behind a reader-writer lock because the format
//! processor updates them while protocol adapters read them; they are
//! monotone, replaced only by non-empty values and never rolled back.

use std::sync::{Arc, RwLock};

use bytes::Bytes;

const VIDEO_CLOCK_RATE: u32 = 90_000;
const OPUS_CLOCK_RATE: u32 = 48_000;

/// Closed set of per-track codec descriptors.
#[derive(Debug, Clone)]
pub enum Format {
    H264(Arc<H264Format>),
    H265(Arc<H265Format>),
    Av1(Arc<Av1Format>),
    Vp9(Arc<Vp9Format>),
    Mpeg4Video(Arc<Mpeg4VideoFormat>),
    Mpeg1Video(Arc<Mpeg1VideoFormat>),
    Mjpeg(Arc<MjpegFormat>),
    Mpeg4Audio(Arc<Mpeg4AudioFormat>),
    Mpeg1Audio(Arc<Mpeg1AudioFormat>),
    Opus(Arc<OpusFormat>),
    Ac3(Arc<Ac3Format>),
    Lpcm(Arc<LpcmFormat>),
}

impl Format {
    pub fn payload_type(&self) -> u8 {
        match self {
            Format::H264(f) => f.payload_type,
            Format::H265(f) => f.payload_type,
            Format::Av1(f) => f.payload_type,
            Format::Vp9(f) => f.payload_type,
            Format::Mpeg4Video(f) => f.payload_type,
            Format::Mpeg1Video(_) => 32,
            Format::Mjpeg(_) => 26,
            Format::Mpeg4Audio(f) => f.payload_type,
            Format::Mpeg1Audio(_) => 14,
            Format::Opus(f) => f.payload_type,
            Format::Ac3(f) => f.payload_type,
            Format::Lpcm(f) => f.payload_type,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::H264(_)
            | Format::H265(_)
            | Format::Av1(_)
            | Format::Vp9(_)
            | Format::Mpeg4Video(_)
            | Format::Mpeg1Video(_)
            | Format::Mjpeg(_)
            | Format::Mpeg1Audio(_) => VIDEO_CLOCK_RATE,
            Format::Mpeg4Audio(f) => f.sample_rate,
            Format::Opus(_) => OPUS_CLOCK_RATE,
            Format::Ac3(f) => f.sample_rate,
            Format::Lpcm(f) => f.sample_rate,
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self {
            Format::H264(_) => "H264",
            Format::H265(_) => "H265",
            Format::Av1(_) => "AV1",
            Format::Vp9(_) => "VP9",
            Format::Mpeg4Video(_) => "MPEG-4 Video",
            Format::Mpeg1Video(_) => "MPEG-1/2 Video",
            Format::Mjpeg(_) => "M-JPEG",
            Format::Mpeg4Audio(_) => "MPEG-4 Audio",
            Format::Mpeg1Audio(_) => "MPEG-1/2 Audio",
            Format::Opus(_) => "Opus",
            Format::Ac3(_) => "AC-3",
            Format::Lpcm(_) => "LPCM",
        }
    }
}

/// H.264 parameter sets, observed inline or provided out of band.
#[derive(Debug, Clone, Default)]
pub struct H264Params {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

#[derive(Debug)]
pub struct H264Format {
    pub payload_type: u8,
    /// RFC 6184 packetization mode; 0 forbids fragmentation.
    pub packetization_mode: u8,
    params: RwLock<H264Params>,
}

impl H264Format {
    pub fn new(payload_type: u8, packetization_mode: u8, sps: Option<Bytes>, pps: Option<Bytes>) -> Self {
        Self {
            payload_type,
            packetization_mode,
            params: RwLock::new(H264Params { sps, pps }),
        }
    }

    pub fn params(&self) -> H264Params {
        self.params.read().unwrap().clone()
    }

    pub fn set_params(&self, sps: Option<Bytes>, pps: Option<Bytes>) {
        let mut params = self.params.write().unwrap();
        params.sps = sps;
        params.pps = pps;
    }
}

/// H.265 parameter sets.
#[derive(Debug, Clone, Default)]
pub struct H265Params {
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

#[derive(Debug)]
pub struct H265Format {
    pub payload_type: u8,
    params: RwLock<H265Params>,
}

impl H265Format {
    pub fn new(payload_type: u8, vps: Option<Bytes>, sps: Option<Bytes>, pps: Option<Bytes>) -> Self {
        Self {
            payload_type,
            params: RwLock::new(H265Params { vps, sps, pps }),
        }
    }

    pub fn params(&self) -> H265Params {
        self.params.read().unwrap().clone()
    }

    pub fn set_params(&self, vps: Option<Bytes>, sps: Option<Bytes>, pps: Option<Bytes>) {
        let mut params = self.params.write().unwrap();
        params.vps = vps;
        params.sps = sps;
        params.pps = pps;
    }
}

#[derive(Debug)]
pub struct Av1Format {
    pub payload_type: u8,
}

#[derive(Debug)]
pub struct Vp9Format {
    pub payload_type: u8,
}

#[derive(Debug)]
pub struct Mpeg4VideoFormat {
    pub payload_type: u8,
    config: RwLock<Option<Bytes>>,
}

impl Mpeg4VideoFormat {
    pub fn new(payload_type: u8, config: Option<Bytes>) -> Self {
        Self {
            payload_type,
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> Option<Bytes> {
        self.config.read().unwrap().clone()
    }

    pub fn set_config(&self, config: Bytes) {
        *self.config.write().unwrap() = Some(config);
    }
}

#[derive(Debug, Default)]
pub struct Mpeg1VideoFormat {}

#[derive(Debug, Default)]
pub struct MjpegFormat {}

/// MPEG-4 Audio; Generic and LATM mappings, single program and layer.
#[derive(Debug)]
pub struct Mpeg4AudioFormat {
    pub payload_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
    pub latm: bool,
    config: RwLock<Option<Bytes>>,
}

impl Mpeg4AudioFormat {
    pub fn new(payload_type: u8, sample_rate: u32, channels: u8, latm: bool, config: Option<Bytes>) -> Self {
        Self {
            payload_type,
            sample_rate,
            channels,
            latm,
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> Option<Bytes> {
        self.config.read().unwrap().clone()
    }

    pub fn set_config(&self, config: Bytes) {
        *self.config.write().unwrap() = Some(config);
    }
}

#[derive(Debug, Default)]
pub struct Mpeg1AudioFormat {}

#[derive(Debug)]
pub struct OpusFormat {
    pub payload_type: u8,
    /// 1 or 2.
    pub channels: u8,
}

#[derive(Debug)]
pub struct Ac3Format {
    pub payload_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug)]
pub struct LpcmFormat {
    pub payload_type: u8,
    pub bit_depth: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_are_replaced_not_cleared() {
        let forma = H264Format::new(96, 1, None, None);
        assert!(forma.params().sps.is_none());

        let sps = Bytes::from_static(&[0x67, 1, 2, 3]);
        let pps = Bytes::from_static(&[0x68, 4]);
        forma.set_params(Some(sps.clone()), Some(pps.clone()));

        let params = forma.params();
        assert_eq!(params.sps, Some(sps));
        assert_eq!(params.pps, Some(pps));
    }

    #[test]
    fn clock_rates() {
        let h264 = Format::H264(Arc::new(H264Format::new(96, 1, None, None)));
        assert_eq!(h264.clock_rate(), 90_000);

        let opus = Format::Opus(Arc::new(OpusFormat { payload_type: 111, channels: 2 }));
        assert_eq!(opus.clock_rate(), 48_000);

        let aac = Format::Mpeg4Audio(Arc::new(Mpeg4AudioFormat::new(97, 44_100, 2, false, None)));
        assert_eq!(aac.clock_rate(), 44_100);
    }
}
