use thiserror::Error;

/// Errors that can occur while parsing, marshaling or repacketizing RTP.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("buffer is too short ({0} bytes)")]
    BufferTooShort(usize),

    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),

    #[error("payload size ({size}) is greater than maximum allowed ({max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The current access unit spans more packets; not an error condition.
    #[error("more packets are needed")]
    MorePacketsNeeded,

    /// A non-starting fragment arrived with no fragment in progress; the
    /// decoder joined the stream mid-unit. Not an error condition.
    #[error("received a non-starting fragment without any previous starting fragment")]
    NonStartingPacketAndNoPrevious,

    #[error("access unit is too big ({size} bytes, maximum is {max})")]
    AccessUnitTooBig { size: usize, max: usize },

    #[error("access unit has too many NAL units ({count}, maximum is {max})")]
    TooManyNalus { count: usize, max: usize },

    #[error("invalid aggregation packet: {0}")]
    InvalidAggregation(&'static str),

    #[error("invalid fragmentation unit: {0}")]
    InvalidFragment(&'static str),

    #[error("NAL unit type {0} is not supported by this decoder")]
    UnsupportedNalu(u8),

    #[error("NAL unit size ({size}) exceeds maximum payload size ({max}) and packetization mode 0 forbids fragmentation")]
    FragmentationForbidden { size: usize, max: usize },
}
