//! RTP packet representation.
//!
//! The payload is a [`Bytes`] slice into the receive buffer, so routing a
//! packet through the relay never copies media data.

use bytes::{BufMut, Bytes, BytesMut};

use crate::RtpError;

const HEADER_SIZE: usize = 12;

/// A parsed RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    pub extension_payload: Bytes,
    pub payload: Bytes,
    pub padding_size: u8,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            extension_profile: 0,
            extension_payload: Bytes::new(),
            payload: Bytes::new(),
            padding_size: 0,
        }
    }
}

impl Packet {
    /// Parse a packet from a raw datagram.
    pub fn parse(buf: &Bytes) -> Result<Self, RtpError> {
        if buf.len() < HEADER_SIZE {
            return Err(RtpError::BufferTooShort(buf.len()));
        }

        let version = buf[0] >> 6;
        if version != 2 {
            return Err(RtpError::UnsupportedVersion(version));
        }

        let padding = (buf[0] & 0x20) != 0;
        let extension = (buf[0] & 0x10) != 0;
        let csrc_count = (buf[0] & 0x0F) as usize;
        let marker = (buf[1] & 0x80) != 0;
        let payload_type = buf[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut pos = HEADER_SIZE;

        if buf.len() < pos + csrc_count * 4 {
            return Err(RtpError::BufferTooShort(buf.len()));
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(u32::from_be_bytes([
                buf[pos],
                buf[pos + 1],
                buf[pos + 2],
                buf[pos + 3],
            ]));
            pos += 4;
        }

        let mut extension_profile = 0;
        let mut extension_payload = Bytes::new();
        if extension {
            if buf.len() < pos + 4 {
                return Err(RtpError::BufferTooShort(buf.len()));
            }
            extension_profile = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let ext_words = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            pos += 4;
            if buf.len() < pos + ext_words * 4 {
                return Err(RtpError::BufferTooShort(buf.len()));
            }
            extension_payload = buf.slice(pos..pos + ext_words * 4);
            pos += ext_words * 4;
        }

        let mut end = buf.len();
        let mut padding_size = 0;
        if padding {
            if end == pos {
                return Err(RtpError::BufferTooShort(buf.len()));
            }
            padding_size = buf[end - 1];
            if padding_size as usize > end - pos {
                return Err(RtpError::BufferTooShort(buf.len()));
            }
            end -= padding_size as usize;
        }

        Ok(Self {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extension_payload,
            payload: buf.slice(pos..end),
            padding_size,
        })
    }

    /// Size of the packet when marshaled, padding included.
    pub fn marshal_size(&self) -> usize {
        let mut n = HEADER_SIZE + self.csrc.len() * 4;
        if self.extension {
            n += 4 + self.extension_payload.len();
        }
        n + self.payload.len() + self.padding_size as usize
    }

    /// Serialize the packet into a contiguous buffer.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.marshal_size());

        let mut b0 = (self.version << 6) | (self.csrc.len() as u8 & 0x0F);
        if self.padding {
            b0 |= 0x20;
        }
        if self.extension {
            b0 |= 0x10;
        }
        buf.put_u8(b0);

        let mut b1 = self.payload_type & 0x7F;
        if self.marker {
            b1 |= 0x80;
        }
        buf.put_u8(b1);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for c in &self.csrc {
            buf.put_u32(*c);
        }

        if self.extension {
            buf.put_u16(self.extension_profile);
            buf.put_u16((self.extension_payload.len() / 4) as u16);
            buf.put_slice(&self.extension_payload);
        }

        buf.put_slice(&self.payload);

        if self.padding_size > 0 {
            for _ in 0..self.padding_size - 1 {
                buf.put_u8(0);
            }
            buf.put_u8(self.padding_size);
        }

        buf.freeze()
    }

    /// Remove padding in place. The relay never forwards padding.
    pub fn strip_padding(&mut self) {
        self.padding = false;
        self.padding_size = 0;
    }
}
