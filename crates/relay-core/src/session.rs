//! Session description: the tracks exposed by a publisher.

use crate::format::Format;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Application,
}

/// One media track and its formats. Within a session, a media is identified
/// by its index and a format by its payload type.
#[derive(Debug, Clone)]
pub struct Media {
    pub kind: MediaKind,
    pub formats: Vec<Format>,
}

/// The set of tracks of a stream.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub medias: Vec<Media>,
}

impl SessionDescription {
    pub fn new(medias: Vec<Media>) -> Self {
        Self { medias }
    }

    /// Find a media/format pair by media index and payload type.
    pub fn find_format(&self, media: usize, payload_type: u8) -> Option<&Format> {
        self.medias
            .get(media)?
            .formats
            .iter()
            .find(|f| f.payload_type() == payload_type)
    }

    /// Short human-readable track list, used in logs.
    pub fn describe_tracks(&self) -> Vec<String> {
        self.medias
            .iter()
            .flat_map(|m| m.formats.iter().map(|f| f.codec_name().to_string()))
            .collect()
    }
}
