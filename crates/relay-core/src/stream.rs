//! The fan-out bus.
//!
//! A Stream exists while a path's source is ready. It owns one format
//! processor per track and a per-track reader set; every write runs the
//! processor once and then pushes a closure onto each subscribed reader's
//! AsyncWriter. Pushes never block: a slow reader overflows its own queue
//! and is torn down without affecting the publisher or other readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use relay_rtp::Packet;

use crate::async_writer::{AsyncWriter, WriterId};
use crate::error::{ReaderError, StreamError};
use crate::processor::{new_format_processor, FormatProcessor, ParentLogger};
use crate::session::SessionDescription;
use crate::unit::Unit;

/// Callback invoked on the reader's own drain task for every unit.
pub type ReadCallback = Arc<dyn Fn(Arc<Unit>) -> Result<(), ReaderError> + Send + Sync>;

struct StreamReader {
    writer: Arc<AsyncWriter>,
    callback: ReadCallback,
    /// Readers that need decoded payload (everything except RTP
    /// passthrough readers).
    wants_decoded: bool,
}

struct StreamFormat {
    processor: Box<dyn FormatProcessor>,
    readers: HashMap<WriterId, StreamReader>,
}

impl StreamFormat {
    fn push_unit(&self, unit: Unit) {
        let unit = Arc::new(unit);
        for reader in self.readers.values() {
            let callback = reader.callback.clone();
            let unit = unit.clone();
            reader.writer.push(Box::new(move || callback(unit)));
        }
    }
}

pub struct Stream {
    desc: SessionDescription,
    bytes_received: Arc<AtomicU64>,
    formats: Vec<Vec<Mutex<StreamFormat>>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("desc", &self.desc).finish()
    }
}

impl Stream {
    pub fn new(
        udp_max_payload_size: usize,
        desc: SessionDescription,
        generate_rtp_packets: bool,
        bytes_received: Arc<AtomicU64>,
        parent: Arc<dyn ParentLogger>,
    ) -> Self {
        let formats = desc
            .medias
            .iter()
            .map(|media| {
                media
                    .formats
                    .iter()
                    .map(|format| {
                        Mutex::new(StreamFormat {
                            processor: new_format_processor(
                                udp_max_payload_size,
                                format,
                                generate_rtp_packets,
                                parent.clone(),
                            ),
                            readers: HashMap::new(),
                        })
                    })
                    .collect()
            })
            .collect();

        Self {
            desc,
            bytes_received,
            formats,
        }
    }

    pub fn desc(&self) -> &SessionDescription {
        &self.desc
    }

    fn format(&self, media: usize, payload_type: u8) -> Result<&Mutex<StreamFormat>, StreamError> {
        let media_formats = self
            .formats
            .get(media)
            .ok_or(StreamError::UnknownMedia(media))?;
        let index = self
            .desc
            .medias
            .get(media)
            .ok_or(StreamError::UnknownMedia(media))?
            .formats
            .iter()
            .position(|f| f.payload_type() == payload_type)
            .ok_or(StreamError::UnknownFormat {
                media,
                payload_type,
            })?;
        Ok(&media_formats[index])
    }

    /// Subscribe a reader to one (media, format) pair.
    pub fn add_reader(
        &self,
        writer: &Arc<AsyncWriter>,
        media: usize,
        payload_type: u8,
        wants_decoded: bool,
        callback: ReadCallback,
    ) -> Result<(), StreamError> {
        let mut sf = self.format(media, payload_type)?.lock().unwrap();
        sf.readers.insert(
            writer.id(),
            StreamReader {
                writer: writer.clone(),
                callback,
                wants_decoded,
            },
        );
        Ok(())
    }

    /// Unsubscribe a reader from every format.
    pub fn remove_reader(&self, writer_id: WriterId) {
        for media in &self.formats {
            for sf in media {
                sf.lock().unwrap().readers.remove(&writer_id);
            }
        }
    }

    /// Number of subscriptions currently attached.
    pub fn reader_count(&self) -> usize {
        self.formats
            .iter()
            .flatten()
            .map(|sf| sf.lock().unwrap().readers.len())
            .sum()
    }

    /// Publisher path: remux a decoded unit and fan it out.
    pub fn write_unit(
        &self,
        media: usize,
        payload_type: u8,
        mut unit: Unit,
    ) -> Result<(), StreamError> {
        let mut sf = self.format(media, payload_type)?.lock().unwrap();
        sf.processor.process_unit(&mut unit)?;
        self.bytes_received
            .fetch_add(unit.wire_size(), Ordering::Relaxed);
        sf.push_unit(unit);
        Ok(())
    }

    /// RTSP publisher path: route one RTP packet, decoding it only when a
    /// reader needs the payload.
    pub fn write_rtp_packet(
        &self,
        media: usize,
        payload_type: u8,
        pkt: Packet,
        ntp: DateTime<Utc>,
        pts: i64,
    ) -> Result<(), StreamError> {
        let mut sf = self.format(media, payload_type)?.lock().unwrap();
        let has_non_rtsp_readers = sf.readers.values().any(|r| r.wants_decoded);
        let unit = sf
            .processor
            .process_rtp_packet(pkt, ntp, pts, has_non_rtsp_readers)?;
        self.bytes_received
            .fetch_add(unit.wire_size(), Ordering::Relaxed);
        sf.push_unit(unit);
        Ok(())
    }
}
