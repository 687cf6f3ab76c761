//! RTMP session adapter.
//!
//! RTMP publishers deliver decoded frames (FLV-tag level), so every unit
//! goes through `write_unit` with RTP generation enabled. The codec
//! subset is narrower than the relay's: H.264/H.265/AV1/VP9 video and
//! MPEG-4 Audio / MPEG-1 Audio layer 3 audio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::dts::DtsExtractor;
use relay_core::{AsyncWriter, Format, MediaKind, Payload, ReaderError, SessionDescription, Unit};
use tracing::{debug, info};

use super::{pause_on_auth_error, unit_is_key_frame, AdapterSession};
use crate::auth::Credentials;
use crate::error::RelayError;
use crate::path_manager::PathManager;
use crate::source::Session;

/// Connection of a client that issued `connect` + `publish`.
#[async_trait]
pub trait RtmpPublisherConn: Send {
    fn declared_description(&self) -> SessionDescription;

    /// Next decoded unit: (media index, payload type, unit).
    async fn read_unit(&mut self) -> Result<(usize, u8, Unit), RelayError>;
}

/// Write side of a client that issued `connect` + `play`.
pub trait RtmpReaderConn: Send + Sync {
    fn set_write_deadline(&self, timeout: Duration);

    fn write_video(&self, pts: i64, dts: i64, payload: &Payload) -> Result<(), ReaderError>;

    fn write_audio(&self, pts: i64, payload: &Payload) -> Result<(), ReaderError>;
}

/// Check the RTMP codec subset against a declared track list.
pub fn validate_description(desc: &SessionDescription) -> Result<(), RelayError> {
    for media in &desc.medias {
        for format in &media.formats {
            let supported = match media.kind {
                MediaKind::Video => matches!(
                    format,
                    Format::H264(_) | Format::H265(_) | Format::Av1(_) | Format::Vp9(_)
                ),
                MediaKind::Audio => {
                    matches!(format, Format::Mpeg4Audio(_) | Format::Mpeg1Audio(_))
                }
                MediaKind::Application => false,
            };
            if !supported {
                return Err(RelayError::CodecUnsupported(
                    format.codec_name().to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// MPEG-1 Audio layer of a frame header (1..=3), if parseable.
fn mpeg1_audio_layer(frame: &[u8]) -> Option<u8> {
    if frame.len() < 2 || frame[0] != 0xFF || (frame[1] & 0xE0) != 0xE0 {
        return None;
    }
    match (frame[1] >> 1) & 0b11 {
        0b01 => Some(3),
        0b10 => Some(2),
        0b11 => Some(1),
        _ => None,
    }
}

fn check_unit(unit: &Unit) -> Result<(), RelayError> {
    if let Payload::Mpeg1Audio { frames } = &unit.payload {
        for frame in frames {
            if mpeg1_audio_layer(frame) != Some(3) {
                return Err(RelayError::CodecUnsupported(
                    "MPEG-1 Audio layers other than 3".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Drive a publishing session until it disconnects or errors.
pub async fn run_publisher(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    mut conn: impl RtmpPublisherConn,
) -> Result<(), RelayError> {
    let desc = conn.declared_description();
    validate_description(&desc)?;

    let session = AdapterSession::new("rtmpSession");

    let path = match path_manager
        .add_publisher(path_name, credentials, session.clone())
        .await
    {
        Ok(path) => path,
        Err(err) => {
            pause_on_auth_error(&err).await;
            return Err(err);
        }
    };

    let result = async {
        let stream = path.publisher_start(session.id(), desc, true).await?;
        info!("[rtmp] publishing to path '{}'", path.name());

        loop {
            tokio::select! {
                _ = session.token().cancelled() => return Ok(()),
                unit = conn.read_unit() => {
                    let (media, payload_type, unit) = unit?;
                    check_unit(&unit)?;
                    stream
                        .write_unit(media, payload_type, unit)
                        .map_err(|e| RelayError::Protocol(e.to_string()))?;
                }
            }
        }
    }
    .await;

    path.publisher_remove(session.id()).await;
    debug!("[rtmp] publisher of path '{}' left", path.name());
    result
}

/// Drive a playing session until it disconnects, errors, or is evicted.
pub async fn run_reader(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    conn: Arc<dyn RtmpReaderConn>,
    write_timeout: Duration,
    write_queue_size: usize,
) -> Result<(), RelayError> {
    let session = AdapterSession::new("rtmpSession");

    let (path, stream) = match path_manager
        .add_reader(path_name, credentials, session.clone())
        .await
    {
        Ok(res) => res,
        Err(err) => {
            pause_on_auth_error(&err).await;
            return Err(err);
        }
    };

    let writer = AsyncWriter::new(write_queue_size);
    let has_video = stream
        .desc()
        .medias
        .iter()
        .any(|m| m.kind == MediaKind::Video);
    // readers start on a key frame so the stream is decodable
    let video_started = Arc::new(AtomicBool::new(!has_video));

    for (media, desc) in stream.desc().medias.iter().enumerate() {
        for format in &desc.formats {
            let payload_type = format.payload_type();
            let conn = conn.clone();
            let started = video_started.clone();

            let callback: relay_core::stream::ReadCallback = match desc.kind {
                MediaKind::Video => {
                    let dts = Mutex::new(DtsExtractor::new());
                    Arc::new(move |unit: Arc<Unit>| {
                        if unit.payload.is_empty() {
                            return Ok(());
                        }
                        if !started.load(Ordering::Relaxed) {
                            if !unit_is_key_frame(&unit.payload) {
                                return Ok(());
                            }
                            started.store(true, Ordering::Relaxed);
                        }
                        let dts = dts.lock().unwrap().extract(unit.pts);
                        conn.set_write_deadline(write_timeout);
                        conn.write_video(unit.pts, dts, &unit.payload)
                    })
                }
                _ => Arc::new(move |unit: Arc<Unit>| {
                    if unit.payload.is_empty() || !started.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    conn.set_write_deadline(write_timeout);
                    conn.write_audio(unit.pts, &unit.payload)
                }),
            };

            let _ = stream.add_reader(&writer, media, payload_type, true, callback);
        }
    }

    writer.start();
    info!("[rtmp] reading from path '{}'", path.name());

    let mut error_rx = writer.error();
    let result = tokio::select! {
        _ = session.token().cancelled() => Ok(()),
        _ = error_rx.changed() => {
            let err = error_rx.borrow().clone();
            Err(RelayError::Protocol(
                err.map(|e| e.to_string()).unwrap_or_else(|| "writer closed".to_string()),
            ))
        }
    };

    stream.remove_reader(writer.id());
    writer.stop().await;
    path.reader_remove(session.id()).await;
    debug!("[rtmp] reader of path '{}' left", path.name());
    result
}
