//! SRT session adapter.
//!
//! SRT sessions carry MPEG-TS; the direction and stream identity travel
//! in the stream-id string (`read:path[:user:pass]` or
//! `publish:path[:user:pass]`). Publishers must send one of the codecs
//! the TS demuxer understands here: H.264, H.265, MPEG-4 Audio, Opus,
//! MPEG-1 Audio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::dts::DtsExtractor;
use relay_core::{AsyncWriter, Format, MediaKind, ReaderError, SessionDescription, Unit};
use tracing::{debug, info};

use super::{pause_on_auth_error, unit_is_key_frame, AdapterSession};
use crate::auth::Credentials;
use crate::error::RelayError;
use crate::path_manager::PathManager;
use crate::source::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtMode {
    Read,
    Publish,
}

/// Parse an SRT stream-id of the form `mode:path[:user:pass]`.
pub fn parse_stream_id(stream_id: &str) -> Result<(SrtMode, String, Credentials), RelayError> {
    let parts: Vec<&str> = stream_id.split(':').collect();

    let (mode, path, user, pass) = match parts.as_slice() {
        [mode, path] => (*mode, *path, "", ""),
        [mode, path, user, pass] => (*mode, *path, *user, *pass),
        _ => {
            return Err(RelayError::Protocol(format!(
                "invalid stream ID '{stream_id}', must be 'action:pathname' or 'action:pathname:user:pass'"
            )))
        }
    };

    let mode = match mode {
        "read" => SrtMode::Read,
        "publish" => SrtMode::Publish,
        other => {
            return Err(RelayError::Protocol(format!(
                "invalid stream ID action '{other}'"
            )))
        }
    };

    if path.is_empty() {
        return Err(RelayError::Protocol("empty path in stream ID".to_string()));
    }

    Ok((
        mode,
        path.to_string(),
        Credentials {
            user: user.to_string(),
            pass: pass.to_string(),
            ..Default::default()
        },
    ))
}

/// Check the SRT/MPEG-TS codec subset against a demuxed track list.
pub fn validate_description(desc: &SessionDescription) -> Result<(), RelayError> {
    for media in &desc.medias {
        for format in &media.formats {
            let supported = matches!(
                format,
                Format::H264(_)
                    | Format::H265(_)
                    | Format::Mpeg4Audio(_)
                    | Format::Opus(_)
                    | Format::Mpeg1Audio(_)
            );
            if !supported {
                return Err(RelayError::CodecUnsupported(
                    format.codec_name().to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Connection of a publishing SRT client, demuxed from MPEG-TS.
#[async_trait]
pub trait SrtPublisherConn: Send {
    fn demuxed_description(&self) -> SessionDescription;

    /// Next decoded unit: (media index, payload type, unit).
    async fn read_unit(&mut self) -> Result<(usize, u8, Unit), RelayError>;
}

/// Write side of a reading SRT client; samples are muxed back to MPEG-TS
/// behind this trait.
pub trait SrtReaderConn: Send + Sync {
    fn set_write_deadline(&self, timeout: Duration);

    fn write_unit(&self, media: usize, dts: i64, unit: &Unit) -> Result<(), ReaderError>;
}

/// Drive a publishing session until it disconnects or errors.
pub async fn run_publisher(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    mut conn: impl SrtPublisherConn,
) -> Result<(), RelayError> {
    let desc = conn.demuxed_description();
    validate_description(&desc)?;

    let session = AdapterSession::new("srtConn");

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
        info!("[srt] publishing to path '{}'", path.name());

        loop {
            tokio::select! {
                _ = session.token().cancelled() => return Ok(()),
                unit = conn.read_unit() => {
                    let (media, payload_type, unit) = unit?;
                    stream
                        .write_unit(media, payload_type, unit)
                        .map_err(|e| RelayError::Protocol(e.to_string()))?;
                }
            }
        }
    }
    .await;

    path.publisher_remove(session.id()).await;
    debug!("[srt] publisher of path '{}' left", path.name());
    result
}

/// Drive a reading session until it disconnects, errors, or is evicted.
pub async fn run_reader(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    conn: Arc<dyn SrtReaderConn>,
    write_timeout: Duration,
    write_queue_size: usize,
) -> Result<(), RelayError> {
    let session = AdapterSession::new("srtConn");

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
    let video_started = Arc::new(AtomicBool::new(!has_video));

    for (media, desc) in stream.desc().medias.iter().enumerate() {
        for format in &desc.formats {
            let payload_type = format.payload_type();
            let conn = conn.clone();
            let started = video_started.clone();
            let is_video = desc.kind == MediaKind::Video;
            let dts = Mutex::new(DtsExtractor::new());

            let _ = stream.add_reader(
                &writer,
                media,
                payload_type,
                true,
                Arc::new(move |unit: Arc<Unit>| {
                    if unit.payload.is_empty() {
                        return Ok(());
                    }
                    if !started.load(Ordering::Relaxed) {
                        if !(is_video && unit_is_key_frame(&unit.payload)) {
                            return Ok(());
                        }
                        started.store(true, Ordering::Relaxed);
                    }
                    let dts = dts.lock().unwrap().extract(unit.pts);
                    conn.set_write_deadline(write_timeout);
                    conn.write_unit(media, dts, &unit)
                }),
            );
        }
    }

    writer.start();
    info!("[srt] reading from path '{}'", path.name());

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
    debug!("[srt] reader of path '{}' left", path.name());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::format::{H264Format, OpusFormat, Vp9Format};
    use relay_core::Media;

    #[test]
    fn stream_id_parsing() {
        let (mode, path, creds) = parse_stream_id("read:mystream").unwrap();
        assert_eq!(mode, SrtMode::Read);
        assert_eq!(path, "mystream");
        assert!(creds.user.is_empty());

        let (mode, path, creds) = parse_stream_id("publish:cam/front:admin:secret").unwrap();
        assert_eq!(mode, SrtMode::Publish);
        assert_eq!(path, "cam/front");
        assert_eq!(creds.user, "admin");
        assert_eq!(creds.pass, "secret");

        assert!(parse_stream_id("mystream").is_err());
        assert!(parse_stream_id("watch:mystream").is_err());
        assert!(parse_stream_id("read:").is_err());
        assert!(parse_stream_id("read:a:b").is_err());
    }

    #[test]
    fn codec_subset_is_enforced() {
        let ok = SessionDescription::new(vec![
            Media {
                kind: MediaKind::Video,
                formats: vec![Format::H264(Arc::new(H264Format::new(96, 1, None, None)))],
            },
            Media {
                kind: MediaKind::Audio,
                formats: vec![Format::Opus(Arc::new(OpusFormat {
                    payload_type: 111,
                    channels: 2,
                }))],
            },
        ]);
        assert!(validate_description(&ok).is_ok());

        let bad = SessionDescription::new(vec![Media {
            kind: MediaKind::Video,
            formats: vec![Format::Vp9(Arc::new(Vp9Format { payload_type: 98 }))],
        }]);
        assert!(matches!(
            validate_description(&bad).unwrap_err(),
            RelayError::CodecUnsupported(_)
        ));
    }
}
