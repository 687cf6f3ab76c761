//! WebRTC session adapter (WHIP ingest, WHEP playback).
//!
//! The HTTP signaling, ICE and SRTP layers live behind the peer traits;
//! the adapter sees decoded units on ingest and hands regenerated RTP
//! packets to the peer on playback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{AsyncWriter, MediaKind, ReaderError, SessionDescription, Unit};
use relay_rtp::Packet;
use tracing::{debug, info};

use super::{pause_on_auth_error, unit_is_key_frame, AdapterSession};
use crate::auth::Credentials;
use crate::error::RelayError;
use crate::path_manager::PathManager;
use crate::source::Session;

/// Peer that offered media via WHIP.
#[async_trait]
pub trait WhipPeer: Send {
    fn offered_description(&self) -> SessionDescription;

    /// Next decoded unit: (media index, payload type, unit).
    async fn read_unit(&mut self) -> Result<(usize, u8, Unit), RelayError>;
}

/// Peer that requested media via WHEP.
pub trait WhepPeer: Send + Sync {
    fn set_write_deadline(&self, timeout: Duration);

    fn write_rtp(&self, media: usize, pkt: &Packet) -> Result<(), ReaderError>;
}

/// Drive a WHIP session until it disconnects or errors.
pub async fn run_whip_publisher(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    mut peer: impl WhipPeer,
) -> Result<(), RelayError> {
    let session = AdapterSession::new("webRTCSession");

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
        let stream = path
            .publisher_start(session.id(), peer.offered_description(), true)
            .await?;
        info!("[webrtc] publishing to path '{}'", path.name());

        loop {
            tokio::select! {
                _ = session.token().cancelled() => return Ok(()),
                unit = peer.read_unit() => {
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
    debug!("[webrtc] publisher of path '{}' left", path.name());
    result
}

/// Drive a WHEP session until it disconnects, errors, or is evicted.
pub async fn run_whep_reader(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    peer: Arc<dyn WhepPeer>,
    write_timeout: Duration,
    write_queue_size: usize,
) -> Result<(), RelayError> {
    let session = AdapterSession::new("webRTCSession");

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
            let peer = peer.clone();
            let started = video_started.clone();
            let is_video = desc.kind == MediaKind::Video;

            let _ = stream.add_reader(
                &writer,
                media,
                payload_type,
                true,
                Arc::new(move |unit: Arc<Unit>| {
                    if !started.load(Ordering::Relaxed) {
                        if !(is_video && unit_is_key_frame(&unit.payload)) {
                            return Ok(());
                        }
                        started.store(true, Ordering::Relaxed);
                    }
                    peer.set_write_deadline(write_timeout);
                    for pkt in &unit.rtp_packets {
                        peer.write_rtp(media, pkt)?;
                    }
                    Ok(())
                }),
            );
        }
    }

    writer.start();
    info!("[webrtc] reading from path '{}'", path.name());

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
    debug!("[webrtc] reader of path '{}' left", path.name());
    result
}
