//! RTSP session adapter.
//!
//! RTSP carries RTP natively, so this is the only adapter on the opaque
//! fast path: published packets go through `write_rtp_packet` (decoded
//! only when someone else needs the payload), and readers receive RTP
//! packets as-is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{AsyncWriter, ReaderError, SessionDescription};
use relay_rtp::Packet;
use tracing::{debug, info};

use super::{pause_on_auth_error, AdapterSession};
use crate::auth::Credentials;
use crate::error::RelayError;
use crate::path_manager::PathManager;
use crate::source::Session;

/// One RTP packet received from an announcing RTSP client.
pub struct RtspPacket {
    pub media: usize,
    pub payload_type: u8,
    pub packet: Packet,
    pub ntp: DateTime<Utc>,
    pub pts: i64,
}

/// Connection of a client that published via ANNOUNCE + RECORD.
#[async_trait]
pub trait RtspPublisherConn: Send {
    fn announced_description(&self) -> SessionDescription;

    /// Next RTP packet; the implementation applies the read timeout.
    async fn read_packet(&mut self) -> Result<RtspPacket, RelayError>;
}

/// Write side of a client that subscribed via SETUP + PLAY.
pub trait RtspReaderConn: Send + Sync {
    /// Arm the socket deadline for the next write.
    fn set_write_deadline(&self, timeout: Duration);

    fn write_packet(&self, media: usize, payload_type: u8, pkt: &Packet)
        -> Result<(), ReaderError>;
}

/// Drive an announcing session until it disconnects or errors.
pub async fn run_publisher(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    mut conn: impl RtspPublisherConn,
) -> Result<(), RelayError> {
    let session = AdapterSession::new("rtspSession");

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
            .publisher_start(session.id(), conn.announced_description(), false)
            .await?;
        info!(
            "[rtsp] publishing to path '{}', {} tracks",
            path.name(),
            stream.desc().medias.len()
        );

        loop {
            tokio::select! {
                _ = session.token().cancelled() => return Ok(()),
                pkt = conn.read_packet() => {
                    let pkt = pkt?;
                    stream
                        .write_rtp_packet(pkt.media, pkt.payload_type, pkt.packet, pkt.ntp, pkt.pts)
                        .map_err(|e| RelayError::Protocol(e.to_string()))?;
                }
            }
        }
    }
    .await;

    path.publisher_remove(session.id()).await;
    debug!("[rtsp] publisher of path '{}' left", path.name());
    result
}

/// Drive a playing session until it disconnects, errors, or is evicted.
pub async fn run_reader(
    path_manager: &PathManager,
    path_name: &str,
    credentials: Credentials,
    conn: Arc<dyn RtspReaderConn>,
    write_timeout: Duration,
    write_queue_size: usize,
) -> Result<(), RelayError> {
    let session = AdapterSession::new("rtspSession");

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

    for (media, desc) in stream.desc().medias.iter().enumerate() {
        for format in &desc.formats {
            let payload_type = format.payload_type();
            let conn = conn.clone();
            let _ = stream.add_reader(
                &writer,
                media,
                payload_type,
                false,
                Arc::new(move |unit| {
                    conn.set_write_deadline(write_timeout);
                    for pkt in &unit.rtp_packets {
                        conn.write_packet(media, payload_type, pkt)?;
                    }
                    Ok(())
                }),
            );
        }
    }

    writer.start();
    info!("[rtsp] reading from path '{}'", path.name());

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
    debug!("[rtsp] reader of path '{}' left", path.name());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathConf, ServerConfig};
    use crate::core::ServerRuntime;
    use bytes::Bytes;
    use relay_core::format::H264Format;
    use relay_core::{Format, Media, MediaKind};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct RecordingReader {
        packets: Mutex<Vec<(usize, u8, Packet)>>,
    }

    impl RtspReaderConn for RecordingReader {
        fn set_write_deadline(&self, _timeout: Duration) {}

        fn write_packet(
            &self,
            media: usize,
            payload_type: u8,
            pkt: &Packet,
        ) -> Result<(), ReaderError> {
            self.packets
                .lock()
                .unwrap()
                .push((media, payload_type, pkt.clone()));
            Ok(())
        }
    }

    fn h264_desc() -> SessionDescription {
        SessionDescription::new(vec![Media {
            kind: MediaKind::Video,
            formats: vec![Format::H264(Arc::new(H264Format::new(96, 1, None, None)))],
        }])
    }

    #[tokio::test]
    async fn published_packets_reach_rtsp_readers_untouched() {
        let config = ServerConfig::default();
        let runtime = ServerRuntime::from_config(&config);
        let mut confs = HashMap::new();
        confs.insert("mystream".to_string(), PathConf::default());
        let manager = PathManager::new(runtime, confs);

        // a publisher announces and writes two packets
        let publisher_session = AdapterSession::new("rtspSession");
        let path = manager
            .add_publisher("mystream", Credentials::default(), publisher_session.clone())
            .await
            .unwrap();
        let stream = path
            .publisher_start(publisher_session.id(), h264_desc(), false)
            .await
            .unwrap();

        let reader = Arc::new(RecordingReader {
            packets: Mutex::new(Vec::new()),
        });
        let reader_conn = reader.clone();
        let manager_clone = manager.clone();
        let reader_task = tokio::spawn(async move {
            run_reader(
                &manager_clone,
                "mystream",
                Credentials::default(),
                reader_conn,
                Duration::from_secs(1),
                64,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        for seq in 0..2u16 {
            let pkt = Packet {
                marker: true,
                payload_type: 96,
                sequence_number: seq,
                payload: Bytes::from_static(&[0x41, 0x01]),
                ..Default::default()
            };
            stream.write_rtp_packet(0, 96, pkt, Utc::now(), 0).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let got = reader.packets.lock().unwrap();
            assert_eq!(got.len(), 2);
            assert_eq!(got[0].2.sequence_number, 0);
            assert_eq!(got[1].2.sequence_number, 1);
            assert_eq!(got[0].2.payload, Bytes::from_static(&[0x41, 0x01]));
        }

        reader_task.abort();
        manager.close().await;
    }
}
