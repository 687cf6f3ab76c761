//! HLS front-end glue.
//!
//! HLS readers are served from muxers the server runs itself: when a
//! path's source becomes ready, a muxer is created and subscribed to the
//! stream; when the source goes away the muxer is torn down. The muxer
//! itself (fMP4 parts, playlists, HTTP serving) is an external contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use relay_core::{AsyncWriter, ReaderError, SessionDescription, Stream, Unit};
use tracing::{debug, info};

use crate::path::Path;
use crate::path_manager::SourceReadyHook;

/// Muxer serving one path to HLS readers.
pub trait HlsMuxer: Send + Sync {
    /// Deliver one decoded unit of the given track.
    fn write_unit(&self, media: usize, payload_type: u8, unit: &Unit) -> Result<(), ReaderError>;

    fn close(&self);
}

/// Creates muxers on demand.
pub trait HlsMuxerFactory: Send + Sync {
    fn create(&self, path_name: &str, desc: &SessionDescription) -> Arc<dyn HlsMuxer>;
}

struct ActiveMuxer {
    muxer: Arc<dyn HlsMuxer>,
    writer: Arc<AsyncWriter>,
    stream: Arc<Stream>,
}

/// Spins HLS muxers up and down as path sources come and go.
pub struct HlsManager {
    factory: Arc<dyn HlsMuxerFactory>,
    write_queue_size: usize,
    muxers: Mutex<HashMap<String, ActiveMuxer>>,
}

impl HlsManager {
    pub fn new(factory: Arc<dyn HlsMuxerFactory>, write_queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            factory,
            write_queue_size,
            muxers: Mutex::new(HashMap::new()),
        })
    }
}

impl SourceReadyHook for HlsManager {
    fn source_ready(&self, path: Arc<Path>, stream: Arc<Stream>) {
        let muxer = self.factory.create(path.name(), stream.desc());
        let writer = AsyncWriter::new(self.write_queue_size);

        for (media, desc) in stream.desc().medias.iter().enumerate() {
            for format in &desc.formats {
                let payload_type = format.payload_type();
                let muxer = muxer.clone();
                let _ = stream.add_reader(
                    &writer,
                    media,
                    payload_type,
                    true,
                    Arc::new(move |unit: Arc<Unit>| muxer.write_unit(media, payload_type, &unit)),
                );
            }
        }
        writer.start();

        info!("[hls] muxer created for path '{}'", path.name());
        self.muxers.lock().unwrap().insert(
            path.name().to_string(),
            ActiveMuxer {
                muxer,
                writer,
                stream,
            },
        );
    }

    fn source_not_ready(&self, path: Arc<Path>) {
        if let Some(active) = self.muxers.lock().unwrap().remove(path.name()) {
            active.stream.remove_reader(active.writer.id());
            active.muxer.close();
            tokio::spawn(async move { active.writer.stop().await });
            debug!("[hls] muxer destroyed for path '{}'", path.name());
        }
    }
}
