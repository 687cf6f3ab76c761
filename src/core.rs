//! Server wiring.
//!
//! `Core` assembles the shared runtime, the path manager and the segment
//! cleaner, and tears everything down on close. Protocol front ends
//! (listeners, TLS, HTTP signaling) live outside this crate; adapters
//! reach the relay through [`crate::path_manager::PathManager`].

use std::sync::Arc;
use std::time::Duration;

use relay_record::{Cleaner, CleanerEntry};
use tracing::info;

use crate::auth::ExternalAuth;
use crate::config::{RecordFormatConf, ServerConfig};
use crate::hooks::{NullHookRunner, SharedHookRunner};
use crate::path_manager::PathManager;
use crate::source::{NullStaticSourceFactory, StaticSourceFactory};

/// Shared dependencies handed to every path.
pub struct ServerRuntime {
    pub rtsp_address: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub write_queue_size: usize,
    pub udp_max_payload_size: usize,
    pub hook_runner: SharedHookRunner,
    pub static_source_factory: Arc<dyn StaticSourceFactory>,
    pub external_auth: Option<Arc<dyn ExternalAuth>>,
}

impl ServerRuntime {
    pub fn from_config(config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            rtsp_address: config.rtsp_address.clone(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            write_queue_size: config.write_queue_size,
            udp_max_payload_size: config.udp_max_payload_size,
            hook_runner: Arc::new(NullHookRunner),
            static_source_factory: Arc::new(NullStaticSourceFactory),
            external_auth: None,
        })
    }
}

/// The running relay.
pub struct Core {
    path_manager: Arc<PathManager>,
    cleaner: Option<Cleaner>,
}

impl Core {
    pub fn new(config: ServerConfig, runtime: Arc<ServerRuntime>) -> Self {
        let path_manager = PathManager::new(runtime, config.paths.clone());

        // one cleaner entry per unique retention rule
        let mut entries: Vec<CleanerEntry> = Vec::new();
        for conf in config.paths.values() {
            if conf.record && !conf.record_delete_after.is_zero() {
                let entry = CleanerEntry {
                    record_path: conf.record_path.clone(),
                    format: match conf.record_format {
                        RecordFormatConf::Fmp4 => relay_record::RecordFormat::Fmp4,
                        RecordFormatConf::MpegTs => relay_record::RecordFormat::MpegTs,
                    },
                    delete_after: conf.record_delete_after,
                };
                if !entries.iter().any(|e| {
                    e.record_path == entry.record_path
                        && e.format == entry.format
                        && e.delete_after == entry.delete_after
                }) {
                    entries.push(entry);
                }
            }
        }

        let cleaner = if entries.is_empty() {
            None
        } else {
            Some(Cleaner::new(entries, Arc::new(chrono::Utc::now)))
        };

        info!("relay is ready");
        Self {
            path_manager,
            cleaner,
        }
    }

    pub fn path_manager(&self) -> &Arc<PathManager> {
        &self.path_manager
    }

    pub async fn close(&self) {
        if let Some(cleaner) = &self.cleaner {
            cleaner.close().await;
        }
        self.path_manager.close().await;
        info!("relay is shut down");
    }
}
