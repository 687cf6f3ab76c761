//! Source and session capability traits.
//!
//! A path never owns a connection; it holds capability handles that let
//! it terminate a publisher or reader session. Static sources (pull
//! clients the server runs itself) are driven through a runner contract
//! and restarted with a pause on failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PathConf;
use crate::path::StaticSourcePathHandle;

const STATIC_SOURCE_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Identity of a publisher or reader session.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Capability a path holds on a publisher or reader session.
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Protocol label, used in logs.
    fn kind(&self) -> &'static str;

    /// Ask the session to terminate. Must be idempotent and non-blocking.
    fn close(&self);
}

pub type SessionArc = Arc<dyn Session>;

/// A pull client the server runs on behalf of a path (an upstream RTSP or
/// RTMP camera, for instance). The runner connects, declares the session
/// description through `path.set_ready`, feeds the returned stream, and
/// returns on error or disconnection.
#[async_trait]
pub trait StaticSourceRunner: Send + Sync {
    async fn run(
        &self,
        ctx: CancellationToken,
        conf: PathConf,
        path: StaticSourcePathHandle,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Resolves a `source` config value to a runner.
pub trait StaticSourceFactory: Send + Sync {
    fn create(&self, source: &str) -> Option<Arc<dyn StaticSourceRunner>>;
}

/// Factory used when no static-source protocols are wired up.
#[derive(Debug, Default)]
pub struct NullStaticSourceFactory;

impl StaticSourceFactory for NullStaticSourceFactory {
    fn create(&self, _source: &str) -> Option<Arc<dyn StaticSourceRunner>> {
        None
    }
}

struct RunningSource {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Wrapper owning the lifecycle of a static source: start, stop,
/// restart-on-error, config reload.
pub struct StaticSource {
    runner: Arc<dyn StaticSourceRunner>,
    path: StaticSourcePathHandle,
    conf: Arc<Mutex<PathConf>>,
    running: Mutex<Option<RunningSource>>,
}

impl StaticSource {
    pub fn new(
        runner: Arc<dyn StaticSourceRunner>,
        path: StaticSourcePathHandle,
        conf: PathConf,
    ) -> Self {
        Self {
            runner,
            path,
            conf: Arc::new(Mutex::new(conf)),
            running: Mutex::new(None),
        }
    }

    /// Start the run loop; a no-op when already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let runner = self.runner.clone();
        let path = self.path.clone();
        let conf = self.conf.clone();

        let handle = tokio::spawn(async move {
            loop {
                let current_conf = conf.lock().unwrap().clone();

                debug!("static source started");
                let result = tokio::select! {
                    r = runner.run(task_cancel.clone(), current_conf, path.clone()) => r,
                    _ = task_cancel.cancelled() => return,
                };

                path.set_not_ready(&task_cancel).await;

                match result {
                    Ok(()) => debug!("static source ended"),
                    Err(err) => warn!("static source error: {err}"),
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = tokio::time::sleep(STATIC_SOURCE_RETRY_PAUSE) => {}
                }
            }
        });

        *running = Some(RunningSource {
            cancel,
            _handle: handle,
        });
    }

    /// Stop the run loop; a no-op when not running.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().unwrap().take() {
            running.cancel.cancel();
        }
    }

    /// Swap the configuration used by the next (re)connection.
    pub fn reload_conf(&self, new_conf: PathConf) {
        *self.conf.lock().unwrap() = new_conf;
    }
}
