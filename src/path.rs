//! Per-stream coordinator.
//!
//! A Path binds at most one publisher to N readers for one stream name.
//! All mutations of per-path state are serialized on the path's own event
//! loop: sessions and the path manager talk to it through typed requests
//! answered over oneshot channels, and every request send observes the
//! path's cancellation token so no caller can block on a dead path.
//!
//! The on-demand machinery exists twice, once for static sources and once
//! for hook-started publishers:
//!
//! ```text
//! Initial --start--> WaitingReady --ready--> Ready --(last reader leaves)--> Closing
//!   ^                     |                                                     |
//!   +----- stop() / ready-timeout --------+------ close-timeout ----------------+
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use relay_core::{SessionDescription, Stream, TracingLogger};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PathConf, RecordFormatConf};
use crate::core::ServerRuntime;
use crate::error::RelayError;
use crate::hooks::{hook_env, HookHandle};
use crate::path_manager::ManagerEvent;
use crate::source::{SessionArc, SessionId, StaticSource};

/// Answer to a describe request.
#[derive(Clone)]
pub enum DescribeAnswer {
    Stream(Arc<Stream>),
    Redirect(String),
}

impl std::fmt::Debug for DescribeAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescribeAnswer::Stream(_) => f.debug_tuple("Stream").finish(),
            DescribeAnswer::Redirect(url) => f.debug_tuple("Redirect").field(url).finish(),
        }
    }
}

pub struct DescribeRequest {
    pub url: Option<url::Url>,
    pub res: oneshot::Sender<Result<DescribeAnswer, RelayError>>,
}

pub struct PublisherAddRequest {
    pub session: SessionArc,
    pub res: oneshot::Sender<Result<Arc<Path>, RelayError>>,
}

pub struct PublisherStartRequest {
    pub session_id: SessionId,
    pub desc: SessionDescription,
    pub generate_rtp_packets: bool,
    pub res: oneshot::Sender<Result<Arc<Stream>, RelayError>>,
}

pub struct ReaderAddRequest {
    pub session: SessionArc,
    pub res: oneshot::Sender<Result<(Arc<Path>, Arc<Stream>), RelayError>>,
}

pub(crate) struct SourceSetReadyReq {
    pub desc: SessionDescription,
    pub generate_rtp_packets: bool,
    pub res: oneshot::Sender<Result<Arc<Stream>, RelayError>>,
}

pub(crate) struct SourceSetNotReadyReq {
    pub res: oneshot::Sender<()>,
}

pub(crate) enum PathEvent {
    ReloadConf(PathConf),
    SourceSetReady(SourceSetReadyReq),
    SourceSetNotReady(SourceSetNotReadyReq),
    Describe(DescribeRequest),
    PublisherAdd(PublisherAddRequest),
    PublisherStart(PublisherStartRequest),
    PublisherStop {
        session_id: SessionId,
        res: oneshot::Sender<()>,
    },
    PublisherRemove {
        session_id: SessionId,
        res: oneshot::Sender<()>,
    },
    ReaderAdd(ReaderAddRequest),
    ReaderRemove {
        session_id: SessionId,
        res: oneshot::Sender<()>,
    },
}

/// Channel bundle a path uses to talk to its manager.
#[derive(Clone)]
pub(crate) struct PathParent {
    pub tx: mpsc::Sender<ManagerEvent>,
    pub ctx: CancellationToken,
}

impl PathParent {
    // the select on `path_ctx` avoids a deadlock when the manager is
    // blocked in `path.wait()` while this path tries to notify it
    async fn notify(&self, path_ctx: &CancellationToken, event: ManagerEvent) {
        tokio::select! {
            _ = self.tx.send(event) => {}
            _ = self.ctx.cancelled() => {}
            _ = path_ctx.cancelled() => {}
        }
    }
}

/// Handle a static source runner uses to report readiness to its path.
#[derive(Clone)]
pub struct StaticSourcePathHandle {
    event_tx: mpsc::Sender<PathEvent>,
    path_ctx: CancellationToken,
}

impl StaticSourcePathHandle {
    pub async fn set_ready(
        &self,
        desc: SessionDescription,
        generate_rtp_packets: bool,
        source_ctx: &CancellationToken,
    ) -> Result<Arc<Stream>, RelayError> {
        let (tx, rx) = oneshot::channel();
        let event = PathEvent::SourceSetReady(SourceSetReadyReq {
            desc,
            generate_rtp_packets,
            res: tx,
        });

        tokio::select! {
            sent = self.event_tx.send(event) => {
                if sent.is_err() {
                    return Err(RelayError::Terminated);
                }
            }
            _ = self.path_ctx.cancelled() => return Err(RelayError::Terminated),
            // avoids requests sent after the source has been stopped
            _ = source_ctx.cancelled() => return Err(RelayError::Terminated),
        }

        rx.await.unwrap_or(Err(RelayError::Terminated))
    }

    pub async fn set_not_ready(&self, source_ctx: &CancellationToken) {
        let (tx, rx) = oneshot::channel();
        let event = PathEvent::SourceSetNotReady(SourceSetNotReadyReq { res: tx });

        tokio::select! {
            sent = self.event_tx.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
            _ = self.path_ctx.cancelled() => return,
            _ = source_ctx.cancelled() => return,
        }

        let _ = rx.await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnDemandState {
    Initial,
    WaitingReady,
    Ready,
    Closing,
}

enum SourceState {
    None,
    Redirect,
    Static(Arc<StaticSource>),
    Publisher(SessionArc),
}

struct ReaderEntry {
    session: SessionArc,
    on_read_cmd: Option<Box<dyn HookHandle>>,
}

/// One path and its event loop.
pub struct Path {
    name: String,
    conf_name: String,
    matches: Vec<String>,
    regexp_born: bool,
    runtime: Arc<ServerRuntime>,
    conf: RwLock<PathConf>,
    bytes_received: Arc<AtomicU64>,
    ctx: CancellationToken,
    done: CancellationToken,
    event_tx: mpsc::Sender<PathEvent>,
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path").field("name", &self.name).finish()
    }
}

impl Path {
    pub(crate) fn new(
        runtime: Arc<ServerRuntime>,
        conf_name: String,
        conf: PathConf,
        name: String,
        matches: Vec<String>,
        regexp_born: bool,
        parent: PathParent,
    ) -> Arc<Self> {
        let ctx = parent.ctx.child_token();
        let (event_tx, event_rx) = mpsc::channel(16);

        let path = Arc::new(Self {
            name,
            conf_name,
            matches,
            regexp_born,
            runtime,
            conf: RwLock::new(conf),
            bytes_received: Arc::new(AtomicU64::new(0)),
            ctx,
            done: CancellationToken::new(),
            event_tx,
        });

        debug!("[path {}] created", path.name);

        let runner_path = path.clone();
        tokio::spawn(async move {
            PathRunner::new(runner_path, parent, event_rx).run().await;
        });

        path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conf_name(&self) -> &str {
        &self.conf_name
    }

    pub fn matches(&self) -> &[String] {
        &self.matches
    }

    /// Snapshot of the current configuration; never tears.
    pub fn safe_conf(&self) -> PathConf {
        self.conf.read().unwrap().clone()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.ctx.cancel();
    }

    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    pub(crate) fn static_source_handle(&self) -> StaticSourcePathHandle {
        StaticSourcePathHandle {
            event_tx: self.event_tx.clone(),
            path_ctx: self.ctx.clone(),
        }
    }

    async fn send(&self, event: PathEvent) -> Result<(), RelayError> {
        tokio::select! {
            sent = self.event_tx.send(event) => sent.map_err(|_| RelayError::Terminated),
            _ = self.ctx.cancelled() => Err(RelayError::Terminated),
        }
    }

    pub(crate) async fn reload_conf(&self, new_conf: PathConf) {
        let _ = self.send(PathEvent::ReloadConf(new_conf)).await;
    }

    pub async fn describe(
        &self,
        url: Option<url::Url>,
    ) -> Result<DescribeAnswer, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(PathEvent::Describe(DescribeRequest { url, res: tx }))
            .await?;
        rx.await.unwrap_or(Err(RelayError::Terminated))
    }

    pub async fn publisher_add(&self, session: SessionArc) -> Result<Arc<Path>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(PathEvent::PublisherAdd(PublisherAddRequest {
            session,
            res: tx,
        }))
        .await?;
        rx.await.unwrap_or(Err(RelayError::Terminated))
    }

    pub async fn publisher_start(
        &self,
        session_id: SessionId,
        desc: SessionDescription,
        generate_rtp_packets: bool,
    ) -> Result<Arc<Stream>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(PathEvent::PublisherStart(PublisherStartRequest {
            session_id,
            desc,
            generate_rtp_packets,
            res: tx,
        }))
        .await?;
        rx.await.unwrap_or(Err(RelayError::Terminated))
    }

    pub async fn publisher_stop(&self, session_id: SessionId) {
        let (tx, rx) = oneshot::channel();
        if self
            .send(PathEvent::PublisherStop {
                session_id,
                res: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn publisher_remove(&self, session_id: SessionId) {
        let (tx, rx) = oneshot::channel();
        if self
            .send(PathEvent::PublisherRemove {
                session_id,
                res: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn reader_add(
        &self,
        session: SessionArc,
    ) -> Result<(Arc<Path>, Arc<Stream>), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(PathEvent::ReaderAdd(ReaderAddRequest { session, res: tx }))
            .await?;
        rx.await.unwrap_or(Err(RelayError::Terminated))
    }

    pub async fn reader_remove(&self, session_id: SessionId) {
        let (tx, rx) = oneshot::channel();
        if self
            .send(PathEvent::ReaderRemove {
                session_id,
                res: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

struct PathRunner {
    path: Arc<Path>,
    parent: PathParent,
    event_rx: mpsc::Receiver<PathEvent>,

    source: SourceState,
    stream: Option<Arc<Stream>>,
    readers: HashMap<SessionId, ReaderEntry>,
    describe_on_hold: Vec<DescribeRequest>,
    reader_add_on_hold: Vec<ReaderAddRequest>,

    on_demand_static_state: OnDemandState,
    static_ready_deadline: Option<Instant>,
    static_close_deadline: Option<Instant>,
    on_demand_publisher_state: OnDemandState,
    publisher_ready_deadline: Option<Instant>,
    publisher_close_deadline: Option<Instant>,

    on_init_cmd: Option<Box<dyn HookHandle>>,
    on_demand_cmd: Option<Box<dyn HookHandle>>,
    on_ready_cmd: Option<Box<dyn HookHandle>>,
    record_agent: Option<relay_record::Agent>,
}

impl PathRunner {
    fn new(path: Arc<Path>, parent: PathParent, event_rx: mpsc::Receiver<PathEvent>) -> Self {
        Self {
            path,
            parent,
            event_rx,
            source: SourceState::None,
            stream: None,
            readers: HashMap::new(),
            describe_on_hold: Vec::new(),
            reader_add_on_hold: Vec::new(),
            on_demand_static_state: OnDemandState::Initial,
            static_ready_deadline: None,
            static_close_deadline: None,
            on_demand_publisher_state: OnDemandState::Initial,
            publisher_ready_deadline: None,
            publisher_close_deadline: None,
            on_init_cmd: None,
            on_demand_cmd: None,
            on_ready_cmd: None,
            record_agent: None,
        }
    }

    fn conf(&self) -> PathConf {
        self.path.safe_conf()
    }

    async fn run(mut self) {
        let conf = self.conf();

        if conf.is_redirect() {
            self.source = SourceState::Redirect;
        } else if conf.has_static_source() {
            match self
                .path
                .runtime
                .static_source_factory
                .create(&conf.source)
            {
                Some(runner) => {
                    let source = Arc::new(StaticSource::new(
                        runner,
                        self.path.static_source_handle(),
                        conf.clone(),
                    ));
                    if !conf.source_on_demand {
                        source.start();
                    }
                    self.source = SourceState::Static(source);
                }
                None => {
                    warn!(
                        "[path {}] no handler for static source '{}'",
                        self.path.name, conf.source
                    );
                }
            }
        }

        if !conf.run_on_init.is_empty() {
            info!("[path {}] runOnInit command started", self.path.name);
            self.on_init_cmd = Some(self.path.runtime.hook_runner.start(
                &conf.run_on_init,
                conf.run_on_init_restart,
                hook_env(
                    &self.path.runtime.rtsp_address,
                    &self.path.name,
                    &self.path.matches,
                ),
            ));
        }

        let err = self.event_loop().await;

        // notify the manager before tearing down
        self.parent
            .notify(&self.path.ctx, ManagerEvent::PathClose(self.path.clone()))
            .await;

        self.path.ctx.cancel();

        if let Some(mut cmd) = self.on_init_cmd.take() {
            cmd.close();
            info!("[path {}] runOnInit command stopped", self.path.name);
        }

        for req in self.describe_on_hold.drain(..) {
            let _ = req.res.send(Err(RelayError::Terminated));
        }
        for req in self.reader_add_on_hold.drain(..) {
            let _ = req.res.send(Err(RelayError::Terminated));
        }

        if self.stream.is_some() {
            self.source_set_not_ready().await;
        }

        match &self.source {
            SourceState::Static(source) => source.stop(),
            SourceState::Publisher(session) => session.close(),
            _ => {}
        }

        if let Some(mut cmd) = self.on_demand_cmd.take() {
            cmd.close();
            info!("[path {}] runOnDemand command stopped", self.path.name);
        }

        debug!("[path {}] destroyed ({})", self.path.name, err);
        self.path.done.cancel();
    }

    async fn event_loop(&mut self) -> RelayError {
        loop {
            tokio::select! {
                _ = deadline_wait(self.static_ready_deadline) => {
                    self.fail_on_hold(RelayError::Timeout(self.path.name.clone()));
                    self.on_demand_static_source_stop();
                    if self.should_close() {
                        return RelayError::Terminated;
                    }
                }

                _ = deadline_wait(self.static_close_deadline) => {
                    self.source_set_not_ready().await;
                    self.on_demand_static_source_stop();
                    if self.should_close() {
                        return RelayError::Terminated;
                    }
                }

                _ = deadline_wait(self.publisher_ready_deadline) => {
                    self.fail_on_hold(RelayError::Timeout(self.path.name.clone()));
                    self.on_demand_publisher_stop().await;
                    if self.should_close() {
                        return RelayError::Terminated;
                    }
                }

                _ = deadline_wait(self.publisher_close_deadline) => {
                    self.on_demand_publisher_stop().await;
                    if self.should_close() {
                        return RelayError::Terminated;
                    }
                }

                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        return RelayError::Terminated;
                    };
                    if let Some(err) = self.handle_event(event).await {
                        return err;
                    }
                }

                _ = self.path.ctx.cancelled() => {
                    return RelayError::Terminated;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: PathEvent) -> Option<RelayError> {
        match event {
            PathEvent::ReloadConf(new_conf) => {
                if let SourceState::Static(source) = &self.source {
                    source.reload_conf(new_conf.clone());
                }
                *self.path.conf.write().unwrap() = new_conf;
            }

            PathEvent::SourceSetReady(req) => {
                let result = self.source_set_ready(req.desc, req.generate_rtp_packets).await;
                match result {
                    Err(err) => {
                        let _ = req.res.send(Err(err));
                    }
                    Ok(stream) => {
                        if self.conf().has_on_demand_static_source() {
                            self.static_ready_deadline = None;
                            self.on_demand_static_source_schedule_close();
                            self.flush_on_hold(&stream);
                        }
                        let _ = req.res.send(Ok(stream));
                    }
                }
            }

            PathEvent::SourceSetNotReady(req) => {
                self.source_set_not_ready().await;

                // reply before stopping the source to avoid a deadlock
                // with the source's own stop sequence
                let _ = req.res.send(());

                if self.conf().has_on_demand_static_source()
                    && self.on_demand_static_state != OnDemandState::Initial
                {
                    self.on_demand_static_source_stop();
                }

                if self.should_close() {
                    return Some(RelayError::Terminated);
                }
            }

            PathEvent::Describe(req) => {
                self.handle_describe(req);
                if self.should_close() {
                    return Some(RelayError::Terminated);
                }
            }

            PathEvent::PublisherAdd(req) => self.handle_publisher_add(req).await,

            PathEvent::PublisherStart(req) => self.handle_publisher_start(req).await,

            PathEvent::PublisherStop { session_id, res } => {
                let assigned =
                    matches!(&self.source, SourceState::Publisher(s) if s.id() == session_id);
                if assigned && self.stream.is_some() {
                    self.source_set_not_ready().await;
                }
                let _ = res.send(());
                if self.should_close() {
                    return Some(RelayError::Terminated);
                }
            }

            PathEvent::PublisherRemove { session_id, res } => {
                let assigned =
                    matches!(&self.source, SourceState::Publisher(s) if s.id() == session_id);
                if assigned {
                    self.do_publisher_remove().await;
                }
                let _ = res.send(());
                if self.should_close() {
                    return Some(RelayError::Terminated);
                }
            }

            PathEvent::ReaderAdd(req) => {
                self.handle_reader_add(req);
                if self.should_close() {
                    return Some(RelayError::Terminated);
                }
            }

            PathEvent::ReaderRemove { session_id, res } => {
                if let Some(mut entry) = self.readers.remove(&session_id) {
                    if let Some(mut cmd) = entry.on_read_cmd.take() {
                        cmd.close();
                        info!("[path {}] runOnRead command stopped", self.path.name);
                    }
                }
                let _ = res.send(());

                if self.readers.is_empty() {
                    let conf = self.conf();
                    if conf.has_on_demand_static_source() {
                        if self.on_demand_static_state == OnDemandState::Ready {
                            self.on_demand_static_source_schedule_close();
                        }
                    } else if conf.has_on_demand_publisher()
                        && self.on_demand_publisher_state == OnDemandState::Ready
                    {
                        self.on_demand_publisher_schedule_close();
                    }
                }

                if self.should_close() {
                    return Some(RelayError::Terminated);
                }
            }
        }

        None
    }

    fn should_close(&self) -> bool {
        self.path.regexp_born
            && matches!(self.source, SourceState::None)
            && self.readers.is_empty()
            && self.describe_on_hold.is_empty()
            && self.reader_add_on_hold.is_empty()
    }

    fn fail_on_hold(&mut self, err: RelayError) {
        for req in self.describe_on_hold.drain(..) {
            let _ = req.res.send(Err(err.clone()));
        }
        for req in self.reader_add_on_hold.drain(..) {
            let _ = req.res.send(Err(err.clone()));
        }
    }

    fn flush_on_hold(&mut self, stream: &Arc<Stream>) {
        for req in self.describe_on_hold.drain(..) {
            let _ = req.res.send(Ok(DescribeAnswer::Stream(stream.clone())));
        }
        let parked: Vec<ReaderAddRequest> = self.reader_add_on_hold.drain(..).collect();
        for req in parked {
            self.handle_reader_add_post(req);
        }
    }

    fn handle_describe(&mut self, req: DescribeRequest) {
        if matches!(self.source, SourceState::Redirect) {
            let target = self.conf().source_redirect.unwrap_or_default();
            let _ = req.res.send(Ok(DescribeAnswer::Redirect(target)));
            return;
        }

        if let Some(stream) = &self.stream {
            let _ = req.res.send(Ok(DescribeAnswer::Stream(stream.clone())));
            return;
        }

        let conf = self.conf();

        if conf.has_on_demand_static_source() {
            if self.on_demand_static_state == OnDemandState::Initial {
                self.on_demand_static_source_start();
            }
            self.describe_on_hold.push(req);
            return;
        }

        if conf.has_on_demand_publisher() {
            if self.on_demand_publisher_state == OnDemandState::Initial {
                self.on_demand_publisher_start();
            }
            self.describe_on_hold.push(req);
            return;
        }

        if let Some(fallback) = &conf.fallback {
            // relative fallbacks are resolved against the request URL
            let target = if fallback.starts_with('/') {
                match &req.url {
                    Some(u) => {
                        let mut rewritten = u.clone();
                        rewritten.set_path(fallback);
                        rewritten.set_query(None);
                        rewritten.to_string()
                    }
                    None => fallback.clone(),
                }
            } else {
                fallback.clone()
            };
            let _ = req.res.send(Ok(DescribeAnswer::Redirect(target)));
            return;
        }

        let _ = req
            .res
            .send(Err(RelayError::NoOnePublishing(self.path.name.clone())));
    }

    async fn handle_publisher_add(&mut self, req: PublisherAddRequest) {
        let conf = self.conf();

        if conf.source != "publisher" {
            let _ = req
                .res
                .send(Err(RelayError::SourceNotPublisher(self.path.name.clone())));
            return;
        }

        let existing = match &self.source {
            SourceState::Publisher(session) => Some(session.clone()),
            _ => None,
        };
        if let Some(existing) = existing {
            if conf.disable_publisher_override {
                let _ = req
                    .res
                    .send(Err(RelayError::PublisherExists(self.path.name.clone())));
                return;
            }

            info!("[path {}] closing existing publisher", self.path.name);
            existing.close();
            self.do_publisher_remove().await;
        }

        self.source = SourceState::Publisher(req.session.clone());

        let _ = req.res.send(Ok(self.path.clone()));
    }

    async fn handle_publisher_start(&mut self, req: PublisherStartRequest) {
        let assigned = matches!(&self.source, SourceState::Publisher(s) if s.id() == req.session_id);
        if !assigned {
            let _ = req.res.send(Err(RelayError::PublisherDetached));
            return;
        }

        match self.source_set_ready(req.desc, req.generate_rtp_packets).await {
            Err(err) => {
                let _ = req.res.send(Err(err));
            }
            Ok(stream) => {
                if self.conf().has_on_demand_publisher() {
                    self.publisher_ready_deadline = None;
                    self.on_demand_publisher_schedule_close();
                    self.flush_on_hold(&stream);
                }
                let _ = req.res.send(Ok(stream));
            }
        }
    }

    fn handle_reader_add(&mut self, req: ReaderAddRequest) {
        if self.stream.is_some() {
            self.handle_reader_add_post(req);
            return;
        }

        let conf = self.conf();

        if conf.has_on_demand_static_source() {
            if self.on_demand_static_state == OnDemandState::Initial {
                self.on_demand_static_source_start();
            }
            self.reader_add_on_hold.push(req);
            return;
        }

        if conf.has_on_demand_publisher() {
            if self.on_demand_publisher_state == OnDemandState::Initial {
                self.on_demand_publisher_start();
            }
            self.reader_add_on_hold.push(req);
            return;
        }

        let _ = req
            .res
            .send(Err(RelayError::NoOnePublishing(self.path.name.clone())));
    }

    fn handle_reader_add_post(&mut self, req: ReaderAddRequest) {
        let Some(stream) = self.stream.clone() else {
            let _ = req
                .res
                .send(Err(RelayError::NoOnePublishing(self.path.name.clone())));
            return;
        };

        let conf = self.conf();

        let on_read_cmd = if !conf.run_on_read.is_empty() {
            info!("[path {}] runOnRead command started", self.path.name);
            Some(self.path.runtime.hook_runner.start(
                &conf.run_on_read,
                conf.run_on_read_restart,
                hook_env(
                    &self.path.runtime.rtsp_address,
                    &self.path.name,
                    &self.path.matches,
                ),
            ))
        } else {
            None
        };

        self.readers.insert(
            req.session.id(),
            ReaderEntry {
                session: req.session.clone(),
                on_read_cmd,
            },
        );

        if conf.has_on_demand_static_source() {
            if self.on_demand_static_state == OnDemandState::Closing {
                self.on_demand_static_state = OnDemandState::Ready;
                self.static_close_deadline = None;
            }
        } else if conf.has_on_demand_publisher()
            && self.on_demand_publisher_state == OnDemandState::Closing
        {
            self.on_demand_publisher_state = OnDemandState::Ready;
            self.publisher_close_deadline = None;
        }

        let _ = req.res.send(Ok((self.path.clone(), stream)));
    }

    async fn source_set_ready(
        &mut self,
        desc: SessionDescription,
        generate_rtp_packets: bool,
    ) -> Result<Arc<Stream>, RelayError> {
        let stream = Arc::new(Stream::new(
            self.path.runtime.udp_max_payload_size,
            desc,
            generate_rtp_packets,
            self.path.bytes_received.clone(),
            Arc::new(TracingLogger),
        ));
        self.stream = Some(stream.clone());

        let conf = self.conf();

        if !conf.run_on_ready.is_empty() {
            info!("[path {}] runOnReady command started", self.path.name);
            self.on_ready_cmd = Some(self.path.runtime.hook_runner.start(
                &conf.run_on_ready,
                conf.run_on_ready_restart,
                hook_env(
                    &self.path.runtime.rtsp_address,
                    &self.path.name,
                    &self.path.matches,
                ),
            ));
        }

        if conf.record {
            let mut record_config = relay_record::agent::AgentConfig::new(
                conf.record_path.clone(),
                match conf.record_format {
                    RecordFormatConf::Fmp4 => relay_record::RecordFormat::Fmp4,
                    RecordFormatConf::MpegTs => relay_record::RecordFormat::MpegTs,
                },
                self.path.name.clone(),
            );
            record_config.write_queue_size = self.path.runtime.write_queue_size;
            record_config.segment_duration = conf.record_segment_duration;
            record_config.part_duration = conf.record_part_duration;
            self.record_agent = Some(relay_record::Agent::new(record_config, stream.clone()));
        }

        self.parent
            .notify(
                &self.path.ctx,
                ManagerEvent::PathSourceReady(self.path.clone(), stream.clone()),
            )
            .await;

        Ok(stream)
    }

    async fn source_set_not_ready(&mut self) {
        self.parent
            .notify(&self.path.ctx, ManagerEvent::PathSourceNotReady(self.path.clone()))
            .await;

        for (_, mut entry) in self.readers.drain() {
            if let Some(mut cmd) = entry.on_read_cmd.take() {
                cmd.close();
                info!("[path {}] runOnRead command stopped", self.path.name);
            }
            entry.session.close();
        }

        if let Some(agent) = self.record_agent.take() {
            tokio::spawn(async move { agent.close().await });
        }

        if let Some(mut cmd) = self.on_ready_cmd.take() {
            cmd.close();
            info!("[path {}] runOnReady command stopped", self.path.name);
        }

        self.stream = None;
    }

    async fn do_publisher_remove(&mut self) {
        if self.stream.is_some() {
            self.source_set_not_ready().await;
        }
        self.source = SourceState::None;
    }

    fn on_demand_static_source_start(&mut self) {
        if let SourceState::Static(source) = &self.source {
            source.start();
        }
        self.static_ready_deadline =
            Some(Instant::now() + self.conf().source_on_demand_start_timeout);
        self.on_demand_static_state = OnDemandState::WaitingReady;
    }

    fn on_demand_static_source_schedule_close(&mut self) {
        self.static_close_deadline =
            Some(Instant::now() + self.conf().source_on_demand_close_after);
        self.on_demand_static_state = OnDemandState::Closing;
    }

    fn on_demand_static_source_stop(&mut self) {
        self.static_ready_deadline = None;
        self.static_close_deadline = None;
        self.on_demand_static_state = OnDemandState::Initial;

        if let SourceState::Static(source) = &self.source {
            source.stop();
        }
    }

    fn on_demand_publisher_start(&mut self) {
        info!("[path {}] runOnDemand command started", self.path.name);
        let conf = self.conf();
        self.on_demand_cmd = Some(self.path.runtime.hook_runner.start(
            &conf.run_on_demand,
            conf.run_on_demand_restart,
            hook_env(
                &self.path.runtime.rtsp_address,
                &self.path.name,
                &self.path.matches,
            ),
        ));

        self.publisher_ready_deadline =
            Some(Instant::now() + conf.run_on_demand_start_timeout);
        self.on_demand_publisher_state = OnDemandState::WaitingReady;
    }

    fn on_demand_publisher_schedule_close(&mut self) {
        self.publisher_close_deadline =
            Some(Instant::now() + self.conf().run_on_demand_close_after);
        self.on_demand_publisher_state = OnDemandState::Closing;
    }

    async fn on_demand_publisher_stop(&mut self) {
        let publisher = match &self.source {
            SourceState::Publisher(session) => Some(session.clone()),
            _ => None,
        };
        if let Some(publisher) = publisher {
            publisher.close();
            self.do_publisher_remove().await;
        }

        self.publisher_ready_deadline = None;
        self.publisher_close_deadline = None;
        self.on_demand_publisher_state = OnDemandState::Initial;

        if let Some(mut cmd) = self.on_demand_cmd.take() {
            cmd.close();
            info!("[path {}] runOnDemand command stopped", self.path.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::config::{PathConf, ServerConfig};
    use crate::hooks::NullHookRunner;
    use crate::path_manager::PathManager;
    use crate::source::{
        next_session_id, Session, SessionId, StaticSourceFactory, StaticSourceRunner,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use relay_core::format::H264Format;
    use relay_core::{Format, Media, MediaKind};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn h264_desc() -> SessionDescription {
        SessionDescription::new(vec![Media {
            kind: MediaKind::Video,
            formats: vec![Format::H264(Arc::new(H264Format::new(
                96,
                1,
                Some(Bytes::from_static(&[0x67, 1])),
                Some(Bytes::from_static(&[0x68, 2])),
            )))],
        }])
    }

    struct FakeSession {
        id: SessionId,
        closed: AtomicBool,
    }

    impl FakeSession {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_session_id(),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Session for FakeSession {
        fn id(&self) -> SessionId {
            self.id
        }

        fn kind(&self) -> &'static str {
            "fakeSession"
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Runner that reports ready after a delay (or never) and counts its
    /// starts.
    struct FakeRunner {
        ready_delay: Option<Duration>,
        starts: AtomicUsize,
    }

    #[async_trait]
    impl StaticSourceRunner for FakeRunner {
        async fn run(
            &self,
            ctx: CancellationToken,
            _conf: PathConf,
            path: StaticSourcePathHandle,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.starts.fetch_add(1, Ordering::SeqCst);

            match self.ready_delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    path.set_ready(h264_desc(), true, &ctx)
                        .await
                        .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                            e.to_string().into()
                        })?;
                    ctx.cancelled().await;
                    Ok(())
                }
                None => {
                    ctx.cancelled().await;
                    Ok(())
                }
            }
        }
    }

    struct FakeFactory {
        runner: Arc<FakeRunner>,
    }

    impl StaticSourceFactory for FakeFactory {
        fn create(&self, _source: &str) -> Option<Arc<dyn StaticSourceRunner>> {
            Some(self.runner.clone())
        }
    }

    fn runtime_with_factory(runner: Arc<FakeRunner>) -> Arc<ServerRuntime> {
        let config = ServerConfig::default();
        Arc::new(ServerRuntime {
            rtsp_address: config.rtsp_address.clone(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            write_queue_size: config.write_queue_size,
            udp_max_payload_size: config.udp_max_payload_size,
            hook_runner: Arc::new(NullHookRunner),
            static_source_factory: Arc::new(FakeFactory { runner }),
            external_auth: None,
        })
    }

    fn on_demand_conf() -> PathConf {
        PathConf {
            source: "test://cam".to_string(),
            source_on_demand: true,
            source_on_demand_start_timeout: Duration::from_millis(300),
            source_on_demand_close_after: Duration::from_millis(150),
            ..Default::default()
        }
    }

    fn manager_with_runner(
        conf: PathConf,
        runner: Arc<FakeRunner>,
    ) -> Arc<PathManager> {
        let runtime = runtime_with_factory(runner);
        let mut confs = HashMap::new();
        confs.insert("cam".to_string(), conf);
        PathManager::new(runtime, confs)
    }

    #[tokio::test]
    async fn on_demand_source_starts_on_reader_and_closes_after_idle() {
        let runner = Arc::new(FakeRunner {
            ready_delay: Some(Duration::from_millis(30)),
            starts: AtomicUsize::new(0),
        });
        let manager = manager_with_runner(on_demand_conf(), runner.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the source is not started before anyone asks
        assert_eq!(runner.starts.load(Ordering::SeqCst), 0);

        // a reader triggers the start and is parked until ready
        let reader = FakeSession::new();
        let (path, stream) = manager
            .add_reader("cam", Credentials::default(), reader.clone())
            .await
            .unwrap();
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
        assert_eq!(stream.desc().medias.len(), 1);

        // last reader leaves: the close timer eventually stops the source
        path.reader_remove(reader.id()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // a new reader starts the source again
        let reader2 = FakeSession::new();
        manager
            .add_reader("cam", Credentials::default(), reader2.clone())
            .await
            .unwrap();
        assert_eq!(runner.starts.load(Ordering::SeqCst), 2);

        manager.close().await;
    }

    #[tokio::test]
    async fn reader_arriving_while_closing_keeps_the_source_alive() {
        let runner = Arc::new(FakeRunner {
            ready_delay: Some(Duration::from_millis(10)),
            starts: AtomicUsize::new(0),
        });
        let manager = manager_with_runner(on_demand_conf(), runner.clone());

        let reader = FakeSession::new();
        let (path, _stream) = manager
            .add_reader("cam", Credentials::default(), reader.clone())
            .await
            .unwrap();

        // leave and come back before the close timer fires
        path.reader_remove(reader.id()).await;
        let reader2 = FakeSession::new();
        manager
            .add_reader("cam", Credentials::default(), reader2.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        // the source was never restarted
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn parked_requests_time_out_when_the_source_never_readies() {
        let runner = Arc::new(FakeRunner {
            ready_delay: None,
            starts: AtomicUsize::new(0),
        });
        let mut conf = on_demand_conf();
        conf.source_on_demand_start_timeout = Duration::from_millis(100);
        let manager = manager_with_runner(conf, runner.clone());

        let reader = FakeSession::new();
        let err = manager
            .add_reader("cam", Credentials::default(), reader)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout("cam".to_string()));
        manager.close().await;
    }

    #[tokio::test]
    async fn describe_is_parked_until_the_source_is_ready() {
        let runner = Arc::new(FakeRunner {
            ready_delay: Some(Duration::from_millis(30)),
            starts: AtomicUsize::new(0),
        });
        let manager = manager_with_runner(on_demand_conf(), runner.clone());

        let (_path, answer) = manager
            .describe("cam", None, Credentials::default())
            .await
            .unwrap();
        assert!(matches!(answer, DescribeAnswer::Stream(_)));
        manager.close().await;
    }
}
