//! Path registry and router.
//!
//! The manager resolves a requested name against the configuration:
//! literal entries first, then regular-expression entries (keys starting
//! with `~`, anchored to the whole name). It authenticates the request,
//! creates paths on demand, and applies configuration hot reloads. Like a
//! path, it runs a single event loop; requests are answered over oneshot
//! channels.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use regex::Regex;
use relay_core::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{authenticate, AuthAction, Credentials};
use crate::config::{
    is_regex_key, is_valid_path_name, normalize_path_name, path_conf_can_be_updated, PathConf,
};
use crate::core::ServerRuntime;
use crate::error::RelayError;
use crate::path::{DescribeAnswer, Path, PathParent};
use crate::source::SessionArc;

/// Observer of path readiness, used by the HLS front end to spin muxers
/// up and down.
pub trait SourceReadyHook: Send + Sync {
    fn source_ready(&self, path: Arc<Path>, stream: Arc<Stream>);
    fn source_not_ready(&self, path: Arc<Path>);
}

pub(crate) enum ManagerEvent {
    ConfReload(HashMap<String, PathConf>),
    PathClose(Arc<Path>),
    PathSourceReady(Arc<Path>, Arc<Stream>),
    PathSourceNotReady(Arc<Path>),
    SetSourceHook(Option<Arc<dyn SourceReadyHook>>),
    GetPath {
        name: String,
        action: AuthAction,
        credentials: Credentials,
        res: oneshot::Sender<Result<Arc<Path>, RelayError>>,
    },
    ListPaths {
        res: oneshot::Sender<Vec<String>>,
    },
}

pub struct PathManager {
    ctx: CancellationToken,
    tx: mpsc::Sender<ManagerEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PathManager {
    pub fn new(runtime: Arc<ServerRuntime>, path_confs: HashMap<String, PathConf>) -> Arc<Self> {
        let ctx = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);

        let mut state = ManagerState {
            runtime,
            ctx: ctx.clone(),
            tx: tx.clone(),
            path_confs: HashMap::new(),
            regexes: HashMap::new(),
            paths: HashMap::new(),
            paths_by_conf: HashMap::new(),
            source_hook: None,
        };
        state.set_path_confs(path_confs);

        // non-regex paths are created eagerly and persist for the process
        // lifetime
        let conf_names: Vec<String> = state
            .path_confs
            .keys()
            .filter(|k| !is_regex_key(k))
            .cloned()
            .collect();
        for conf_name in conf_names {
            if let Some(conf) = state.path_confs.get(&conf_name).cloned() {
                state.create_path(&conf_name, conf, conf_name.clone(), Vec::new());
            }
        }

        debug!("path manager created");

        let handle = tokio::spawn(async move { state.run(rx).await });

        Arc::new(Self {
            ctx,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub async fn close(&self) {
        debug!("path manager is shutting down");
        self.ctx.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn send(&self, event: ManagerEvent) -> Result<(), RelayError> {
        tokio::select! {
            sent = self.tx.send(event) => sent.map_err(|_| RelayError::Terminated),
            _ = self.ctx.cancelled() => Err(RelayError::Terminated),
        }
    }

    async fn get_path(
        &self,
        name: &str,
        action: AuthAction,
        credentials: Credentials,
    ) -> Result<Arc<Path>, RelayError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.send(ManagerEvent::GetPath {
            name: normalize_path_name(name).to_string(),
            action,
            credentials,
            res: res_tx,
        })
        .await?;
        res_rx.await.unwrap_or(Err(RelayError::Terminated))
    }

    /// Called by a reader or publisher to describe a path.
    pub async fn describe(
        &self,
        name: &str,
        url: Option<url::Url>,
        credentials: Credentials,
    ) -> Result<(Arc<Path>, DescribeAnswer), RelayError> {
        let path = self.get_path(name, AuthAction::Read, credentials).await?;
        let answer = path.describe(url).await?;
        Ok((path, answer))
    }

    /// Called by a reader session.
    pub async fn add_reader(
        &self,
        name: &str,
        credentials: Credentials,
        session: SessionArc,
    ) -> Result<(Arc<Path>, Arc<Stream>), RelayError> {
        let path = self.get_path(name, AuthAction::Read, credentials).await?;
        path.reader_add(session).await
    }

    /// Called by a publisher session.
    pub async fn add_publisher(
        &self,
        name: &str,
        credentials: Credentials,
        session: SessionArc,
    ) -> Result<Arc<Path>, RelayError> {
        let path = self.get_path(name, AuthAction::Publish, credentials).await?;
        path.publisher_add(session).await
    }

    /// Apply a new per-path configuration set.
    pub async fn conf_reload(&self, path_confs: HashMap<String, PathConf>) {
        let _ = self.send(ManagerEvent::ConfReload(path_confs)).await;
    }

    /// Register the observer notified on source readiness changes.
    pub async fn set_source_hook(&self, hook: Option<Arc<dyn SourceReadyHook>>) {
        let _ = self.send(ManagerEvent::SetSourceHook(hook)).await;
    }

    /// Names of the currently live paths.
    pub async fn list_paths(&self) -> Vec<String> {
        let (res_tx, res_rx) = oneshot::channel();
        if self
            .send(ManagerEvent::ListPaths { res: res_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        res_rx.await.unwrap_or_default()
    }
}

struct ManagerState {
    runtime: Arc<ServerRuntime>,
    ctx: CancellationToken,
    tx: mpsc::Sender<ManagerEvent>,
    path_confs: HashMap<String, PathConf>,
    regexes: HashMap<String, Regex>,
    paths: HashMap<String, Arc<Path>>,
    paths_by_conf: HashMap<String, HashSet<String>>,
    source_hook: Option<Arc<dyn SourceReadyHook>>,
}

impl ManagerState {
    async fn run(&mut self, mut rx: mpsc::Receiver<ManagerEvent>) {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                _ = self.ctx.cancelled() => break,
            }
        }

        // unwind every path before returning
        for path in self.paths.values() {
            path.close();
        }
        for path in self.paths.values() {
            path.wait().await;
        }
    }

    async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::ConfReload(new_confs) => self.handle_conf_reload(new_confs).await,

            ManagerEvent::PathClose(path) => {
                let registered = self
                    .paths
                    .get(path.name())
                    .map(|p| Arc::ptr_eq(p, &path))
                    .unwrap_or(false);
                if registered {
                    self.remove_path(&path);
                }
            }

            ManagerEvent::PathSourceReady(path, stream) => {
                if let Some(hook) = &self.source_hook {
                    hook.source_ready(path, stream);
                }
            }

            ManagerEvent::PathSourceNotReady(path) => {
                if let Some(hook) = &self.source_hook {
                    hook.source_not_ready(path);
                }
            }

            ManagerEvent::SetSourceHook(hook) => {
                self.source_hook = hook;
            }

            ManagerEvent::GetPath {
                name,
                action,
                credentials,
                res,
            } => {
                let result = self.get_or_create_path(&name, action, &credentials).await;
                let _ = res.send(result);
            }

            ManagerEvent::ListPaths { res } => {
                let mut names: Vec<String> = self.paths.keys().cloned().collect();
                names.sort();
                let _ = res.send(names);
            }
        }
    }

    async fn get_or_create_path(
        &mut self,
        name: &str,
        action: AuthAction,
        credentials: &Credentials,
    ) -> Result<Arc<Path>, RelayError> {
        let (conf_name, conf, matches) = self.get_path_conf(name)?;

        authenticate(
            self.runtime.external_auth.as_ref(),
            name,
            &conf,
            action,
            credentials,
        )
        .await?;

        if let Some(path) = self.paths.get(name) {
            return Ok(path.clone());
        }
        Ok(self.create_path(&conf_name, conf, name.to_string(), matches))
    }

    /// Resolve a requested name to its configuration entry: a literal key
    /// first, then the first matching regex entry (in sorted key order),
    /// exposing the captured groups.
    fn get_path_conf(
        &self,
        name: &str,
    ) -> Result<(String, PathConf, Vec<String>), RelayError> {
        is_valid_path_name(name)?;

        if let Some(conf) = self.path_confs.get(name) {
            return Ok((name.to_string(), conf.clone(), Vec::new()));
        }

        let mut regex_keys: Vec<&String> = self.regexes.keys().collect();
        regex_keys.sort();
        for key in regex_keys {
            if let Some(captures) = self.regexes[key].captures(name) {
                let matches = captures
                    .iter()
                    .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                if let Some(conf) = self.path_confs.get(key) {
                    return Ok((key.clone(), conf.clone(), matches));
                }
            }
        }

        Err(RelayError::NotConfigured(name.to_string()))
    }

    fn set_path_confs(&mut self, path_confs: HashMap<String, PathConf>) {
        self.regexes.clear();
        for key in path_confs.keys() {
            if is_regex_key(key) {
                // the pattern must match the entire requested name
                match Regex::new(&format!("^(?:{})$", &key[1..])) {
                    Ok(re) => {
                        self.regexes.insert(key.clone(), re);
                    }
                    Err(err) => warn!("invalid path regex '{key}': {err}"),
                }
            }
        }
        self.path_confs = path_confs;
    }

    fn create_path(
        &mut self,
        conf_name: &str,
        conf: PathConf,
        name: String,
        matches: Vec<String>,
    ) -> Arc<Path> {
        let path = Path::new(
            self.runtime.clone(),
            conf_name.to_string(),
            conf,
            name.clone(),
            matches,
            is_regex_key(conf_name),
            PathParent {
                tx: self.tx.clone(),
                ctx: self.ctx.clone(),
            },
        );

        self.paths.insert(name.clone(), path.clone());
        self.paths_by_conf
            .entry(conf_name.to_string())
            .or_default()
            .insert(name);

        path
    }

    fn remove_path(&mut self, path: &Arc<Path>) {
        if let Some(set) = self.paths_by_conf.get_mut(path.conf_name()) {
            set.remove(path.name());
            if set.is_empty() {
                self.paths_by_conf.remove(path.conf_name());
            }
        }
        self.paths.remove(path.name());
    }

    async fn handle_conf_reload(&mut self, new_confs: HashMap<String, PathConf>) {
        let old_confs = self.path_confs.clone();

        for (conf_name, old_conf) in &old_confs {
            match new_confs.get(conf_name) {
                Some(new_conf) => {
                    if new_conf == old_conf {
                        continue;
                    }

                    if path_conf_can_be_updated(old_conf, new_conf) {
                        // live paths absorb the change
                        for path_name in self.paths_by_conf.get(conf_name).into_iter().flatten() {
                            if let Some(path) = self.paths.get(path_name) {
                                let path = path.clone();
                                let new_conf = new_conf.clone();
                                tokio::spawn(async move { path.reload_conf(new_conf).await });
                            }
                        }
                    } else {
                        info!("configuration of '{conf_name}' changed, recreating its paths");
                        self.close_paths_of_conf(conf_name).await;
                    }
                }
                None => {
                    info!("configuration of '{conf_name}' removed, closing its paths");
                    self.close_paths_of_conf(conf_name).await;
                }
            }
        }

        self.set_path_confs(new_confs);

        // create newly added static paths eagerly
        let to_create: Vec<String> = self
            .path_confs
            .keys()
            .filter(|k| !is_regex_key(k) && !self.paths.contains_key(*k))
            .cloned()
            .collect();
        for conf_name in to_create {
            if let Some(conf) = self.path_confs.get(&conf_name).cloned() {
                self.create_path(&conf_name, conf, conf_name.clone(), Vec::new());
            }
        }
    }

    async fn close_paths_of_conf(&mut self, conf_name: &str) {
        let names: Vec<String> = self
            .paths_by_conf
            .get(conf_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for name in names {
            if let Some(path) = self.paths.get(&name).cloned() {
                self.remove_path(&path);
                path.close();
                // serialize to avoid conflicts between old and new sources
                path.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::source::{next_session_id, Session, SessionId};
    use bytes::Bytes;
    use relay_core::format::H264Format;
    use relay_core::{Format, Media, MediaKind, SessionDescription};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

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

    fn manager_with(paths: Vec<(&str, PathConf)>) -> Arc<PathManager> {
        let config = ServerConfig::default();
        let runtime = crate::core::ServerRuntime::from_config(&config);
        PathManager::new(
            runtime,
            paths
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[tokio::test]
    async fn static_paths_are_created_eagerly() {
        let manager = manager_with(vec![
            ("mystream", PathConf::default()),
            ("~^cam/(.+)$", PathConf::default()),
        ]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.list_paths().await, vec!["mystream".to_string()]);
        manager.close().await;
    }

    #[tokio::test]
    async fn unknown_names_are_rejected() {
        let manager = manager_with(vec![("mystream", PathConf::default())]);

        let err = manager
            .add_publisher("other", Credentials::default(), FakeSession::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NotConfigured("other".to_string()));

        let err = manager
            .add_publisher("bad name", Credentials::default(), FakeSession::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidPathName(_)));
        manager.close().await;
    }

    #[tokio::test]
    async fn regex_entries_match_the_whole_name() {
        let manager = manager_with(vec![("~^cam/(.+)$", PathConf::default())]);

        // matches: a path is created on demand
        let session = FakeSession::new();
        manager
            .add_publisher("cam/front", Credentials::default(), session.clone())
            .await
            .unwrap();
        assert_eq!(manager.list_paths().await, vec!["cam/front".to_string()]);

        // a partial match is not enough: the pattern is anchored
        let err = manager
            .add_publisher("video/cam/front", Credentials::default(), FakeSession::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RelayError::NotConfigured("video/cam/front".to_string())
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn regex_born_paths_are_destroyed_when_unused() {
        let manager = manager_with(vec![("~^cam/(.+)$", PathConf::default())]);

        let session = FakeSession::new();
        let path = manager
            .add_publisher("cam/front", Credentials::default(), session.clone())
            .await
            .unwrap();

        path.publisher_remove(session.id()).await;
        path.wait().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.list_paths().await.is_empty());
        manager.close().await;
    }

    #[tokio::test]
    async fn publisher_override_follows_configuration() {
        let manager = manager_with(vec![
            ("open", PathConf::default()),
            (
                "locked",
                PathConf {
                    disable_publisher_override: true,
                    ..Default::default()
                },
            ),
        ]);

        // default: the new publisher evicts the old one
        let first = FakeSession::new();
        let path = manager
            .add_publisher("open", Credentials::default(), first.clone())
            .await
            .unwrap();
        path.publisher_start(first.id(), h264_desc(), true)
            .await
            .unwrap();

        let second = FakeSession::new();
        manager
            .add_publisher("open", Credentials::default(), second.clone())
            .await
            .unwrap();
        assert!(first.closed.load(Ordering::SeqCst));

        // locked: the second publisher is rejected
        let a = FakeSession::new();
        manager
            .add_publisher("locked", Credentials::default(), a.clone())
            .await
            .unwrap();
        let err = manager
            .add_publisher("locked", Credentials::default(), FakeSession::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::PublisherExists("locked".to_string()));
        manager.close().await;
    }

    #[tokio::test]
    async fn readers_join_only_ready_paths() {
        let manager = manager_with(vec![("mystream", PathConf::default())]);

        let err = manager
            .add_reader("mystream", Credentials::default(), FakeSession::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NoOnePublishing("mystream".to_string()));

        let publisher = FakeSession::new();
        let path = manager
            .add_publisher("mystream", Credentials::default(), publisher.clone())
            .await
            .unwrap();
        path.publisher_start(publisher.id(), h264_desc(), true)
            .await
            .unwrap();

        let reader = FakeSession::new();
        let (_path, stream) = manager
            .add_reader("mystream", Credentials::default(), reader.clone())
            .await
            .unwrap();
        assert_eq!(stream.desc().medias.len(), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn publisher_stop_evicts_readers() {
        let manager = manager_with(vec![("mystream", PathConf::default())]);

        let publisher = FakeSession::new();
        let path = manager
            .add_publisher("mystream", Credentials::default(), publisher.clone())
            .await
            .unwrap();
        path.publisher_start(publisher.id(), h264_desc(), true)
            .await
            .unwrap();

        let reader = FakeSession::new();
        manager
            .add_reader("mystream", Credentials::default(), reader.clone())
            .await
            .unwrap();

        path.publisher_stop(publisher.id()).await;
        assert!(reader.closed.load(Ordering::SeqCst));
        manager.close().await;
    }

    #[tokio::test]
    async fn auth_failures_are_opaque() {
        let manager = manager_with(vec![(
            "secure",
            PathConf {
                publish_user: Some("admin".to_string()),
                publish_pass: Some("secret".to_string()),
                ..Default::default()
            },
        )]);

        let err = manager
            .add_publisher("secure", Credentials::default(), FakeSession::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Auth);
        manager.close().await;
    }

    #[tokio::test]
    async fn describe_resolution_order() {
        let manager = manager_with(vec![
            (
                "redirecting",
                PathConf {
                    source: "redirect".to_string(),
                    source_redirect: Some("rtsp://elsewhere/stream".to_string()),
                    ..Default::default()
                },
            ),
            (
                "fallbacking",
                PathConf {
                    fallback: Some("/backup".to_string()),
                    ..Default::default()
                },
            ),
            ("plain", PathConf::default()),
        ]);

        // 1. redirect source wins
        let (_, answer) = manager
            .describe("redirecting", None, Credentials::default())
            .await
            .unwrap();
        assert!(matches!(
            answer,
            DescribeAnswer::Redirect(ref url) if url == "rtsp://elsewhere/stream"
        ));

        // 4. fallback rewrites relative paths against the request URL
        let url = url::Url::parse("rtsp://relay:8554/fallbacking?token=x").unwrap();
        let (_, answer) = manager
            .describe("fallbacking", Some(url), Credentials::default())
            .await
            .unwrap();
        assert!(matches!(
            answer,
            DescribeAnswer::Redirect(ref target) if target == "rtsp://relay:8554/backup"
        ));

        // 5. otherwise: no one is publishing
        let err = manager
            .describe("plain", None, Credentials::default())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NoOnePublishing("plain".to_string()));
        manager.close().await;
    }

    #[tokio::test]
    async fn hot_reload_applies_the_rules() {
        let manager = manager_with(vec![("kept", PathConf::default())]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // record-only change: the path survives
        let before = manager.list_paths().await;
        assert_eq!(before, vec!["kept".to_string()]);

        let mut confs = HashMap::new();
        confs.insert(
            "kept".to_string(),
            PathConf {
                record: true,
                ..Default::default()
            },
        );
        confs.insert("added".to_string(), PathConf::default());
        manager.conf_reload(confs.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut paths = manager.list_paths().await;
        paths.sort();
        assert_eq!(paths, vec!["added".to_string(), "kept".to_string()]);

        // removing an entry closes its path
        let mut confs2 = HashMap::new();
        confs2.insert("added".to_string(), PathConf::default());
        manager.conf_reload(confs2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.list_paths().await, vec!["added".to_string()]);

        manager.close().await;
    }
}
