//! Server and per-path configuration.
//!
//! Configuration is deserialized by an outer loader; this module defines
//! the structures, defaults, path-name validation and the hot-reload
//! comparison rules. Path entries are keyed either by a literal path name
//! or, when the key starts with `~`, by a regular expression that must
//! match the whole requested name.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

pub const DEFAULT_UDP_MAX_PAYLOAD_SIZE: usize = 1472;

mod duration_secs {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Global server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Listen address of the RTSP front end; its port is exposed to hooks.
    pub rtsp_address: String,
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,
    /// Queue size of every reader's AsyncWriter.
    pub write_queue_size: usize,
    pub udp_max_payload_size: usize,
    pub external_authentication_url: Option<String>,
    /// Path configurations, keyed by literal name or `~regex`.
    pub paths: HashMap<String, PathConf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rtsp_address: ":8554".to_string(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            write_queue_size: 512,
            udp_max_payload_size: DEFAULT_UDP_MAX_PAYLOAD_SIZE,
            external_authentication_url: None,
            paths: HashMap::new(),
        }
    }
}

/// Container format of recorded segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormatConf {
    #[default]
    Fmp4,
    MpegTs,
}

/// Configuration of one path entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathConf {
    /// "publisher", "redirect", or the URL of a static source.
    pub source: String,
    pub source_on_demand: bool,
    #[serde(with = "duration_secs")]
    pub source_on_demand_start_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub source_on_demand_close_after: Duration,
    pub source_redirect: Option<String>,
    pub disable_publisher_override: bool,
    pub fallback: Option<String>,

    pub record: bool,
    pub record_path: String,
    pub record_format: RecordFormatConf,
    #[serde(with = "duration_secs")]
    pub record_part_duration: Duration,
    #[serde(with = "duration_secs")]
    pub record_segment_duration: Duration,
    #[serde(with = "duration_secs")]
    pub record_delete_after: Duration,

    pub publish_user: Option<String>,
    pub publish_pass: Option<String>,
    pub publish_ips: Vec<String>,
    pub read_user: Option<String>,
    pub read_pass: Option<String>,
    pub read_ips: Vec<String>,

    pub run_on_init: String,
    pub run_on_init_restart: bool,
    pub run_on_demand: String,
    pub run_on_demand_restart: bool,
    #[serde(with = "duration_secs")]
    pub run_on_demand_start_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub run_on_demand_close_after: Duration,
    pub run_on_ready: String,
    pub run_on_ready_restart: bool,
    pub run_on_read: String,
    pub run_on_read_restart: bool,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: "publisher".to_string(),
            source_on_demand: false,
            source_on_demand_start_timeout: Duration::from_secs(10),
            source_on_demand_close_after: Duration::from_secs(10),
            source_redirect: None,
            disable_publisher_override: false,
            fallback: None,
            record: false,
            record_path: "./recordings/%path/%Y-%m-%d_%H-%M-%S-%f".to_string(),
            record_format: RecordFormatConf::Fmp4,
            record_part_duration: Duration::from_secs(1),
            record_segment_duration: Duration::from_secs(3600),
            record_delete_after: Duration::from_secs(24 * 3600),
            publish_user: None,
            publish_pass: None,
            publish_ips: Vec::new(),
            read_user: None,
            read_pass: None,
            read_ips: Vec::new(),
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_demand_start_timeout: Duration::from_secs(10),
            run_on_demand_close_after: Duration::from_secs(10),
            run_on_ready: String::new(),
            run_on_ready_restart: false,
            run_on_read: String::new(),
            run_on_read_restart: false,
        }
    }
}

impl PathConf {
    pub fn has_static_source(&self) -> bool {
        self.source != "publisher" && self.source != "redirect"
    }

    pub fn has_on_demand_static_source(&self) -> bool {
        self.has_static_source() && self.source_on_demand
    }

    pub fn has_on_demand_publisher(&self) -> bool {
        !self.run_on_demand.is_empty()
    }

    pub fn is_redirect(&self) -> bool {
        self.source == "redirect"
    }
}

/// Whether a configuration change can be applied to live paths. Only the
/// record switch is hot-updatable; any other difference forces the paths
/// of this entry to be closed and recreated.
pub fn path_conf_can_be_updated(old: &PathConf, new: &PathConf) -> bool {
    let mut clone = old.clone();
    clone.record = new.record;
    *new == clone
}

/// Whether a config key denotes a regular-expression entry.
pub fn is_regex_key(key: &str) -> bool {
    key.starts_with('~')
}

/// Strip leading and trailing slashes from a requested path name.
pub fn normalize_path_name(name: &str) -> &str {
    name.trim_matches('/')
}

/// Validate a requested path name: non-empty, limited character set, no
/// leading slash, no parent-directory traversal.
pub fn is_valid_path_name(name: &str) -> Result<(), RelayError> {
    if name.is_empty() {
        return Err(RelayError::InvalidPathName("empty".into()));
    }
    if name.starts_with('/') {
        return Err(RelayError::InvalidPathName(format!(
            "must not begin with a slash: {name}"
        )));
    }
    if name.contains("../") {
        return Err(RelayError::InvalidPathName(format!(
            "must not contain '../': {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '.' | '~'))
    {
        return Err(RelayError::InvalidPathName(format!(
            "can contain only alphanumeric characters, underscore, dash, slash, dot, tilde: {name}"
        )));
    }
    Ok(())
}
