//! Hook command contract.
//!
//! Paths start hook commands on init, on demand, on ready and on read.
//! Executing external processes is outside the core; paths talk to a
//! [`HookRunner`] and only build the environment the commands receive:
//! `MTX_PATH`, the deprecated `RTSP_PATH` alias, `RTSP_PORT`, and
//! `G1..Gn` with the regex capture groups of the matched path config.

use std::sync::Arc;

/// Environment passed to a hook command.
pub type HookEnv = Vec<(String, String)>;

/// Handle of a started hook command.
pub trait HookHandle: Send {
    fn close(&mut self);
}

/// Launches hook commands.
pub trait HookRunner: Send + Sync {
    fn start(&self, command: &str, restart: bool, env: HookEnv) -> Box<dyn HookHandle>;
}

/// Runner used when hook execution is not wired up.
#[derive(Debug, Default)]
pub struct NullHookRunner;

struct NullHookHandle;

impl HookHandle for NullHookHandle {
    fn close(&mut self) {}
}

impl HookRunner for NullHookRunner {
    fn start(&self, _command: &str, _restart: bool, _env: HookEnv) -> Box<dyn HookHandle> {
        Box::new(NullHookHandle)
    }
}

pub type SharedHookRunner = Arc<dyn HookRunner>;

/// Build the environment of a hook command for one path.
pub fn hook_env(rtsp_address: &str, path_name: &str, matches: &[String]) -> HookEnv {
    let port = rtsp_address.rsplit(':').next().unwrap_or("");

    let mut env = vec![
        ("MTX_PATH".to_string(), path_name.to_string()),
        ("RTSP_PATH".to_string(), path_name.to_string()), // deprecated
        ("RTSP_PORT".to_string(), port.to_string()),
    ];

    for (i, m) in matches.iter().skip(1).enumerate() {
        env.push((format!("G{}", i + 1), m.clone()));
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_contains_path_port_and_groups() {
        let env = hook_env(
            ":8554",
            "cam/front",
            &["cam/front".to_string(), "cam".to_string(), "front".to_string()],
        );

        assert!(env.contains(&("MTX_PATH".to_string(), "cam/front".to_string())));
        assert!(env.contains(&("RTSP_PATH".to_string(), "cam/front".to_string())));
        assert!(env.contains(&("RTSP_PORT".to_string(), "8554".to_string())));
        assert!(env.contains(&("G1".to_string(), "cam".to_string())));
        assert!(env.contains(&("G2".to_string(), "front".to_string())));
    }

    #[test]
    fn literal_matches_produce_no_groups() {
        let env = hook_env("0.0.0.0:8554", "mystream", &[]);
        assert_eq!(env.len(), 3);
    }
}
