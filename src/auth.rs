//! Authentication of publishers and readers.
//!
//! Credentials are checked against the per-path configuration (user,
//! password, allowed IPs) and, when configured, against an external
//! authenticator reached over a transport this crate does not implement.
//! Failures surface as the opaque [`RelayError::Auth`]; adapters pause
//! before returning it to rate-limit brute force.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::PathConf;
use crate::error::RelayError;

/// Sleep applied by adapters before surfacing an authentication error.
pub const PAUSE_AFTER_AUTH_ERROR: Duration = Duration::from_secs(2);

/// Credentials extracted from the wire control layer.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
    pub ip: Option<IpAddr>,
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Publish,
    Read,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Publish => "publish",
            AuthAction::Read => "read",
        }
    }
}

/// External authenticator contract; the transport (HTTP or otherwise)
/// lives outside the core.
#[async_trait]
pub trait ExternalAuth: Send + Sync {
    async fn authenticate(
        &self,
        path_name: &str,
        action: AuthAction,
        credentials: &Credentials,
    ) -> Result<(), String>;
}

fn ip_allowed(allowed: &[String], ip: Option<IpAddr>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match ip {
        Some(ip) => allowed.iter().any(|a| a == &ip.to_string()),
        None => false,
    }
}

/// Check credentials for an action on a path.
pub async fn authenticate(
    external: Option<&Arc<dyn ExternalAuth>>,
    path_name: &str,
    conf: &PathConf,
    action: AuthAction,
    credentials: &Credentials,
) -> Result<(), RelayError> {
    if let Some(external) = external {
        if let Err(reason) = external.authenticate(path_name, action, credentials).await {
            debug!("external authentication failed for path '{path_name}': {reason}");
            return Err(RelayError::Auth);
        }
    }

    let (user, pass, ips) = match action {
        AuthAction::Publish => (&conf.publish_user, &conf.publish_pass, &conf.publish_ips),
        AuthAction::Read => (&conf.read_user, &conf.read_pass, &conf.read_ips),
    };

    if let Some(expected) = user {
        if &credentials.user != expected {
            debug!("authentication failed for path '{path_name}': wrong user");
            return Err(RelayError::Auth);
        }
    }
    if let Some(expected) = pass {
        if &credentials.pass != expected {
            debug!("authentication failed for path '{path_name}': wrong password");
            return Err(RelayError::Auth);
        }
    }
    if !ip_allowed(ips, credentials.ip) {
        debug!("authentication failed for path '{path_name}': IP not allowed");
        return Err(RelayError::Auth);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf_with_publish_auth() -> PathConf {
        PathConf {
            publish_user: Some("admin".to_string()),
            publish_pass: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn matching_credentials_pass() {
        let conf = conf_with_publish_auth();
        let creds = Credentials {
            user: "admin".to_string(),
            pass: "secret".to_string(),
            ..Default::default()
        };
        assert!(
            authenticate(None, "p", &conf, AuthAction::Publish, &creds)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn wrong_password_is_an_opaque_auth_error() {
        let conf = conf_with_publish_auth();
        let creds = Credentials {
            user: "admin".to_string(),
            pass: "wrong".to_string(),
            ..Default::default()
        };
        let err = authenticate(None, "p", &conf, AuthAction::Publish, &creds)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Auth);
        assert_eq!(err.to_string(), "authentication error");
    }

    #[tokio::test]
    async fn read_side_is_checked_independently() {
        let conf = conf_with_publish_auth();
        // No read credentials configured: anonymous reads pass.
        let creds = Credentials::default();
        assert!(
            authenticate(None, "p", &conf, AuthAction::Read, &creds)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn ip_allowlist_is_enforced() {
        let conf = PathConf {
            read_ips: vec!["10.0.0.5".to_string()],
            ..Default::default()
        };

        let allowed = Credentials {
            ip: Some("10.0.0.5".parse().unwrap()),
            ..Default::default()
        };
        assert!(
            authenticate(None, "p", &conf, AuthAction::Read, &allowed)
                .await
                .is_ok()
        );

        let denied = Credentials {
            ip: Some("10.0.0.6".parse().unwrap()),
            ..Default::default()
        };
        assert!(
            authenticate(None, "p", &conf, AuthAction::Read, &denied)
                .await
                .is_err()
        );
    }
}
