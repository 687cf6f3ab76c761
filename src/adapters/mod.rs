//! Protocol adapters.
//!
//! Each adapter is a long-lived session loop that maps one wire protocol
//! onto the relay: it parses the stream identity from the wire control
//! layer, registers with the path manager as a publisher or reader, and
//! converts between wire frames and codec-tagged units. The byte-level
//! framing of every protocol stays behind the adapter's connection
//! traits.

pub mod hls;
pub mod rtmp;
pub mod rtsp;
pub mod srt;
pub mod webrtc;

use std::sync::Arc;

use relay_core::Payload;
use relay_rtp::{h264, h265};
use tokio_util::sync::CancellationToken;

use crate::auth::PAUSE_AFTER_AUTH_ERROR;
use crate::error::RelayError;
use crate::source::{next_session_id, Session, SessionId};

/// Session capability shared by all adapters: identity plus a
/// cancellation token the session loop observes.
pub struct AdapterSession {
    id: SessionId,
    kind: &'static str,
    cancel: CancellationToken,
}

impl AdapterSession {
    pub fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id: next_session_id(),
            kind,
            cancel: CancellationToken::new(),
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Session for AdapterSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Rate-limit brute force: sleep before surfacing an authentication
/// failure to the wire.
pub async fn pause_on_auth_error(err: &RelayError) {
    if *err == RelayError::Auth {
        tokio::time::sleep(PAUSE_AFTER_AUTH_ERROR).await;
    }
}

/// Whether a decoded unit is a video key frame. Codecs without parseable
/// random-access markers count as key frames.
pub(crate) fn unit_is_key_frame(payload: &Payload) -> bool {
    match payload {
        Payload::H264 { au } => au
            .iter()
            .any(|n| !n.is_empty() && h264::nalu_type(n[0]) == h264::NaluType::Idr as u8),
        Payload::H265 { au } => au
            .iter()
            .any(|n| !n.is_empty() && h265::is_key_nalu(h265::nalu_type(n[0]))),
        _ => true,
    }
}
