//! strelay: a real-time media relay.
//!
//! One publisher per path, any number of readers, several wire protocols
//! on either side (RTSP, RTMP, SRT, WebRTC, HLS), optional on-disk
//! recording. The relay does not transcode: media units are remuxed just
//! enough to stay decodable (parameter-set injection, re-packetization)
//! and fanned out at wire speed.
//!
//! This crate hosts the control plane: configuration, authentication,
//! the per-path lifecycle state machine, the path registry, and the
//! protocol adapters. The data plane lives in `relay-core` (units,
//! format processors, fan-out stream) and `relay-record` (segmented
//! recording); RTP packetization is in `relay-rtp`.
//!
//! Byte-level wire framing, HTTP APIs, TLS and hook execution are
//! external: the relay consumes them as trait contracts.

pub mod adapters;
pub mod auth;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod hooks;
pub mod path;
pub mod path_manager;
pub mod source;
