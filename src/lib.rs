//! Mixr GW - serial slider controller to per-application volume gateway
//!
//! Reads slider telemetry from the controller over a serial link, routes each
//! slider to the audio streams it is configured for, and mirrors the
//! now-playing song and cover art back to the controller's display.

pub mod audio;
pub mod config;
pub mod error;
pub mod input;
pub mod link;
pub mod media;
pub mod paths;
pub mod protocol;
pub mod shutdown;
pub mod supervisor;
pub mod transport;
pub mod watcher;
