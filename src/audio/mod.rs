//! Audio mixer capability and slider-to-stream routing
//!
//! The OS mixer is reached only through the [`AudioMixer`] trait. Everything
//! above it (routing table, volume workers, rebuild controller) is platform
//! independent.

pub mod applier;
pub mod console;
pub mod controller;
pub mod routing;
#[cfg(windows)]
pub mod wasapi;

use std::sync::Arc;

use crate::error::ProviderError;

pub use applier::VolumeApplier;
pub use console::ConsoleMixer;
pub use controller::{RebuildReason, RoutingController};
pub use routing::{ApplyOutcome, SessionRoutingTable};

/// Pseudo-slider that addresses the default output device directly
pub const MASTER_TARGET: &str = "master";

/// Returns true if `target` names the master pseudo-slider
pub fn is_master(target: &str) -> bool {
    target.eq_ignore_ascii_case(MASTER_TARGET)
}

/// A live per-application output stream on the default device
///
/// Only valid until the next routing rebuild; the backend resolves `key`
/// back to the OS session when a volume is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioStream {
    /// Backend-specific identity of the session
    pub key: String,
    /// Name used for slider and group matching
    pub display_name: String,
}

impl AudioStream {
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
        }
    }
}

/// Callback fired when the set of active streams changes
pub type SessionChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// OS audio mixer
///
/// All calls may block on device I/O; callers run them on blocking threads.
pub trait AudioMixer: Send + Sync {
    /// Backend name for logs (e.g. "wasapi", "console")
    fn name(&self) -> &str;

    /// Active output streams of the system default device
    fn active_streams(&self) -> Result<Vec<AudioStream>, ProviderError>;

    /// Set one stream's volume, 0-100
    fn set_stream_volume(&self, stream: &AudioStream, percent: u8) -> Result<(), ProviderError>;

    /// Set the default device's master volume, 0-100
    fn set_master_volume(&self, percent: u8) -> Result<(), ProviderError>;

    /// Register for session-set change notifications
    ///
    /// Default implementation: no-op (backend cannot report changes)
    fn subscribe_session_changes(&self, _callback: SessionChangeCallback) {}
}

/// Convert a normalized level to a volume percentage
pub fn level_to_percent(level: f32) -> u8 {
    if !level.is_finite() {
        return 0;
    }
    (level.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
pub(crate) mod fake {
    //! Recording mixer used by tests across the crate

    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum MixerCall {
        Stream { name: String, percent: u8 },
        Master { percent: u8 },
    }

    #[derive(Default)]
    pub struct FakeMixer {
        pub streams: Mutex<Vec<AudioStream>>,
        pub calls: Mutex<Vec<MixerCall>>,
        /// Display names whose volume calls fail
        pub failing: Mutex<Vec<String>>,
        pub listing_calls: Mutex<usize>,
        pub callbacks: Mutex<Vec<SessionChangeCallback>>,
    }

    impl FakeMixer {
        pub fn with_streams(names: &[&str]) -> Self {
            let mixer = Self::default();
            *mixer.streams.lock() = names
                .iter()
                .enumerate()
                .map(|(i, n)| AudioStream::new(format!("s{}", i), *n))
                .collect();
            mixer
        }

        pub fn calls(&self) -> Vec<MixerCall> {
            self.calls.lock().clone()
        }

        pub fn fire_session_change(&self) {
            for cb in self.callbacks.lock().iter() {
                cb();
            }
        }
    }

    impl AudioMixer for FakeMixer {
        fn name(&self) -> &str {
            "fake"
        }

        fn active_streams(&self) -> Result<Vec<AudioStream>, ProviderError> {
            *self.listing_calls.lock() += 1;
            Ok(self.streams.lock().clone())
        }

        fn set_stream_volume(&self, stream: &AudioStream, percent: u8) -> Result<(), ProviderError> {
            if self.failing.lock().contains(&stream.display_name) {
                return Err(ProviderError::Mixer(format!("{} is gone", stream.display_name)));
            }
            self.calls.lock().push(MixerCall::Stream {
                name: stream.display_name.clone(),
                percent,
            });
            Ok(())
        }

        fn set_master_volume(&self, percent: u8) -> Result<(), ProviderError> {
            self.calls.lock().push(MixerCall::Master { percent });
            Ok(())
        }

        fn subscribe_session_changes(&self, callback: SessionChangeCallback) {
            self.callbacks.lock().push(callback);
        }
    }
}
