//! Console mixer - logs volume changes instead of touching an OS mixer
//!
//! Used on platforms without a native backend, and handy for checking slider
//! wiring without any audio running:
//! - every stream listed in `streams` is reported as live
//! - volume calls are logged and counted, never fail

use parking_lot::Mutex;
use tracing::info;

use super::{AudioMixer, AudioStream};
use crate::error::ProviderError;

/// Mixer that logs every call
pub struct ConsoleMixer {
    streams: Vec<AudioStream>,
    /// Execution counter for debugging
    call_count: Mutex<u64>,
}

impl ConsoleMixer {
    /// Create a console mixer reporting the given stream names as live
    pub fn new<I, S>(stream_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let streams = stream_names
            .into_iter()
            .enumerate()
            .map(|(i, name)| AudioStream::new(format!("console:{}", i), name))
            .collect();
        Self {
            streams,
            call_count: Mutex::new(0),
        }
    }

    /// Number of volume calls handled so far
    pub fn call_count(&self) -> u64 {
        *self.call_count.lock()
    }

    fn bump(&self) -> u64 {
        let mut count = self.call_count.lock();
        *count += 1;
        *count
    }
}

impl AudioMixer for ConsoleMixer {
    fn name(&self) -> &str {
        "console"
    }

    fn active_streams(&self) -> Result<Vec<AudioStream>, ProviderError> {
        Ok(self.streams.clone())
    }

    fn set_stream_volume(&self, stream: &AudioStream, percent: u8) -> Result<(), ProviderError> {
        let n = self.bump();
        info!("🎚 [console #{}] {} -> {}%", n, stream.display_name, percent);
        Ok(())
    }

    fn set_master_volume(&self, percent: u8) -> Result<(), ProviderError> {
        let n = self.bump();
        info!("🔊 [console #{}] master -> {}%", n, percent);
        Ok(())
    }
}
