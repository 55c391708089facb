//! Cover art framing
//!
//! The receiver has a small input buffer and no flow control, so the payload
//! is paced: a pause after the start marker lets it switch into image mode,
//! every chunk is flushed and followed by a short gap, and the end marker is
//! separated from the last data byte.

use std::time::Duration;
use tracing::debug;

use super::{IMAGE_END, IMAGE_START};
use crate::config::TuningConfig;
use crate::error::TransportError;
use crate::transport::Transport;

/// Pacing of one image transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransferConfig {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub marker_delay: Duration,
}

impl Default for ImageTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            chunk_delay: Duration::from_millis(2),
            marker_delay: Duration::from_millis(50),
        }
    }
}

impl From<&TuningConfig> for ImageTransferConfig {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            chunk_size: tuning.image_chunk_size,
            chunk_delay: Duration::from_millis(tuning.image_chunk_delay_ms),
            marker_delay: Duration::from_millis(tuning.image_marker_delay_ms),
        }
    }
}

/// Send `image` framed by start/end markers; blocks for the whole transfer
///
/// Returns the number of payload chunks written. An empty image sends
/// nothing. The first failed write aborts the transfer.
pub fn send_image(
    transport: &mut dyn Transport,
    image: &[u8],
    config: &ImageTransferConfig,
) -> Result<usize, TransportError> {
    if image.is_empty() {
        return Ok(0);
    }

    transport.send_text(IMAGE_START)?;
    pause(config.marker_delay);

    let mut chunks = 0;
    for chunk in image.chunks(config.chunk_size.max(1)) {
        transport.send_bytes(chunk)?;
        chunks += 1;
        pause(config.chunk_delay);
    }

    pause(config.marker_delay);
    transport.send_text(IMAGE_END)?;

    debug!("🖼 Sent {} bytes in {} chunks", image.len(), chunks);
    Ok(chunks)
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
