//! Newline framing for the receive side of the serial link

use tracing::warn;

/// Longest line kept before the buffer is considered garbage
const MAX_LINE_LEN: usize = 4096;

/// Reassembles newline-terminated lines from arbitrary read chunks
///
/// Only complete lines are returned. Lines are trimmed (so `\r\n` works),
/// empty lines are skipped and invalid UTF-8 is replaced lossily. A line
/// that outgrows the buffer is dropped whole, up to its terminator.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
    /// Inside an oversized line, skipping to the next `\n`
    discarding: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if !std::mem::take(&mut self.discarding) {
                    let line = String::from_utf8_lossy(&self.buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                }
                self.buf.clear();
            } else if self.discarding {
                continue;
            } else if self.buf.len() >= MAX_LINE_LEN {
                warn!("Discarding line longer than {} bytes", MAX_LINE_LEN);
                self.buf.clear();
                self.discarding = true;
            } else {
                self.buf.push(b);
            }
        }
        lines
    }

    /// Bytes waiting for their line terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
