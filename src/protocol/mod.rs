//! Device wire format
//!
//! Upstream (device to host): newline-terminated telemetry frames
//! `v0|v1|...|vN` with raw 10-bit readings, plus acknowledgment lines.
//!
//! Downstream (host to device):
//! - song text: `sp|<source>|<title>|<artist>|<album>\n`
//! - cover art: `<IMG>`, raw JPEG bytes in paced chunks, `<END>`

pub mod image;

pub use image::{send_image, ImageTransferConfig};

/// Separator between telemetry readings and song fields
pub const FIELD_DELIMITER: char = '|';

/// Lines the device sends back that are not telemetry
pub const ACK_TOKENS: [&str; 2] = ["IMG_OK", "TXT_OK"];

/// Largest raw reading a slider reports
pub const RAW_MAX: u16 = 1023;

pub const IMAGE_START: &str = "<IMG>";
pub const IMAGE_END: &str = "<END>";

const SONG_PREFIX: &str = "sp";

/// Returns true for acknowledgment lines from the device
pub fn is_ack(line: &str) -> bool {
    ACK_TOKENS.iter().any(|token| line.starts_with(token))
}

/// Now-playing metadata as sent to the device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SongInfo {
    pub source_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
}

impl SongInfo {
    /// Render the song line, newline included
    pub fn to_message(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}\n",
            SONG_PREFIX,
            sanitize(&self.source_id),
            sanitize(&self.title),
            sanitize(&self.artist),
            sanitize(&self.album)
        )
    }
}

/// Replace characters that would break line or field framing
fn sanitize(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            FIELD_DELIMITER | '\r' | '\n' => ' ',
            c => c,
        })
        .collect()
}
