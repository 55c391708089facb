//! Now-playing metadata and cover art
//!
//! The OS media session service is reached through [`MediaProvider`]. The
//! [`NowPlayingWatcher`] turns its notifications and a watchdog poll into
//! song and cover events for the device link.

pub mod cover;
#[cfg(windows)]
pub mod gsmtc;
pub mod watcher;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::ProviderError;
use crate::protocol::SongInfo;

pub use cover::CoverEncoder;
pub use watcher::NowPlayingWatcher;

/// Playback state reported by a media session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Closed,
    Opened,
    Changing,
    Stopped,
    Playing,
    Paused,
    Unknown,
}

/// Metadata of the track a session is playing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaProperties {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub has_thumbnail: bool,
}

/// Inbound messages for the now-playing watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaNotification {
    /// The OS switched which session owns the transport controls
    CurrentSessionChanged,
    /// The tracked session's metadata or playback state changed
    PropertiesChanged,
    /// The device reconnected and needs the current song and cover again
    Resync,
}

/// What the watcher hands to the device link
#[derive(Debug)]
pub enum MediaEvent {
    SongChanged(SongInfo),
    CoverReady(Cover),
}

/// JPEG bytes ready for transfer, plus the channel the link answers on
///
/// The link reports `true` once the image went out on the wire. A cover it
/// refuses or fails to send reports `false`, or is simply dropped.
#[derive(Debug)]
pub struct Cover {
    pub jpeg: Vec<u8>,
    delivered: oneshot::Sender<bool>,
}

impl Cover {
    pub fn new(jpeg: Vec<u8>) -> (Self, oneshot::Receiver<bool>) {
        let (delivered, rx) = oneshot::channel();
        (Self { jpeg, delivered }, rx)
    }

    pub fn into_parts(self) -> (Vec<u8>, oneshot::Sender<bool>) {
        (self.jpeg, self.delivered)
    }
}

/// OS media session service
///
/// Sessions are identified by their source application id.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Source id of the session owning the transport controls, if any
    async fn current_session(&self) -> Result<Option<String>, ProviderError>;

    /// Track metadata; `None` when the session is gone
    async fn properties(&self, source_id: &str) -> Result<Option<MediaProperties>, ProviderError>;

    async fn playback_status(&self, source_id: &str) -> Result<PlaybackStatus, ProviderError>;

    /// Raw thumbnail bytes in whatever format the source supplied
    async fn thumbnail(&self, source_id: &str) -> Result<Option<Vec<u8>>, ProviderError>;

    /// Forward session and property change notifications to `tx`
    fn subscribe(&self, tx: mpsc::UnboundedSender<MediaNotification>);
}
