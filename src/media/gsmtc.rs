//! Global System Media Transport Controls provider
//!
//! WinRT objects stay on one worker thread; async callers send it requests
//! and await the reply.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use windows::core::{Interface, HSTRING};
use windows::Foundation::TypedEventHandler;
use windows::Media::Control::{
    GlobalSystemMediaTransportControlsSession as Session,
    GlobalSystemMediaTransportControlsSessionManager as SessionManager,
    GlobalSystemMediaTransportControlsSessionPlaybackStatus as WinStatus,
};
use windows::Storage::Streams::{DataReader, IInputStream};

use super::{MediaNotification, MediaProperties, MediaProvider, PlaybackStatus};
use crate::error::ProviderError;

type Reply<T> = oneshot::Sender<Result<T, ProviderError>>;

enum Request {
    CurrentSession(Reply<Option<String>>),
    Properties(String, Reply<Option<MediaProperties>>),
    Status(String, Reply<PlaybackStatus>),
    Thumbnail(String, Reply<Option<Vec<u8>>>),
    Subscribe(mpsc::UnboundedSender<MediaNotification>),
}

pub struct GsmtcProvider {
    requests: mpsc::UnboundedSender<Request>,
}

impl GsmtcProvider {
    /// Connect to the session manager on a dedicated thread
    pub fn start() -> Result<Self, ProviderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("gsmtc".into())
            .spawn(move || {
                let manager = match SessionManager::RequestAsync().and_then(|op| op.get()) {
                    Ok(manager) => {
                        let _ = ready_tx.send(Ok(()));
                        manager
                    },
                    Err(e) => {
                        let _ = ready_tx.send(Err(media_err(e)));
                        return;
                    },
                };
                Worker::new(manager).run(rx);
            })
            .map_err(|e| ProviderError::Media(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| ProviderError::Media("media worker exited".to_string()))??;
        info!("✅ Connected to media transport controls");
        Ok(Self { requests: tx })
    }

    async fn ask<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, ProviderError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| ProviderError::Media("media worker stopped".to_string()))?;
        rx.await
            .map_err(|_| ProviderError::Media("media worker dropped the request".to_string()))?
    }
}

#[async_trait]
impl MediaProvider for GsmtcProvider {
    async fn current_session(&self) -> Result<Option<String>, ProviderError> {
        self.ask(Request::CurrentSession).await
    }

    async fn properties(&self, source_id: &str) -> Result<Option<MediaProperties>, ProviderError> {
        let id = source_id.to_string();
        self.ask(|reply| Request::Properties(id, reply)).await
    }

    async fn playback_status(&self, source_id: &str) -> Result<PlaybackStatus, ProviderError> {
        let id = source_id.to_string();
        self.ask(|reply| Request::Status(id, reply)).await
    }

    async fn thumbnail(&self, source_id: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        let id = source_id.to_string();
        self.ask(|reply| Request::Thumbnail(id, reply)).await
    }

    fn subscribe(&self, tx: mpsc::UnboundedSender<MediaNotification>) {
        let _ = self.requests.send(Request::Subscribe(tx));
    }
}

struct Worker {
    manager: SessionManager,
    subscribers: Vec<mpsc::UnboundedSender<MediaNotification>>,
    /// Sessions whose change events are already hooked
    hooked: HashSet<String>,
}

impl Worker {
    fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            subscribers: Vec::new(),
            hooked: HashSet::new(),
        }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = rx.blocking_recv() {
            match request {
                Request::CurrentSession(reply) => {
                    let _ = reply.send(Ok(self.current_session()));
                },
                Request::Properties(id, reply) => {
                    let _ = reply.send(self.properties(&id));
                },
                Request::Status(id, reply) => {
                    let _ = reply.send(self.status(&id));
                },
                Request::Thumbnail(id, reply) => {
                    let _ = reply.send(self.thumbnail(&id));
                },
                Request::Subscribe(tx) => self.subscribe(tx),
            }
        }
        debug!("Media worker stopped");
    }

    fn subscribe(&mut self, tx: mpsc::UnboundedSender<MediaNotification>) {
        if self.subscribers.is_empty() {
            let handler_tx = tx.clone();
            let hooked = self.manager.CurrentSessionChanged(&TypedEventHandler::new(move |_, _| {
                let _ = handler_tx.send(MediaNotification::CurrentSessionChanged);
                Ok(())
            }));
            if let Err(e) = hooked {
                warn!("Could not subscribe to media session changes: {}", e);
            }
        }
        self.subscribers.push(tx);
    }

    fn current_session(&mut self) -> Option<String> {
        let session = self.manager.GetCurrentSession().ok()?;
        let id = session.SourceAppUserModelId().ok()?.to_string();
        self.hook_session(&session, &id);
        Some(id)
    }

    fn hook_session(&mut self, session: &Session, id: &str) {
        if self.subscribers.is_empty() || !self.hooked.insert(id.to_string()) {
            return;
        }
        for tx in &self.subscribers {
            let props_tx = tx.clone();
            let _ = session.MediaPropertiesChanged(&TypedEventHandler::new(move |_, _| {
                let _ = props_tx.send(MediaNotification::PropertiesChanged);
                Ok(())
            }));
            let playback_tx = tx.clone();
            let _ = session.PlaybackInfoChanged(&TypedEventHandler::new(move |_, _| {
                let _ = playback_tx.send(MediaNotification::PropertiesChanged);
                Ok(())
            }));
        }
        debug!("Hooked media session {}", id);
    }

    fn find(&self, id: &str) -> Result<Option<Session>, ProviderError> {
        let wanted = HSTRING::from(id);
        let sessions = self.manager.GetSessions().map_err(media_err)?;
        for session in sessions {
            if session.SourceAppUserModelId().ok().as_ref() == Some(&wanted) {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    fn properties(&self, id: &str) -> Result<Option<MediaProperties>, ProviderError> {
        let Some(session) = self.find(id)? else {
            return Ok(None);
        };
        let props = session
            .TryGetMediaPropertiesAsync()
            .and_then(|op| op.get())
            .map_err(media_err)?;

        Ok(Some(MediaProperties {
            title: props.Title().map(|s| s.to_string()).unwrap_or_default(),
            artist: props.Artist().map(|s| s.to_string()).unwrap_or_default(),
            album: props.AlbumTitle().map(|s| s.to_string()).unwrap_or_default(),
            has_thumbnail: props.Thumbnail().is_ok(),
        }))
    }

    fn status(&self, id: &str) -> Result<PlaybackStatus, ProviderError> {
        let Some(session) = self.find(id)? else {
            return Ok(PlaybackStatus::Closed);
        };
        let status = session
            .GetPlaybackInfo()
            .and_then(|info| info.PlaybackStatus())
            .map_err(media_err)?;

        Ok(match status {
            WinStatus::Closed => PlaybackStatus::Closed,
            WinStatus::Opened => PlaybackStatus::Opened,
            WinStatus::Changing => PlaybackStatus::Changing,
            WinStatus::Stopped => PlaybackStatus::Stopped,
            WinStatus::Playing => PlaybackStatus::Playing,
            WinStatus::Paused => PlaybackStatus::Paused,
            _ => PlaybackStatus::Unknown,
        })
    }

    fn thumbnail(&self, id: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        let Some(session) = self.find(id)? else {
            return Ok(None);
        };
        let props = session
            .TryGetMediaPropertiesAsync()
            .and_then(|op| op.get())
            .map_err(media_err)?;
        let Ok(reference) = props.Thumbnail() else {
            return Ok(None);
        };

        let stream = reference
            .OpenReadAsync()
            .and_then(|op| op.get())
            .map_err(media_err)?;
        let size = stream.Size().map_err(media_err)? as u32;
        if size == 0 {
            return Ok(None);
        }

        let input: IInputStream = stream.cast().map_err(media_err)?;
        let reader = DataReader::CreateDataReader(&input).map_err(media_err)?;
        let loaded = reader
            .LoadAsync(size)
            .and_then(|op| op.get())
            .map_err(media_err)?;

        let mut bytes = vec![0u8; loaded as usize];
        reader.ReadBytes(&mut bytes).map_err(media_err)?;
        Ok(Some(bytes))
    }
}

fn media_err(e: windows::core::Error) -> ProviderError {
    ProviderError::Media(e.to_string())
}
