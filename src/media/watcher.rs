//! Now-playing state machine
//!
//! Tracks the session owning the transport controls and reports title
//! changes and covers. Provider notifications and a watchdog tick feed the
//! same logic, because some players stop emitting property events after the
//! first track. A cover is fetched, encoded and handed to the device link on
//! a separate task that stays in flight until the link answers. At most one
//! cover is in flight and each track gets at most one delivered cover.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{Cover, CoverEncoder, MediaEvent, MediaNotification, MediaProvider, PlaybackStatus};
use crate::protocol::SongInfo;
use crate::shutdown::ShutdownSignal;

/// What the watcher currently believes is playing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlayingState {
    /// Tracked session; `None` while no session owns the controls
    pub source_id: Option<String>,
    /// Last reported title, empty before the first song
    pub title: String,
    pub cover_sent: bool,
}

struct CoverOutcome {
    title: String,
    sent: bool,
}

/// Reports the end of a cover attempt when dropped, however it ended
struct CoverAttempt {
    title: String,
    sent: bool,
    done: mpsc::UnboundedSender<CoverOutcome>,
}

impl Drop for CoverAttempt {
    fn drop(&mut self) {
        let _ = self.done.send(CoverOutcome {
            title: std::mem::take(&mut self.title),
            sent: self.sent,
        });
    }
}

enum Step {
    Notification(MediaNotification),
    CoverDone(CoverOutcome),
    Watchdog,
    Stop,
}

pub struct NowPlayingWatcher {
    provider: Arc<dyn MediaProvider>,
    encoder: CoverEncoder,
    events: mpsc::UnboundedSender<MediaEvent>,
    state: NowPlayingState,
    last_status: Option<PlaybackStatus>,
    cover_in_flight: bool,
    notify_tx: mpsc::UnboundedSender<MediaNotification>,
    notify_rx: mpsc::UnboundedReceiver<MediaNotification>,
    cover_tx: mpsc::UnboundedSender<CoverOutcome>,
    cover_rx: mpsc::UnboundedReceiver<CoverOutcome>,
}

impl NowPlayingWatcher {
    /// Create the watcher and subscribe it to the provider's notifications
    pub fn new(
        provider: Arc<dyn MediaProvider>,
        encoder: CoverEncoder,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (cover_tx, cover_rx) = mpsc::unbounded_channel();
        provider.subscribe(notify_tx.clone());

        Self {
            provider,
            encoder,
            events,
            state: NowPlayingState::default(),
            last_status: None,
            cover_in_flight: false,
            notify_tx,
            notify_rx,
            cover_tx,
            cover_rx,
        }
    }

    /// Sender for injecting notifications, e.g. [`MediaNotification::Resync`]
    pub fn notifier(&self) -> mpsc::UnboundedSender<MediaNotification> {
        self.notify_tx.clone()
    }

    pub fn state(&self) -> &NowPlayingState {
        &self.state
    }

    /// Process notifications and watchdog ticks until shutdown
    pub async fn run(mut self, watchdog: Duration, mut shutdown: ShutdownSignal) {
        info!("🎵 Now-playing watcher started");
        self.update_current_session().await;

        let mut ticker = tokio::time::interval(watchdog);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            let step = tokio::select! {
                Some(n) = self.notify_rx.recv() => Step::Notification(n),
                Some(outcome) = self.cover_rx.recv() => Step::CoverDone(outcome),
                _ = ticker.tick() => Step::Watchdog,
                _ = shutdown.wait() => Step::Stop,
            };

            match step {
                Step::Notification(n) => self.handle(n).await,
                Step::CoverDone(outcome) => self.finish_cover(outcome),
                Step::Watchdog => self.on_watchdog().await,
                Step::Stop => break,
            }
        }
        debug!("Now-playing watcher stopped");
    }

    async fn handle(&mut self, notification: MediaNotification) {
        trace!("Media notification: {:?}", notification);
        match notification {
            MediaNotification::CurrentSessionChanged => {
                info!("♻️ Media source changed");
                self.update_current_session().await;
            },
            MediaNotification::PropertiesChanged => self.process_media().await,
            MediaNotification::Resync => self.resync().await,
        }
    }

    async fn on_watchdog(&mut self) {
        if self.state.source_id.is_some() {
            self.process_media().await;
        } else {
            self.update_current_session().await;
        }
    }

    /// Forget the reported song so it and its cover are sent again
    async fn resync(&mut self) {
        debug!("Re-sending now-playing state");
        self.state.title.clear();
        self.state.cover_sent = false;
        self.process_media().await;
    }

    async fn update_current_session(&mut self) {
        match self.provider.current_session().await {
            Ok(Some(id)) => {
                if self.state.source_id.as_deref() == Some(id.as_str()) {
                    return;
                }
                info!("Tracking media session {}", id);
                // Titles are compared per session
                self.state = NowPlayingState {
                    source_id: Some(id),
                    ..NowPlayingState::default()
                };
                self.last_status = None;
                self.process_media().await;
            },
            Ok(None) => {
                if let Some(old) = self.state.source_id.take() {
                    debug!("Media session {} went away", old);
                }
            },
            Err(e) => debug!("Could not query current media session: {}", e),
        }
    }

    async fn process_media(&mut self) {
        let Some(source_id) = self.state.source_id.clone() else {
            return;
        };

        match self.provider.playback_status(&source_id).await {
            Ok(status) if self.last_status != Some(status) => {
                debug!("{}: playback {:?}", source_id, status);
                self.last_status = Some(status);
            },
            Ok(_) => {},
            Err(e) => trace!("{}: no playback info ({})", source_id, e),
        }

        let props = match self.provider.properties(&source_id).await {
            Ok(Some(props)) => props,
            Ok(None) => {
                debug!("Media session {} is gone", source_id);
                self.state.source_id = None;
                return;
            },
            Err(e) => {
                debug!("{}: could not read media properties ({})", source_id, e);
                return;
            },
        };

        if props.title != self.state.title {
            // Players briefly report an empty title while switching tracks
            if props.title.is_empty() {
                return;
            }
            self.state = NowPlayingState {
                source_id: Some(source_id.clone()),
                title: props.title.clone(),
                cover_sent: false,
            };
            info!("🎵 Now playing: {} - {}", props.title, props.artist);
            let _ = self.events.send(MediaEvent::SongChanged(SongInfo {
                source_id: source_id.clone(),
                title: props.title.clone(),
                artist: props.artist.clone(),
                album: props.album.clone(),
            }));
        }

        if props.has_thumbnail
            && !self.state.title.is_empty()
            && !self.state.cover_sent
            && !self.cover_in_flight
        {
            self.start_cover(source_id);
        }
    }

    fn start_cover(&mut self, source_id: String) {
        self.cover_in_flight = true;

        let attempt = CoverAttempt {
            title: self.state.title.clone(),
            sent: false,
            done: self.cover_tx.clone(),
        };
        let provider = Arc::clone(&self.provider);
        let encoder = self.encoder;
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut attempt = attempt;
            let raw = match provider.thumbnail(&source_id).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!("{}: thumbnail not available yet", source_id);
                    return;
                },
                Err(e) => {
                    debug!("{}: thumbnail fetch failed ({})", source_id, e);
                    return;
                },
            };

            match tokio::task::spawn_blocking(move || encoder.encode(&raw)).await {
                Ok(Ok(jpeg)) => {
                    info!("📤 Cover ready ({} bytes)", jpeg.len());
                    let (cover, delivered) = Cover::new(jpeg);
                    if events.send(MediaEvent::CoverReady(cover)).is_ok() {
                        attempt.sent = delivered.await.unwrap_or(false);
                    }
                    if !attempt.sent {
                        debug!("Cover for '{}' not delivered, will retry", attempt.title);
                    }
                },
                Ok(Err(e)) => warn!("Cover conversion failed: {}", e),
                Err(e) => warn!("Cover conversion task failed: {}", e),
            }
        });
    }

    fn finish_cover(&mut self, outcome: CoverOutcome) {
        self.cover_in_flight = false;
        if outcome.sent && outcome.title == self.state.title {
            self.state.cover_sent = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::cover::sample_png;
    use crate::media::fake::FakeMediaProvider;
    use crate::shutdown;

    /// Stands in for the device link: records songs, answers covers
    struct Device {
        rx: mpsc::UnboundedReceiver<MediaEvent>,
        accept: bool,
        songs: Vec<SongInfo>,
        covers: usize,
    }

    impl Device {
        fn take(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                match event {
                    MediaEvent::SongChanged(song) => self.songs.push(song),
                    MediaEvent::CoverReady(cover) => {
                        self.covers += 1;
                        let (_, delivered) = cover.into_parts();
                        let _ = delivered.send(self.accept);
                    },
                }
            }
        }

        fn titles(&mut self) -> Vec<String> {
            self.take();
            self.songs.drain(..).map(|s| s.title).collect()
        }
    }

    fn setup() -> (Arc<FakeMediaProvider>, NowPlayingWatcher, Device) {
        let provider = Arc::new(FakeMediaProvider::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = NowPlayingWatcher::new(provider.clone(), CoverEncoder::default(), tx);
        let device = Device {
            rx,
            accept: true,
            songs: Vec::new(),
            covers: 0,
        };
        (provider, watcher, device)
    }

    async fn settle_cover(watcher: &mut NowPlayingWatcher, device: &mut Device) {
        while watcher.cover_in_flight {
            device.take();
            let outcome = tokio::select! {
                Some(outcome) = watcher.cover_rx.recv() => Some(outcome),
                _ = tokio::time::sleep(Duration::from_millis(5)) => None,
            };
            if let Some(outcome) = outcome {
                watcher.finish_cover(outcome);
            }
        }
        device.take();
    }

    #[tokio::test]
    async fn test_song_change_fires_once() {
        let (provider, mut watcher, mut device) = setup();
        provider.play("Spotify.exe", "", "");

        watcher.on_watchdog().await;
        assert_eq!(watcher.state().source_id.as_deref(), Some("Spotify.exe"));
        assert!(device.titles().is_empty());

        provider.play("Spotify.exe", "Song A", "Artist");
        for _ in 0..5 {
            watcher.on_watchdog().await;
        }

        device.take();
        assert_eq!(device.songs.len(), 1);
        assert_eq!(device.songs[0].title, "Song A");
        assert_eq!(device.songs[0].source_id, "Spotify.exe");
        assert_eq!(device.songs[0].artist, "Artist");
    }

    #[tokio::test]
    async fn test_empty_title_gap_is_not_a_song_change() {
        let (provider, mut watcher, mut device) = setup();
        provider.play("app", "Song A", "");
        watcher.on_watchdog().await;

        provider.play("app", "", "");
        watcher.on_watchdog().await;
        provider.play("app", "Song A", "");
        watcher.on_watchdog().await;

        assert_eq!(device.titles(), vec!["Song A".to_string()]);
    }

    #[tokio::test]
    async fn test_cover_sent_once_per_track() {
        let (provider, mut watcher, mut device) = setup();
        *provider.thumbnail.lock() = Some(sample_png(64, 64));
        provider.play("app", "Song A", "");

        watcher.on_watchdog().await;
        assert!(watcher.cover_in_flight);
        // still in flight, must not start another
        watcher.on_watchdog().await;
        settle_cover(&mut watcher, &mut device).await;
        assert!(watcher.state().cover_sent);

        for _ in 0..5 {
            watcher.on_watchdog().await;
            settle_cover(&mut watcher, &mut device).await;
        }
        assert_eq!(device.covers, 1);
        assert_eq!(*provider.thumbnail_calls.lock(), 1);

        provider.play("app", "Song B", "");
        watcher.on_watchdog().await;
        settle_cover(&mut watcher, &mut device).await;
        assert_eq!(device.titles(), vec!["Song A".to_string(), "Song B".to_string()]);
        assert_eq!(device.covers, 2);
    }

    #[tokio::test]
    async fn test_cover_stays_in_flight_until_answered() {
        let (provider, mut watcher, mut device) = setup();
        *provider.thumbnail.lock() = Some(sample_png(16, 16));
        provider.play("app", "Song A", "");
        watcher.on_watchdog().await;

        // encoded and queued, but nobody answered yet
        while device.rx.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for _ in 0..3 {
            watcher.on_watchdog().await;
        }
        assert!(watcher.cover_in_flight);
        assert!(!watcher.state().cover_sent);
        assert_eq!(*provider.thumbnail_calls.lock(), 1);

        settle_cover(&mut watcher, &mut device).await;
        assert!(watcher.state().cover_sent);
        assert_eq!(device.covers, 1);
    }

    #[tokio::test]
    async fn test_refused_cover_is_retried() {
        let (provider, mut watcher, mut device) = setup();
        *provider.thumbnail.lock() = Some(sample_png(16, 16));
        device.accept = false;
        provider.play("app", "Song A", "");

        watcher.on_watchdog().await;
        settle_cover(&mut watcher, &mut device).await;
        assert!(!watcher.state().cover_sent);

        device.accept = true;
        watcher.on_watchdog().await;
        settle_cover(&mut watcher, &mut device).await;

        assert!(watcher.state().cover_sent);
        assert_eq!(device.covers, 2);
    }

    #[tokio::test]
    async fn test_failed_cover_is_retried() {
        let (provider, mut watcher, mut device) = setup();
        *provider.thumbnail.lock() = Some(b"broken".to_vec());
        provider.play("app", "Song A", "");

        watcher.on_watchdog().await;
        settle_cover(&mut watcher, &mut device).await;
        assert!(!watcher.state().cover_sent);
        assert!(!watcher.cover_in_flight);

        *provider.thumbnail.lock() = Some(sample_png(32, 32));
        watcher.on_watchdog().await;
        settle_cover(&mut watcher, &mut device).await;

        assert!(watcher.state().cover_sent);
        assert_eq!(device.covers, 1);
    }

    #[tokio::test]
    async fn test_resync_repeats_song() {
        let (provider, mut watcher, mut device) = setup();
        provider.play("app", "Song A", "");
        watcher.on_watchdog().await;

        watcher.handle(MediaNotification::Resync).await;
        assert_eq!(
            device.titles(),
            vec!["Song A".to_string(), "Song A".to_string()]
        );
    }

    #[tokio::test]
    async fn test_session_switch_and_loss() {
        let (provider, mut watcher, mut device) = setup();
        provider.play("spotify", "Song A", "");
        watcher.on_watchdog().await;

        provider.play("chrome", "Video", "");
        watcher.handle(MediaNotification::CurrentSessionChanged).await;
        assert_eq!(watcher.state().source_id.as_deref(), Some("chrome"));

        provider.sessions.lock().clear();
        *provider.current.lock() = None;
        watcher.on_watchdog().await;
        assert_eq!(watcher.state().source_id, None);

        assert_eq!(
            device.titles(),
            vec!["Song A".to_string(), "Video".to_string()]
        );
    }

    #[tokio::test]
    async fn test_same_title_on_new_session_is_reported() {
        let (provider, mut watcher, mut device) = setup();
        *provider.thumbnail.lock() = Some(sample_png(16, 16));
        provider.play("spotify", "Song A", "");
        watcher.on_watchdog().await;
        settle_cover(&mut watcher, &mut device).await;

        provider.play("chrome", "Song A", "");
        watcher.handle(MediaNotification::CurrentSessionChanged).await;
        settle_cover(&mut watcher, &mut device).await;

        device.take();
        let sources: Vec<&str> = device.songs.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(sources, vec!["spotify", "chrome"]);
        assert_eq!(device.covers, 2);
        assert!(watcher.state().cover_sent);
    }

    #[tokio::test]
    async fn test_run_reacts_to_provider_notifications() {
        let (provider, watcher, mut device) = setup();
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(watcher.run(Duration::from_secs(60), signal));

        provider.play("app", "Pushed", "");
        provider.notify(MediaNotification::CurrentSessionChanged);

        let event = tokio::time::timeout(Duration::from_secs(2), device.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, MediaEvent::SongChanged(song) if song.title == "Pushed"));

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
