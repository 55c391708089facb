//! Device writer
//!
//! Single owner of outbound traffic. Song text and cover transfers are
//! serialized here so text never lands between image chunks: a song that
//! arrives during a transfer is written right after it, a cover that arrives
//! during a transfer is refused. Every cover is answered on its delivery
//! channel, so the watcher only counts covers that reached the wire. After
//! each cover the last song line is written once more, for receivers that
//! were busy drawing when it came.

use std::future::pending;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TuningConfig;
use crate::error::TransportError;
use crate::media::{Cover, MediaEvent};
use crate::protocol::{send_image, ImageTransferConfig};
use crate::shutdown::ShutdownSignal;
use crate::transport::{EventSender, SharedTransport, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub image: ImageTransferConfig,
    pub safety_resend: Duration,
}

impl From<&TuningConfig> for LinkConfig {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            image: ImageTransferConfig::from(tuning),
            safety_resend: tuning.safety_resend(),
        }
    }
}

type Transfer = JoinHandle<Result<usize, TransportError>>;

enum Step {
    Event(MediaEvent),
    TransferDone(Result<Result<usize, TransportError>, tokio::task::JoinError>),
    Resend,
    Stop,
}

pub struct DeviceLink {
    transport: SharedTransport,
    config: LinkConfig,
    /// Where write failures are reported, same channel as the reader's
    failures: EventSender,
    last_song: Option<String>,
    song_pending: bool,
    resend_at: Option<Instant>,
    transfer: Option<Transfer>,
    /// Answered when `transfer` finishes
    delivered: Option<oneshot::Sender<bool>>,
}

impl DeviceLink {
    pub fn new(transport: SharedTransport, config: LinkConfig, failures: EventSender) -> Self {
        Self {
            transport,
            config,
            failures,
            last_song: None,
            song_pending: false,
            resend_at: None,
            transfer: None,
            delivered: None,
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<MediaEvent>, mut shutdown: ShutdownSignal) {
        loop {
            let transferring = self.transfer.is_some();
            let resending = self.resend_at.is_some();
            let resend_at = self.resend_at.unwrap_or_else(Instant::now);
            let step = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => Step::Event(event),
                    None => Step::Stop,
                },
                result = wait_for(&mut self.transfer), if transferring => Step::TransferDone(result),
                _ = tokio::time::sleep_until(resend_at), if resending => Step::Resend,
                _ = shutdown.wait() => Step::Stop,
            };

            match step {
                Step::Event(MediaEvent::SongChanged(song)) => {
                    self.last_song = Some(song.to_message());
                    if self.transfer.is_some() {
                        self.song_pending = true;
                    } else {
                        self.write_last_song().await;
                    }
                },
                Step::Event(MediaEvent::CoverReady(cover)) => self.start_transfer(cover),
                Step::TransferDone(result) => self.finish_transfer(result).await,
                Step::Resend => {
                    self.resend_at = None;
                    debug!("Safety re-send of song text");
                    self.write_last_song().await;
                },
                Step::Stop => break,
            }
        }
        debug!("Device link stopped");
    }

    fn start_transfer(&mut self, cover: Cover) {
        let (jpeg, delivered) = cover.into_parts();
        if self.transfer.is_some() {
            debug!("Cover transfer in progress, refusing new cover ({} bytes)", jpeg.len());
            let _ = delivered.send(false);
            return;
        }
        self.resend_at = None;
        self.delivered = Some(delivered);

        let transport = self.transport.clone();
        let image = self.config.image;
        self.transfer = Some(tokio::task::spawn_blocking(move || {
            let mut transport = transport.lock();
            if !transport.is_open() {
                return Err(TransportError::NotConnected);
            }
            send_image(transport.as_mut(), &jpeg, &image)
        }));
    }

    async fn finish_transfer(&mut self, result: Result<Result<usize, TransportError>, tokio::task::JoinError>) {
        self.transfer = None;
        let sent = matches!(result, Ok(Ok(chunks)) if chunks > 0);
        if let Some(delivered) = self.delivered.take() {
            let _ = delivered.send(sent);
        }

        match result {
            Ok(Ok(0)) => {},
            Ok(Ok(chunks)) => {
                info!("🖼 Cover sent ({} chunks)", chunks);
                self.resend_at = Some(Instant::now() + self.config.safety_resend);
            },
            Ok(Err(e)) => self.report(e),
            Err(e) => warn!("Cover transfer task failed: {}", e),
        }

        if std::mem::take(&mut self.song_pending) {
            self.write_last_song().await;
        }
    }

    async fn write_last_song(&mut self) {
        let Some(message) = self.last_song.clone() else {
            return;
        };
        let transport = self.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.lock().send_text(&message)).await;

        match result {
            Ok(Ok(())) => debug!("Song text sent"),
            Ok(Err(e)) => self.report(e),
            Err(e) => warn!("Song write task failed: {}", e),
        }
    }

    fn report(&self, error: TransportError) {
        match error {
            TransportError::NotConnected => debug!("Device not connected, write skipped"),
            e => {
                warn!("Device write failed: {}", e);
                let _ = self.failures.send(TransportEvent::Closed(e.to_string()));
            },
        }
    }
}

async fn wait_for(transfer: &mut Option<Transfer>) -> Result<Result<usize, TransportError>, tokio::task::JoinError> {
    match transfer.as_mut() {
        Some(handle) => handle.await,
        None => pending().await,
    }
}
