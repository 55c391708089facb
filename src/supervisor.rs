//! Connection supervisor
//!
//! Keeps the serial link up: opens the port, retries forever with a fixed
//! backoff, feeds received telemetry into the decoder and falls back to
//! retrying whenever the link fails. Nothing here is fatal.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::audio::{RebuildReason, RoutingController, VolumeApplier};
use crate::input::SliderInputDecoder;
use crate::media::MediaNotification;
use crate::shutdown::ShutdownSignal;
use crate::transport::{EventSender, SharedTransport, Transport, TransportEvent};

/// Link state as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub port: String,
    pub baud_rate: u32,
    pub backoff: Duration,
}

enum Served {
    LinkLost(String),
    Shutdown,
}

pub struct ConnectionSupervisor {
    transport: SharedTransport,
    config: SupervisorConfig,
    decoder: SliderInputDecoder,
    applier: VolumeApplier,
    controller: RoutingController,
    media: Option<mpsc::UnboundedSender<MediaNotification>>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    state: watch::Sender<LinkState>,
    connections: u64,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: SharedTransport,
        config: SupervisorConfig,
        decoder: SliderInputDecoder,
        applier: VolumeApplier,
        controller: RoutingController,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            transport,
            config,
            decoder,
            applier,
            controller,
            media: None,
            events_tx,
            events_rx,
            state,
            connections: 0,
        }
    }

    /// Ask the now-playing watcher for a re-send after each reconnect
    pub fn with_media(mut self, notifier: mpsc::UnboundedSender<MediaNotification>) -> Self {
        self.media = Some(notifier);
        self
    }

    /// Channel for reporting link failures from other writers
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Run until shutdown, then close the port and drain pending volume work
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        while !shutdown.is_triggered() {
            self.state.send_replace(LinkState::Connecting);
            // Leftovers from the previous connection must not kill the new one
            while self.events_rx.try_recv().is_ok() {}

            match self.open().await {
                Ok(()) => {
                    self.state.send_replace(LinkState::Connected);
                    self.on_connected();

                    let served = self.serve(&mut shutdown).await;
                    self.close().await;
                    self.state.send_replace(LinkState::Disconnected);

                    match served {
                        Served::LinkLost(reason) => warn!("⚠️ Device link lost: {}", reason),
                        Served::Shutdown => break,
                    }
                },
                Err(reason) => {
                    self.state.send_replace(LinkState::Disconnected);
                    warn!(
                        "Could not open {}: {} (retrying in {}s)",
                        self.config.port,
                        reason,
                        self.config.backoff.as_secs_f32()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.backoff) => {},
                        _ = shutdown.wait() => break,
                    }
                },
            }
        }

        self.close().await;
        self.state.send_replace(LinkState::Disconnected);
        self.applier.shutdown().await;
        debug!("Connection supervisor stopped");
    }

    async fn open(&self) -> Result<(), String> {
        let transport = self.transport.clone();
        let port = self.config.port.clone();
        let baud = self.config.baud_rate;
        let events = self.events_tx.clone();

        tokio::task::spawn_blocking(move || transport.lock().open(&port, baud, events))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    async fn close(&self) {
        let transport = self.transport.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || transport.lock().close()).await {
            warn!("Closing the serial port failed: {}", e);
        }
    }

    fn on_connected(&mut self) {
        self.connections += 1;
        info!("🔗 Device connected on {}", self.config.port);

        self.decoder.reset();
        if self.connections > 1 {
            self.controller.request(RebuildReason::Reconnected);
        }
        if let Some(media) = &self.media {
            let _ = media.send(MediaNotification::Resync);
        }
    }

    async fn serve(&mut self, shutdown: &mut ShutdownSignal) -> Served {
        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                _ = shutdown.wait() => return Served::Shutdown,
            };

            match event {
                Some(TransportEvent::Line(line)) => self.handle_line(&line),
                Some(TransportEvent::Closed(reason)) => return Served::LinkLost(reason),
                // We hold a sender ourselves, so this cannot happen
                None => return Served::Shutdown,
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        trace!("RX {}", line);
        for update in self.decoder.decode(line) {
            let index = update.slider_index;
            if !self.applier.submit(update) {
                // Let the next frame re-issue it
                self.decoder.forget(index);
            }
        }
    }
}
