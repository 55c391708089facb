//! Routing rebuild controller
//!
//! Owns the routing table's write side. Rebuild requests from the process
//! watcher, the mixer's session notifications, reconnects and startup are
//! funneled through one channel; requests that pile up while a rebuild runs
//! collapse into a single follow-up rebuild.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::routing::SessionRoutingTable;
use super::AudioMixer;
use crate::shutdown::ShutdownSignal;

/// Why a rebuild was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    Startup,
    /// The mixer reported a change in its session set
    SessionsChanged,
    /// A whitelisted process started or stopped
    ProcessesChanged,
    /// The device link came back
    Reconnected,
}

/// Handle for requesting routing rebuilds
#[derive(Clone)]
pub struct RoutingController {
    tx: mpsc::UnboundedSender<RebuildReason>,
    completed: watch::Receiver<u64>,
}

impl RoutingController {
    /// Spawn the controller task and hook up the mixer's change notifications
    pub fn spawn(
        routing: Arc<SessionRoutingTable>,
        mixer: Arc<dyn AudioMixer>,
        shutdown: ShutdownSignal,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (completed_tx, completed_rx) = watch::channel(0u64);

        let notify_tx = tx.clone();
        mixer.subscribe_session_changes(Arc::new(move || {
            let _ = notify_tx.send(RebuildReason::SessionsChanged);
        }));

        let handle = tokio::spawn(run(rx, routing, mixer, completed_tx, shutdown));

        (
            Self {
                tx,
                completed: completed_rx,
            },
            handle,
        )
    }

    /// Ask for a rebuild; never blocks
    pub fn request(&self, reason: RebuildReason) {
        if self.tx.send(reason).is_err() {
            debug!("Routing controller stopped, ignoring rebuild ({:?})", reason);
        }
    }

    /// Number of rebuild passes completed so far
    pub fn completed(&self) -> watch::Receiver<u64> {
        self.completed.clone()
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<RebuildReason>,
    routing: Arc<SessionRoutingTable>,
    mixer: Arc<dyn AudioMixer>,
    completed: watch::Sender<u64>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let reason = tokio::select! {
            reason = rx.recv() => match reason {
                Some(reason) => reason,
                None => break,
            },
            _ = shutdown.wait() => break,
        };

        let mut coalesced = 0usize;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!("Coalesced {} additional rebuild requests", coalesced);
        }

        info!("🔄 Rebuilding audio routing ({:?})", reason);
        let routing = Arc::clone(&routing);
        let mixer = Arc::clone(&mixer);
        let result = tokio::task::spawn_blocking(move || {
            mixer.active_streams().map(|streams| routing.rebuild(streams))
        })
        .await;

        match result {
            Ok(Ok(summary)) => info!(
                "Routing rebuilt: {} streams, {} mapped, {} sliders without a stream",
                summary.streams_seen, summary.streams_mapped, summary.empty_sliders
            ),
            // The previous table stays in place
            Ok(Err(e)) => warn!("Could not list audio streams, keeping old routing: {}", e),
            Err(e) => warn!("Routing rebuild task failed: {}", e),
        }

        completed.send_modify(|n| *n += 1);
    }

    debug!("Routing controller stopped");
}
