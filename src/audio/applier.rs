//! Fire-and-forget volume application
//!
//! The serial receive path hands slider updates to a fixed pool of workers
//! through bounded queues and returns immediately. Each slider always lands
//! on the same worker, so its updates apply in order; a worker that falls
//! behind collapses queued updates for the same target to the newest one.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::routing::SessionRoutingTable;
use super::AudioMixer;

/// One debounced slider movement
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeUpdate {
    /// Position of the slider in the telemetry frame
    pub slider_index: usize,
    /// Configured slider id
    pub target: String,
    /// Normalized level, 0.0-1.0
    pub level: f32,
}

/// Bounded worker pool applying volume updates off the receive path
pub struct VolumeApplier {
    queues: Vec<mpsc::Sender<VolumeUpdate>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl VolumeApplier {
    /// Spawn `workers` tasks, each with a queue of `queue_len` updates
    pub fn spawn(
        routing: Arc<SessionRoutingTable>,
        mixer: Arc<dyn AudioMixer>,
        workers: usize,
        queue_len: usize,
    ) -> Self {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_len.max(1));
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(
                id,
                rx,
                Arc::clone(&routing),
                Arc::clone(&mixer),
            )));
        }

        debug!("Volume applier started with {} workers", workers);
        Self {
            queues,
            workers: Mutex::new(handles),
        }
    }

    /// Queue an update without waiting
    ///
    /// Returns false if the worker's queue is full or the pool is shut down;
    /// the update is dropped in that case.
    pub fn submit(&self, update: VolumeUpdate) -> bool {
        let queue = &self.queues[update.slider_index % self.queues.len()];
        match queue.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                warn!(
                    "Volume queue full, dropping update for '{}' ({:.3})",
                    update.target, update.level
                );
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting updates and wait for queued ones to drain
    pub async fn shutdown(self) {
        drop(self.queues);
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Volume worker ended abnormally: {}", e);
            }
        }
        debug!("Volume applier stopped");
    }
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<VolumeUpdate>,
    routing: Arc<SessionRoutingTable>,
    mixer: Arc<dyn AudioMixer>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        for update in coalesce(batch) {
            trace!("Worker {} applying {} = {:.3}", id, update.target, update.level);
            let routing = Arc::clone(&routing);
            let mixer = Arc::clone(&mixer);
            let result = tokio::task::spawn_blocking(move || {
                routing.apply(mixer.as_ref(), &update.target, update.level)
            })
            .await;

            if let Err(e) = result {
                warn!("Volume worker {} task failed: {}", id, e);
            }
        }
    }
}

/// Keep only the newest update per target, in order of last arrival
fn coalesce(batch: Vec<VolumeUpdate>) -> Vec<VolumeUpdate> {
    let mut out: Vec<VolumeUpdate> = Vec::with_capacity(batch.len());
    for update in batch {
        out.retain(|u| u.target != update.target);
        out.push(update);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::{FakeMixer, MixerCall};
    use crate::audio::AudioStream;
    use crate::config::SessionGroups;

    fn update(idx: usize, target: &str, level: f32) -> VolumeUpdate {
        VolumeUpdate {
            slider_index: idx,
            target: target.to_string(),
            level,
        }
    }

    #[test]
    fn test_coalesce_keeps_latest_per_target() {
        let batch = vec![
            update(0, "spotify", 0.1),
            update(1, "discord", 0.2),
            update(0, "spotify", 0.3),
        ];
        let out = coalesce(batch);
        assert_eq!(out, vec![update(1, "discord", 0.2), update(0, "spotify", 0.3)]);
    }

    #[tokio::test]
    async fn test_updates_reach_the_mixer() {
        let mixer = Arc::new(FakeMixer::default());
        let routing = Arc::new(SessionRoutingTable::new(
            &["master".to_string(), "spotify".to_string()],
            &SessionGroups::default(),
        ));
        routing.rebuild(vec![AudioStream::new("1", "Spotify")]);

        let applier = VolumeApplier::spawn(routing, mixer.clone(), 2, 8);
        assert!(applier.submit(update(0, "master", 1.0)));
        assert!(applier.submit(update(1, "spotify", 0.5)));
        applier.shutdown().await;

        let mut calls = mixer.calls();
        calls.sort_by_key(|c| format!("{:?}", c));
        assert_eq!(
            calls,
            vec![
                MixerCall::Master { percent: 100 },
                MixerCall::Stream { name: "Spotify".into(), percent: 50 },
            ]
        );
    }

    #[tokio::test]
    async fn test_same_slider_applies_in_order() {
        let mixer = Arc::new(FakeMixer::default());
        let routing = Arc::new(SessionRoutingTable::new(
            &["master".to_string()],
            &SessionGroups::default(),
        ));

        let applier = VolumeApplier::spawn(routing, mixer.clone(), 3, 16);
        for level in [0.1, 0.2, 0.3, 0.4] {
            applier.submit(update(0, "master", level));
        }
        applier.shutdown().await;

        let calls = mixer.calls();
        assert_eq!(calls.last(), Some(&MixerCall::Master { percent: 40 }));
        let percents: Vec<u8> = calls
            .iter()
            .map(|c| match c {
                MixerCall::Master { percent } => *percent,
                _ => unreachable!(),
            })
            .collect();
        let mut sorted = percents.clone();
        sorted.sort();
        assert_eq!(percents, sorted);
    }
}
