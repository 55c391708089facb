//! Whitelisted process watcher
//!
//! Audio sessions of a freshly started program are not always announced by
//! the mixer, so the process list is polled as well. Any start or stop of a
//! whitelisted program asks the routing controller for one rebuild.

use std::collections::HashSet;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::audio::{RebuildReason, RoutingController};
use crate::shutdown::ShutdownSignal;

/// A running process, identified by normalized name and pid
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessEntry {
    pub name: String,
    pub pid: u32,
}

/// Source of the current OS process list
pub trait ProcessSource: Send {
    /// Raw (name, pid) pairs; names as the OS reports them
    fn snapshot(&mut self) -> Vec<(String, u32)>;
}

/// Process list via `sysinfo`
pub struct SysinfoProcessSource {
    system: System,
}

impl SysinfoProcessSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoProcessSource {
    fn snapshot(&mut self) -> Vec<(String, u32)> {
        self.system.refresh_processes();
        self.system
            .processes()
            .iter()
            .map(|(pid, process)| (process.name().to_string(), pid.as_u32()))
            .collect()
    }
}

/// Lowercase and strip the extension: `Game.EXE` -> `game`
pub fn normalize_process_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}

/// Processes that appeared and disappeared between two polls
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProcessDiff {
    pub added: Vec<ProcessEntry>,
    pub removed: Vec<ProcessEntry>,
}

impl ProcessDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct WhitelistProcessWatcher<S> {
    source: S,
    whitelist: HashSet<String>,
    known: HashSet<ProcessEntry>,
}

impl<S: ProcessSource> WhitelistProcessWatcher<S> {
    pub fn new(source: S, whitelist: &[String]) -> Self {
        Self {
            source,
            whitelist: whitelist.iter().map(|n| normalize_process_name(n)).collect(),
            known: HashSet::new(),
        }
    }

    /// Snapshot, diff against the previous snapshot and remember the new one
    pub fn poll_once(&mut self) -> ProcessDiff {
        let current: HashSet<ProcessEntry> = self
            .source
            .snapshot()
            .into_iter()
            .map(|(name, pid)| ProcessEntry {
                name: normalize_process_name(&name),
                pid,
            })
            .filter(|p| self.whitelist.contains(&p.name))
            .collect();

        let mut added: Vec<ProcessEntry> = current.difference(&self.known).cloned().collect();
        let mut removed: Vec<ProcessEntry> = self.known.difference(&current).cloned().collect();
        added.sort();
        removed.sort();

        self.known = current;
        ProcessDiff { added, removed }
    }

    /// Currently tracked whitelisted processes
    pub fn known(&self) -> &HashSet<ProcessEntry> {
        &self.known
    }
}

impl<S: ProcessSource + 'static> WhitelistProcessWatcher<S> {
    /// Poll every `interval` until shutdown
    pub async fn run(
        mut self,
        controller: RoutingController,
        interval: Duration,
        mut shutdown: ShutdownSignal,
    ) {
        if self.whitelist.is_empty() {
            debug!("Process whitelist is empty, watcher not started");
            return;
        }
        info!("👀 Watching {} whitelisted processes", self.whitelist.len());

        let mut first = true;
        loop {
            let polled = tokio::task::spawn_blocking(move || {
                let diff = self.poll_once();
                (self, diff)
            })
            .await;

            let diff = match polled {
                Ok((watcher, diff)) => {
                    self = watcher;
                    diff
                },
                Err(e) => {
                    warn!("Process watcher stopped: {}", e);
                    return;
                },
            };

            // The first poll only establishes the baseline
            if !first && !diff.is_empty() {
                for p in &diff.added {
                    info!("▶ Process started: {} (pid {})", p.name, p.pid);
                }
                for p in &diff.removed {
                    info!("⏹ Process stopped: {} (pid {})", p.name, p.pid);
                }
                controller.request(RebuildReason::ProcessesChanged);
            }
            first = false;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown.wait() => break,
            }
        }
        debug!("Process watcher stopped");
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeProcessSource;
    use super::*;
    use crate::audio::fake::FakeMixer;
    use crate::audio::SessionRoutingTable;
    use crate::config::SessionGroups;
    use crate::shutdown;
    use std::sync::Arc;

    #[test]
    fn test_normalize_process_name() {
        assert_eq!(normalize_process_name("Game.EXE"), "game");
        assert_eq!(normalize_process_name("spotify"), "spotify");
        assert_eq!(normalize_process_name(".hidden"), ".hidden");
        assert_eq!(normalize_process_name("my.app.exe"), "my.app");
    }

    #[test]
    fn test_diff_both_directions() {
        let source = FakeProcessSource::scripted(vec![
            vec![("game.exe", 10), ("explorer.exe", 1)],
            vec![("Game.exe", 11), ("explorer.exe", 1)],
            vec![("Game.exe", 11)],
        ]);
        let mut watcher = WhitelistProcessWatcher::new(source, &["game.exe".to_string()]);

        let diff = watcher.poll_once();
        assert_eq!(diff.added, vec![ProcessEntry { name: "game".into(), pid: 10 }]);

        // restarted under a new pid
        let diff = watcher.poll_once();
        assert_eq!(diff.added, vec![ProcessEntry { name: "game".into(), pid: 11 }]);
        assert_eq!(diff.removed, vec![ProcessEntry { name: "game".into(), pid: 10 }]);

        // non-whitelisted churn is invisible
        assert!(watcher.poll_once().is_empty());
        assert_eq!(watcher.known().len(), 1);
    }

    #[tokio::test]
    async fn test_game_start_triggers_one_rebuild() {
        let source = FakeProcessSource::scripted(vec![
            vec![("explorer.exe", 1)],
            vec![("explorer.exe", 1), ("game.exe", 42)],
        ]);
        let watcher = WhitelistProcessWatcher::new(source, &["game.exe".to_string()]);

        let mixer = Arc::new(FakeMixer::with_streams(&["game"]));
        let routing = Arc::new(SessionRoutingTable::new(
            &["game".to_string()],
            &SessionGroups::default(),
        ));
        let (trigger, signal) = shutdown::channel();
        let (controller, _handle) =
            RoutingController::spawn(routing.clone(), mixer.clone(), signal.clone());
        let mut completed = controller.completed();

        let task = tokio::spawn(watcher.run(controller, Duration::from_millis(10), signal));

        tokio::time::timeout(Duration::from_secs(2), completed.wait_for(|n| *n >= 1))
            .await
            .unwrap()
            .unwrap();
        // several more polls with an unchanged list
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(*mixer.listing_calls.lock(), 1);
        assert_eq!(routing.streams_for("game").len(), 1);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
