//! Slider id -> audio stream routing table
//!
//! The table is never patched in place. `rebuild` builds a fresh map from the
//! live stream list and swaps it in behind an `Arc`, so a reader either sees
//! the old table or the new one, and lookups never wait for a rebuild to
//! enumerate sessions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{is_master, level_to_percent, AudioMixer, AudioStream};
use crate::config::SessionGroups;

/// Routing map keyed by lowercased slider id
pub type RoutingMap = HashMap<String, Vec<AudioStream>>;

/// Result of applying a level to a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Default device volume was set (or failed, see `ok`)
    Master { ok: bool },
    /// Volume was pushed to the bound streams
    Streams { applied: usize, failed: usize },
    /// Target unknown or currently bound to no stream
    Unrouted,
}

/// Counts reported after a rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildSummary {
    pub streams_seen: usize,
    pub streams_mapped: usize,
    pub empty_sliders: usize,
}

struct Group {
    slider: String,
    keywords: Vec<String>,
}

/// Slider -> stream routing table
pub struct SessionRoutingTable {
    /// Lowercased configured slider ids, in config order
    sliders: Vec<String>,
    /// Lowercased group definitions, in config order
    groups: Vec<Group>,
    table: RwLock<Arc<RoutingMap>>,
}

impl SessionRoutingTable {
    /// Create an empty table for the configured sliders and groups
    pub fn new(sliders: &[String], groups: &SessionGroups) -> Self {
        let sliders: Vec<String> = sliders.iter().map(|s| s.to_lowercase()).collect();
        let groups = groups
            .iter()
            .map(|(slider, keywords)| Group {
                slider: slider.to_lowercase(),
                keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            })
            .collect();

        Self {
            sliders,
            groups,
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Find the slider a stream belongs to
    ///
    /// A direct slider id match beats any group keyword. Among groups the
    /// first one listed wins. `master` never binds streams.
    fn match_stream(&self, display_name: &str) -> Option<&str> {
        let name = display_name.to_lowercase();

        let direct = self
            .sliders
            .iter()
            .filter(|slider| !is_master(slider))
            .find(|slider| name.contains(slider.as_str()));
        if let Some(slider) = direct {
            return Some(slider);
        }

        self.groups
            .iter()
            .find(|group| group.keywords.iter().any(|k| name.contains(k.as_str())))
            .map(|group| group.slider.as_str())
    }

    /// Replace the table with one built from `streams`
    pub fn rebuild(&self, streams: Vec<AudioStream>) -> RebuildSummary {
        let mut map: RoutingMap = HashMap::new();
        for slider in &self.sliders {
            if !is_master(slider) {
                map.insert(slider.clone(), Vec::new());
            }
        }
        for group in &self.groups {
            map.entry(group.slider.clone()).or_default();
        }

        let mut summary = RebuildSummary {
            streams_seen: streams.len(),
            ..Default::default()
        };

        for stream in streams {
            if stream.display_name.trim().is_empty() {
                continue;
            }
            match self.match_stream(&stream.display_name) {
                Some(slider) => {
                    info!("Mapped: {} -> {}", stream.display_name, slider);
                    summary.streams_mapped += 1;
                    map.entry(slider.to_string()).or_default().push(stream);
                }
                None => debug!("Unmatched stream: {}", stream.display_name),
            }
        }

        for (slider, streams) in &map {
            if streams.is_empty() {
                summary.empty_sliders += 1;
                debug!("No stream found for '{}'", slider);
            }
        }

        *self.table.write() = Arc::new(map);
        summary
    }

    /// Current table; cheap, never blocks on a running rebuild
    pub fn snapshot(&self) -> Arc<RoutingMap> {
        Arc::clone(&self.table.read())
    }

    /// Streams currently bound to `slider`
    pub fn streams_for(&self, slider: &str) -> Vec<AudioStream> {
        self.snapshot()
            .get(&slider.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Push `level` to the target slider's streams, or to the master volume
    ///
    /// Per-stream failures are logged and do not stop the remaining streams.
    pub fn apply(&self, mixer: &dyn AudioMixer, target: &str, level: f32) -> ApplyOutcome {
        let percent = level_to_percent(level);

        if is_master(target) {
            return match mixer.set_master_volume(percent) {
                Ok(()) => {
                    debug!("🔊 Master volume set to {}%", percent);
                    ApplyOutcome::Master { ok: true }
                },
                Err(e) => {
                    warn!("Failed to set master volume: {}", e);
                    ApplyOutcome::Master { ok: false }
                },
            };
        }

        let table = self.snapshot();
        let streams = match table.get(&target.to_lowercase()) {
            Some(streams) if !streams.is_empty() => streams,
            _ => {
                debug!("No stream bound to '{}', volume unchanged", target);
                return ApplyOutcome::Unrouted;
            },
        };

        let mut applied = 0;
        let mut failed = 0;
        for stream in streams {
            match mixer.set_stream_volume(stream, percent) {
                Ok(()) => {
                    applied += 1;
                    debug!("🎚 {}: volume {}%", stream.display_name, percent);
                },
                Err(e) => {
                    failed += 1;
                    warn!("Failed to set volume for {} ({}): {}", stream.display_name, target, e);
                },
            }
        }

        ApplyOutcome::Streams { applied, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::{FakeMixer, MixerCall};

    fn sliders(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn groups(defs: Vec<(&str, Vec<&str>)>) -> SessionGroups {
        defs.into_iter()
            .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
            .collect()
    }

    fn streams(names: &[&str]) -> Vec<AudioStream> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| AudioStream::new(format!("s{}", i), *n))
            .collect()
    }

    fn names(table: &SessionRoutingTable, slider: &str) -> Vec<String> {
        table
            .streams_for(slider)
            .into_iter()
            .map(|s| s.display_name)
            .collect()
    }

    #[test]
    fn test_direct_match_is_case_insensitive_substring() {
        let table = SessionRoutingTable::new(&sliders(&["Spotify", "Discord"]), &SessionGroups::default());
        let summary = table.rebuild(streams(&["spotify.exe", "DISCORD", "chrome"]));

        assert_eq!(names(&table, "Spotify"), vec!["spotify.exe"]);
        assert_eq!(names(&table, "discord"), vec!["DISCORD"]);
        assert_eq!(summary.streams_seen, 3);
        assert_eq!(summary.streams_mapped, 2);
        assert_eq!(summary.empty_sliders, 0);
    }

    #[test]
    fn test_direct_match_beats_group_keyword() {
        let table = SessionRoutingTable::new(
            &sliders(&["discord", "voice"]),
            &groups(vec![("voice", vec!["discord", "teamspeak"])]),
        );
        table.rebuild(streams(&["Discord", "TeamSpeak 3"]));

        assert_eq!(names(&table, "discord"), vec!["Discord"]);
        assert_eq!(names(&table, "voice"), vec!["TeamSpeak 3"]);
    }

    #[test]
    fn test_first_group_wins() {
        let table = SessionRoutingTable::new(
            &sliders(&["browser", "media"]),
            &groups(vec![("media", vec!["vlc", "chrome"]), ("browser", vec!["chrome"])]),
        );
        table.rebuild(streams(&["Google Chrome"]));

        assert_eq!(names(&table, "media"), vec!["Google Chrome"]);
        assert!(names(&table, "browser").is_empty());
    }

    #[test]
    fn test_group_collects_many_streams() {
        let table = SessionRoutingTable::new(
            &sliders(&["games"]),
            &groups(vec![("games", vec!["steam", "epic", "game"])]),
        );
        table.rebuild(streams(&["steamwebhelper", "EpicGamesLauncher", "game", "spotify"]));

        assert_eq!(
            names(&table, "games"),
            vec!["steamwebhelper", "EpicGamesLauncher", "game"]
        );
    }

    #[test]
    fn test_empty_names_and_unmatched_streams_are_dropped() {
        let table = SessionRoutingTable::new(&sliders(&["spotify"]), &SessionGroups::default());
        let summary = table.rebuild(streams(&["", "  ", "chrome"]));

        assert!(names(&table, "spotify").is_empty());
        assert_eq!(summary.streams_mapped, 0);
        assert_eq!(summary.empty_sliders, 1);
    }

    #[test]
    fn test_rebuild_clears_stale_streams() {
        let table = SessionRoutingTable::new(&sliders(&["spotify"]), &SessionGroups::default());
        table.rebuild(streams(&["Spotify"]));
        assert_eq!(names(&table, "spotify").len(), 1);

        table.rebuild(Vec::new());
        assert!(names(&table, "spotify").is_empty());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let table = SessionRoutingTable::new(
            &sliders(&["master", "spotify", "games"]),
            &groups(vec![("games", vec!["steam", "game"])]),
        );
        let live = streams(&["Spotify", "steam", "game.exe", "Discord"]);

        table.rebuild(live.clone());
        let first = table.snapshot();
        table.rebuild(live);
        let second = table.snapshot();

        assert_eq!(*first, *second);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_master_never_binds_streams() {
        let table = SessionRoutingTable::new(&sliders(&["master"]), &SessionGroups::default());
        table.rebuild(streams(&["Mastering Suite"]));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_apply_master_bypasses_table() {
        let mixer = FakeMixer::default();
        let table = SessionRoutingTable::new(&sliders(&["master", "spotify"]), &SessionGroups::default());
        table.rebuild(streams(&["Spotify"]));
        let before = table.snapshot();

        let outcome = table.apply(&mixer, "MASTER", 0.42);

        assert_eq!(outcome, ApplyOutcome::Master { ok: true });
        assert_eq!(mixer.calls(), vec![MixerCall::Master { percent: 42 }]);
        assert!(Arc::ptr_eq(&before, &table.snapshot()));
    }

    #[test]
    fn test_apply_to_all_bound_streams() {
        let mixer = FakeMixer::default();
        let table = SessionRoutingTable::new(
            &sliders(&["games"]),
            &groups(vec![("games", vec!["steam", "epic"])]),
        );
        table.rebuild(streams(&["steam", "epic"]));

        let outcome = table.apply(&mixer, "games", 0.25);

        assert_eq!(outcome, ApplyOutcome::Streams { applied: 2, failed: 0 });
        assert_eq!(
            mixer.calls(),
            vec![
                MixerCall::Stream { name: "steam".into(), percent: 25 },
                MixerCall::Stream { name: "epic".into(), percent: 25 },
            ]
        );
    }

    #[test]
    fn test_failing_stream_does_not_block_others() {
        let mixer = FakeMixer::default();
        mixer.failing.lock().push("steam".to_string());
        let table = SessionRoutingTable::new(
            &sliders(&["games"]),
            &groups(vec![("games", vec!["steam", "epic"])]),
        );
        table.rebuild(streams(&["steam", "epic"]));

        let outcome = table.apply(&mixer, "games", 1.0);

        assert_eq!(outcome, ApplyOutcome::Streams { applied: 1, failed: 1 });
        assert_eq!(
            mixer.calls(),
            vec![MixerCall::Stream { name: "epic".into(), percent: 100 }]
        );
    }

    #[test]
    fn test_apply_unrouted_is_noop() {
        let mixer = FakeMixer::default();
        let table = SessionRoutingTable::new(&sliders(&["spotify"]), &SessionGroups::default());
        table.rebuild(Vec::new());

        assert_eq!(table.apply(&mixer, "spotify", 0.5), ApplyOutcome::Unrouted);
        assert_eq!(table.apply(&mixer, "unknown", 0.5), ApplyOutcome::Unrouted);
        assert!(mixer.calls().is_empty());
    }
}
