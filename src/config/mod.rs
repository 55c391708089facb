//! Configuration management for Mixr GW
//!
//! Handles loading, parsing, and validation of the YAML configuration file.
//! Field names match the `config.yaml` shipped with the controller firmware.

use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Serial port of the slider controller (e.g. "COM11", "/dev/ttyACM0")
    pub com_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Slider ids in telemetry order: position i of a frame drives slider i
    pub slider_mapping: Vec<String>,

    /// Slider id -> keywords binding additional streams to that slider
    #[serde(default)]
    pub session_groups: SessionGroups,

    /// Process names whose start/stop triggers a routing rebuild
    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default = "default_true")]
    pub invert_sliders: bool,

    /// Passed through to the firmware side; not interpreted here
    #[serde(default = "default_noise_reduction")]
    pub noise_reduction: String,

    #[serde(default)]
    pub tuning: TuningConfig,
}

/// Group definitions in file order
///
/// Order is significant: when a stream matches keywords of several groups,
/// the group listed first wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionGroups(Vec<(String, Vec<String>)>);

impl SessionGroups {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn get(&self, group: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(k, _)| k == group)
            .map(|(_, v)| v.as_slice())
    }

    /// Append a group, replacing an existing one with the same name in place
    pub fn insert(&mut self, group: impl Into<String>, keywords: Vec<String>) {
        let group = group.into();
        match self.0.iter_mut().find(|(k, _)| *k == group) {
            Some(entry) => entry.1 = keywords,
            None => self.0.push((group, keywords)),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Vec<String>)> for SessionGroups {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        let mut groups = SessionGroups::default();
        for (k, v) in iter {
            groups.insert(k, v);
        }
        groups
    }
}

impl Serialize for SessionGroups {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SessionGroups {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct GroupsVisitor;

        impl<'de> Visitor<'de> for GroupsVisitor {
            type Value = SessionGroups;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of group name to keyword list")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(SessionGroups::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut groups = SessionGroups::default();
                while let Some((k, v)) = access.next_entry::<String, Vec<String>>()? {
                    groups.insert(k, v);
                }
                Ok(groups)
            }
        }

        deserializer.deserialize_any(GroupsVisitor)
    }
}

/// Timing and sizing knobs, all optional
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TuningConfig {
    /// Minimum level change (0..1) before a slider update is applied
    #[serde(default = "default_debounce_threshold")]
    pub debounce_threshold: f32,

    /// Number of volume worker tasks
    #[serde(default = "default_volume_workers")]
    pub volume_workers: usize,

    /// Pending updates per volume worker before new ones are dropped
    #[serde(default = "default_volume_queue")]
    pub volume_queue: usize,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_process_poll_ms")]
    pub process_poll_ms: u64,

    #[serde(default = "default_media_watchdog_ms")]
    pub media_watchdog_ms: u64,

    /// Delay before the song text is repeated after a cover transfer
    #[serde(default = "default_safety_resend_ms")]
    pub safety_resend_ms: u64,

    #[serde(default = "default_image_chunk_size")]
    pub image_chunk_size: usize,

    #[serde(default = "default_image_chunk_delay_ms")]
    pub image_chunk_delay_ms: u64,

    /// Pause after `<IMG>` and before `<END>`
    #[serde(default = "default_image_marker_delay_ms")]
    pub image_marker_delay_ms: u64,

    /// Edge length of the square cover sent to the display
    #[serde(default = "default_cover_size")]
    pub cover_size: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_cover_quality")]
    pub cover_quality: u8,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            debounce_threshold: default_debounce_threshold(),
            volume_workers: default_volume_workers(),
            volume_queue: default_volume_queue(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            process_poll_ms: default_process_poll_ms(),
            media_watchdog_ms: default_media_watchdog_ms(),
            safety_resend_ms: default_safety_resend_ms(),
            image_chunk_size: default_image_chunk_size(),
            image_chunk_delay_ms: default_image_chunk_delay_ms(),
            image_marker_delay_ms: default_image_marker_delay_ms(),
            cover_size: default_cover_size(),
            cover_quality: default_cover_quality(),
        }
    }
}

impl TuningConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn process_poll(&self) -> Duration {
        Duration::from_millis(self.process_poll_ms)
    }

    pub fn media_watchdog(&self) -> Duration {
        Duration::from_millis(self.media_watchdog_ms)
    }

    pub fn safety_resend(&self) -> Duration {
        Duration::from_millis(self.safety_resend_ms)
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.com_port.trim().is_empty() {
            return Err(ConfigError::EmptyPort);
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidBaudRate);
        }
        if self.slider_mapping.is_empty() {
            return Err(ConfigError::NoSliders);
        }

        let mut seen = HashSet::new();
        for (idx, slider) in self.slider_mapping.iter().enumerate() {
            if slider.trim().is_empty() {
                return Err(ConfigError::EmptySliderId(idx));
            }
            if !seen.insert(slider.to_lowercase()) {
                return Err(ConfigError::DuplicateSlider(slider.clone()));
            }
        }

        for (group, keywords) in self.session_groups.iter() {
            if keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(ConfigError::EmptyKeyword(group.to_string()));
            }
            // Not fatal: the group just can never be addressed by a slider
            if !seen.contains(&group.to_lowercase()) {
                warn!(
                    "Group '{}' does not name a configured slider and will never receive updates",
                    group
                );
            }
        }

        self.tuning.validate()
    }
}

impl TuningConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.debounce_threshold) {
            return Err(ConfigError::Tuning {
                field: "debounce_threshold",
                reason: format!("{} is not within [0, 1)", self.debounce_threshold),
            });
        }
        if self.volume_workers == 0 {
            return Err(tuning_zero("volume_workers"));
        }
        if self.volume_queue == 0 {
            return Err(tuning_zero("volume_queue"));
        }
        if self.image_chunk_size == 0 {
            return Err(tuning_zero("image_chunk_size"));
        }
        if self.cover_size == 0 {
            return Err(tuning_zero("cover_size"));
        }
        if !(1..=100).contains(&self.cover_quality) {
            return Err(ConfigError::Tuning {
                field: "cover_quality",
                reason: format!("{} is not within 1-100", self.cover_quality),
            });
        }
        Ok(())
    }
}

fn tuning_zero(field: &'static str) -> ConfigError {
    ConfigError::Tuning {
        field,
        reason: "must be greater than zero".to_string(),
    }
}

// Default value functions
fn default_baud_rate() -> u32 { 230_400 }
fn default_true() -> bool { true }
fn default_noise_reduction() -> String { "default".to_string() }
fn default_debounce_threshold() -> f32 { 0.005 }
fn default_volume_workers() -> usize { 2 }
fn default_volume_queue() -> usize { 64 }
fn default_reconnect_backoff_ms() -> u64 { 30_000 }
fn default_process_poll_ms() -> u64 { 5_000 }
fn default_media_watchdog_ms() -> u64 { 1_000 }
fn default_safety_resend_ms() -> u64 { 1_000 }
fn default_image_chunk_size() -> usize { 64 }
fn default_image_chunk_delay_ms() -> u64 { 2 }
fn default_image_marker_delay_ms() -> u64 { 50 }
fn default_cover_size() -> u32 { 170 }
fn default_cover_quality() -> u8 { 40 }
