//! Slider telemetry decoding
//!
//! Turns one received line into debounced per-slider volume updates. Field i
//! of a frame belongs to the i-th configured slider; extra fields are ignored
//! and missing ones leave their slider untouched.

use tracing::trace;

use crate::audio::applier::VolumeUpdate;
use crate::config::AppConfig;
use crate::error::ProtocolParseError;
use crate::protocol::{is_ack, FIELD_DELIMITER, RAW_MAX};

/// Level before the first reading, never within threshold of a real one
const UNSET: f32 = -1.0;

/// Parse one raw telemetry field
pub fn parse_reading(field: &str) -> Result<i64, ProtocolParseError> {
    let field = field.trim();
    if field.is_empty() {
        return Err(ProtocolParseError::EmptyField);
    }
    let raw: i64 = field
        .parse()
        .map_err(|_| ProtocolParseError::InvalidNumber(field.to_string()))?;
    if raw < 0 {
        return Err(ProtocolParseError::OutOfRange(raw));
    }
    Ok(raw)
}

/// Map a raw reading onto 0.0-1.0, optionally inverted
pub fn normalize(raw: i64, invert: bool) -> f32 {
    let level = (raw as f32 / f32::from(RAW_MAX)).clamp(0.0, 1.0);
    if invert {
        1.0 - level
    } else {
        level
    }
}

pub struct SliderInputDecoder {
    sliders: Vec<String>,
    invert: bool,
    threshold: f32,
    last: Vec<f32>,
}

impl SliderInputDecoder {
    pub fn new(sliders: Vec<String>, invert: bool, threshold: f32) -> Self {
        let last = vec![UNSET; sliders.len()];
        Self {
            sliders,
            invert,
            threshold,
            last,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.slider_mapping.clone(),
            config.invert_sliders,
            config.tuning.debounce_threshold,
        )
    }

    /// Decode one trimmed line into the updates that passed the debounce
    pub fn decode(&mut self, line: &str) -> Vec<VolumeUpdate> {
        let line = line.trim();
        if is_ack(line) || !line.contains(FIELD_DELIMITER) {
            return Vec::new();
        }

        let mut updates = Vec::new();
        for (i, field) in line.split(FIELD_DELIMITER).take(self.sliders.len()).enumerate() {
            let raw = match parse_reading(field) {
                Ok(raw) => raw,
                Err(e) => {
                    trace!("Slider {}: skipping field ({})", i, e);
                    continue;
                },
            };

            let level = normalize(raw, self.invert);
            if (level - self.last[i]).abs() <= self.threshold {
                continue;
            }
            self.last[i] = level;
            updates.push(VolumeUpdate {
                slider_index: i,
                target: self.sliders[i].clone(),
                level,
            });
        }
        updates
    }

    /// Forget every slider's last level so the next frame applies in full
    pub fn reset(&mut self) {
        self.last.fill(UNSET);
    }

    /// Forget one slider's last level, e.g. after its update was dropped
    pub fn forget(&mut self, slider_index: usize) {
        if let Some(level) = self.last.get_mut(slider_index) {
            *level = UNSET;
        }
    }

    /// Last applied level per slider, `None` before the first reading
    pub fn levels(&self) -> Vec<Option<f32>> {
        self.last
            .iter()
            .map(|&l| (l >= 0.0).then_some(l))
            .collect()
    }
}
