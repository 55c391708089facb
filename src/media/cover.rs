//! Cover art re-encoding for the device display

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use crate::config::TuningConfig;
use crate::error::ProviderError;

/// Resizes thumbnails to the display's square frame and encodes them as JPEG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverEncoder {
    pub size: u32,
    pub quality: u8,
}

impl Default for CoverEncoder {
    fn default() -> Self {
        Self {
            size: 170,
            quality: 40,
        }
    }
}

impl From<&TuningConfig> for CoverEncoder {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            size: tuning.cover_size,
            quality: tuning.cover_quality,
        }
    }
}

impl CoverEncoder {
    /// Decode `raw`, stretch it to `size`x`size` and encode as JPEG
    ///
    /// CPU bound; run it on a blocking thread.
    pub fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, ProviderError> {
        if raw.is_empty() {
            return Err(ProviderError::Image("thumbnail is empty".to_string()));
        }
        let decoded = image::load_from_memory(raw).map_err(|e| ProviderError::Image(e.to_string()))?;
        let resized = decoded
            .resize_exact(self.size, self.size, FilterType::Triangle)
            .to_rgb8();

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality.clamp(1, 100))
            .encode_image(&resized)
            .map_err(|e| ProviderError::Image(e.to_string()))?;
        Ok(out)
    }
}

/// Solid-colour PNG for tests
#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageFormat, Rgb, RgbImage};

    let img = RgbImage::from_pixel(width, height, Rgb([200, 40, 90]));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}
