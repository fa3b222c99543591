use anyhow::Result;

use crate::detect::backend::{DetectorBackend, RawDetection};

/// Minimum fraction of bright pixels before the blob counts as a detection.
const MIN_BLOB_FRACTION: f32 = 0.001;

/// Stub backend for tests and the `stub://` source: finds the bounding box of
/// bright pixels and reports it as one detection of the configured class.
///
/// The synthetic frame source draws a bright rectangle when a subject is
/// "present", so this backend is fully deterministic against it.
pub struct BrightBlobBackend {
    threshold: u8,
    class_name: String,
}

impl BrightBlobBackend {
    pub fn new(threshold: u8, class_name: impl Into<String>) -> Self {
        Self {
            threshold,
            class_name: class_name.into(),
        }
    }
}

impl Default for BrightBlobBackend {
    fn default() -> Self {
        Self::new(200, "bird")
    }
}

impl DetectorBackend for BrightBlobBackend {
    fn name(&self) -> &'static str {
        "bright-blob"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>> {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut bright = 0u64;

        for (i, px) in pixels.chunks_exact(3).enumerate() {
            let mean = (px[0] as u16 + px[1] as u16 + px[2] as u16) / 3;
            if mean as u8 >= self.threshold {
                let x = (i as u32) % width;
                let y = (i as u32) / width;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
                bright += 1;
            }
        }

        let total = (width as u64) * (height as u64);
        if total == 0 || (bright as f32 / total as f32) < MIN_BLOB_FRACTION {
            return Ok(vec![]);
        }

        Ok(vec![RawDetection {
            x: min_x as f32 / width as f32,
            y: min_y as f32 / height as f32,
            w: (max_x - min_x + 1) as f32 / width as f32,
            h: (max_y - min_y + 1) as f32 / height as f32,
            confidence: 0.9,
            class_name: self.class_name.clone(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dark_frame(width: u32, height: u32) -> Vec<u8> {
        vec![10u8; (width * height * 3) as usize]
    }

    fn with_bright_rect(mut pixels: Vec<u8>, width: u32, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
        for row in y..y + h {
            for col in x..x + w {
                let i = ((row * width + col) * 3) as usize;
                pixels[i] = 255;
                pixels[i + 1] = 255;
                pixels[i + 2] = 255;
            }
        }
        pixels
    }

    #[test]
    fn dark_frame_yields_no_detections() {
        let mut backend = BrightBlobBackend::default();
        let raw = backend.detect(&dark_frame(100, 100), 100, 100).unwrap();
        assert!(raw.is_empty());
    }

    #[test]
    fn bright_rect_yields_one_detection_with_matching_bbox() {
        let mut backend = BrightBlobBackend::default();
        let pixels = with_bright_rect(dark_frame(100, 100), 100, 20, 30, 40, 20);

        let raw = backend.detect(&pixels, 100, 100).unwrap();
        assert_eq!(raw.len(), 1);

        let d = &raw[0];
        assert!((d.x - 0.2).abs() < 0.02);
        assert!((d.y - 0.3).abs() < 0.02);
        assert!((d.w - 0.4).abs() < 0.02);
        assert!((d.h - 0.2).abs() < 0.02);
        assert_eq!(d.class_name, "bird");
    }
}
