//! Detection types and the detector adapter.
//!
//! The adapter owns everything between a raw frame and the state machine's
//! tick input: cropping to the region of interest, running the backend,
//! filtering by class/confidence/area, and mapping boxes back to full-frame
//! pixel coordinates. The state machine only ever sees qualifying detections.

mod backend;
mod stub;

pub use backend::{DetectorBackend, RawDetection};
pub use stub::BrightBlobBackend;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::DetectionSettings;
use crate::frame::Frame;

/// Region of interest as a normalized sub-rectangle of the frame.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Roi {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Roi {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
        let roi = Self { x1, y1, x2, y2 };
        for v in [x1, y1, x2, y2] {
            if !(0.0..=1.0).contains(&v) {
                return Err(anyhow!("roi coordinates must be within 0..=1"));
            }
        }
        if x2 <= x1 || y2 <= y1 {
            return Err(anyhow!("roi must have positive width and height"));
        }
        Ok(roi)
    }

    /// Full frame.
    pub fn full() -> Self {
        Self {
            x1: 0.0,
            y1: 0.0,
            x2: 1.0,
            y2: 1.0,
        }
    }

    /// Pixel rectangle (x, y, width, height) for a frame of the given size.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let px1 = (self.x1 * width as f32) as u32;
        let py1 = (self.y1 * height as f32) as u32;
        let px2 = ((self.x2 * width as f32) as u32).min(width);
        let py2 = ((self.y2 * height as f32) as u32).min(height);
        (px1, py1, px2.saturating_sub(px1), py2.saturating_sub(py1))
    }
}

/// A qualifying detection in full-frame pixel coordinates.
///
/// Ephemeral: consumed by the state machine on the tick it was produced, and
/// persisted only as part of a capture record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    /// (x1, y1, x2, y2) in full-frame pixels.
    pub bbox: [u32; 4],
    pub confidence: f32,
    pub class_name: String,
    /// Bounding-box area relative to the ROI area.
    pub area_ratio: f32,
}

impl Detection {
    /// Bounding-box area in square pixels.
    pub fn bbox_area(&self) -> u64 {
        let w = self.bbox[2].saturating_sub(self.bbox[0]) as u64;
        let h = self.bbox[3].saturating_sub(self.bbox[1]) as u64;
        w * h
    }
}

/// Wraps a backend with ROI cropping and qualification filtering.
pub struct DetectorAdapter {
    backend: Box<dyn DetectorBackend>,
    settings: DetectionSettings,
}

impl DetectorAdapter {
    pub fn new(backend: Box<dyn DetectorBackend>, settings: DetectionSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run detection on the ROI of a frame and return qualifying detections
    /// in full-frame pixel coordinates.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (rx, ry, rw, rh) = self.settings.roi.to_pixels(frame.width, frame.height);
        if rw == 0 || rh == 0 {
            return Err(anyhow!(
                "roi maps to an empty pixel rect for {}x{} frame",
                frame.width,
                frame.height
            ));
        }

        let cropped = crop_rgb(&frame.pixels, frame.width, rx, ry, rw, rh)?;
        let raw = self.backend.detect(&cropped, rw, rh)?;

        let roi_area = (rw as f32) * (rh as f32);
        let mut detections = Vec::new();
        for d in raw {
            if d.class_name != self.settings.target_class {
                continue;
            }
            if d.confidence < self.settings.confidence_threshold {
                continue;
            }
            // Backend boxes are normalized within the cropped region.
            let bx1 = (d.x * rw as f32) as u32;
            let by1 = (d.y * rh as f32) as u32;
            let bw = (d.w * rw as f32).max(0.0) as u32;
            let bh = (d.h * rh as f32).max(0.0) as u32;
            let area_ratio = (bw as f32 * bh as f32) / roi_area;
            if area_ratio < self.settings.min_area_ratio {
                continue;
            }
            detections.push(Detection {
                bbox: [rx + bx1, ry + by1, rx + bx1 + bw, ry + by1 + bh],
                confidence: d.confidence,
                class_name: d.class_name,
                area_ratio,
            });
        }
        Ok(detections)
    }
}

fn crop_rgb(pixels: &[u8], frame_width: u32, x: u32, y: u32, w: u32, h: u32) -> Result<Vec<u8>> {
    let stride = frame_width as usize * 3;
    let row_bytes = w as usize * 3;
    let mut out = Vec::with_capacity(row_bytes * h as usize);
    for row in y..y + h {
        let start = row as usize * stride + x as usize * 3;
        let end = start + row_bytes;
        out.extend_from_slice(
            pixels
                .get(start..end)
                .ok_or_else(|| anyhow!("frame pixel buffer is shorter than its dimensions"))?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FixedBackend {
        raw: Vec<RawDetection>,
    }

    impl DetectorBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<RawDetection>> {
            Ok(self.raw.clone())
        }
    }

    fn settings() -> DetectionSettings {
        DetectionSettings {
            confidence_threshold: 0.25,
            min_area_ratio: 0.002,
            target_class: "bird".to_string(),
            roi: Roi::new(0.25, 0.25, 0.75, 0.75).unwrap(),
            tick_interval: Duration::from_millis(500),
        }
    }

    fn raw(class: &str, confidence: f32, w: f32, h: f32) -> RawDetection {
        RawDetection {
            x: 0.1,
            y: 0.1,
            w,
            h,
            confidence,
            class_name: class.to_string(),
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; 400 * 400 * 3], 400, 400, 1, 0)
    }

    #[test]
    fn roi_maps_to_pixel_rect() {
        let roi = Roi::new(0.25, 0.25, 0.75, 0.75).unwrap();
        assert_eq!(roi.to_pixels(400, 400), (100, 100, 200, 200));
    }

    #[test]
    fn roi_rejects_degenerate_rects() {
        assert!(Roi::new(0.5, 0.1, 0.5, 0.9).is_err());
        assert!(Roi::new(0.0, 0.0, 1.2, 1.0).is_err());
    }

    #[test]
    fn adapter_filters_class_confidence_and_area() {
        let backend = FixedBackend {
            raw: vec![
                raw("bird", 0.9, 0.2, 0.2),
                raw("cat", 0.9, 0.2, 0.2),
                raw("bird", 0.1, 0.2, 0.2),
                raw("bird", 0.9, 0.01, 0.01),
            ],
        };
        let mut adapter = DetectorAdapter::new(Box::new(backend), settings());

        let detections = adapter.detect(&frame()).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "bird");
        assert!(detections[0].confidence >= 0.25);
    }

    #[test]
    fn adapter_maps_boxes_to_full_frame_coordinates() {
        let backend = FixedBackend {
            raw: vec![raw("bird", 0.8, 0.5, 0.5)],
        };
        let mut adapter = DetectorAdapter::new(Box::new(backend), settings());

        let detections = adapter.detect(&frame()).unwrap();
        // ROI starts at (100, 100); backend box starts at 10% of a 200px ROI.
        assert_eq!(detections[0].bbox, [120, 120, 220, 220]);
    }
}
