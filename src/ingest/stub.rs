use anyhow::Result;
use std::time::{Duration, Instant};

use super::SourceStats;
use crate::config::StreamSettings;
use crate::frame::Frame;
use crate::now_ms;

const BACKGROUND_LEVEL: u8 = 20;
const SUBJECT_LEVEL: u8 = 255;

/// Presence pattern for the synthetic source.
#[derive(Clone, Copy, Debug)]
pub enum StubPattern {
    /// Subject never appears.
    Empty,
    /// Subject alternates: present for `present` frames, gone for `absent`.
    Alternating { present: u64, absent: u64 },
}

impl Default for StubPattern {
    fn default() -> Self {
        // Roughly 6s visits with 12s gaps at 10 fps.
        StubPattern::Alternating {
            present: 60,
            absent: 120,
        }
    }
}

impl StubPattern {
    fn present_at(&self, seq: u64) -> bool {
        match *self {
            StubPattern::Empty => false,
            StubPattern::Alternating { present, absent } => {
                let cycle = present + absent;
                cycle > 0 && seq % cycle < present
            }
        }
    }
}

/// Synthetic frame source for `stub://` URLs.
///
/// Draws a bright rectangle inside the default ROI whenever the pattern says a
/// subject is present, which pairs with the bright-blob stub detector.
pub struct StubSource {
    settings: StreamSettings,
    pattern: StubPattern,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl StubSource {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            pattern: StubPattern::default(),
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub fn with_pattern(mut self, pattern: StubPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn connect(&mut self) -> Result<()> {
        log::info!("StubSource: connected to {} (synthetic)", self.settings.url);
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        // Pace to the configured frame rate.
        if let Some(last) = self.last_frame_at {
            let min_interval = frame_interval(self.settings.target_fps);
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                std::thread::sleep(min_interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());

        let seq = self.frame_count;
        self.frame_count += 1;

        let pixels = self.render(self.pattern.present_at(seq));
        Ok(Frame::new(
            pixels,
            self.settings.width,
            self.settings.height,
            seq,
            now_ms()?,
        ))
    }

    pub fn is_healthy(&self) -> bool {
        true
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.settings.url.clone(),
        }
    }

    fn render(&self, subject_present: bool) -> Vec<u8> {
        let w = self.settings.width;
        let h = self.settings.height;
        let mut pixels = vec![BACKGROUND_LEVEL; (w * h * 3) as usize];

        if subject_present {
            // Rectangle placed inside the default ROI (0.25..0.62 x 0.34..0.72).
            let (x1, y1) = ((w as f32 * 0.38) as u32, (h as f32 * 0.45) as u32);
            let (x2, y2) = ((w as f32 * 0.52) as u32, (h as f32 * 0.60) as u32);
            for y in y1..y2 {
                for x in x1..x2 {
                    let i = ((y * w + x) * 3) as usize;
                    pixels[i] = SUBJECT_LEVEL;
                    pixels[i + 1] = SUBJECT_LEVEL;
                    pixels[i + 2] = SUBJECT_LEVEL;
                }
            }
        }
        pixels
    }
}

pub(super) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(100)
    } else {
        Duration::from_millis(1000 / target_fps as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BrightBlobBackend, DetectorBackend};

    fn source(pattern: StubPattern) -> StubSource {
        StubSource::new(StreamSettings {
            url: "stub://test".to_string(),
            target_fps: 0,
            width: 160,
            height: 120,
        })
        .with_pattern(pattern)
    }

    #[test]
    fn empty_pattern_renders_no_subject() -> Result<()> {
        let mut src = source(StubPattern::Empty);
        src.connect()?;
        let frame = src.next_frame()?;

        let mut backend = BrightBlobBackend::default();
        let raw = backend.detect(&frame.pixels, frame.width, frame.height)?;
        assert!(raw.is_empty());
        Ok(())
    }

    #[test]
    fn alternating_pattern_toggles_subject() -> Result<()> {
        let mut src = source(StubPattern::Alternating {
            present: 1,
            absent: 1,
        });
        src.connect()?;

        let mut backend = BrightBlobBackend::default();
        let present = src.next_frame()?;
        let absent = src.next_frame()?;

        assert!(!backend
            .detect(&present.pixels, present.width, present.height)?
            .is_empty());
        assert!(backend
            .detect(&absent.pixels, absent.width, absent.height)?
            .is_empty());
        Ok(())
    }
}
