//! Capture policy: which frames become persisted photos of a visit.
//!
//! Rate limiting is per visit (minimum interval between photos, hard cap per
//! visit). Writes are idempotent: a capture is keyed by visit id and sequence
//! number, so a retried tick lands on the same path and an existing file is
//! never rewritten.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::VisitSettings;
use crate::detect::Detection;
use crate::frame::Frame;
use crate::visit::VisitSession;

/// Reference to one persisted capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureRef {
    /// Sequence number within the visit, starting at 0.
    pub seq: usize,
    pub path: PathBuf,
    pub captured_at_ms: u64,
    /// Representativeness score: max(confidence x bbox pixel area) over the
    /// detections in this capture.
    pub score: f64,
    /// Hex sha256 of the JPEG bytes; secondary dedup key for store commits.
    pub fingerprint: String,
    pub detections: Vec<Detection>,
}

pub struct CapturePolicy {
    captures_dir: PathBuf,
    settings: VisitSettings,
}

impl CapturePolicy {
    pub fn new(captures_dir: impl Into<PathBuf>, settings: VisitSettings) -> Self {
        Self {
            captures_dir: captures_dir.into(),
            settings,
        }
    }

    /// True iff the visit is under its capture cap and the interval since the
    /// last capture has elapsed. The first capture of a visit is always due.
    pub fn should_capture(&self, session: &VisitSession, now_ms: u64) -> bool {
        if session.captures.len() >= self.settings.max_captures_per_visit {
            return false;
        }
        match session.captures.last() {
            None => true,
            Some(last) => {
                now_ms.saturating_sub(last.captured_at_ms)
                    >= self.settings.capture_interval.as_millis() as u64
            }
        }
    }

    /// Persist the frame as the visit's next capture and update the session's
    /// capture list and best-capture pointer.
    pub fn record_capture(
        &self,
        session: &mut VisitSession,
        frame: &Frame,
        detections: &[Detection],
        now_ms: u64,
    ) -> Result<CaptureRef> {
        if session.captures.len() >= self.settings.max_captures_per_visit {
            return Err(anyhow!(
                "visit {} already has {} captures",
                session.id,
                session.captures.len()
            ));
        }

        let seq = session.captures.len();
        let path = self.capture_path(&session.id, seq, now_ms);
        let jpeg = encode_jpeg(frame, self.settings.jpeg_quality)?;
        let fingerprint = hex::encode(Sha256::digest(&jpeg));

        if path.exists() {
            log::debug!("capture already on disk, reusing: {}", path.display());
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create capture dir {}", parent.display()))?;
            }
            fs::write(&path, &jpeg)
                .with_context(|| format!("write capture {}", path.display()))?;
        }

        let score = detections
            .iter()
            .map(|d| d.confidence as f64 * d.bbox_area() as f64)
            .fold(0.0_f64, f64::max);

        let capture = CaptureRef {
            seq,
            path,
            captured_at_ms: now_ms,
            score,
            fingerprint,
            detections: detections.to_vec(),
        };

        let best_score = session.best_capture().map(|c| c.score).unwrap_or(-1.0);
        session.captures.push(capture.clone());
        if score > best_score {
            session.best_capture = Some(seq);
        }

        log::info!(
            "captured photo {}/{} for visit {}",
            seq + 1,
            self.settings.max_captures_per_visit,
            session.id
        );
        Ok(capture)
    }

    /// Path keyed by date, visit id, and sequence number.
    fn capture_path(&self, visit_id: &str, seq: usize, now_ms: u64) -> PathBuf {
        let date = DateTime::<Utc>::from_timestamp_millis(now_ms as i64)
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default())
            .format("%Y-%m-%d")
            .to_string();
        self.captures_dir
            .join(date)
            .join(visit_id)
            .join(format!("{:02}.jpg", seq))
    }
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let img = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone())
        .ok_or_else(|| anyhow!("frame pixel buffer does not match its dimensions"))?;
    let mut jpeg = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality);
    img.write_with_encoder(encoder).context("encode jpeg")?;
    Ok(jpeg)
}

/// Fingerprint of an already-encoded capture file (scan mode).
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("read capture file {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> VisitSettings {
        VisitSettings {
            grace: Duration::from_secs(5),
            cooldown: Duration::from_secs(15),
            capture_interval: Duration::from_secs(3),
            max_captures_per_visit: 3,
            merge_window: Duration::from_secs(0),
            jpeg_quality: 85,
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![128u8; 32 * 32 * 3], 32, 32, 0, 0)
    }

    fn detection(confidence: f32, size: u32) -> Detection {
        Detection {
            bbox: [0, 0, size, size],
            confidence,
            class_name: "bird".to_string(),
            area_ratio: 0.05,
        }
    }

    fn session() -> VisitSession {
        let mut machine =
            crate::visit::VisitStateMachine::new(settings());
        machine.on_tick(0, &[detection(0.5, 10)]);
        machine.current_session().cloned().expect("session started")
    }

    #[test]
    fn first_capture_is_always_due() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CapturePolicy::new(dir.path(), settings());
        assert!(policy.should_capture(&session(), 0));
    }

    #[test]
    fn interval_and_cap_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CapturePolicy::new(dir.path(), settings());
        let mut session = session();
        let frame = frame();

        policy
            .record_capture(&mut session, &frame, &[detection(0.5, 10)], 0)
            .unwrap();
        assert!(!policy.should_capture(&session, 2_000));
        assert!(policy.should_capture(&session, 3_000));

        policy
            .record_capture(&mut session, &frame, &[detection(0.5, 10)], 3_000)
            .unwrap();
        policy
            .record_capture(&mut session, &frame, &[detection(0.5, 10)], 6_000)
            .unwrap();
        // Cap of 3 reached.
        assert!(!policy.should_capture(&session, 60_000));
    }

    #[test]
    fn retried_capture_lands_on_the_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CapturePolicy::new(dir.path(), settings());
        let mut a = session();
        let mut b = a.clone();
        let frame = frame();

        let first = policy
            .record_capture(&mut a, &frame, &[], 1_000)
            .unwrap();
        let retried = policy
            .record_capture(&mut b, &frame, &[], 1_000)
            .unwrap();
        assert_eq!(first.path, retried.path);
        assert_eq!(first.fingerprint, retried.fingerprint);
    }

    #[test]
    fn best_capture_tracks_highest_score() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CapturePolicy::new(dir.path(), settings());
        let mut session = session();
        let frame = frame();

        policy
            .record_capture(&mut session, &frame, &[detection(0.5, 10)], 0)
            .unwrap();
        policy
            .record_capture(&mut session, &frame, &[detection(0.9, 20)], 3_000)
            .unwrap();
        policy
            .record_capture(&mut session, &frame, &[detection(0.3, 5)], 6_000)
            .unwrap();

        assert_eq!(session.best_capture, Some(1));
        assert_eq!(session.best_capture().unwrap().seq, 1);
    }

    #[test]
    fn capture_paths_are_keyed_by_date_and_visit() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CapturePolicy::new(dir.path(), settings());
        let mut session = session();

        // 2026-08-23 00:00:00 UTC
        let ref_ = policy
            .record_capture(&mut session, &frame(), &[], 1_787_443_200_000)
            .unwrap();
        let path = ref_.path.to_string_lossy().to_string();
        assert!(path.contains("2026-08-23"), "path was {}", path);
        assert!(path.contains(&session.id));
        assert!(path.ends_with("00.jpg"));
        assert!(ref_.path.exists());
    }
}
