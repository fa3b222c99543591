use anyhow::Result;

/// A raw backend detection, normalized 0..1 within the image it was given.
#[derive(Clone, Debug)]
pub struct RawDetection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class_name: String,
}

/// Detector backend trait.
///
/// The object-detection model is a black box behind this seam: image in,
/// labelled boxes out. Backends receive the ROI crop only, never the full
/// frame, and must treat the pixel slice as read-only and ephemeral.
pub trait DetectorBackend: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Run detection on an interleaved RGB8 image.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
