//! Frame ingestion sources.
//!
//! This module provides sources for decoded frames:
//! - `stub://` synthetic source (tests, demos)
//! - `http(s)://` MJPEG or single-JPEG camera endpoints
//!
//! All sources produce `Frame` instances that flow into the latest-frame slot.
//! The ingestion layer owns connection, decoding, frame decimation, and
//! reconnection; the tick loop only ever sees "latest frame or none". A real
//! RTSP decoder is an external collaborator and plugs in behind the same
//! `connect`/`next_frame` surface.

mod mjpeg;
mod stub;

pub use mjpeg::MjpegSource;
pub use stub::{StubPattern, StubSource};

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use url::Url;

use crate::config::StreamSettings;
use crate::frame::{Frame, FrameSlot};

const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// A frame source. Dispatches on the URL scheme.
pub struct FrameSource {
    backend: SourceBackend,
}

enum SourceBackend {
    Stub(StubSource),
    Mjpeg(MjpegSource),
}

impl FrameSource {
    pub fn new(settings: &StreamSettings) -> Result<Self> {
        if settings.url.starts_with("stub://") {
            return Ok(Self {
                backend: SourceBackend::Stub(StubSource::new(settings.clone())),
            });
        }
        let url = Url::parse(&settings.url).context("parse stream url")?;
        match url.scheme() {
            "http" | "https" => Ok(Self {
                backend: SourceBackend::Mjpeg(MjpegSource::new(settings.clone())),
            }),
            other => Err(anyhow!(
                "unsupported stream scheme '{}'; expected stub or http(s)",
                other
            )),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            SourceBackend::Stub(source) => source.connect(),
            SourceBackend::Mjpeg(source) => source.connect(),
        }
    }

    /// Capture the next frame. Blocks until a frame is available or the
    /// source fails; called only from the dedicated reader thread.
    pub fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            SourceBackend::Stub(source) => source.next_frame(),
            SourceBackend::Mjpeg(source) => source.next_frame(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            SourceBackend::Stub(source) => source.is_healthy(),
            SourceBackend::Mjpeg(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            SourceBackend::Stub(source) => source.stats(),
            SourceBackend::Mjpeg(source) => source.stats(),
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Run a source on its own thread, publishing into the slot.
///
/// The source's blocking I/O is isolated here so a stalled stream never delays
/// the tick loop. On read failure the reader reconnects with exponential
/// backoff (2s doubling to 60s, with jitter) and keeps trying until shutdown;
/// while disconnected the tick loop simply sees a stale or empty slot.
pub fn spawn_reader(
    mut source: FrameSource,
    slot: FrameSlot,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut backoff = RECONNECT_BACKOFF_START;
        let mut consecutive_failures = 0u32;

        while !shutdown.load(Ordering::Relaxed) {
            match source.next_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    backoff = RECONNECT_BACKOFF_START;
                    slot.publish(frame);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    log::warn!(
                        "frame read failed (failures: {}, healthy: {}): {:#}",
                        consecutive_failures,
                        source.is_healthy(),
                        e
                    );
                    let jitter = Duration::from_millis(rand::random::<u64>() % 500);
                    interruptible_sleep(backoff + jitter, &shutdown);
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);

                    if let Err(e) = source.connect() {
                        log::warn!("reconnect failed: {:#}", e);
                    } else {
                        log::info!("frame source reconnected");
                    }
                }
            }
        }
        log::info!(
            "frame reader stopped after {} frames",
            source.stats().frames_captured
        );
    })
}

fn interruptible_sleep(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}
