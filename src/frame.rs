//! Frames and the single-slot latest-frame holder.
//!
//! Frame producers (the ingest reader thread) and the tick loop never block
//! each other: the producer swaps the newest complete frame into the slot, and
//! readers take a cheap `Arc` clone of whatever is current, or `None` when no
//! frame has arrived yet.

use std::sync::{Arc, Mutex};

/// A decoded RGB8 frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Interleaved RGB8 pixel data, row-major, no padding.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Producer-assigned sequence number, monotonic per source.
    pub seq: u64,
    /// Capture wall-clock time, epoch milliseconds.
    pub captured_at_ms: u64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, seq: u64, captured_at_ms: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            seq,
            captured_at_ms,
        }
    }
}

/// Single-slot "latest frame" holder.
///
/// Publishing replaces the previous frame; a frame that is never read is
/// simply dropped. Readers always see the most recent complete frame or none.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<Option<Arc<Frame>>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        let mut slot = match self.inner.lock() {
            Ok(slot) => slot,
            // A poisoned slot means the producer panicked mid-publish; the
            // stored Option is still a complete value, so keep going.
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::new(frame));
    }

    /// Most recent frame, if any. Does not consume the slot; the same frame
    /// may be observed by multiple ticks (the tick loop dedups on `seq`).
    pub fn latest(&self) -> Option<Arc<Frame>> {
        let slot = match self.inner.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
    }
}
