//! feeder-watch - visit detection and species tracking for a feeder camera.
//!
//! The pipeline turns a noisy stream of per-frame detections into discrete,
//! deduplicated visit events:
//!
//! 1. A frame source publishes the latest frame into a single-slot holder.
//! 2. A fixed-interval tick loop runs the detector over the region of interest.
//! 3. The visit state machine converts detection ticks into visit lifecycle
//!    events (start, capture, complete).
//! 4. The capture policy persists rate-limited photos per visit.
//! 5. The analysis worker classifies each completed visit's best capture via an
//!    external vision service, with retry/backoff and a failure-storm breaker.
//! 6. The store writer merges results into an atomically-replaced JSON document
//!    and regenerates the report.
//!
//! Visit detection never blocks on classification, and a visit is only marked
//! processed after its store commit has been verified on disk.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod analyze;
pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod report;
pub mod species;
pub mod store;
pub mod visit;

pub use analyze::{
    AnalysisResult, AnalysisWorker, Classifier, ClassifierGate, ClassifierVerdict, ClassifyError,
    HttpClassifier,
};
pub use capture::{CapturePolicy, CaptureRef};
pub use config::FeederConfig;
pub use detect::{Detection, DetectorAdapter, DetectorBackend, Roi};
pub use frame::{Frame, FrameSlot};
pub use ingest::{FrameSource, SourceStats};
pub use pipeline::Pipeline;
pub use report::ReportEmitter;
pub use species::{normalize_species, ConfidenceTier};
pub use store::{CommitAck, MetricsDocument, StoreWriter, VisitRecord};
pub use visit::{TickEvent, VisitSession, VisitState, VisitStateMachine};

/// Wall-clock epoch milliseconds. Tick inputs and session timestamps carry
/// this value so the state machine itself never reads a clock.
pub fn now_ms() -> anyhow::Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}
