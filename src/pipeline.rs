//! Pipeline wiring.
//!
//! Thread layout, fixed for the life of the process:
//! - one frame reader thread (blocking source I/O, publishes into the slot)
//! - the tick loop on the caller's thread (state machine + capture policy;
//!   never blocks on the network)
//! - a small pool of analysis workers draining a bounded queue of completed
//!   visits
//! - exactly one store thread serializing commits and regenerating the report
//!
//! Shutdown: stop ticking, close the analysis queue, let in-flight analyses
//! finish, flush pending commits, then release the frame reader.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use crate::analyze::{AnalysisResult, AnalysisWorker, Classifier, ClassifierGate};
use crate::capture::CapturePolicy;
use crate::config::FeederConfig;
use crate::detect::{DetectorAdapter, DetectorBackend};
use crate::frame::FrameSlot;
use crate::ingest::{spawn_reader, FrameSource};
use crate::now_ms;
use crate::report::ReportEmitter;
use crate::store::StoreWriter;
use crate::visit::{TickEvent, VisitSession, VisitStateMachine};

const ANALYSIS_WORKERS: usize = 2;
/// Commit attempts per visit before it is logged as lost.
const MAX_COMMIT_ATTEMPTS: u32 = 3;
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct Pipeline;

impl Pipeline {
    /// Run the watch-mode pipeline until `shutdown` is set.
    pub fn run(
        config: FeederConfig,
        backend: Box<dyn DetectorBackend>,
        classifier: Arc<dyn Classifier>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        let mut source = FrameSource::new(&config.stream)?;
        source.connect().context("connect frame source")?;
        Self::run_with_source(config, source, backend, classifier, shutdown)
    }

    /// Same as `run`, with a pre-built (already connected) source.
    pub fn run_with_source(
        config: FeederConfig,
        source: FrameSource,
        backend: Box<dyn DetectorBackend>,
        classifier: Arc<dyn Classifier>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

        let slot = FrameSlot::new();
        let reader = spawn_reader(source, slot.clone(), Arc::clone(&shutdown));

        let (analysis_tx, analysis_rx) = mpsc::sync_channel(config.analysis_queue_depth);
        let (result_tx, result_rx) = mpsc::channel();

        let gate = Arc::new(ClassifierGate::new());
        let workers = AnalysisWorker::spawn(
            ANALYSIS_WORKERS,
            classifier,
            gate,
            config.classifier.clone(),
            analysis_rx,
            result_tx.clone(),
        );

        let writer = StoreWriter::open(config.store_path())?;
        let emitter = ReportEmitter::new(config.report_path());
        let store_thread = std::thread::spawn(move || run_store(writer, emitter, result_rx));

        let mut detector = DetectorAdapter::new(backend, config.detection.clone());
        let mut machine = VisitStateMachine::new(config.visit.clone());
        let policy = CapturePolicy::new(config.captures_dir(), config.visit.clone());

        log::info!(
            "feeder pipeline running: source={}, detector={}, store={}",
            config.stream.url,
            detector.backend_name(),
            config.store_path().display()
        );

        let tick_result = tick_loop(
            &config,
            &slot,
            &mut detector,
            &mut machine,
            &policy,
            &analysis_tx,
            &result_tx,
            &shutdown,
        );

        // Orderly teardown: closing the queues lets each stage drain and exit.
        drop(analysis_tx);
        for handle in workers {
            let _ = handle.join();
        }
        drop(result_tx);
        let _ = store_thread.join();
        let _ = reader.join();

        tick_result
    }
}

#[allow(clippy::too_many_arguments)]
fn tick_loop(
    config: &FeederConfig,
    slot: &FrameSlot,
    detector: &mut DetectorAdapter,
    machine: &mut VisitStateMachine,
    policy: &CapturePolicy,
    analysis_tx: &mpsc::SyncSender<VisitSession>,
    result_tx: &Sender<(VisitSession, AnalysisResult)>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let mut last_seq: Option<u64> = None;
    let mut last_health = std::time::Instant::now();
    let mut ticks = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        let tick_started = std::time::Instant::now();

        // No new frame means no tick: a stalled source pauses detection
        // instead of feeding the machine stale observations.
        if let Some(frame) = slot.latest() {
            if last_seq != Some(frame.seq) {
                last_seq = Some(frame.seq);
                ticks += 1;

                match detector.detect(&frame) {
                    Ok(detections) => {
                        let now = now_ms()?;
                        for event in machine.on_tick(now, &detections) {
                            match event {
                                TickEvent::VisitStarted { .. } | TickEvent::VisitReopened { .. } => {}
                                TickEvent::CaptureRequested => {
                                    if let Some(session) = machine.current_session_mut() {
                                        if policy.should_capture(session, now) {
                                            if let Err(e) = policy.record_capture(
                                                session,
                                                &frame,
                                                &detections,
                                                now,
                                            ) {
                                                log::warn!("capture failed: {:#}", e);
                                            }
                                        }
                                    }
                                }
                                TickEvent::VisitCompleted(session) => {
                                    enqueue_visit(session, analysis_tx, result_tx)?;
                                }
                            }
                        }
                    }
                    Err(e) => log::warn!("detection failed, skipping tick: {:#}", e),
                }
            }
        }

        if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
            last_health = std::time::Instant::now();
            log::info!("pipeline health: state={}, ticks={}", machine.state().as_str(), ticks);
        }

        let elapsed = tick_started.elapsed();
        if elapsed < config.detection.tick_interval {
            std::thread::sleep(config.detection.tick_interval - elapsed);
        }
    }

    log::info!("tick loop stopped after {} ticks", ticks);
    Ok(())
}

/// Hand a completed visit to the analysis queue. When the queue is full the
/// visit is committed directly with an unresolved result instead of blocking
/// detection or dropping the visit.
fn enqueue_visit(
    session: VisitSession,
    analysis_tx: &mpsc::SyncSender<VisitSession>,
    result_tx: &Sender<(VisitSession, AnalysisResult)>,
) -> Result<()> {
    match analysis_tx.try_send(session) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(session)) => {
            log::warn!(
                "analysis queue full, recording visit {} without classification",
                session.id
            );
            let result =
                AnalysisResult::unresolved("analysis skipped: queue full", now_ms()?);
            result_tx
                .send((session, result))
                .context("store channel closed")?;
            Ok(())
        }
        Err(TrySendError::Disconnected(_)) => Err(anyhow::anyhow!("analysis queue closed")),
    }
}

/// Store actor: the only thread that ever writes the metrics document.
///
/// Commit failures keep the visit in an in-memory retry set; a visit is only
/// dropped (and loudly logged as lost) after the retry budget is exhausted.
fn run_store(
    mut writer: StoreWriter,
    emitter: ReportEmitter,
    rx: Receiver<(VisitSession, AnalysisResult)>,
) {
    let mut pending: VecDeque<(VisitSession, AnalysisResult, u32)> = VecDeque::new();

    for (session, result) in rx.iter() {
        pending.push_back((session, result, 0));
        drain_pending(&mut writer, &emitter, &mut pending);
    }

    // Channel closed: one final flush before exit.
    drain_pending(&mut writer, &emitter, &mut pending);
    for (session, _, attempts) in pending {
        log::error!(
            "visit {} lost after {} commit attempts: captured but not saved",
            session.id,
            attempts
        );
    }
    log::info!("store writer stopped");
}

fn drain_pending(
    writer: &mut StoreWriter,
    emitter: &ReportEmitter,
    pending: &mut VecDeque<(VisitSession, AnalysisResult, u32)>,
) {
    let mut remaining = VecDeque::new();
    while let Some((session, result, attempts)) = pending.pop_front() {
        match writer.commit(&session, &result, Some(emitter.path())) {
            Ok(_ack) => match writer.load() {
                Ok(doc) => {
                    if let Err(e) = emitter.emit(&doc) {
                        log::warn!("report regeneration failed: {:#}", e);
                    }
                }
                Err(e) => log::warn!("report skipped, store unreadable: {:#}", e),
            },
            Err(e) => {
                let attempts = attempts + 1;
                log::error!(
                    "commit failed for visit {} (attempt {}/{}): {:#}",
                    session.id,
                    attempts,
                    MAX_COMMIT_ATTEMPTS,
                    e
                );
                if attempts >= MAX_COMMIT_ATTEMPTS {
                    log::error!(
                        "visit {} lost after {} commit attempts: captured but not saved",
                        session.id,
                        attempts
                    );
                } else {
                    remaining.push_back((session, result, attempts));
                }
            }
        }
    }
    *pending = remaining;
}
