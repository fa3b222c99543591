//! scan_captures - backfill the metrics store from capture files on disk.
//!
//! Walks `<data_dir>/captures/<date>/<visit_id>/` and commits any visit whose
//! id is not yet in the store, classifying its first capture when an API key
//! is configured. One-shot recovery tool for visits whose commit was lost
//! (crash between capture and store write).
//!
//! Do not run this while feederd is active: the store has a single-writer
//! protocol and this tool takes that role for the duration of the scan.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use feeder_watch::analyze::{self, ClassifierGate};
use feeder_watch::capture::{fingerprint_file, CaptureRef};
use feeder_watch::report::ReportEmitter;
use feeder_watch::store::StoreWriter;
use feeder_watch::visit::VisitSession;
use feeder_watch::{now_ms, AnalysisResult, FeederConfig, HttpClassifier};

#[derive(Parser, Debug)]
#[command(
    name = "scan_captures",
    about = "Backfill unrecorded visits from capture files",
    after_help = "Must not run concurrently with feederd: both write the same store."
)]
struct Args {
    /// Data directory holding captures/ and visits.json. Overrides config.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// List what would be committed without writing anything.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = FeederConfig::load()?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let classifier: Option<HttpClassifier> = match HttpClassifier::new(config.classifier.clone())
    {
        Ok(classifier) => Some(classifier),
        Err(e) => {
            log::warn!("{:#}; backfilled visits will be recorded as unknown", e);
            None
        }
    };

    let report_path = config.report_path();
    let mut writer = StoreWriter::open(config.store_path())?;
    let emitter = ReportEmitter::new(&report_path);
    let gate = ClassifierGate::new();

    let mut scanned = 0usize;
    let mut committed = 0usize;
    for visit_dir in visit_dirs(&config.captures_dir())? {
        let session = match synthesize_session(&visit_dir)? {
            Some(session) => session,
            None => continue,
        };
        scanned += 1;
        if writer.is_processed(&session.id) {
            continue;
        }
        if args.dry_run {
            log::info!(
                "would commit visit {} ({} captures)",
                session.id,
                session.captures.len()
            );
            continue;
        }

        let result = match classifier.as_ref() {
            Some(classifier) => {
                analyze::analyze(classifier, &gate, &config.classifier, &session)
            }
            None => AnalysisResult::unresolved("backfilled without classifier", now_ms()?),
        };
        writer
            .commit(&session, &result, Some(report_path.as_path()))
            .with_context(|| format!("backfill visit {}", session.id))?;
        committed += 1;
        log::info!("backfilled visit {}: {}", session.id, result.species_raw);
    }

    if committed > 0 {
        emitter.emit(&writer.load()?)?;
    }
    log::info!("scan complete: {} visits on disk, {} backfilled", scanned, committed);
    Ok(())
}

/// All `<captures>/<date>/<visit_id>` directories, in path order.
fn visit_dirs(captures_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let date_dirs = match std::fs::read_dir(captures_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => {
            return Err(e).with_context(|| format!("read {}", captures_dir.display()));
        }
    };
    for date_entry in date_dirs {
        let date_path = date_entry?.path();
        if !date_path.is_dir() {
            continue;
        }
        for visit_entry in std::fs::read_dir(&date_path)
            .with_context(|| format!("read {}", date_path.display()))?
        {
            let visit_path = visit_entry?.path();
            if visit_path.is_dir() {
                dirs.push(visit_path);
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Rebuild a session from a visit's capture directory. Timing comes from file
/// modification times; detection boxes are gone, so analysis sends the whole
/// first capture.
fn synthesize_session(visit_dir: &Path) -> Result<Option<VisitSession>> {
    let Some(id) = visit_dir.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };

    let mut jpegs: Vec<PathBuf> = std::fs::read_dir(visit_dir)
        .with_context(|| format!("read {}", visit_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "jpg"))
        .collect();
    jpegs.sort();
    if jpegs.is_empty() {
        return Ok(None);
    }

    let mut captures = Vec::with_capacity(jpegs.len());
    for (seq, path) in jpegs.iter().enumerate() {
        let fingerprint = fingerprint_file(path)?;
        let captured_at_ms = file_mtime_ms(path)?;
        captures.push(CaptureRef {
            seq,
            path: path.clone(),
            captured_at_ms,
            score: 0.0,
            fingerprint,
            detections: Vec::new(),
        });
    }

    let start_ms = captures.iter().map(|c| c.captured_at_ms).min().unwrap_or(0);
    let last_seen_ms = captures.iter().map(|c| c.captured_at_ms).max().unwrap_or(0);
    Ok(Some(VisitSession {
        id: id.to_string(),
        start_ms,
        last_seen_ms,
        end_ms: Some(last_seen_ms),
        captures,
        best_capture: Some(0),
        bird_count: 1,
    }))
}

fn file_mtime_ms(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?;
    let mtime = meta.modified().context("file mtime unavailable")?;
    Ok(mtime.duration_since(UNIX_EPOCH)?.as_millis() as u64)
}
