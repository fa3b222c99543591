//! feederd - feeder watch daemon.
//!
//! Connects to the camera stream, runs the visit pipeline, and keeps going
//! until interrupted. Configuration comes from the JSON file named by
//! `FEEDER_CONFIG` plus `FEEDER_*` environment overrides; command-line flags
//! override both.

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use feeder_watch::analyze::{Classifier, ClassifierVerdict, ClassifyError};
use feeder_watch::detect::BrightBlobBackend;
use feeder_watch::{FeederConfig, HttpClassifier, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "feederd", about = "Bird feeder visit detection daemon")]
struct Args {
    /// Stream URL (stub:// or http(s):// MJPEG), overrides config.
    #[arg(long)]
    stream_url: Option<String>,

    /// Data directory for captures, the metrics store, and the report.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Run detection without the external classifier even if a key is set.
    #[arg(long)]
    no_classifier: bool,
}

/// Stands in when no API key is configured: every visit is recorded with
/// species "unknown", and the gate keeps the noise down.
struct DisabledClassifier;

impl Classifier for DisabledClassifier {
    fn classify(&self, _jpeg: &[u8]) -> Result<ClassifierVerdict, ClassifyError> {
        Err(ClassifyError::Fatal("classifier not configured".to_string()))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = FeederConfig::load()?;
    if let Some(url) = args.stream_url {
        config.stream.url = url;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let classifier: Arc<dyn Classifier> = if args.no_classifier {
        log::info!("classifier disabled by flag; visits will be recorded as unknown");
        Arc::new(DisabledClassifier)
    } else {
        match HttpClassifier::new(config.classifier.clone()) {
            Ok(classifier) => Arc::new(classifier),
            Err(e) => {
                log::warn!("{:#}; visits will be recorded as unknown", e);
                Arc::new(DisabledClassifier)
            }
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        handler_flag.store(true, Ordering::Relaxed);
    })?;

    log::info!("feederd starting: data_dir={}", config.data_dir.display());
    Pipeline::run(
        config,
        Box::new(BrightBlobBackend::default()),
        classifier,
        shutdown,
    )?;
    log::info!("feederd stopped");
    Ok(())
}
