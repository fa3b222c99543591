use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::Roi;

const DEFAULT_DATA_DIR: &str = "feeder_data";
const DEFAULT_STREAM_URL: &str = "stub://feeder_camera";
const DEFAULT_STREAM_FPS: u32 = 10;
const DEFAULT_STREAM_WIDTH: u32 = 640;
const DEFAULT_STREAM_HEIGHT: u32 = 480;

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_MIN_AREA_RATIO: f32 = 0.002;
const DEFAULT_TARGET_CLASS: &str = "bird";
const DEFAULT_ROI: [f32; 4] = [0.25, 0.34, 0.62, 0.72];

const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
const DEFAULT_GRACE_SECS: u64 = 5;
const DEFAULT_COOLDOWN_SECS: u64 = 15;
const DEFAULT_CAPTURE_INTERVAL_SECS: u64 = 3;
const DEFAULT_MAX_CAPTURES_PER_VISIT: usize = 5;
const DEFAULT_MERGE_WINDOW_SECS: u64 = 0;

const DEFAULT_CLASSIFIER_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_CLASSIFIER_MODEL: &str = "gpt-4o-mini";
const DEFAULT_CLASSIFIER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CLASSIFIER_MAX_RETRIES: u32 = 3;
const DEFAULT_CLASSIFIER_RETRY_DELAY_SECS: u64 = 2;
const DEFAULT_CLASSIFIER_DISABLE_COOLDOWN_SECS: u64 = 300;
const DEFAULT_CLASSIFIER_MAX_IMAGE_DIM: u32 = 512;
const DEFAULT_CLASSIFIER_MAX_TOKENS: u32 = 300;

const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_ANALYSIS_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Deserialize, Default)]
struct FeederConfigFile {
    data_dir: Option<PathBuf>,
    stream: Option<StreamConfigFile>,
    detection: Option<DetectionConfigFile>,
    visit: Option<VisitConfigFile>,
    classifier: Option<ClassifierConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    min_area_ratio: Option<f32>,
    target_class: Option<String>,
    roi: Option<[f32; 4]>,
    tick_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct VisitConfigFile {
    grace_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    capture_interval_secs: Option<u64>,
    max_captures_per_visit: Option<usize>,
    merge_window_secs: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    endpoint: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_secs: Option<u64>,
    disable_cooldown_secs: Option<u64>,
    max_image_dim: Option<u32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub data_dir: PathBuf,
    pub stream: StreamSettings,
    pub detection: DetectionSettings,
    pub visit: VisitSettings,
    pub classifier: ClassifierSettings,
    pub analysis_queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub confidence_threshold: f32,
    pub min_area_ratio: f32,
    pub target_class: String,
    pub roi: Roi,
    pub tick_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct VisitSettings {
    pub grace: Duration,
    pub cooldown: Duration,
    pub capture_interval: Duration,
    pub max_captures_per_visit: usize,
    /// Merge window for reopening a just-completed visit. Zero disables merging.
    pub merge_window: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub endpoint: String,
    pub model: String,
    /// API key comes from the environment only, never from the config file.
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub disable_cooldown: Duration,
    pub max_image_dim: u32,
    pub max_tokens: u32,
}

impl FeederConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FEEDER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FeederConfigFile) -> Result<Self> {
        let data_dir = file
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let stream = StreamSettings {
            url: file
                .stream
                .as_ref()
                .and_then(|s| s.url.clone())
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            target_fps: file
                .stream
                .as_ref()
                .and_then(|s| s.target_fps)
                .unwrap_or(DEFAULT_STREAM_FPS),
            width: file
                .stream
                .as_ref()
                .and_then(|s| s.width)
                .unwrap_or(DEFAULT_STREAM_WIDTH),
            height: file
                .stream
                .as_ref()
                .and_then(|s| s.height)
                .unwrap_or(DEFAULT_STREAM_HEIGHT),
        };
        let roi = file
            .detection
            .as_ref()
            .and_then(|d| d.roi)
            .unwrap_or(DEFAULT_ROI);
        let detection = DetectionSettings {
            confidence_threshold: file
                .detection
                .as_ref()
                .and_then(|d| d.confidence_threshold)
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            min_area_ratio: file
                .detection
                .as_ref()
                .and_then(|d| d.min_area_ratio)
                .unwrap_or(DEFAULT_MIN_AREA_RATIO),
            target_class: file
                .detection
                .as_ref()
                .and_then(|d| d.target_class.clone())
                .unwrap_or_else(|| DEFAULT_TARGET_CLASS.to_string()),
            roi: Roi::new(roi[0], roi[1], roi[2], roi[3])?,
            tick_interval: Duration::from_millis(
                file.detection
                    .as_ref()
                    .and_then(|d| d.tick_interval_ms)
                    .unwrap_or(DEFAULT_TICK_INTERVAL_MS),
            ),
        };
        let visit = VisitSettings {
            grace: Duration::from_secs(
                file.visit
                    .as_ref()
                    .and_then(|v| v.grace_secs)
                    .unwrap_or(DEFAULT_GRACE_SECS),
            ),
            cooldown: Duration::from_secs(
                file.visit
                    .as_ref()
                    .and_then(|v| v.cooldown_secs)
                    .unwrap_or(DEFAULT_COOLDOWN_SECS),
            ),
            capture_interval: Duration::from_secs(
                file.visit
                    .as_ref()
                    .and_then(|v| v.capture_interval_secs)
                    .unwrap_or(DEFAULT_CAPTURE_INTERVAL_SECS),
            ),
            max_captures_per_visit: file
                .visit
                .as_ref()
                .and_then(|v| v.max_captures_per_visit)
                .unwrap_or(DEFAULT_MAX_CAPTURES_PER_VISIT),
            merge_window: Duration::from_secs(
                file.visit
                    .as_ref()
                    .and_then(|v| v.merge_window_secs)
                    .unwrap_or(DEFAULT_MERGE_WINDOW_SECS),
            ),
            jpeg_quality: file
                .visit
                .as_ref()
                .and_then(|v| v.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
        };
        let classifier = ClassifierSettings {
            endpoint: file
                .classifier
                .as_ref()
                .and_then(|c| c.endpoint.clone())
                .unwrap_or_else(|| DEFAULT_CLASSIFIER_ENDPOINT.to_string()),
            model: file
                .classifier
                .as_ref()
                .and_then(|c| c.model.clone())
                .unwrap_or_else(|| DEFAULT_CLASSIFIER_MODEL.to_string()),
            api_key: None,
            timeout: Duration::from_secs(
                file.classifier
                    .as_ref()
                    .and_then(|c| c.timeout_secs)
                    .unwrap_or(DEFAULT_CLASSIFIER_TIMEOUT_SECS),
            ),
            max_retries: file
                .classifier
                .as_ref()
                .and_then(|c| c.max_retries)
                .unwrap_or(DEFAULT_CLASSIFIER_MAX_RETRIES),
            retry_delay: Duration::from_secs(
                file.classifier
                    .as_ref()
                    .and_then(|c| c.retry_delay_secs)
                    .unwrap_or(DEFAULT_CLASSIFIER_RETRY_DELAY_SECS),
            ),
            disable_cooldown: Duration::from_secs(
                file.classifier
                    .as_ref()
                    .and_then(|c| c.disable_cooldown_secs)
                    .unwrap_or(DEFAULT_CLASSIFIER_DISABLE_COOLDOWN_SECS),
            ),
            max_image_dim: file
                .classifier
                .as_ref()
                .and_then(|c| c.max_image_dim)
                .unwrap_or(DEFAULT_CLASSIFIER_MAX_IMAGE_DIM),
            max_tokens: file
                .classifier
                .and_then(|c| c.max_tokens)
                .unwrap_or(DEFAULT_CLASSIFIER_MAX_TOKENS),
        };
        Ok(Self {
            data_dir,
            stream,
            detection,
            visit,
            classifier,
            analysis_queue_depth: DEFAULT_ANALYSIS_QUEUE_DEPTH,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FEEDER_STREAM_URL") {
            if !url.trim().is_empty() {
                self.stream.url = url;
            }
        }
        if let Ok(dir) = std::env::var("FEEDER_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(endpoint) = std::env::var("FEEDER_CLASSIFIER_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.classifier.endpoint = endpoint;
            }
        }
        if let Ok(key) = std::env::var("FEEDER_CLASSIFIER_API_KEY") {
            if !key.trim().is_empty() {
                self.classifier.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(interval) = std::env::var("FEEDER_TICK_INTERVAL_MS") {
            let ms: u64 = interval.parse().map_err(|_| {
                anyhow!("FEEDER_TICK_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.detection.tick_interval = Duration::from_millis(ms);
        }
        if let Ok(window) = std::env::var("FEEDER_MERGE_WINDOW_SECS") {
            let secs: u64 = window.parse().map_err(|_| {
                anyhow!("FEEDER_MERGE_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.visit.merge_window = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.detection.min_area_ratio) {
            return Err(anyhow!("min_area_ratio must be within 0..=1"));
        }
        if self.detection.target_class.trim().is_empty() {
            return Err(anyhow!("target_class must not be empty"));
        }
        if self.detection.tick_interval.is_zero() {
            return Err(anyhow!("tick_interval_ms must be greater than zero"));
        }
        if self.visit.capture_interval.is_zero() {
            return Err(anyhow!("capture_interval_secs must be greater than zero"));
        }
        if self.visit.max_captures_per_visit == 0 {
            return Err(anyhow!("max_captures_per_visit must be greater than zero"));
        }
        if self.visit.jpeg_quality == 0 || self.visit.jpeg_quality > 100 {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        Ok(())
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("visits.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.data_dir.join("report.md")
    }
}

fn read_config_file(path: &Path) -> Result<FeederConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
