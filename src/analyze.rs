//! Asynchronous visit analysis.
//!
//! Completed visits are queued for classification off the tick thread: the
//! worker selects the visit's best capture, crops it to the detection box
//! plus margin, bounds its size, and sends it to the external vision service.
//!
//! Error taxonomy:
//! - transient (timeouts, 429, 5xx, unparseable responses): retried with
//!   doubling backoff up to a fixed attempt budget;
//! - fatal (401/403, broken credentials): logged once and the shared
//!   `ClassifierGate` suppresses classification for a cooldown window so every
//!   subsequent visit does not re-trigger the same failure.
//!
//! In every failure mode the visit still produces an `AnalysisResult` with
//! species "unknown" — detection data is never discarded because
//! classification failed.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ClassifierSettings;
use crate::now_ms;
use crate::species::{normalize_species, ConfidenceTier};
use crate::visit::VisitSession;

const PROMPT: &str = "Analyze this bird feeder image. Return JSON with:\n\
- birds_present (bool): Whether any birds are visible\n\
- count (int): Number of distinct birds\n\
- species_guess (string): Your best guess for species name (use \"unknown\" only if truly uncertain)\n\
- confidence (string): \"low\", \"medium\", or \"high\"\n\
- summary (string): Brief natural language description\n\n\
Provide your best species guess even if not 100% certain.";

/// Crop margin around the detection box, as a fraction of its size.
const CROP_MARGIN: f32 = 0.1;

/// Classification failure, split by retry policy.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// Worth retrying: network errors, timeouts, rate limits, 5xx,
    /// unparseable responses.
    #[error("transient classifier failure: {0}")]
    Transient(String),
    /// Not worth retrying: bad credentials or a permanently broken request.
    #[error("fatal classifier failure: {0}")]
    Fatal(String),
}

/// Structured response from the vision service.
#[derive(Clone, Debug, Deserialize)]
pub struct ClassifierVerdict {
    #[serde(default)]
    pub birds_present: bool,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_species")]
    pub species_guess: String,
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: ConfidenceTier,
    #[serde(default)]
    pub summary: String,
}

fn default_count() -> u32 {
    1
}

fn default_species() -> String {
    "unknown".to_string()
}

/// Models capitalize the tier often enough that a strict enum parse would
/// reject otherwise well-formed replies.
fn lenient_confidence<'de, D>(deserializer: D) -> Result<ConfidenceTier, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(ConfidenceTier::parse(&raw))
}

/// The external vision classifier: prepared image in, species verdict out.
pub trait Classifier: Send + Sync {
    fn classify(&self, jpeg: &[u8]) -> Result<ClassifierVerdict, ClassifyError>;
}

/// Result of analyzing one visit. Produced exactly once per completed visit,
/// resolved or not.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub species_raw: String,
    /// Normalized aggregation key; "unknown" when unresolved.
    pub species_key: String,
    pub confidence: ConfidenceTier,
    pub summary: String,
    pub bird_count: u32,
    pub analyzed_at_ms: u64,
}

impl AnalysisResult {
    pub fn unresolved(reason: &str, analyzed_at_ms: u64) -> Self {
        Self {
            species_raw: "unknown".to_string(),
            species_key: "unknown".to_string(),
            confidence: ConfidenceTier::Low,
            summary: reason.to_string(),
            bird_count: 1,
            analyzed_at_ms,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.species_key != "unknown"
    }

    fn from_verdict(verdict: ClassifierVerdict, analyzed_at_ms: u64) -> Self {
        let species_key = normalize_species(&verdict.species_guess);
        Self {
            species_raw: verdict.species_guess,
            species_key,
            confidence: verdict.confidence,
            summary: verdict.summary,
            bird_count: verdict.count.max(1),
            analyzed_at_ms,
        }
    }
}

/// Shared breaker for fatal classifier failures.
///
/// After a fatal failure the gate stays closed for the configured cooldown;
/// visits analyzed while closed are recorded as unresolved without touching
/// the service.
#[derive(Default)]
pub struct ClassifierGate {
    disabled_until_ms: AtomicU64,
}

impl ClassifierGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self, now_ms: u64) -> bool {
        now_ms < self.disabled_until_ms.load(Ordering::Relaxed)
    }

    pub fn disable_for(&self, now_ms: u64, cooldown: Duration) {
        self.disabled_until_ms
            .store(now_ms + cooldown.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Analyze one completed visit. Blocking (retries sleep); callers run this on
/// a worker thread, never on the tick thread.
pub fn analyze(
    classifier: &dyn Classifier,
    gate: &ClassifierGate,
    settings: &ClassifierSettings,
    session: &VisitSession,
) -> AnalysisResult {
    let analyzed_at = now_ms().unwrap_or(0);

    if gate.is_disabled(analyzed_at) {
        log::debug!(
            "classifier disabled, recording visit {} as unknown",
            session.id
        );
        return AnalysisResult::unresolved("classifier disabled", analyzed_at);
    }

    let jpeg = match prepare_image(session, settings.max_image_dim) {
        Ok(jpeg) => jpeg,
        Err(e) => {
            log::warn!("no usable capture for visit {}: {:#}", session.id, e);
            return AnalysisResult::unresolved("no capture available for analysis", analyzed_at);
        }
    };

    for attempt in 0..settings.max_retries {
        match classifier.classify(&jpeg) {
            Ok(verdict) => {
                let result = AnalysisResult::from_verdict(verdict, now_ms().unwrap_or(analyzed_at));
                log::info!(
                    "analysis complete for visit {}: {} ({})",
                    session.id,
                    result.species_raw,
                    result.confidence.as_str()
                );
                return result;
            }
            Err(ClassifyError::Fatal(reason)) => {
                log::error!(
                    "fatal classifier failure, disabling for {}s: {}",
                    settings.disable_cooldown.as_secs(),
                    reason
                );
                gate.disable_for(now_ms().unwrap_or(analyzed_at), settings.disable_cooldown);
                return AnalysisResult::unresolved("classifier unavailable", analyzed_at);
            }
            Err(ClassifyError::Transient(reason)) => {
                log::warn!(
                    "classifier attempt {}/{} failed for visit {}: {}",
                    attempt + 1,
                    settings.max_retries,
                    session.id,
                    reason
                );
                if attempt + 1 < settings.max_retries {
                    let delay = settings.retry_delay * 2u32.saturating_pow(attempt);
                    std::thread::sleep(delay);
                }
            }
        }
    }

    log::warn!("all classifier attempts failed for visit {}", session.id);
    AnalysisResult::unresolved("analysis failed after all retries", analyzed_at)
}

/// Prepare the best capture for classification: crop to the best detection's
/// box plus margin and bound the longest side.
pub fn prepare_image(session: &VisitSession, max_dim: u32) -> Result<Vec<u8>> {
    let capture = session
        .best_capture()
        .or_else(|| session.captures.first())
        .ok_or_else(|| anyhow!("visit has no captures"))?;

    let img = image::open(&capture.path)
        .with_context(|| format!("open capture {}", capture.path.display()))?;

    let cropped = match capture
        .detections
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    {
        Some(d) => {
            let [x1, y1, x2, y2] = d.bbox;
            let w = x2.saturating_sub(x1);
            let h = y2.saturating_sub(y1);
            let mx = (w as f32 * CROP_MARGIN) as u32;
            let my = (h as f32 * CROP_MARGIN) as u32;
            let cx = x1.saturating_sub(mx);
            let cy = y1.saturating_sub(my);
            let cw = (w + 2 * mx).min(img.width().saturating_sub(cx)).max(1);
            let ch = (h + 2 * my).min(img.height().saturating_sub(cy)).max(1);
            img.crop_imm(cx, cy, cw, ch)
        }
        None => img,
    };

    let bounded = if cropped.width().max(cropped.height()) > max_dim {
        cropped.resize(max_dim, max_dim, image::imageops::FilterType::Triangle)
    } else {
        cropped
    };

    let mut jpeg = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 85);
    bounded
        .to_rgb8()
        .write_with_encoder(encoder)
        .context("encode prepared image")?;
    Ok(jpeg)
}

// ----------------------------------------------------------------------------
// HTTP classifier
// ----------------------------------------------------------------------------

/// Vision classifier over an OpenAI-style chat completions endpoint.
pub struct HttpClassifier {
    settings: ClassifierSettings,
    agent: ureq::Agent,
}

impl HttpClassifier {
    pub fn new(settings: ClassifierSettings) -> Result<Self> {
        if settings.api_key.is_none() {
            return Err(anyhow!(
                "classifier api key not configured (FEEDER_CLASSIFIER_API_KEY)"
            ));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.timeout)
            .build();
        Ok(Self { settings, agent })
    }
}

impl Classifier for HttpClassifier {
    fn classify(&self, jpeg: &[u8]) -> Result<ClassifierVerdict, ClassifyError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| ClassifyError::Fatal("api key missing".to_string()))?;

        let body = serde_json::json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PROMPT },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg)),
                        },
                    },
                ],
            }],
        });

        let response = self
            .agent
            .post(&self.settings.endpoint)
            .set("Authorization", &format!("Bearer {}", api_key))
            .set("Content-Type", "application/json")
            .send_string(&body.to_string());

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(status_error(code));
            }
            Err(e) => {
                // Transport errors cover timeouts and connection failures.
                return Err(ClassifyError::Transient(format!("transport error: {}", e)));
            }
        };

        let body = response
            .into_string()
            .map_err(|e| ClassifyError::Transient(format!("read response body: {}", e)))?;
        let payload: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| ClassifyError::Transient(format!("invalid response body: {}", e)))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ClassifyError::Transient("response missing message content".to_string())
            })?;

        parse_verdict(content)
    }
}

fn status_error(code: u16) -> ClassifyError {
    match code {
        401 | 403 => ClassifyError::Fatal(format!("authentication rejected ({})", code)),
        408 | 429 => ClassifyError::Transient(format!("rate limited ({})", code)),
        500..=599 => ClassifyError::Transient(format!("server error ({})", code)),
        other => ClassifyError::Fatal(format!("unexpected status ({})", other)),
    }
}

/// Parse the model's reply. Prefers the JSON object span; falls back to a
/// regex scrape of `species_guess` for replies that wrap the JSON in prose.
pub fn parse_verdict(content: &str) -> Result<ClassifierVerdict, ClassifyError> {
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if end > start {
            if let Ok(verdict) =
                serde_json::from_str::<ClassifierVerdict>(&content[start..=end])
            {
                return Ok(verdict);
            }
        }
    }

    let re = regex::Regex::new(r#"(?i)species[_\s]*guess[:\s]*["']?([^"',}\n]+)"#)
        .map_err(|e| ClassifyError::Fatal(format!("bad fallback pattern: {}", e)))?;
    if let Some(caps) = re.captures(content) {
        let species = caps[1].trim().to_string();
        return Ok(ClassifierVerdict {
            birds_present: true,
            count: 1,
            species_guess: species,
            confidence: ConfidenceTier::Low,
            summary: content.trim().to_string(),
        });
    }

    Err(ClassifyError::Transient(
        "no parseable verdict in response".to_string(),
    ))
}

// ----------------------------------------------------------------------------
// Worker pool
// ----------------------------------------------------------------------------

/// Drains the completed-visit queue and forwards (session, result) pairs to
/// the store writer. Multiple workers may analyze concurrently; commits are
/// serialized downstream by the single store thread.
pub struct AnalysisWorker;

impl AnalysisWorker {
    pub fn spawn(
        workers: usize,
        classifier: Arc<dyn Classifier>,
        gate: Arc<ClassifierGate>,
        settings: ClassifierSettings,
        rx: Receiver<VisitSession>,
        tx: Sender<(VisitSession, AnalysisResult)>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let tx = tx.clone();
                let classifier = Arc::clone(&classifier);
                let gate = Arc::clone(&gate);
                let settings = settings.clone();
                std::thread::spawn(move || loop {
                    let session = {
                        let rx = match rx.lock() {
                            Ok(rx) => rx,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        rx.recv()
                    };
                    let Ok(session) = session else {
                        log::debug!("analysis worker {} stopping: queue closed", worker);
                        break;
                    };
                    let result = analyze(classifier.as_ref(), &gate, &settings, &session);
                    if tx.send((session, result)).is_err() {
                        log::debug!("analysis worker {} stopping: store closed", worker);
                        break;
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn settings() -> ClassifierSettings {
        ClassifierSettings {
            endpoint: "http://127.0.0.1:0/unused".to_string(),
            model: "test-model".to_string(),
            api_key: Some("key".to_string()),
            timeout: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::ZERO,
            disable_cooldown: Duration::from_secs(300),
            max_image_dim: 512,
            max_tokens: 300,
        }
    }

    struct ScriptedClassifier {
        calls: AtomicU32,
        script: Vec<Result<ClassifierVerdict, ClassifyError>>,
    }

    impl ScriptedClassifier {
        fn new(script: Vec<Result<ClassifierVerdict, ClassifyError>>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                script,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl Classifier for ScriptedClassifier {
        fn classify(&self, _jpeg: &[u8]) -> Result<ClassifierVerdict, ClassifyError> {
            let i = self.calls.fetch_add(1, Ordering::Relaxed) as usize;
            match self.script.get(i.min(self.script.len().saturating_sub(1))) {
                Some(Ok(v)) => Ok(v.clone()),
                Some(Err(ClassifyError::Transient(s))) => {
                    Err(ClassifyError::Transient(s.clone()))
                }
                Some(Err(ClassifyError::Fatal(s))) => Err(ClassifyError::Fatal(s.clone())),
                None => Err(ClassifyError::Transient("empty script".to_string())),
            }
        }
    }

    fn verdict(species: &str) -> ClassifierVerdict {
        ClassifierVerdict {
            birds_present: true,
            count: 2,
            species_guess: species.to_string(),
            confidence: ConfidenceTier::High,
            summary: "a bird".to_string(),
        }
    }

    fn session_with_capture() -> (tempfile::TempDir, VisitSession) {
        use crate::capture::CapturePolicy;
        use crate::frame::Frame;

        let dir = tempfile::tempdir().unwrap();
        let policy = CapturePolicy::new(dir.path(), policy_settings());
        let mut machine = crate::visit::VisitStateMachine::new(policy_settings());
        machine.on_tick(0, &[test_detection()]);
        let mut session = machine.current_session().cloned().unwrap();
        let frame = Frame::new(vec![90u8; 64 * 64 * 3], 64, 64, 0, 0);
        policy
            .record_capture(&mut session, &frame, &[test_detection()], 0)
            .unwrap();
        (dir, session)
    }

    fn policy_settings() -> crate::config::VisitSettings {
        crate::config::VisitSettings {
            grace: Duration::from_secs(5),
            cooldown: Duration::from_secs(15),
            capture_interval: Duration::from_secs(3),
            max_captures_per_visit: 5,
            merge_window: Duration::ZERO,
            jpeg_quality: 85,
        }
    }

    fn test_detection() -> crate::detect::Detection {
        crate::detect::Detection {
            bbox: [8, 8, 40, 40],
            confidence: 0.8,
            class_name: "bird".to_string(),
            area_ratio: 0.1,
        }
    }

    #[test]
    fn verdict_json_parses_directly() {
        let v = parse_verdict(
            r#"{"birds_present": true, "count": 2, "species_guess": "Blue Jay", "confidence": "high", "summary": "two jays"}"#,
        )
        .unwrap();
        assert_eq!(v.species_guess, "Blue Jay");
        assert_eq!(v.count, 2);
        assert_eq!(v.confidence, ConfidenceTier::High);
    }

    #[test]
    fn capitalized_confidence_keeps_the_structured_parse() {
        let v = parse_verdict(
            r#"{"birds_present": true, "count": 3, "species_guess": "Blue Jay", "confidence": "High", "summary": "three jays"}"#,
        )
        .unwrap();
        // The whole verdict survives; nothing is demoted to the regex scrape.
        assert_eq!(v.count, 3);
        assert_eq!(v.confidence, ConfidenceTier::High);
        assert_eq!(v.summary, "three jays");
    }

    #[test]
    fn regex_scrape_stops_at_commas() {
        let v = parse_verdict("species_guess: American Goldfinch, count: 2").unwrap();
        assert_eq!(v.species_guess, "American Goldfinch");
    }

    #[test]
    fn verdict_json_is_extracted_from_surrounding_prose() {
        let v = parse_verdict(
            "Here you go:\n```json\n{\"species_guess\": \"House Finch\", \"count\": 1}\n```\nHope that helps!",
        )
        .unwrap();
        assert_eq!(v.species_guess, "House Finch");
        assert!(v.summary.is_empty());
    }

    #[test]
    fn verdict_falls_back_to_regex_scrape() {
        let v = parse_verdict("I think the species_guess: Northern Cardinal, low confidence")
            .unwrap();
        assert_eq!(v.species_guess, "Northern Cardinal");
        assert_eq!(v.confidence, ConfidenceTier::Low);
    }

    #[test]
    fn garbage_response_is_transient() {
        let err = parse_verdict("I cannot help with that").unwrap_err();
        assert!(matches!(err, ClassifyError::Transient(_)));
    }

    #[test]
    fn transient_failures_are_retried_then_succeed() {
        let (_dir, session) = session_with_capture();
        let classifier = ScriptedClassifier::new(vec![
            Err(ClassifyError::Transient("timeout".to_string())),
            Err(ClassifyError::Transient("timeout".to_string())),
            Ok(verdict("House Sparrows")),
        ]);
        let gate = ClassifierGate::new();

        let result = analyze(&classifier, &gate, &settings(), &session);
        assert_eq!(classifier.call_count(), 3);
        assert!(result.is_resolved());
        assert_eq!(result.species_key, "house sparrow");
        assert_eq!(result.bird_count, 2);
    }

    #[test]
    fn exhausted_retries_yield_unresolved_result() {
        let (_dir, session) = session_with_capture();
        let classifier = ScriptedClassifier::new(vec![Err(ClassifyError::Transient(
            "server error".to_string(),
        ))]);
        let gate = ClassifierGate::new();

        let result = analyze(&classifier, &gate, &settings(), &session);
        assert_eq!(classifier.call_count(), 3);
        assert!(!result.is_resolved());
        assert_eq!(result.species_key, "unknown");
    }

    #[test]
    fn fatal_failure_trips_the_gate_and_suppresses_later_calls() {
        let (_dir, session) = session_with_capture();
        let classifier = ScriptedClassifier::new(vec![Err(ClassifyError::Fatal(
            "authentication rejected (401)".to_string(),
        ))]);
        let gate = ClassifierGate::new();

        let first = analyze(&classifier, &gate, &settings(), &session);
        assert!(!first.is_resolved());
        assert_eq!(classifier.call_count(), 1);

        // Second visit while the gate is closed: the service is not touched.
        let second = analyze(&classifier, &gate, &settings(), &session);
        assert!(!second.is_resolved());
        assert_eq!(classifier.call_count(), 1);
    }

    #[test]
    fn visit_without_captures_is_still_recorded_as_unknown() {
        let mut machine = crate::visit::VisitStateMachine::new(policy_settings());
        machine.on_tick(0, &[test_detection()]);
        let session = machine.current_session().cloned().unwrap();

        let classifier = ScriptedClassifier::new(vec![Ok(verdict("Blue Jay"))]);
        let gate = ClassifierGate::new();
        let result = analyze(&classifier, &gate, &settings(), &session);

        assert_eq!(classifier.call_count(), 0);
        assert_eq!(result.species_key, "unknown");
    }

    #[test]
    fn prepared_image_is_bounded() {
        let (_dir, session) = session_with_capture();
        let jpeg = prepare_image(&session, 16).unwrap();
        let img = image::load_from_memory(&jpeg).unwrap();
        assert!(img.width().max(img.height()) <= 16);
    }

    #[test]
    fn auth_statuses_are_fatal_and_server_statuses_transient() {
        assert!(matches!(status_error(401), ClassifyError::Fatal(_)));
        assert!(matches!(status_error(403), ClassifyError::Fatal(_)));
        assert!(matches!(status_error(429), ClassifyError::Transient(_)));
        assert!(matches!(status_error(503), ClassifyError::Transient(_)));
    }
}
