//! Durable metrics store.
//!
//! One JSON document holds the aggregate: total visit count, the append-only
//! visit record list, and per-species running counts. The document is only
//! ever replaced atomically (temp file, fsync, rename) and every commit is
//! verified by re-reading the canonical file before the caller is allowed to
//! mark the visit processed. The canonical file is never mutated in place.
//!
//! Exactly one `StoreWriter` exists per data directory and it is owned by a
//! single thread; all commits are serialized through it. Everything else
//! treats the document as read-only.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::analyze::AnalysisResult;
use crate::species::ConfidenceTier;
use crate::visit::VisitSession;

/// The persisted aggregate.
///
/// Invariants: `total_visits == visits.len()`; the species counts sum to the
/// number of records with a resolved species.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub total_visits: u64,
    pub visits: Vec<VisitRecord>,
    pub species_counts: BTreeMap<String, u64>,
}

impl MetricsDocument {
    pub fn contains_visit(&self, id: &str) -> bool {
        self.visits.iter().any(|v| v.id == id)
    }

    pub fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        self.visits
            .iter()
            .any(|v| v.capture_fingerprint.as_deref() == Some(fingerprint))
    }
}

/// One completed, analyzed visit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisitRecord {
    pub id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_secs: Option<u64>,
    pub species_raw: String,
    pub species_norm: String,
    pub confidence: ConfidenceTier,
    pub summary: String,
    pub bird_count: u32,
    /// Best capture path, if any photo was taken.
    pub image: Option<String>,
    /// Fingerprint of the best capture; secondary dedup key.
    pub capture_fingerprint: Option<String>,
    /// All capture paths, in capture order.
    pub captures: Vec<String>,
    /// Rendered report that includes this visit, if one exists.
    pub report: Option<String>,
}

/// Acknowledgement of a verified commit.
#[derive(Clone, Copy, Debug)]
pub struct CommitAck {
    pub total_visits: u64,
    /// True when the visit was already in the store and nothing changed.
    pub deduplicated: bool,
}

/// Single writer over the metrics document.
#[derive(Debug)]
pub struct StoreWriter {
    path: PathBuf,
    /// Ids whose commit has been verified. Advanced only after verification,
    /// never before.
    processed: HashSet<String>,
}

impl StoreWriter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut writer = Self {
            path,
            processed: HashSet::new(),
        };
        // Seed the processed set from what is already durable.
        let doc = writer.load()?;
        writer.processed = doc.visits.into_iter().map(|v| v.id).collect();
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    /// Current document; missing file reads as the empty aggregate.
    pub fn load(&self) -> Result<MetricsDocument> {
        load_document(&self.path)
    }

    /// Merge one analyzed visit into the store.
    ///
    /// Re-delivery of an already-stored visit id (or best-capture fingerprint)
    /// acknowledges without modification. On any write or verification
    /// failure the visit stays unprocessed and the error distinguishes
    /// "captured but not saved" from nothing having happened.
    pub fn commit(
        &mut self,
        visit: &VisitSession,
        result: &AnalysisResult,
        report_path: Option<&Path>,
    ) -> Result<CommitAck> {
        let mut doc = self.load()?;

        let fingerprint = visit.best_capture().map(|c| c.fingerprint.clone());
        let duplicate = doc.contains_visit(&visit.id)
            || fingerprint
                .as_deref()
                .is_some_and(|fp| doc.contains_fingerprint(fp));
        if duplicate {
            log::info!("visit {} already committed, acknowledging", visit.id);
            self.processed.insert(visit.id.clone());
            return Ok(CommitAck {
                total_visits: doc.total_visits,
                deduplicated: true,
            });
        }

        let record = build_record(visit, result, fingerprint, report_path);
        doc.visits.push(record);
        doc.total_visits += 1;
        if result.is_resolved() {
            *doc
                .species_counts
                .entry(result.species_key.clone())
                .or_insert(0) += 1;
        }

        debug_assert_eq!(doc.total_visits as usize, doc.visits.len());

        let expected_total = doc.total_visits;
        let bytes = serde_json::to_vec_pretty(&doc).context("serialize metrics document")?;
        atomic_write(&self.path, &bytes).with_context(|| {
            format!(
                "visit {} captured but not saved: store write failed",
                visit.id
            )
        })?;

        // Verify the canonical file actually reflects the commit.
        let reread = load_document(&self.path)?;
        if reread.total_visits != expected_total || !reread.contains_visit(&visit.id) {
            return Err(anyhow!(
                "visit {} captured but not saved: store verification failed \
                 (expected {} visits, found {})",
                visit.id,
                expected_total,
                reread.total_visits
            ));
        }

        self.processed.insert(visit.id.clone());
        log::info!(
            "committed visit {} ({}), total visits: {}",
            visit.id,
            result.species_key,
            expected_total
        );
        Ok(CommitAck {
            total_visits: expected_total,
            deduplicated: false,
        })
    }
}

fn build_record(
    visit: &VisitSession,
    result: &AnalysisResult,
    fingerprint: Option<String>,
    report_path: Option<&Path>,
) -> VisitRecord {
    VisitRecord {
        id: visit.id.clone(),
        start_time: rfc3339(visit.start_ms),
        end_time: visit.end_ms.map(rfc3339),
        duration_secs: visit.duration_secs(),
        species_raw: result.species_raw.clone(),
        species_norm: result.species_key.clone(),
        confidence: result.confidence,
        summary: result.summary.clone(),
        bird_count: visit.bird_count.max(result.bird_count),
        image: visit
            .best_capture()
            .map(|c| c.path.to_string_lossy().into_owned()),
        capture_fingerprint: fingerprint,
        captures: visit
            .captures
            .iter()
            .map(|c| c.path.to_string_lossy().into_owned())
            .collect(),
        report: report_path.map(|p| p.to_string_lossy().into_owned()),
    }
}

fn rfc3339(epoch_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms as i64)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default())
        .to_rfc3339()
}

fn load_document(path: &Path) -> Result<MetricsDocument> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(MetricsDocument::default())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read metrics store {}", path.display()))
        }
    };
    serde_json::from_str(&raw)
        .with_context(|| format!("corrupt metrics store {}", path.display()))
}

/// Write bytes next to `path` and atomically rename over it. The canonical
/// file is either the old version or the new one, never a partial write.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
    }
    {
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("flush {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} over {}", tmp.display(), path.display()))?;
    Ok(())
}
