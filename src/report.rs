//! Static report rendering.
//!
//! Regenerates a markdown summary of the metrics document after every
//! successful commit. The emitter only reads the document; it never writes
//! back into the store.

use anyhow::Result;
use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::store::{atomic_write, MetricsDocument};

/// How many recent visits the report lists.
const RECENT_VISITS: usize = 20;

pub struct ReportEmitter {
    path: PathBuf,
}

impl ReportEmitter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render the document and atomically replace the report file.
    pub fn emit(&self, doc: &MetricsDocument) -> Result<()> {
        let rendered = render(doc);
        atomic_write(&self.path, rendered.as_bytes())?;
        log::debug!("report regenerated: {}", self.path.display());
        Ok(())
    }
}

fn render(doc: &MetricsDocument) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Feeder visits\n");
    let _ = writeln!(out, "Updated: {}\n", Utc::now().to_rfc3339());
    let _ = writeln!(out, "Total visits: **{}**\n", doc.total_visits);

    let _ = writeln!(out, "## Species\n");
    if doc.species_counts.is_empty() {
        let _ = writeln!(out, "No species identified yet.\n");
    } else {
        let mut counts: Vec<(&String, &u64)> = doc.species_counts.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let _ = writeln!(out, "| Species | Visits |");
        let _ = writeln!(out, "|---|---|");
        for (species, count) in counts {
            let _ = writeln!(out, "| {} | {} |", species, count);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Recent visits\n");
    if doc.visits.is_empty() {
        let _ = writeln!(out, "No visits recorded yet.");
    } else {
        let _ = writeln!(out, "| Start | Species | Count | Duration | Summary |");
        let _ = writeln!(out, "|---|---|---|---|---|");
        for visit in doc.visits.iter().rev().take(RECENT_VISITS) {
            let duration = visit
                .duration_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                visit.start_time,
                visit.species_raw,
                visit.bird_count,
                duration,
                visit.summary.replace('|', "\\|").replace('\n', " "),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::ConfidenceTier;
    use crate::store::VisitRecord;

    fn record(species: &str) -> VisitRecord {
        VisitRecord {
            id: "v1".to_string(),
            start_time: "2026-08-23T10:00:00+00:00".to_string(),
            end_time: Some("2026-08-23T10:00:15+00:00".to_string()),
            duration_secs: Some(15),
            species_raw: species.to_string(),
            species_norm: crate::species::normalize_species(species),
            confidence: ConfidenceTier::Medium,
            summary: "a small | bird".to_string(),
            bird_count: 1,
            image: None,
            capture_fingerprint: None,
            captures: vec![],
            report: None,
        }
    }

    #[test]
    fn report_lists_totals_species_and_visits() {
        let mut doc = MetricsDocument::default();
        doc.visits.push(record("Blue Jay"));
        doc.total_visits = 1;
        doc.species_counts.insert("blue jay".to_string(), 1);

        let rendered = render(&doc);
        assert!(rendered.contains("Total visits: **1**"));
        assert!(rendered.contains("| blue jay | 1 |"));
        assert!(rendered.contains("2026-08-23T10:00:00+00:00"));
        // Table cells must not break on the summary's pipe.
        assert!(rendered.contains("a small \\| bird"));
    }

    #[test]
    fn emit_replaces_the_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        let emitter = ReportEmitter::new(&path);

        emitter.emit(&MetricsDocument::default()).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("No visits recorded yet."));

        let mut doc = MetricsDocument::default();
        doc.visits.push(record("Blue Jay"));
        doc.total_visits = 1;
        emitter.emit(&doc).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert!(second.contains("Blue Jay"));
    }
}
