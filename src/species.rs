//! Species key normalization and classifier confidence tiers.

use serde::{Deserialize, Serialize};

/// Normalize a free-text species guess into an aggregation key.
///
/// Lowercases, collapses whitespace, and singularizes a plain trailing "s"
/// ("House Sparrows" and "house sparrow" map to the same key). Words ending in
/// "ss" keep their suffix. Returns "unknown" for empty input.
pub fn normalize_species(raw: &str) -> String {
    let collapsed = raw
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.is_empty() {
        return "unknown".to_string();
    }
    if collapsed.ends_with('s') && !collapsed.ends_with("ss") {
        collapsed[..collapsed.len() - 1].to_string()
    } else {
        collapsed
    }
}

/// Classifier confidence tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    #[default]
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    /// Lenient parse for classifier output; anything unrecognized is Low.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "high" => ConfidenceTier::High,
            "medium" | "med" => ConfidenceTier::Medium,
            _ => ConfidenceTier::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::Low => "low",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::High => "high",
        }
    }
}
