//! Peer version compatibility.
//!
//! Version checks never fail a connection. A peer below the minimum is still
//! used, with a warning and a list of features to treat as degraded.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A feature that needs at least `min_version` on the peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGate {
    /// Feature name reported as degraded.
    pub feature: String,
    /// First peer version that supports it.
    pub min_version: String,
}

impl FeatureGate {
    /// Build a gate.
    pub fn new(feature: impl Into<String>, min_version: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            min_version: min_version.into(),
        }
    }
}

/// Outcome of a version compatibility check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionReport {
    /// Version the peer reported, if any.
    pub peer_version: Option<String>,
    /// Minimum version the bridge was configured with.
    pub minimum_version: String,
    /// `false` when the peer is known to be below the minimum.
    pub meets_minimum: bool,
    /// Human-readable warnings.
    pub warnings: Vec<String>,
    /// Features that should be considered unavailable.
    pub degraded_features: Vec<String>,
}

fn components(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches(['v', 'V'])
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compare dotted numeric versions component by component.
///
/// Missing components count as zero, so `"0.5"` equals `"0.5.0"`. Non-numeric
/// suffixes inside a component are ignored (`"5-beta"` reads as `5`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Check a reported peer version against the minimum and feature gates.
pub fn check_version(peer: Option<&str>, minimum: &str, gates: &[FeatureGate]) -> VersionReport {
    let Some(peer) = peer.map(str::trim).filter(|v| !v.is_empty()) else {
        debug!(minimum, "peer did not report a version");
        return VersionReport {
            peer_version: None,
            minimum_version: minimum.to_owned(),
            meets_minimum: true,
            warnings: vec![format!(
                "could not determine peer version; assuming compatibility with {minimum}"
            )],
            degraded_features: Vec::new(),
        };
    };

    let degraded_features: Vec<String> = gates
        .iter()
        .filter(|gate| compare_versions(peer, &gate.min_version) == Ordering::Less)
        .map(|gate| gate.feature.clone())
        .collect();

    let meets_minimum = compare_versions(peer, minimum) != Ordering::Less;
    debug!(peer, minimum, meets_minimum, degraded = ?degraded_features, "peer version checked");
    let mut warnings = Vec::new();
    if !meets_minimum {
        warnings.push(format!(
            "peer version {peer} is older than the minimum supported {minimum}; some features may not work"
        ));
    }
    if !degraded_features.is_empty() {
        warnings.push(format!(
            "features unavailable on peer {peer}: {}",
            degraded_features.join(", ")
        ));
    }

    VersionReport {
        peer_version: Some(peer.to_owned()),
        minimum_version: minimum.to_owned(),
        meets_minimum,
        warnings,
        degraded_features,
    }
}
