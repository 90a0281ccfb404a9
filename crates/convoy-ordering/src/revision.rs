//! Revision history — template hashing and retention.
//!
//! Every distinct template a workload has run gets one revision record. The
//! record is keyed by a hash of the template, so rolling back to an earlier
//! template finds the existing record instead of minting a duplicate.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of the hex hash used in revision and member names.
const HASH_LEN_BYTES: usize = 5;

/// Hash a pod template. `serde_json::Value` objects are key-ordered, so two
/// templates that differ only in key order hash the same.
pub fn revision_hash(template: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..HASH_LEN_BYTES])
}

/// A stored revision as the planners see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub name: String,
    pub hash: String,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionDecision {
    /// The template matches the newest revision.
    Current { name: String },
    /// The template matches an older revision, which is promoted to
    /// `revision`.
    Reuse { name: String, revision: u64 },
    /// No revision matches; create one numbered `revision`.
    Create { hash: String, revision: u64 },
}

impl RevisionDecision {
    /// Revision number the workload ends up on.
    pub fn revision(&self, existing: &[RevisionRecord]) -> u64 {
        match self {
            Self::Current { name } => existing
                .iter()
                .find(|r| &r.name == name)
                .map(|r| r.revision)
                .unwrap_or_default(),
            Self::Reuse { revision, .. } | Self::Create { revision, .. } => *revision,
        }
    }
}

/// Decide which revision a template with `hash` maps to.
pub fn select_revision(existing: &[RevisionRecord], hash: &str) -> RevisionDecision {
    let newest = existing.iter().map(|r| r.revision).max().unwrap_or(0);
    match existing.iter().find(|r| r.hash == hash) {
        Some(r) if r.revision == newest => RevisionDecision::Current {
            name: r.name.clone(),
        },
        Some(r) => RevisionDecision::Reuse {
            name: r.name.clone(),
            revision: newest + 1,
        },
        None => RevisionDecision::Create {
            hash: hash.to_string(),
            revision: newest + 1,
        },
    }
}

/// Names of revisions to garbage-collect.
///
/// The revision matching `current_hash` and every revision a live member
/// still runs are kept unconditionally. Of the rest, the newest `limit`
/// are retained.
pub fn revisions_to_prune(
    existing: &[RevisionRecord],
    referenced: &HashSet<String>,
    current_hash: &str,
    limit: usize,
) -> Vec<String> {
    let mut candidates: Vec<&RevisionRecord> = existing
        .iter()
        .filter(|r| r.hash != current_hash && !referenced.contains(&r.hash))
        .collect();
    candidates.sort_by_key(|r| r.revision);
    let excess = candidates.len().saturating_sub(limit);
    candidates
        .into_iter()
        .take(excess)
        .map(|r| r.name.clone())
        .collect()
}
