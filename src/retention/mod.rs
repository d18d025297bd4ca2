//! Post-success artifact rotation.
//!
//! Two policies per job: keep the N newest, or GFS
//! (grandfather-father-son) with daily/weekly/monthly/yearly buckets
//! aligned to the calendar. Under GFS an artifact kept by any bucket is
//! retained; it is deleted only once it falls outside every configured
//! bucket's window. A bucket count of 0 disables that bucket; all-zero
//! keeps everything.

use crate::adapters::{AdapterResult, StorageAdapter};
use crate::artifact;
use chrono::{DateTime, Datelike, Days, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info};

/// Rotation policy attached to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep everything
    #[default]
    None,
    /// Keep the N most-recent artifacts
    Simple {
        /// How many artifacts survive a rotation
        keep: u32,
    },
    /// Calendar-aligned GFS rotation
    Gfs {
        /// Newest artifact per day, for the last `daily` days
        daily: u32,
        /// Newest artifact per ISO week, for the last `weekly` weeks
        weekly: u32,
        /// Newest artifact per month, for the last `monthly` months
        monthly: u32,
        /// Newest artifact per year, for the last `yearly` years
        yearly: u32,
    },
}

/// What a rotation did
#[derive(Debug, Clone, Default)]
pub struct RetentionOutcome {
    /// Remote paths deleted (sidecars not listed)
    pub deleted: Vec<String>,
    /// Artifacts surviving the rotation
    pub kept: usize,
}

/// One artifact candidate under a job prefix
#[derive(Debug, Clone)]
struct Candidate {
    path: String,
    created: DateTime<Utc>,
}

/// Apply `policy` to the artifacts under `prefix` at the destination.
/// Sidecars follow their artifact.
pub async fn apply(
    policy: &RetentionPolicy,
    storage: &dyn StorageAdapter,
    settings: &Value,
    prefix: &str,
    now: DateTime<Utc>,
) -> AdapterResult<RetentionOutcome> {
    if matches!(policy, RetentionPolicy::None) {
        return Ok(RetentionOutcome::default());
    }

    let mut candidates: Vec<Candidate> = storage
        .list(settings, prefix)
        .await?
        .into_iter()
        .filter(|entry| !artifact::is_sidecar(&entry.path))
        .filter_map(|entry| {
            let name = entry.path.rsplit('/').next()?;
            let created = artifact::parse_artifact_timestamp(name)?;
            Some(Candidate {
                path: entry.path,
                created,
            })
        })
        .collect();
    candidates.sort_by(|a, b| b.created.cmp(&a.created));

    let keep = select_keepers(&candidates, policy, now);
    let mut outcome = RetentionOutcome {
        deleted: Vec::new(),
        kept: keep.len(),
    };
    for candidate in &candidates {
        if keep.contains(candidate.path.as_str()) {
            continue;
        }
        storage.delete(settings, &candidate.path).await?;
        storage
            .delete(settings, &artifact::sidecar_path(&candidate.path))
            .await?;
        debug!(path = %candidate.path, "rotated out");
        outcome.deleted.push(candidate.path.clone());
    }
    if !outcome.deleted.is_empty() {
        info!(
            prefix,
            deleted = outcome.deleted.len(),
            kept = outcome.kept,
            "retention applied"
        );
    }
    Ok(outcome)
}

/// Pure bucket selection over candidates sorted newest-first
fn select_keepers<'a>(
    candidates: &'a [Candidate],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> HashSet<&'a str> {
    match *policy {
        RetentionPolicy::None => candidates.iter().map(|c| c.path.as_str()).collect(),
        RetentionPolicy::Simple { keep } => candidates
            .iter()
            .take(keep as usize)
            .map(|c| c.path.as_str())
            .collect(),
        RetentionPolicy::Gfs {
            daily,
            weekly,
            monthly,
            yearly,
        } => {
            if daily == 0 && weekly == 0 && monthly == 0 && yearly == 0 {
                return candidates.iter().map(|c| c.path.as_str()).collect();
            }
            let mut keep = HashSet::new();

            for i in 0..daily {
                let Some(day) = now.date_naive().checked_sub_days(Days::new(i as u64)) else {
                    break;
                };
                if let Some(c) = candidates.iter().find(|c| c.created.date_naive() == day) {
                    keep.insert(c.path.as_str());
                }
            }
            for i in 0..weekly {
                let week = (now - Duration::weeks(i as i64)).iso_week();
                if let Some(c) = candidates.iter().find(|c| c.created.iso_week() == week) {
                    keep.insert(c.path.as_str());
                }
            }
            for i in 0..monthly {
                let target = month_index(now) - i as i32;
                if let Some(c) = candidates
                    .iter()
                    .find(|c| month_index(c.created) == target)
                {
                    keep.insert(c.path.as_str());
                }
            }
            for i in 0..yearly {
                let target = now.year() - i as i32;
                if let Some(c) = candidates.iter().find(|c| c.created.year() == target) {
                    keep.insert(c.path.as_str());
                }
            }
            keep
        }
    }
}

fn month_index(ts: DateTime<Utc>) -> i32 {
    ts.year() * 12 + ts.month0() as i32
}
