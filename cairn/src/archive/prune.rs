/*!
Retention-based pruning of old archives.

A policy keeps the last N archives plus the newest archive within each of
a configurable number of hourly, daily, weekly, monthly, and yearly
buckets. Selection is a pure function of the archive timestamps and the
policy, so pruning is deterministic and idempotent: rerunning it with the
same inputs deletes nothing further.
*/
use super::{delete_archive, Result};
use crate::cache::ChunkIndex;
use crate::manifest::{ArchiveListEntry, Manifest};
use crate::repository::Repository;

use chrono::prelude::*;
use tracing::{debug, info, instrument};

use std::collections::HashSet;

/// How many archives to keep, per rule; zero disables a rule
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    pub keep_last: usize,
    pub keep_hourly: usize,
    pub keep_daily: usize,
    pub keep_weekly: usize,
    pub keep_monthly: usize,
    pub keep_yearly: usize,
}

impl PrunePolicy {
    pub fn is_empty(&self) -> bool {
        *self == PrunePolicy::default()
    }
}

/// What a prune run decided (and, unless dry, did)
#[derive(Debug, Default)]
pub struct PruneReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
}

/// Computes the set of archive names the policy retains.
///
/// Archives are considered newest first. Each period rule keeps the
/// newest archive of each distinct period, up to its count; `keep_last`
/// keeps the newest N unconditionally.
pub fn select_keep(archives: &[ArchiveListEntry], policy: &PrunePolicy) -> HashSet<String> {
    let mut sorted: Vec<&ArchiveListEntry> = archives.iter().collect();
    sorted.sort_by(|a, b| b.time.cmp(&a.time));

    let mut keep: HashSet<String> = HashSet::new();
    for entry in sorted.iter().take(policy.keep_last) {
        keep.insert(entry.name.clone());
    }

    let rules: [(usize, fn(&DateTime<FixedOffset>) -> String); 5] = [
        (policy.keep_hourly, |t| t.format("%Y-%m-%d %H").to_string()),
        (policy.keep_daily, |t| t.format("%Y-%m-%d").to_string()),
        (policy.keep_weekly, |t| t.format("%G-%V").to_string()),
        (policy.keep_monthly, |t| t.format("%Y-%m").to_string()),
        (policy.keep_yearly, |t| t.format("%Y").to_string()),
    ];
    for (count, bucket) in &rules {
        if *count == 0 {
            continue;
        }
        let mut seen: HashSet<String> = HashSet::new();
        for entry in &sorted {
            let key = bucket(&entry.time);
            if seen.insert(key) {
                keep.insert(entry.name.clone());
                if seen.len() == *count {
                    break;
                }
            }
        }
    }
    keep
}

/// Applies the policy: deletes every non-checkpoint archive the selection
/// does not retain. With `dry_run`, only reports.
#[instrument(skip(repo, manifest, chunk_index))]
pub fn prune(
    repo: &mut Repository,
    manifest: &mut Manifest,
    chunk_index: &mut ChunkIndex,
    policy: &PrunePolicy,
    dry_run: bool,
) -> Result<PruneReport> {
    let archives = manifest.list(false);
    let keep = select_keep(&archives, policy);

    let mut report = PruneReport::default();
    for entry in archives {
        if keep.contains(&entry.name) {
            report.kept.push(entry.name);
        } else {
            report.deleted.push(entry.name);
        }
    }
    debug!(
        "Prune keeps {} archives, deletes {}",
        report.kept.len(),
        report.deleted.len()
    );
    if !dry_run {
        for name in &report.deleted {
            delete_archive(repo, manifest, chunk_index, name)?;
        }
        if !report.deleted.is_empty() {
            info!("Pruned {} archives", report.deleted.len());
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::repository::ChunkId;

    fn archive_at(name: &str, time: &str) -> ArchiveListEntry {
        ArchiveListEntry {
            name: name.to_string(),
            id: ChunkId::random_id(),
            time: DateTime::parse_from_rfc3339(time).unwrap(),
        }
    }

    #[test]
    fn keep_last_keeps_the_newest() {
        let archives = vec![
            archive_at("t1", "2024-01-01T10:00:00+00:00"),
            archive_at("t2", "2024-01-02T10:00:00+00:00"),
            archive_at("t3", "2024-01-03T10:00:00+00:00"),
            archive_at("t4", "2024-01-04T10:00:00+00:00"),
        ];
        let keep = select_keep(
            &archives,
            &PrunePolicy {
                keep_last: 2,
                ..PrunePolicy::default()
            },
        );
        assert_eq!(keep.len(), 2);
        assert!(keep.contains("t3"));
        assert!(keep.contains("t4"));
    }

    #[test]
    fn daily_rule_keeps_newest_per_day() {
        let archives = vec![
            archive_at("mon-am", "2024-03-04T06:00:00+00:00"),
            archive_at("mon-pm", "2024-03-04T18:00:00+00:00"),
            archive_at("tue-am", "2024-03-05T06:00:00+00:00"),
            archive_at("tue-pm", "2024-03-05T18:00:00+00:00"),
            archive_at("wed", "2024-03-06T12:00:00+00:00"),
        ];
        let keep = select_keep(
            &archives,
            &PrunePolicy {
                keep_daily: 2,
                ..PrunePolicy::default()
            },
        );
        assert_eq!(keep.len(), 2);
        assert!(keep.contains("wed"));
        assert!(keep.contains("tue-pm"));
    }

    #[test]
    fn rules_combine() {
        let archives = vec![
            archive_at("old-year", "2022-06-01T00:00:00+00:00"),
            archive_at("last-month", "2024-02-10T00:00:00+00:00"),
            archive_at("yesterday", "2024-03-05T00:00:00+00:00"),
            archive_at("today", "2024-03-06T00:00:00+00:00"),
        ];
        let keep = select_keep(
            &archives,
            &PrunePolicy {
                keep_last: 1,
                keep_yearly: 2,
                ..PrunePolicy::default()
            },
        );
        // keep_last takes "today"; yearly takes the newest of 2024 (also
        // "today") and the newest of 2022
        assert_eq!(keep.len(), 2);
        assert!(keep.contains("today"));
        assert!(keep.contains("old-year"));
    }

    #[test]
    fn selection_is_deterministic_and_idempotent() {
        let archives = vec![
            archive_at("t1", "2024-01-01T10:00:00+00:00"),
            archive_at("t2", "2024-01-02T10:00:00+00:00"),
            archive_at("t3", "2024-01-03T10:00:00+00:00"),
            archive_at("t4", "2024-01-04T10:00:00+00:00"),
        ];
        let policy = PrunePolicy {
            keep_last: 2,
            ..PrunePolicy::default()
        };
        let first = select_keep(&archives, &policy);
        let second = select_keep(&archives, &policy);
        assert_eq!(first, second);

        // Pruning the survivors again deletes nothing
        let survivors: Vec<ArchiveListEntry> = archives
            .into_iter()
            .filter(|a| first.contains(&a.name))
            .collect();
        let third = select_keep(&survivors, &policy);
        assert_eq!(third.len(), survivors.len());
    }
}
