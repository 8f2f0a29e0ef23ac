use std::sync::OnceLock;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::error::user_error_hint;
use crate::state::model::SnapshotRecord;
use crate::state::store::StateStore;

/// A snapshot chosen as the recovery base for a point-in-time target.
#[derive(Debug, Clone)]
pub struct PitrSelection {
    pub full_snapshot_name: String,
    /// Short name (after `@`).
    pub snapshot_name: String,
    pub record: SnapshotRecord,
}

/// Parse a recovery target: absolute ISO-8601 (`2025-10-07T14:30:00Z`,
/// with or without zone) or relative English (`30 minutes ago`).
pub fn parse_target_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(absolute) = DateTime::parse_from_rfc3339(input) {
        return Ok(absolute.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    if let Some(captures) = relative_regex().captures(input) {
        let amount: i64 = captures[1].parse().unwrap_or(0);
        let delta = match &captures[2] {
            "minute" => chrono::Duration::minutes(amount),
            "hour" => chrono::Duration::hours(amount),
            "day" => chrono::Duration::days(amount),
            "week" => chrono::Duration::weeks(amount),
            _ => unreachable!("regex only admits known units"),
        };
        return Ok(now - delta);
    }

    Err(user_error_hint(
        format!("unrecognized time '{input}'"),
        "use ISO-8601 ('2025-10-07T14:30:00Z') or relative ('30 minutes ago', '2 days ago')",
    ))
}

fn relative_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\s+(minute|hour|day|week)s?\s+ago$").unwrap())
}

/// Pick the newest snapshot of `branch_id` created strictly before `target`.
/// No qualifying snapshot is a user error: recovery cannot start from the
/// future.
pub fn select_snapshot_before(
    store: &StateStore,
    branch_id: Uuid,
    branch_name: &str,
    target: DateTime<Utc>,
) -> Result<PitrSelection> {
    let mut candidates: Vec<&SnapshotRecord> = store
        .snapshots_for_branch(branch_id)?
        .into_iter()
        .filter(|s| s.created_at < target)
        .collect();
    candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let record = candidates.first().copied().ok_or_else(|| {
        user_error_hint(
            format!("no snapshot of '{branch_name}' exists before {target}"),
            format!("create snapshots with 'pgfork snapshot create {branch_name}' before the times you want to recover to"),
        )
    })?;

    let snapshot_name = record
        .zfs_snapshot
        .rsplit('@')
        .next()
        .unwrap_or(&record.zfs_snapshot)
        .to_string();

    Ok(PitrSelection {
        full_snapshot_name: record.zfs_snapshot.clone(),
        snapshot_name,
        record: record.clone(),
    })
}
