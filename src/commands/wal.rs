use anyhow::Result;
use chrono::Utc;

use super::App;
use crate::state::model::Namespace;
use crate::wal::ArchiveInfo;

const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug)]
pub struct WalInfoRow {
    pub branch: String,
    pub dataset: String,
    pub info: ArchiveInfo,
    pub gaps: Vec<String>,
}

/// Archive statistics (and segment-gap check) for one branch or all.
pub async fn info(app: &App, scope: Option<&str>) -> Result<Vec<WalInfoRow>> {
    let store = app.open_store().await?;

    let targets: Vec<(String, String)> = match scope {
        Some(branch_name) => {
            let ns = Namespace::parse(branch_name)?;
            let (_, branch) = store.branch(&ns)?;
            vec![(branch.name.clone(), branch.zfs_dataset.clone())]
        }
        None => store
            .all_branches()?
            .into_iter()
            .map(|b| (b.name.clone(), b.zfs_dataset.clone()))
            .collect(),
    };

    let mut rows = Vec::with_capacity(targets.len());
    for (branch, dataset) in targets {
        let info = app.wal.archive_info(&dataset).await?;
        let gaps = app.wal.verify_archive_integrity(&dataset).await?;
        rows.push(WalInfoRow {
            branch,
            dataset,
            info,
            gaps,
        });
    }
    Ok(rows)
}

#[derive(Debug)]
pub struct WalCleanupOutcome {
    pub branch: String,
    pub segments: Vec<String>,
    pub deleted: usize,
    pub dry_run: bool,
}

/// Delete WAL segments older than `--days` (default 7) from a branch's
/// archive. Dry-run lists what would go.
pub async fn cleanup(
    app: &App,
    branch_name: &str,
    days: Option<i64>,
    dry_run: bool,
) -> Result<WalCleanupOutcome> {
    let ns = Namespace::parse(branch_name)?;
    let store = app.open_store().await?;
    let (_, branch) = store.branch(&ns)?;
    let dataset = branch.zfs_dataset.clone();
    let branch = branch.name.clone();

    let days = days.unwrap_or(DEFAULT_RETENTION_DAYS);
    let cutoff = Utc::now() - chrono::Duration::days(days);

    let segments = app.wal.preview_cleanup(&dataset, cutoff).await?;
    if dry_run {
        return Ok(WalCleanupOutcome {
            branch,
            deleted: 0,
            segments,
            dry_run: true,
        });
    }

    let deleted = app.wal.cleanup_wals_before(&dataset, cutoff).await?;
    Ok(WalCleanupOutcome {
        branch,
        segments,
        deleted,
        dry_run: false,
    })
}
